//! Integration tests for the H1emu server: admission, send gating,
//! keepalive and shutdown.
//!
//! Two setups are used:
//! - real loopback UDP, for the full socket path;
//! - an in-memory bridge driven by hand under `start_paused = true`, for
//!   anything that depends on ping and timeout timing.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use h1emu::prelude::*;
use h1emu::{BridgeCommand, BridgeEvent, BridgePeer, Datagram, TransportError, bridge_channel};
use serde_json::{Value, json};
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

// =========================================================================
// Recording handler
// =========================================================================

#[derive(Default)]
struct Log {
    messages: Vec<(SessionId, Opcode, Value)>,
    evictions: Vec<(SessionId, EvictionReason)>,
}

/// Records everything it sees. Optionally answers a session request by
/// establishing the session and sending a session reply.
struct Recorder {
    log: Arc<Mutex<Log>>,
    establish_on_request: bool,
}

impl Recorder {
    fn new(establish_on_request: bool) -> (Self, Arc<Mutex<Log>>) {
        let log = Arc::new(Mutex::new(Log::default()));
        let recorder = Self {
            log: Arc::clone(&log),
            establish_on_request,
        };
        (recorder, log)
    }
}

impl MessageHandler<JsonCodec> for Recorder {
    type Payload = Value;

    fn on_message(
        &mut self,
        ctx: &mut SessionContext<'_, JsonCodec>,
        session: SessionId,
        opcode: Opcode,
        payload: Value,
    ) {
        self.log
            .lock()
            .unwrap()
            .messages
            .push((session, opcode, payload));

        if self.establish_on_request && opcode == Opcode::SESSION_REQUEST {
            ctx.establish(session).unwrap();
            ctx.send(session, Opcode::SESSION_REPLY, &json!({ "ok": true }));
        }
    }

    fn on_session_evicted(&mut self, session: SessionId, reason: EvictionReason) {
        self.log.lock().unwrap().evictions.push((session, reason));
    }
}

// =========================================================================
// Helpers
// =========================================================================

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn test_config() -> ServerConfig {
    ServerConfig {
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        initial_ping_jitter: 0,
        ..ServerConfig::default()
    }
}

fn peer_addr() -> SocketAddr {
    "10.0.0.5:4000".parse().unwrap()
}

/// Starts a server over an in-memory bridge, answering its bind request.
async fn start_in_memory(handler: Recorder) -> (ServerHandle<JsonCodec>, BridgePeer) {
    start_in_memory_with(test_config(), handler).await
}

async fn start_in_memory_with<H: MessageHandler<JsonCodec>>(
    config: ServerConfig,
    handler: H,
) -> (ServerHandle<JsonCodec>, BridgePeer) {
    let (bridge, mut peer) = bridge_channel();
    let server = H1emuServer::builder().config(config).build(handler, JsonCodec);

    let (handle, ()) = tokio::join!(server.start_with_bridge(bridge), async {
        match peer.commands.recv().await {
            Some(BridgeCommand::Bind { reply, .. }) => {
                let _ = reply.send(Ok("127.0.0.1:1110".parse().unwrap()));
            }
            other => panic!("expected Bind, got {other:?}"),
        }
    });
    (handle.unwrap(), peer)
}

fn inject(peer: &BridgePeer, remote: SocketAddr, data: &[u8]) {
    peer.events
        .send(BridgeEvent::Inbound(Datagram {
            data: data.to_vec(),
            remote,
        }))
        .unwrap();
}

/// Everything the orchestrator asked the I/O context to transmit so far.
fn drain_sent(peer: &mut BridgePeer) -> Vec<Datagram> {
    let mut sent = Vec::new();
    while let Ok(cmd) = peer.commands.try_recv() {
        if let BridgeCommand::SendPacket(datagram) = cmd {
            sent.push(datagram);
        }
    }
    sent
}

fn opcodes(sent: &[Datagram]) -> Vec<u8> {
    sent.iter().map(|d| d.data[0]).collect()
}

// =========================================================================
// Admission
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_session_request_from_unknown_peer_creates_pending_session() {
    let (handler, log) = Recorder::new(false);
    let (handle, peer) = start_in_memory(handler).await;

    inject(&peer, peer_addr(), &[0x01]);

    assert_eq!(handle.session_count().await.unwrap(), 1);
    let session = handle
        .session(SessionId::new(peer_addr()))
        .await
        .unwrap()
        .expect("session exists");
    assert_eq!(session.state(), SessionState::Pending);
    assert_eq!(session.port(), 4000);

    let log = log.lock().unwrap();
    assert_eq!(log.messages.len(), 1);
    assert_eq!(log.messages[0].1, Opcode::SESSION_REQUEST);
    assert_eq!(log.messages[0].2, Value::Null);
}

#[tokio::test(start_paused = true)]
async fn test_session_reply_from_unknown_peer_also_admits() {
    let (handler, _log) = Recorder::new(false);
    let (handle, peer) = start_in_memory(handler).await;

    inject(&peer, peer_addr(), &[0x02]);

    assert_eq!(handle.session_count().await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_peer_without_admission_opcode_is_dropped() {
    let (handler, log) = Recorder::new(false);
    let (handle, peer) = start_in_memory(handler).await;

    inject(&peer, peer_addr(), &[0x03]);
    inject(&peer, peer_addr(), &[0x7f, b'{', b'}']);
    inject(&peer, peer_addr(), &[]);

    assert_eq!(handle.session_count().await.unwrap(), 0);
    assert!(log.lock().unwrap().messages.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_existing_peer_any_opcode_is_dispatched() {
    let (handler, log) = Recorder::new(false);
    let (handle, peer) = start_in_memory(handler).await;

    inject(&peer, peer_addr(), &[0x01]);
    inject(&peer, peer_addr(), br#"Z{"x":1}"#);

    assert_eq!(handle.session_count().await.unwrap(), 1);
    let log = log.lock().unwrap();
    assert_eq!(log.messages.len(), 2);
    assert_eq!(log.messages[1].1, Opcode(b'Z'));
    assert_eq!(log.messages[1].2, json!({ "x": 1 }));
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_body_is_dropped_after_admission() {
    let (handler, log) = Recorder::new(false);
    let (handle, peer) = start_in_memory(handler).await;

    inject(&peer, peer_addr(), &[0x01, b'{']);

    // Admission only looks at the opcode byte.
    assert_eq!(handle.session_count().await.unwrap(), 1);
    assert!(log.lock().unwrap().messages.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_sessions_are_keyed_by_address_and_port() {
    let (handler, _log) = Recorder::new(false);
    let (handle, peer) = start_in_memory(handler).await;

    inject(&peer, "10.0.0.5:4000".parse().unwrap(), &[0x01]);
    inject(&peer, "10.0.0.5:4001".parse().unwrap(), &[0x01]);
    inject(&peer, "10.0.0.5:4000".parse().unwrap(), &[0x01]);

    assert_eq!(handle.session_count().await.unwrap(), 2);
}

// =========================================================================
// Send gating
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_handler_reply_after_establish_is_transmitted() {
    let (handler, _log) = Recorder::new(true);
    let (handle, mut peer) = start_in_memory(handler).await;

    inject(&peer, peer_addr(), &[0x01]);
    handle.session_count().await.unwrap();

    let sent = drain_sent(&mut peer);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].remote, peer_addr());
    let mut expected = vec![0x02];
    expected.extend_from_slice(br#"{"ok":true}"#);
    assert_eq!(sent[0].data, expected);
}

#[tokio::test(start_paused = true)]
async fn test_handle_send_to_pending_session_only_passes_session_request() {
    let (handler, _log) = Recorder::new(false);
    let (handle, mut peer) = start_in_memory(handler).await;
    let id = SessionId::new(peer_addr());
    inject(&peer, peer_addr(), &[0x01]);
    handle.session_count().await.unwrap();

    handle.send(id, Opcode::SESSION_REPLY, &()).unwrap();
    handle.send(id, Opcode::PING, &()).unwrap();
    handle.send(id, Opcode::SESSION_REQUEST, &json!({ "v": 1 })).unwrap();
    handle.session_count().await.unwrap();

    assert_eq!(opcodes(&drain_sent(&mut peer)), vec![0x01]);
}

#[tokio::test(start_paused = true)]
async fn test_handle_send_to_unknown_session_is_silently_dropped() {
    let (handler, _log) = Recorder::new(false);
    let (handle, mut peer) = start_in_memory(handler).await;

    let result = handle.send(SessionId::new(peer_addr()), Opcode::SESSION_REQUEST, &());
    handle.session_count().await.unwrap();

    assert!(result.is_ok());
    assert!(drain_sent(&mut peer).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_handle_establish_lifts_send_gate() {
    let (handler, _log) = Recorder::new(false);
    let (handle, mut peer) = start_in_memory(handler).await;
    let id = SessionId::new(peer_addr());
    inject(&peer, peer_addr(), &[0x01]);

    handle.establish(id).await.unwrap();
    handle.send(id, Opcode(0x20), &json!("hello")).unwrap();
    handle.session_count().await.unwrap();

    let session = handle.session(id).await.unwrap().unwrap();
    assert!(session.is_established());
    assert_eq!(opcodes(&drain_sent(&mut peer)), vec![0x20]);
}

#[tokio::test(start_paused = true)]
async fn test_handle_establish_unknown_session_returns_not_found() {
    let (handler, _log) = Recorder::new(false);
    let (handle, _peer) = start_in_memory(handler).await;

    let result = handle.establish(SessionId::new(peer_addr())).await;

    assert!(matches!(
        result,
        Err(H1emuError::Session(h1emu::SessionError::NotFound(_)))
    ));
}

// =========================================================================
// Keepalive
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_pending_session_is_never_pinged() {
    let (handler, _log) = Recorder::new(false);
    let (handle, mut peer) = start_in_memory(handler).await;
    inject(&peer, peer_addr(), &[0x01]);
    handle.session_count().await.unwrap();

    sleep(ms(5_050)).await;

    assert!(drain_sent(&mut peer).is_empty());
    assert_eq!(handle.session_count().await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_established_session_is_pinged_every_interval() {
    let (handler, _log) = Recorder::new(true);
    let (handle, mut peer) = start_in_memory(handler).await;
    inject(&peer, peer_addr(), &[0x01]);
    handle.session_count().await.unwrap();
    assert_eq!(opcodes(&drain_sent(&mut peer)), vec![0x02]);

    sleep(ms(4_950)).await;
    assert!(drain_sent(&mut peer).is_empty(), "no ping before 5 s");

    sleep(ms(100)).await;
    let sent = drain_sent(&mut peer);
    assert_eq!(opcodes(&sent), vec![0x03]);
    assert_eq!(sent[0].remote, peer_addr());

    // Incoming traffic does not move the ping cadence.
    inject(&peer, peer_addr(), &[0x04]);
    sleep(ms(5_000)).await;
    assert_eq!(opcodes(&drain_sent(&mut peer)), vec![0x03]);
}

#[tokio::test(start_paused = true)]
async fn test_silent_session_is_evicted_after_timeout() {
    let (handler, log) = Recorder::new(true);
    let (handle, mut peer) = start_in_memory(handler).await;
    let id = SessionId::new(peer_addr());
    inject(&peer, peer_addr(), &[0x01]);
    handle.session_count().await.unwrap();

    sleep(ms(11_950)).await;
    assert_eq!(handle.session_count().await.unwrap(), 1);

    sleep(ms(100)).await;
    assert_eq!(handle.session_count().await.unwrap(), 0);
    assert_eq!(
        log.lock().unwrap().evictions,
        vec![(id, EvictionReason::Timeout)]
    );

    // Reply, then pings at 5 s and 10 s; nothing after eviction.
    sleep(ms(20_000)).await;
    assert_eq!(opcodes(&drain_sent(&mut peer)), vec![0x02, 0x03, 0x03]);
}

#[tokio::test(start_paused = true)]
async fn test_traffic_extends_idle_window() {
    let (handler, _log) = Recorder::new(true);
    let (handle, peer) = start_in_memory(handler).await;
    inject(&peer, peer_addr(), &[0x01]);
    handle.session_count().await.unwrap();

    sleep(ms(10_000)).await;
    inject(&peer, peer_addr(), &[0x04]);
    handle.session_count().await.unwrap();

    sleep(ms(11_950)).await;
    assert_eq!(handle.session_count().await.unwrap(), 1);

    sleep(ms(100)).await;
    assert_eq!(handle.session_count().await.unwrap(), 0);
}

/// Counts dispatched messages and remembers who was evicted, without
/// holding a lock on the hot path.
struct Counter {
    processed: Arc<AtomicUsize>,
    evicted: Arc<Mutex<Vec<SessionId>>>,
}

impl MessageHandler<JsonCodec> for Counter {
    type Payload = Value;

    fn on_message(
        &mut self,
        _ctx: &mut SessionContext<'_, JsonCodec>,
        _session: SessionId,
        _opcode: Opcode,
        _payload: Value,
    ) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    fn on_session_evicted(&mut self, session: SessionId, _reason: EvictionReason) {
        self.evicted.lock().unwrap().push(session);
    }
}

// Runs on real time: paused time never advances while the orchestrator
// has datagrams to chew through, so it cannot show timers being held back.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_inbound_flood_does_not_hold_back_timeout_eviction() {
    let processed = Arc::new(AtomicUsize::new(0));
    let evicted = Arc::new(Mutex::new(Vec::new()));
    let handler = Counter {
        processed: Arc::clone(&processed),
        evicted: Arc::clone(&evicted),
    };
    let config = ServerConfig {
        ping_timeout: 50,
        ..test_config()
    };
    let (handle, peer) = start_in_memory_with(config, handler).await;
    let quiet: SocketAddr = "10.0.0.6:4000".parse().unwrap();
    let noisy = peer_addr();

    let started = Instant::now();
    inject(&peer, quiet, &[0x01]);
    inject(&peer, noisy, &[0x01]);
    handle.session_count().await.unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let flooder = tokio::spawn({
        let events = peer.events.clone();
        let stop = Arc::clone(&stop);
        let processed = Arc::clone(&processed);
        async move {
            let mut sent = 0usize;
            while !stop.load(Ordering::Relaxed) {
                // Keep a deep backlog without growing it forever.
                while sent.saturating_sub(processed.load(Ordering::Relaxed)) < 10_000 {
                    let datagram = Datagram {
                        data: vec![0x04],
                        remote: noisy,
                    };
                    if events.send(BridgeEvent::Inbound(datagram)).is_err() {
                        return;
                    }
                    sent += 1;
                }
                tokio::task::yield_now().await;
            }
        }
    });

    let quiet_id = SessionId::new(quiet);
    let mut evicted_after = None;
    while started.elapsed() < Duration::from_secs(2) {
        if evicted.lock().unwrap().contains(&quiet_id) {
            evicted_after = Some(started.elapsed());
            break;
        }
        sleep(ms(5)).await;
    }
    stop.store(true, Ordering::Relaxed);
    flooder.await.unwrap();

    let evicted_after = evicted_after.expect("quiet session evicted during the flood");
    assert!(
        evicted_after < Duration::from_secs(1),
        "eviction took {evicted_after:?}"
    );
    assert!(processed.load(Ordering::Relaxed) > 2, "flood never reached the handler");

    handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_evicted_peer_must_be_admitted_again() {
    let (handler, log) = Recorder::new(false);
    let (handle, peer) = start_in_memory(handler).await;
    let id = SessionId::new(peer_addr());
    inject(&peer, peer_addr(), &[0x01]);
    handle.establish(id).await.unwrap();

    sleep(ms(12_100)).await;
    assert_eq!(handle.session_count().await.unwrap(), 0);

    inject(&peer, peer_addr(), &[0x04]);
    assert_eq!(handle.session_count().await.unwrap(), 0);

    inject(&peer, peer_addr(), &[0x01]);
    let session = handle.session(id).await.unwrap().expect("readmitted");
    assert_eq!(session.state(), SessionState::Pending);
    assert_eq!(log.lock().unwrap().messages.len(), 2);
}

// =========================================================================
// Shutdown
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_stop_evicts_sessions_and_closes_bridge() {
    let (handler, log) = Recorder::new(false);
    let (handle, mut peer) = start_in_memory(handler).await;
    let id = SessionId::new(peer_addr());
    inject(&peer, peer_addr(), &[0x01]);
    handle.session_count().await.unwrap();

    handle.stop().await.unwrap();

    assert_eq!(
        log.lock().unwrap().evictions,
        vec![(id, EvictionReason::Shutdown)]
    );
    let mut saw_close = false;
    while let Ok(cmd) = peer.commands.try_recv() {
        saw_close |= matches!(cmd, BridgeCommand::Close);
    }
    assert!(saw_close);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_handle_evicts_sessions_and_closes_bridge() {
    let (handler, log) = Recorder::new(false);
    let (handle, mut peer) = start_in_memory(handler).await;
    let id = SessionId::new(peer_addr());
    inject(&peer, peer_addr(), &[0x01]);
    handle.session_count().await.unwrap();

    drop(handle);

    let closed = timeout(ms(5_000), async {
        loop {
            match peer.commands.recv().await {
                Some(BridgeCommand::Close) => break true,
                Some(_) => continue,
                None => break false,
            }
        }
    })
    .await
    .expect("bridge closed in time");
    assert!(closed);
    assert_eq!(
        log.lock().unwrap().evictions,
        vec![(id, EvictionReason::Shutdown)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_io_context_exit_stops_orchestrator() {
    let (handler, _log) = Recorder::new(false);
    let (handle, peer) = start_in_memory(handler).await;

    drop(peer);

    assert!(matches!(
        handle.session_count().await,
        Err(H1emuError::Stopped)
    ));
    assert!(matches!(
        handle.stop().await,
        Err(H1emuError::Transport(TransportError::Shutdown))
    ));
}

// =========================================================================
// Loopback UDP
// =========================================================================

async fn start_udp(handler: Recorder) -> (ServerHandle<JsonCodec>, UdpSocket) {
    let handle = H1emuServer::builder()
        .config(test_config())
        .build(handler, JsonCodec)
        .start()
        .await
        .unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(handle.local_addr()).await.unwrap();
    (handle, client)
}

#[tokio::test]
async fn test_udp_session_request_gets_session_reply() {
    let (handler, _log) = Recorder::new(true);
    let (handle, client) = start_udp(handler).await;

    client.send(&[0x01]).await.unwrap();

    let mut buf = [0u8; 512];
    let len = timeout(Duration::from_secs(2), client.recv(&mut buf))
        .await
        .expect("reply in time")
        .unwrap();
    assert_eq!(buf[0], 0x02);
    let body: Value = serde_json::from_slice(&buf[1..len]).unwrap();
    assert_eq!(body, json!({ "ok": true }));

    let id = SessionId::new(client.local_addr().unwrap());
    let session = handle.session(id).await.unwrap().unwrap();
    assert!(session.is_established());

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_udp_unknown_peer_gets_nothing() {
    let (handler, log) = Recorder::new(true);
    let (handle, client) = start_udp(handler).await;

    client.send(&[0x03]).await.unwrap();

    let mut buf = [0u8; 512];
    let reply = timeout(ms(200), client.recv(&mut buf)).await;
    assert!(reply.is_err(), "rejected peer must get no answer");
    assert_eq!(handle.session_count().await.unwrap(), 0);
    assert!(log.lock().unwrap().messages.is_empty());

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_udp_bind_conflict_fails_start() {
    let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = taken.local_addr().unwrap().port();
    let (handler, _log) = Recorder::new(false);

    let result = H1emuServer::builder()
        .config(test_config())
        .port(port)
        .build(handler, JsonCodec)
        .start()
        .await;

    assert!(matches!(result, Err(H1emuError::Transport(_))));
}

#[tokio::test]
async fn test_udp_dropping_handle_releases_port() {
    let (handler, _log) = Recorder::new(false);
    let (handle, _client) = start_udp(handler).await;
    let addr = handle.local_addr();

    drop(handle);

    let mut rebound = None;
    for _ in 0..100 {
        match UdpSocket::bind(addr).await {
            Ok(socket) => {
                rebound = Some(socket);
                break;
            }
            Err(_) => sleep(ms(20)).await,
        }
    }
    assert!(rebound.is_some(), "{addr} still held after the handle was dropped");
}
