//! The orchestrator task: owns every session and runs all session logic.
//!
//! It never touches a socket. Datagrams arrive from the I/O context as
//! [`BridgeEvent`]s and leave as [`BridgeHandle::send`] calls, so nothing
//! here ever blocks on the network. Four inputs are multiplexed, in this
//! priority order:
//!
//! 1. shutdown (the server's cancellation token)
//! 2. keepalive timers
//! 3. inbound datagrams
//! 4. commands from [`ServerHandle`](crate::ServerHandle)s
//!
//! Timers come before inbound traffic so that a flood of datagrams, even
//! rejected ones, cannot hold back pings and evictions.

use std::time::Duration;

use h1emu_keepalive::{KeepaliveEvent, KeepaliveScheduler};
use h1emu_protocol::{Codec, Opcode};
use h1emu_session::{Admission, Session, SessionError, SessionId, SessionRegistry};
use h1emu_transport::{BridgeEvent, BridgeHandle, Datagram, TransportError};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::handler::{EvictionReason, MessageHandler, SessionContext, send_frame, send_gated};
use crate::H1emuError;

/// Requests from a [`ServerHandle`](crate::ServerHandle).
pub(crate) enum ServerCommand {
    /// Send a pre-encoded frame, subject to send gating.
    Send {
        session: SessionId,
        opcode: Opcode,
        frame: Vec<u8>,
    },

    /// Mark a session as established.
    Establish {
        session: SessionId,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },

    /// Snapshot one session.
    GetSession {
        session: SessionId,
        reply: oneshot::Sender<Option<Session>>,
    },

    /// Count sessions.
    SessionCount { reply: oneshot::Sender<usize> },
}

pub(crate) struct Orchestrator<H, C> {
    pub(crate) registry: SessionRegistry,
    pub(crate) keepalive: KeepaliveScheduler<SessionId>,
    pub(crate) handler: H,
    pub(crate) codec: C,
    pub(crate) bridge: BridgeHandle,
    pub(crate) commands: mpsc::UnboundedReceiver<ServerCommand>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) ping_timeout: Duration,
    pub(crate) shutdown_grace: Duration,
}

impl<H, C> Orchestrator<H, C>
where
    H: MessageHandler<C>,
    C: Codec,
{
    /// Runs until the shutdown token fires, the server handle is dropped,
    /// or the I/O context goes away.
    ///
    /// Either way every remaining session is evicted and the bridge is
    /// closed before this returns.
    pub(crate) async fn run(mut self) -> Result<(), H1emuError> {
        tracing::info!("orchestrator started");

        let outcome = loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    tracing::info!("shutdown requested");
                    break Ok(());
                }

                Some(timer) = self.keepalive.next_event() => self.handle_timer(timer),

                event = self.bridge.recv() => match event {
                    Some(BridgeEvent::Inbound(datagram)) => self.handle_datagram(datagram),
                    None => {
                        tracing::error!("I/O context exited unexpectedly, stopping");
                        break Err(H1emuError::Transport(TransportError::Shutdown));
                    }
                },

                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        tracing::info!("server handle dropped, stopping");
                        break Ok(());
                    }
                },
            }
        };

        self.evict_all();
        if let Err(e) = self.bridge.close(self.shutdown_grace).await {
            tracing::warn!(error = %e, "bridge close failed");
        }

        tracing::info!("orchestrator stopped");
        outcome
    }

    fn handle_datagram(&mut self, datagram: Datagram) {
        let Datagram { data, remote } = datagram;
        let Some(opcode) = Opcode::peek(&data) else {
            tracing::debug!(%remote, "empty datagram dropped");
            return;
        };
        tracing::trace!(%remote, %opcode, len = data.len(), "datagram received");

        let now = Instant::now();
        let session = match self.registry.admit(remote, opcode, now) {
            Admission::Existing(id) => id,
            Admission::Created(id) => {
                self.keepalive.track(id, now);
                id
            }
            Admission::Rejected => return,
        };

        let frame = match self.codec.decode::<H::Payload>(&data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(peer = %session, %opcode, error = %e, "undecodable datagram dropped");
                return;
            }
        };

        let mut ctx = SessionContext {
            registry: &mut self.registry,
            codec: &self.codec,
            bridge: &self.bridge,
        };
        self.handler
            .on_message(&mut ctx, session, frame.opcode, frame.payload);
    }

    fn handle_timer(&mut self, timer: KeepaliveEvent<SessionId>) {
        match timer {
            KeepaliveEvent::Ping(id) => {
                // Pending sessions are silently skipped by the send gate.
                send_gated(&self.registry, &self.codec, &self.bridge, id, Opcode::PING, &());
            }
            KeepaliveEvent::TimeoutCheck(id) => {
                let now = Instant::now();
                let Some(session) = self.registry.get(&id) else {
                    self.keepalive.cancel(&id);
                    return;
                };
                if session.is_timed_out(now, self.ping_timeout) {
                    tracing::info!(
                        peer = %id,
                        idle_ms = session.idle_for(now).as_millis() as u64,
                        "session timed out"
                    );
                    self.evict(id, EvictionReason::Timeout);
                } else {
                    // Idle must strictly exceed the timeout, hence the extra ms.
                    let deadline =
                        session.last_seen() + self.ping_timeout + Duration::from_millis(1);
                    self.keepalive.check_again_at(&id, deadline);
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: ServerCommand) {
        match cmd {
            ServerCommand::Send {
                session,
                opcode,
                frame,
            } => {
                send_frame(&self.registry, &self.bridge, session, opcode, frame);
            }
            ServerCommand::Establish { session, reply } => {
                let _ = reply.send(self.registry.establish(session));
            }
            ServerCommand::GetSession { session, reply } => {
                let _ = reply.send(self.registry.get(&session).cloned());
            }
            ServerCommand::SessionCount { reply } => {
                let _ = reply.send(self.registry.len());
            }
        }
    }

    fn evict(&mut self, id: SessionId, reason: EvictionReason) {
        self.keepalive.cancel(&id);
        if self.registry.evict(id).is_some() {
            tracing::debug!(peer = %id, ?reason, "session evicted");
            self.handler.on_session_evicted(id, reason);
        }
    }

    fn evict_all(&mut self) {
        self.keepalive.cancel_all();
        let stats = self.keepalive.stats();
        tracing::info!(
            pings = stats.pings,
            timeout_checks = stats.timeout_checks,
            cancelled = stats.cancelled,
            "keepalive totals"
        );
        let sessions = self.registry.drain();
        if !sessions.is_empty() {
            tracing::info!(count = sessions.len(), "evicting remaining sessions");
        }
        for session in sessions {
            self.handler
                .on_session_evicted(session.id(), EvictionReason::Shutdown);
        }
    }
}
