//! UDP I/O context using `tokio::net::UdpSocket`.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::{
    bridge_channel, BridgeCommand, BridgeEvent, BridgeHandle, BridgePeer,
    Datagram, TransportError,
};

/// Settings for the UDP I/O context.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Receive buffer size. Longer datagrams are truncated by the OS.
    ///
    /// Default: 512 bytes.
    pub max_datagram_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_datagram_size: 512,
        }
    }
}

/// Spawns the task that owns the UDP socket.
pub struct UdpBridge;

impl UdpBridge {
    /// Spawns an unbound I/O context and returns the orchestrator's handle.
    ///
    /// The socket is created by the first [`BridgeHandle::bind`].
    pub fn spawn(config: BridgeConfig) -> BridgeHandle {
        let (mut handle, peer) = bridge_channel();
        let task = tokio::spawn(run(peer, config));
        handle.attach(task);
        handle
    }
}

/// I/O context main loop: wait for `Bind`, then shuttle datagrams.
async fn run(mut peer: BridgePeer, config: BridgeConfig) {
    let Some(socket) = wait_for_bind(&mut peer).await else {
        tracing::debug!("I/O context closed before bind");
        return;
    };
    let local = socket.local_addr().ok();
    let mut buf = vec![0u8; config.max_datagram_size.max(1)];
    let mut backoff = RecvBackoff::default();

    loop {
        tokio::select! {
            biased;

            _ = peer.cancel.cancelled() => {
                tracing::debug!(?local, "I/O context cancelled");
                break;
            }

            cmd = peer.commands.recv() => match cmd {
                Some(BridgeCommand::SendPacket(dgram)) => {
                    transmit(&socket, dgram).await;
                }
                Some(BridgeCommand::Bind { reply, .. }) => {
                    let err = match local {
                        Some(addr) => TransportError::AlreadyBound(addr),
                        None => TransportError::Shutdown,
                    };
                    let _ = reply.send(Err(err));
                }
                Some(BridgeCommand::Close) | None => {
                    flush(&socket, &mut peer).await;
                    break;
                }
            },

            res = socket.recv_from(&mut buf) => match res {
                Ok((len, remote)) => {
                    backoff.reset();
                    let dgram = Datagram {
                        data: buf[..len].to_vec(),
                        remote,
                    };
                    tracing::trace!(%remote, len, "datagram received");
                    if peer.events.send(BridgeEvent::Inbound(dgram)).is_err() {
                        tracing::debug!("orchestrator gone, closing I/O context");
                        break;
                    }
                }
                Err(e) => {
                    // ICMP port-unreachable and friends surface here on some
                    // platforms; the socket itself is still usable.
                    let err = TransportError::ReceiveFailed(e);
                    let pause = backoff.on_error();
                    if backoff.should_warn() {
                        tracing::warn!(
                            error = %err,
                            consecutive = backoff.consecutive,
                            "recv_from failed"
                        );
                    } else {
                        tracing::trace!(error = %err, "recv_from failed");
                    }
                    if !pause.is_zero() {
                        tokio::time::sleep(pause).await;
                    }
                }
            },
        }
    }

    tracing::info!(?local, "UDP socket released");
}

/// Serves commands until a `Bind` succeeds. Returns `None` on close.
async fn wait_for_bind(peer: &mut BridgePeer) -> Option<UdpSocket> {
    loop {
        let cmd = tokio::select! {
            _ = peer.cancel.cancelled() => return None,
            cmd = peer.commands.recv() => cmd?,
        };

        match cmd {
            BridgeCommand::Bind { addr, reply } => match bind(addr).await {
                Ok((socket, local)) => {
                    tracing::info!(%local, "UDP socket bound");
                    let _ = reply.send(Ok(local));
                    return Some(socket);
                }
                Err(e) => {
                    tracing::error!(%addr, error = %e, "UDP bind failed");
                    let _ = reply.send(Err(e));
                }
            },
            BridgeCommand::SendPacket(dgram) => {
                tracing::debug!(
                    remote = %dgram.remote,
                    "dropping send on unbound socket"
                );
            }
            BridgeCommand::Close => return None,
        }
    }
}

async fn bind(
    addr: SocketAddr,
) -> Result<(UdpSocket, SocketAddr), TransportError> {
    let socket = UdpSocket::bind(addr)
        .await
        .map_err(TransportError::BindFailed)?;
    let local = socket.local_addr().map_err(TransportError::BindFailed)?;
    Ok((socket, local))
}

async fn transmit(socket: &UdpSocket, dgram: Datagram) {
    if let Err(e) = socket.send_to(&dgram.data, dgram.remote).await {
        let err = TransportError::SendFailed(e);
        tracing::warn!(remote = %dgram.remote, error = %err, "send_to failed");
    }
}

/// Sends whatever is still queued behind a `Close`.
async fn flush(socket: &UdpSocket, peer: &mut BridgePeer) {
    let mut flushed = 0usize;
    while let Ok(cmd) = peer.commands.try_recv() {
        if let BridgeCommand::SendPacket(dgram) = cmd {
            transmit(socket, dgram).await;
            flushed += 1;
        }
    }
    if flushed > 0 {
        tracing::debug!(flushed, "flushed queued sends on close");
    }
}

/// Paces a run of consecutive `recv_from` failures.
///
/// The first failure is retried at once. After that the pause doubles from
/// 1 ms up to 100 ms, and only every power-of-two failure is logged at
/// `warn`.
#[derive(Debug, Default)]
struct RecvBackoff {
    consecutive: u32,
}

impl RecvBackoff {
    const BASE: Duration = Duration::from_millis(1);
    const MAX: Duration = Duration::from_millis(100);

    fn reset(&mut self) {
        self.consecutive = 0;
    }

    /// Records a failure and returns how long to pause before the next
    /// receive.
    fn on_error(&mut self) -> Duration {
        self.consecutive = self.consecutive.saturating_add(1);
        if self.consecutive == 1 {
            return Duration::ZERO;
        }
        let shift = (self.consecutive - 2).min(7);
        (Self::BASE * (1u32 << shift)).min(Self::MAX)
    }

    fn should_warn(&self) -> bool {
        self.consecutive.is_power_of_two()
    }
}
