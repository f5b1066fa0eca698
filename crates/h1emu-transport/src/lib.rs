//! Isolated datagram I/O for the H1emu session layer.
//!
//! The socket lives in its own Tokio task (the "I/O context"). Nothing
//! outside that task ever touches it: the orchestrator talks to the task
//! through a pair of ordered channels carrying [`BridgeCommand`]s one way
//! and [`BridgeEvent`]s the other. Buffers are moved through the channels,
//! never shared.
//!
//! ```text
//! orchestrator ──BridgeCommand──→ I/O context ──→ UdpSocket
//! orchestrator ←──BridgeEvent──── I/O context ←── UdpSocket
//! ```
//!
//! [`bridge_channel`] builds the bare channel pair. [`UdpBridge::spawn`]
//! builds one and drives its far end with a real UDP socket.
//!
//! # Feature Flags
//!
//! - `udp` (default): UDP I/O context via `tokio::net::UdpSocket`

mod error;
#[cfg(feature = "udp")]
mod udp;

pub use error::TransportError;
#[cfg(feature = "udp")]
pub use udp::{BridgeConfig, UdpBridge};

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A raw datagram and the endpoint it came from or goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Undecoded payload bytes.
    pub data: Vec<u8>,
    /// Remote endpoint.
    pub remote: SocketAddr,
}

/// Messages from the orchestrator to the I/O context.
#[derive(Debug)]
pub enum BridgeCommand {
    /// Bind the socket and start receiving. The bound local address (or
    /// the bind error) comes back on `reply`.
    Bind {
        addr: SocketAddr,
        reply: oneshot::Sender<Result<SocketAddr, TransportError>>,
    },

    /// Transmit a prepared buffer.
    SendPacket(Datagram),

    /// Flush queued sends, release the socket and exit.
    Close,
}

/// Messages from the I/O context to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// A datagram arrived.
    Inbound(Datagram),
}

/// The orchestrator's end of the bridge.
pub struct BridgeHandle {
    commands: mpsc::UnboundedSender<BridgeCommand>,
    events: mpsc::UnboundedReceiver<BridgeEvent>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// The I/O context's end of the bridge.
///
/// [`UdpBridge`] drives one of these with a socket. Tests and alternative
/// transports can drive it by hand.
pub struct BridgePeer {
    /// Commands sent by the orchestrator.
    pub commands: mpsc::UnboundedReceiver<BridgeCommand>,
    /// Events delivered to the orchestrator.
    pub events: mpsc::UnboundedSender<BridgeEvent>,
    /// Cancelled when the orchestrator gives up waiting for a clean close.
    pub cancel: CancellationToken,
}

/// Creates a connected [`BridgeHandle`] / [`BridgePeer`] pair.
///
/// Channels are unbounded: a burst of datagrams is queued as fast as it
/// arrives.
pub fn bridge_channel() -> (BridgeHandle, BridgePeer) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let handle = BridgeHandle {
        commands: cmd_tx,
        events: event_rx,
        cancel: cancel.clone(),
        task: None,
    };
    let peer = BridgePeer {
        commands: cmd_rx,
        events: event_tx,
        cancel,
    };
    (handle, peer)
}

impl BridgeHandle {
    /// Associates the task driving the peer end, so [`close`](Self::close)
    /// can wait for it.
    pub fn attach(&mut self, task: JoinHandle<()>) {
        self.task = Some(task);
    }

    /// Asks the I/O context to bind `addr` and waits for the outcome.
    pub async fn bind(
        &self,
        addr: SocketAddr,
    ) -> Result<SocketAddr, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(BridgeCommand::Bind {
                addr,
                reply: reply_tx,
            })
            .map_err(|_| TransportError::Shutdown)?;
        reply_rx.await.map_err(|_| TransportError::Shutdown)?
    }

    /// Hands a buffer to the I/O context for transmission.
    ///
    /// Ownership of `data` moves across the channel; delivery is best
    /// effort.
    pub fn send(
        &self,
        data: Vec<u8>,
        remote: SocketAddr,
    ) -> Result<(), TransportError> {
        self.commands
            .send(BridgeCommand::SendPacket(Datagram { data, remote }))
            .map_err(|_| TransportError::Shutdown)
    }

    /// Waits for the next event. `None` means the I/O context is gone.
    pub async fn recv(&mut self) -> Option<BridgeEvent> {
        self.events.recv().await
    }

    /// Closes the bridge.
    ///
    /// Sends [`BridgeCommand::Close`] so the I/O context flushes the sends
    /// already queued, then waits up to `grace` for it to exit. If it is
    /// still running after that, it is cancelled.
    pub async fn close(mut self, grace: Duration) -> Result<(), TransportError> {
        let _ = self.commands.send(BridgeCommand::Close);
        self.events.close();

        let Some(mut task) = self.task.take() else {
            return Ok(());
        };

        match tokio::time::timeout(grace, &mut task).await {
            Ok(_) => Ok(()),
            Err(_) => {
                tracing::warn!(
                    grace_ms = grace.as_millis() as u64,
                    "I/O context did not close in time, cancelling"
                );
                self.cancel.cancel();
                let _ = task.await;
                Ok(())
            }
        }
    }
}
