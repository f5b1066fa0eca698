//! `H1emuServer` builder, startup and the handle used to drive a running
//! server.
//!
//! Starting a server spawns two tasks that only talk over channels:
//!
//! ```text
//!   UdpBridge (I/O context)  ──BridgeEvent──▶  Orchestrator
//!          ▲                                      │
//!          └────────────BridgeCommand─────────────┘
//! ```
//!
//! The [`ServerHandle`] returned by [`H1emuServer::start`] talks to the
//! orchestrator the same way.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use h1emu_keepalive::KeepaliveScheduler;
use h1emu_protocol::{Codec, Opcode};
use h1emu_session::{Session, SessionId, SessionRegistry};
use h1emu_transport::{BridgeHandle, UdpBridge};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::handler::MessageHandler;
use crate::orchestrator::{Orchestrator, ServerCommand};
use crate::H1emuError;

/// Builder for configuring an H1emu server.
///
/// # Example
///
/// ```rust,ignore
/// use h1emu::prelude::*;
///
/// let handle = H1emuServer::builder()
///     .port(1110)
///     .ping_timeout(Duration::from_secs(12))
///     .build(MyHandler, JsonCodec)
///     .start()
///     .await?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct H1emuServerBuilder {
    config: ServerConfig,
}

impl H1emuServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the UDP port. 0 lets the OS pick one.
    pub fn port(mut self, port: u16) -> Self {
        self.config.server_port = port;
        self
    }

    /// Sets the local address to bind.
    pub fn bind_address(mut self, addr: IpAddr) -> Self {
        self.config.bind_address = addr;
        self
    }

    /// Sets the ping timer period, in whole milliseconds. Anything below
    /// 1 ms is raised to 1 ms when the server starts.
    pub fn ping_time(mut self, period: Duration) -> Self {
        self.config.ping_time = whole_millis(period);
        self
    }

    /// Sets the idle window before a silent peer is evicted, in whole
    /// milliseconds. Anything below 1 ms is raised to 1 ms when the server
    /// starts.
    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.config.ping_timeout = whole_millis(timeout);
        self
    }

    /// Sets the receive buffer size.
    pub fn max_datagram_size(mut self, size: usize) -> Self {
        self.config.max_datagram_size = size;
        self
    }

    /// Attaches the message handler and codec.
    pub fn build<H, C>(self, handler: H, codec: C) -> H1emuServer<H, C>
    where
        H: MessageHandler<C>,
        C: Codec + Clone,
    {
        H1emuServer {
            config: self.config,
            handler,
            codec,
        }
    }
}

/// Config durations are stored as milliseconds; saturates instead of
/// wrapping.
fn whole_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// A configured, not yet running H1emu server.
pub struct H1emuServer<H, C> {
    config: ServerConfig,
    handler: H,
    codec: C,
}

impl H1emuServer<(), ()> {
    /// Creates a new builder.
    pub fn builder() -> H1emuServerBuilder {
        H1emuServerBuilder::new()
    }
}

impl<H, C> H1emuServer<H, C>
where
    H: MessageHandler<C>,
    C: Codec + Clone,
{
    /// The configuration this server will start with.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds the UDP socket and starts serving.
    ///
    /// Resolves once the socket is bound, so [`ServerHandle::local_addr`]
    /// is valid immediately.
    ///
    /// # Errors
    /// Returns `H1emuError::Transport` if the bind fails.
    pub async fn start(self) -> Result<ServerHandle<C>, H1emuError> {
        let bridge = UdpBridge::spawn(self.config.bridge());
        self.start_with_bridge(bridge).await
    }

    /// Starts serving over an already spawned I/O context.
    ///
    /// The orchestrator does not care what is on the other end of the
    /// bridge, so tests can drive a [`BridgePeer`](h1emu_transport::BridgePeer)
    /// by hand.
    pub async fn start_with_bridge(
        self,
        bridge: BridgeHandle,
    ) -> Result<ServerHandle<C>, H1emuError> {
        let Self {
            config,
            handler,
            codec,
        } = self;

        let local_addr = match bridge.bind(config.bind_addr()).await {
            Ok(addr) => addr,
            Err(e) => {
                tracing::error!(addr = %config.bind_addr(), error = %e, "bind failed");
                let _ = bridge.close(config.shutdown_grace()).await;
                return Err(e.into());
            }
        };

        let keepalive = KeepaliveScheduler::new(config.keepalive());
        let ping_timeout = keepalive.config().ping_timeout;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let orchestrator = Orchestrator {
            registry: SessionRegistry::new(),
            keepalive,
            handler,
            codec: codec.clone(),
            bridge,
            commands: cmd_rx,
            shutdown: shutdown.clone(),
            ping_timeout,
            shutdown_grace: config.shutdown_grace(),
        };
        let task = tokio::spawn(orchestrator.run());

        tracing::info!(
            %local_addr,
            ping_ms = config.ping_time,
            timeout_ms = config.ping_timeout,
            "H1emu server listening"
        );

        Ok(ServerHandle {
            local_addr,
            commands: cmd_tx,
            codec,
            shutdown,
            task,
        })
    }
}

/// Handle to a running server.
///
/// Every query round-trips through the orchestrator task, so answers
/// reflect every datagram it processed before the query arrived.
///
/// Dropping the handle shuts the server down the same way
/// [`stop`](Self::stop) does, without waiting for it to finish.
pub struct ServerHandle<C> {
    local_addr: SocketAddr,
    commands: mpsc::UnboundedSender<ServerCommand>,
    codec: C,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), H1emuError>>,
}

impl<C: Codec> ServerHandle<C> {
    /// The address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns `true` until the orchestrator has exited.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Sends a message to a session.
    ///
    /// Send gating is applied by the orchestrator: a send to an absent
    /// session, or a non-session-request send to a pending one, is dropped
    /// without error.
    ///
    /// # Errors
    /// - `H1emuError::Protocol` if `payload` fails to encode
    /// - `H1emuError::Stopped` if the server is no longer running
    pub fn send<T: Serialize>(
        &self,
        session: SessionId,
        opcode: Opcode,
        payload: &T,
    ) -> Result<(), H1emuError> {
        let frame = self.codec.encode(opcode, payload)?;
        self.commands
            .send(ServerCommand::Send {
                session,
                opcode,
                frame,
            })
            .map_err(|_| H1emuError::Stopped)
    }

    /// Marks a session as established.
    ///
    /// # Errors
    /// - `H1emuError::Session` if there is no such session
    /// - `H1emuError::Stopped` if the server is no longer running
    pub async fn establish(&self, session: SessionId) -> Result<(), H1emuError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(ServerCommand::Establish {
                session,
                reply: reply_tx,
            })
            .map_err(|_| H1emuError::Stopped)?;
        Ok(reply_rx.await.map_err(|_| H1emuError::Stopped)??)
    }

    /// Snapshot of one session, if it exists.
    pub async fn session(&self, session: SessionId) -> Result<Option<Session>, H1emuError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(ServerCommand::GetSession {
                session,
                reply: reply_tx,
            })
            .map_err(|_| H1emuError::Stopped)?;
        reply_rx.await.map_err(|_| H1emuError::Stopped)
    }

    /// Number of sessions (any state).
    pub async fn session_count(&self) -> Result<usize, H1emuError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(ServerCommand::SessionCount { reply: reply_tx })
            .map_err(|_| H1emuError::Stopped)?;
        reply_rx.await.map_err(|_| H1emuError::Stopped)
    }

    /// Stops the server.
    ///
    /// Cancels every keepalive timer, evicts every session, lets the I/O
    /// context flush queued sends (bounded by the configured shutdown
    /// grace) and waits for both tasks to exit.
    ///
    /// # Errors
    /// Returns the error the orchestrator stopped with, if it had already
    /// stopped on its own because the I/O context went away.
    pub async fn stop(self) -> Result<(), H1emuError> {
        tracing::info!(local_addr = %self.local_addr, "stopping H1emu server");
        self.shutdown.cancel();
        self.task.await?
    }
}
