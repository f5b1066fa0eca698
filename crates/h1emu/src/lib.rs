//! # H1emu
//!
//! Session and admission layer for H1emu game servers over UDP.
//!
//! The server owns the socket, decides which peers may talk to it, keeps
//! their sessions alive with pings and evicts the ones that go silent.
//! Application logic implements a single [`MessageHandler`] trait and
//! receives only decoded messages from admitted peers.
//!
//! ## Session lifecycle
//!
//! - An unknown peer is admitted only if its first datagram leads with a
//!   session request (`0x01`) or reply (`0x02`). Anything else is dropped.
//! - A new session is *pending*: the only thing the server will send it
//!   is a session request. The handler lifts this by calling
//!   [`SessionContext::establish`].
//! - Established sessions are pinged every `pingTime` ms. A session
//!   silent for longer than `pingTimeout` ms is evicted and must be
//!   admitted again from scratch.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use h1emu::prelude::*;
//!
//! struct Login;
//!
//! impl MessageHandler<JsonCodec> for Login {
//!     type Payload = serde_json::Value;
//!
//!     fn on_message(
//!         &mut self,
//!         ctx: &mut SessionContext<'_, JsonCodec>,
//!         session: SessionId,
//!         opcode: Opcode,
//!         _payload: serde_json::Value,
//!     ) {
//!         if opcode == Opcode::SESSION_REQUEST {
//!             let _ = ctx.establish(session);
//!             ctx.send(session, Opcode::SESSION_REPLY, &());
//!         }
//!     }
//! }
//!
//! # async fn run() -> Result<(), H1emuError> {
//! let handle = H1emuServer::builder()
//!     .port(1110)
//!     .build(Login, JsonCodec)
//!     .start()
//!     .await?;
//! handle.stop().await
//! # }
//! ```

mod config;
mod error;
mod handler;
mod orchestrator;
mod server;

pub use config::ServerConfig;
pub use error::H1emuError;
pub use handler::{EvictionReason, MessageHandler, SessionContext};
pub use server::{H1emuServer, H1emuServerBuilder, ServerHandle};

pub use h1emu_keepalive::KeepaliveConfig;
pub use h1emu_protocol::{Codec, Frame, JsonCodec, Opcode, ProtocolError};
pub use h1emu_session::{Session, SessionError, SessionId, SessionState};
pub use h1emu_transport::{
    BridgeCommand, BridgeEvent, BridgeHandle, BridgePeer, Datagram, TransportError,
    bridge_channel,
};

/// Everything needed to write a handler and run a server.
pub mod prelude {
    pub use crate::{
        Codec, EvictionReason, H1emuError, H1emuServer, JsonCodec, MessageHandler, Opcode,
        ServerConfig, ServerHandle, Session, SessionContext, SessionId, SessionState,
    };
}
