//! Unified error type for the H1emu session layer.

use h1emu_protocol::ProtocolError;
use h1emu_session::SessionError;
use h1emu_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attributes let `?` convert sub-crate errors.
///
/// Note what is *not* here: rejected admissions, refused sends and
/// undecodable datagrams are absorbed by the orchestrator and only show
/// up in logs.
#[derive(Debug, thiserror::Error)]
pub enum H1emuError {
    /// A transport-level error (bind, I/O context gone).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encode failed).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A session-level error (unknown session).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The configuration could not be loaded.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The server has stopped; its handle can no longer reach it.
    #[error("server stopped")]
    Stopped,

    /// The orchestrator task panicked or was aborted.
    #[error("orchestrator task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
