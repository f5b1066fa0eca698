//! Error types for the session layer.

use crate::SessionId;

/// Errors that can occur during session management.
///
/// Admission rejections are not errors: an unknown peer sending a
/// non-admission opcode is routine noise and yields
/// [`Admission::Rejected`](crate::Admission::Rejected).
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No session exists for the given peer. It was never admitted or has
    /// already been evicted.
    #[error("session not found for peer {0}")]
    NotFound(SessionId),
}
