//! Error types for the protocol layer.
//!
//! The session layer never escalates these: a frame that fails to decode
//! is transport noise and gets dropped. They exist so codecs can say what
//! went wrong in logs.

/// Errors that can occur while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The datagram had no bytes, so not even an opcode.
    #[error("empty frame")]
    EmptyFrame,

    /// Serializing a payload failed.
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserializing a body failed: malformed, truncated, or the wrong
    /// shape for the expected payload type.
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),
}
