//! Codec trait and the reference JSON codec.
//!
//! A codec turns an `(opcode, payload)` pair into a datagram and back. The
//! one rule every codec must follow is that the opcode is the first byte
//! of the encoded frame: admission control reads it before decoding.

use serde::{de::DeserializeOwned, Serialize};

use crate::{Opcode, ProtocolError};

/// A decoded datagram: its opcode and typed payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame<T> {
    /// Message type.
    pub opcode: Opcode,
    /// Decoded body.
    pub payload: T,
}

/// Encodes and decodes opcode-prefixed frames.
///
/// `Send + Sync + 'static` because the codec lives inside the
/// orchestrator task for the lifetime of the server.
pub trait Codec: Send + Sync + 'static {
    /// Serializes `payload` into a frame led by `opcode`.
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if the payload cannot be
    /// represented in this format.
    fn encode<T: Serialize>(
        &self,
        opcode: Opcode,
        payload: &T,
    ) -> Result<Vec<u8>, ProtocolError>;

    /// Parses a frame.
    ///
    /// # Errors
    /// - `ProtocolError::EmptyFrame` for a zero-length datagram
    /// - `ProtocolError::Decode` if the body is malformed or does not
    ///   match `T`
    fn decode<T: DeserializeOwned>(
        &self,
        data: &[u8],
    ) -> Result<Frame<T>, ProtocolError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] framing JSON bodies behind the opcode byte.
///
/// Layout: `[opcode: u8][body: JSON]`. An empty body reads as JSON
/// `null`, so unit and `Option` payloads (a bare `Ping`, say) can be a
/// single byte on the wire.
///
/// ## Example
///
/// ```rust
/// use h1emu_protocol::{Codec, JsonCodec, Opcode};
///
/// let codec = JsonCodec;
/// let bytes = codec.encode(Opcode::SESSION_REQUEST, &42u32).unwrap();
/// assert_eq!(bytes[0], 0x01);
///
/// let frame = codec.decode::<u32>(&bytes).unwrap();
/// assert_eq!(frame.opcode, Opcode::SESSION_REQUEST);
/// assert_eq!(frame.payload, 42);
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn encode<T: Serialize>(
        &self,
        opcode: Opcode,
        payload: &T,
    ) -> Result<Vec<u8>, ProtocolError> {
        let mut out = vec![opcode.0];
        serde_json::to_writer(&mut out, payload)
            .map_err(ProtocolError::Encode)?;
        Ok(out)
    }

    fn decode<T: DeserializeOwned>(
        &self,
        data: &[u8],
    ) -> Result<Frame<T>, ProtocolError> {
        let (&first, body) =
            data.split_first().ok_or(ProtocolError::EmptyFrame)?;
        let body: &[u8] = if body.is_empty() { b"null" } else { body };
        let payload =
            serde_json::from_slice(body).map_err(ProtocolError::Decode)?;
        Ok(Frame {
            opcode: Opcode(first),
            payload,
        })
    }
}
