//! Wire protocol for the H1emu session layer.
//!
//! - **Opcodes** ([`Opcode`]): the leading byte of every datagram. Two
//!   of them, [`Opcode::SESSION_REQUEST`] and [`Opcode::SESSION_REPLY`],
//!   are admission opcodes: the only ones an unknown peer may open with.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how `(opcode, payload)`
//!   pairs become bytes and back.
//! - **Errors** ([`ProtocolError`]).
//!
//! The session layer treats the codec as opaque. It only relies on the
//! opcode being the first byte, which lets admission decide before any
//! decoding happens.
//!
//! ```text
//! Transport (bytes) → Protocol (opcode, payload) → Session (peer context)
//! ```

mod codec;
mod error;
mod opcode;

pub use codec::{Codec, Frame};
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::ProtocolError;
pub use opcode::Opcode;
