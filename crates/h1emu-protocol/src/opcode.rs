//! Opcodes: the message-type byte that leads every datagram.

use std::fmt;

/// A message type, carried as the first byte of a datagram.
///
/// The session layer only gives meaning to a handful of opcodes; every
/// other value belongs to the application and passes through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Opcode(pub u8);

impl Opcode {
    /// A peer asks to open a session. Admission opcode, and the only
    /// message that may be sent to a session that is not yet established.
    pub const SESSION_REQUEST: Opcode = Opcode(0x01);

    /// Answer to a session request. Admission opcode.
    pub const SESSION_REPLY: Opcode = Opcode(0x02);

    /// Keepalive probe.
    pub const PING: Opcode = Opcode(0x03);

    /// Acknowledgement.
    pub const ACK: Opcode = Opcode(0x04);

    /// Returns `true` if an unrecognized peer may open a session with this
    /// opcode.
    pub fn is_admission(self) -> bool {
        self == Self::SESSION_REQUEST || self == Self::SESSION_REPLY
    }

    /// Reads the opcode from the first byte of a datagram.
    pub fn peek(data: &[u8]) -> Option<Opcode> {
        data.first().copied().map(Opcode)
    }

    /// Human-readable name for logs. Application opcodes are `"Unknown"`.
    pub fn name(self) -> &'static str {
        match self {
            Self::SESSION_REQUEST => "SessionRequest",
            Self::SESSION_REPLY => "SessionReply",
            Self::PING => "Ping",
            Self::ACK => "Ack",
            _ => "Unknown",
        }
    }
}

impl From<u8> for Opcode {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<Opcode> for u8 {
    fn from(value: Opcode) -> Self {
        value.0
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x} ({})", self.0, self.name())
    }
}
