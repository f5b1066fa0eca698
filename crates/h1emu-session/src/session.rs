//! Session types: the server's record of one peer endpoint.
//!
//! A session tracks:
//! - WHO the peer is (`SessionId`, derived from its address and port)
//! - WHERE the handshake stands (`Pending` or `Established`)
//! - WHEN the peer was last heard from (for keepalive eviction)

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use h1emu_protocol::Opcode;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// SessionId
// ---------------------------------------------------------------------------

/// Identity of a session, derived from the peer's `(address, port)`.
///
/// The same endpoint always yields the same id, so a datagram can be
/// matched to its session without any token on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(SocketAddr);

impl SessionId {
    /// Derives the id of the session for `remote`.
    pub fn new(remote: SocketAddr) -> Self {
        Self(remote)
    }

    /// The peer endpoint this id stands for.
    pub fn remote(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for SessionId {
    fn from(remote: SocketAddr) -> Self {
        Self::new(remote)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0.ip(), self.0.port())
    }
}

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// Handshake progress of a session.
///
/// ```text
///   Pending ──(application confirms handshake)──→ Established
/// ```
///
/// There is no way back. Eviction is not a state: an evicted session is
/// simply no longer in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Admitted, handshake not yet confirmed.
    Pending,
    /// Handshake confirmed; application traffic may flow.
    Established,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Established => write!(f, "Established"),
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One admitted peer.
///
/// Fields are only mutated through [`SessionRegistry`](crate::SessionRegistry),
/// which keeps `last_seen` monotonic and `state` forward-only.
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    state: SessionState,
    last_seen: Instant,
    created_at: Instant,
}

impl Session {
    pub(crate) fn new(id: SessionId, now: Instant) -> Self {
        Self {
            id,
            state: SessionState::Pending,
            last_seen: now,
            created_at: now,
        }
    }

    /// This session's id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The peer endpoint.
    pub fn remote(&self) -> SocketAddr {
        self.id.remote()
    }

    /// The peer's IP address.
    pub fn address(&self) -> IpAddr {
        self.id.remote().ip()
    }

    /// The peer's port.
    pub fn port(&self) -> u16 {
        self.id.remote().port()
    }

    /// Current handshake state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns `true` once the application has confirmed the handshake.
    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    /// When the most recent datagram from this peer arrived.
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// When the session was admitted.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// How long the peer has been silent as of `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }

    /// Returns `true` if the peer has been silent for strictly longer than
    /// `timeout`.
    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        self.idle_for(now) > timeout
    }

    /// Outbound gating policy.
    ///
    /// An established session may receive anything. A pending one may
    /// only receive the session request that drives the handshake.
    pub fn may_send(&self, opcode: Opcode) -> bool {
        self.is_established() || opcode == Opcode::SESSION_REQUEST
    }

    /// Records inbound traffic. Never moves `last_seen` backwards.
    pub(crate) fn touch(&mut self, now: Instant) {
        if now > self.last_seen {
            self.last_seen = now;
        }
    }

    /// Confirms the handshake. Returns `true` if the state changed.
    pub(crate) fn establish(&mut self) -> bool {
        let changed = self.state == SessionState::Pending;
        self.state = SessionState::Established;
        changed
    }
}
