//! The session registry: every admitted peer, keyed by endpoint.
//!
//! It is responsible for:
//! - Admission control: deciding whether a datagram from an unknown peer
//!   may create a session
//! - Tracking liveness (`last_seen`) and handshake state
//! - Resolving outbound destinations under the send policy
//! - Removing sessions on eviction or shutdown
//!
//! # Concurrency note
//!
//! `SessionRegistry` is a plain `HashMap` with no locking. It is owned by
//! the orchestrator task and only ever touched from there, so every
//! mutation happens on one timeline.

use std::collections::HashMap;
use std::net::SocketAddr;

use h1emu_protocol::Opcode;
use tokio::time::Instant;

use crate::{Session, SessionError, SessionId, SessionState};

/// Outcome of [`SessionRegistry::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The peer already had a session. Its `last_seen` was refreshed.
    Existing(SessionId),
    /// The peer was unknown and opened with an admission opcode. A new
    /// `Pending` session was created.
    Created(SessionId),
    /// The peer was unknown and did not open with an admission opcode.
    /// Nothing was created; the datagram should be dropped.
    Rejected,
}

impl Admission {
    /// The admitted session, if any.
    pub fn session_id(self) -> Option<SessionId> {
        match self {
            Self::Existing(id) | Self::Created(id) => Some(id),
            Self::Rejected => None,
        }
    }
}

/// All admitted sessions.
///
/// ## Lifecycle
///
/// ```text
/// admit(0x01|0x02) ──→ [Pending] ──establish()──→ [Established]
///                          │                            │
///                          └──────── evict() ───────────┘
///                                      │
///                                      ▼
///                          gone; only a new admission
///                          opcode brings the peer back
/// ```
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Admission control for one inbound datagram.
    ///
    /// 1. A peer with a session is admitted unconditionally and its
    ///    `last_seen` is advanced to `now`; the opcode is not re-checked.
    /// 2. An unknown peer leading with an admission opcode gets a new
    ///    `Pending` session.
    /// 3. Anyone else is rejected and leaves no trace in the registry.
    pub fn admit(
        &mut self,
        remote: SocketAddr,
        opcode: Opcode,
        now: Instant,
    ) -> Admission {
        let id = SessionId::new(remote);

        if let Some(session) = self.sessions.get_mut(&id) {
            session.touch(now);
            return Admission::Existing(id);
        }

        if !opcode.is_admission() {
            tracing::debug!(
                peer = %id,
                %opcode,
                "connection rejected: unknown peer without admission opcode"
            );
            return Admission::Rejected;
        }

        self.sessions.insert(id, Session::new(id, now));
        tracing::info!(peer = %id, %opcode, "session created");
        Admission::Created(id)
    }

    /// Marks the handshake of `id` as confirmed.
    ///
    /// Idempotent: establishing an established session is a no-op.
    ///
    /// # Errors
    /// Returns [`SessionError::NotFound`] if no session exists.
    pub fn establish(&mut self, id: SessionId) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::NotFound(id))?;

        if session.establish() {
            tracing::info!(peer = %id, "session established");
        }
        Ok(())
    }

    /// Resolves where a message with `opcode` for `id` should go.
    ///
    /// Returns `None` when the send must be refused: the session is
    /// absent, or it is still pending and `opcode` is not the session
    /// request.
    pub fn outbound_target(
        &self,
        id: SessionId,
        opcode: Opcode,
    ) -> Option<SocketAddr> {
        let session = self.sessions.get(&id)?;
        session.may_send(opcode).then(|| session.remote())
    }

    /// Removes a session. Returns it if it existed.
    pub fn evict(&mut self, id: SessionId) -> Option<Session> {
        self.sessions.remove(&id)
    }

    /// Removes and returns every session.
    pub fn drain(&mut self) -> Vec<Session> {
        self.sessions.drain().map(|(_, s)| s).collect()
    }

    /// Looks up a session.
    pub fn get(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    /// Returns `true` if `id` has a session.
    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Iterates over all sessions in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Number of sessions in `state`.
    pub fn count_in(&self, state: SessionState) -> usize {
        self.sessions.values().filter(|s| s.state() == state).count()
    }

    /// Number of sessions (any state).
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns `true` if there are no sessions.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

// =========================================================================
// Tests
// =========================================================================
