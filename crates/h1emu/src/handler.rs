//! The extension point: what the server calls when a session speaks.
//!
//! The session layer decides *whether* a datagram is let in. What it means
//! is up to a [`MessageHandler`], which sees every decoded message from an
//! admitted peer and answers through a [`SessionContext`].

use h1emu_protocol::{Codec, Opcode};
use h1emu_session::{Session, SessionError, SessionId, SessionRegistry, SessionState};
use h1emu_transport::BridgeHandle;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Why a session left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// Silent for longer than the ping timeout.
    Timeout,
    /// The server is stopping.
    Shutdown,
}

/// Application logic plugged into an [`H1emuServer`](crate::H1emuServer).
///
/// Called on the orchestrator task, one message at a time, so `&mut self`
/// needs no locking. Don't block in here: every other session waits.
///
/// `Payload` is what the body after the opcode byte decodes to. Bodies
/// that fail to decode are dropped before they reach the handler. An empty
/// body decodes as `null`, so pick a type that accepts it
/// (`serde_json::Value`, an `Option`) if peers send bare opcodes.
///
/// ```rust,ignore
/// struct Login;
///
/// impl MessageHandler<JsonCodec> for Login {
///     type Payload = serde_json::Value;
///
///     fn on_message(
///         &mut self,
///         ctx: &mut SessionContext<'_, JsonCodec>,
///         session: SessionId,
///         opcode: Opcode,
///         _payload: serde_json::Value,
///     ) {
///         if opcode == Opcode::SESSION_REQUEST {
///             let _ = ctx.establish(session);
///             ctx.send(session, Opcode::SESSION_REPLY, &());
///         }
///     }
/// }
/// ```
pub trait MessageHandler<C: Codec>: Send + 'static {
    /// Decoded message body.
    type Payload: DeserializeOwned + Send;

    /// A decoded message arrived from an admitted peer.
    fn on_message(
        &mut self,
        ctx: &mut SessionContext<'_, C>,
        session: SessionId,
        opcode: Opcode,
        payload: Self::Payload,
    );

    /// A session was removed. It is already gone from the registry.
    fn on_session_evicted(&mut self, session: SessionId, reason: EvictionReason) {
        let _ = (session, reason);
    }
}

/// What a handler can do while handling a message.
///
/// Borrowed from the orchestrator for the duration of one call.
pub struct SessionContext<'a, C> {
    pub(crate) registry: &'a mut SessionRegistry,
    pub(crate) codec: &'a C,
    pub(crate) bridge: &'a BridgeHandle,
}

impl<C: Codec> SessionContext<'_, C> {
    /// Sends a message to a session, subject to send gating.
    ///
    /// Returns `false` if nothing was sent: the session is gone, it is
    /// pending and `opcode` isn't the session request, or the payload
    /// failed to encode.
    pub fn send<T: Serialize>(&mut self, session: SessionId, opcode: Opcode, payload: &T) -> bool {
        send_gated(self.registry, self.codec, self.bridge, session, opcode, payload)
    }

    /// Marks `session` as established, lifting the pending send gate.
    pub fn establish(&mut self, session: SessionId) -> Result<(), SessionError> {
        self.registry.establish(session)
    }

    /// Looks up a session.
    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.registry.get(&id)
    }

    /// Iterates over all sessions.
    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.registry.iter()
    }

    /// Number of sessions (any state).
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Number of established sessions.
    pub fn established_count(&self) -> usize {
        self.registry.count_in(SessionState::Established)
    }
}

/// Encodes and sends `payload` if the registry allows it.
pub(crate) fn send_gated<C: Codec, T: Serialize>(
    registry: &SessionRegistry,
    codec: &C,
    bridge: &BridgeHandle,
    session: SessionId,
    opcode: Opcode,
    payload: &T,
) -> bool {
    let Some(remote) = registry.outbound_target(session, opcode) else {
        tracing::trace!(peer = %session, %opcode, "send refused");
        return false;
    };
    match codec.encode(opcode, payload) {
        Ok(frame) => transmit(bridge, remote, opcode, frame),
        Err(e) => {
            tracing::warn!(peer = %session, %opcode, error = %e, "encode failed");
            false
        }
    }
}

/// Sends an already-encoded frame if the registry allows it.
pub(crate) fn send_frame(
    registry: &SessionRegistry,
    bridge: &BridgeHandle,
    session: SessionId,
    opcode: Opcode,
    frame: Vec<u8>,
) -> bool {
    let Some(remote) = registry.outbound_target(session, opcode) else {
        tracing::trace!(peer = %session, %opcode, "send refused");
        return false;
    };
    transmit(bridge, remote, opcode, frame)
}

fn transmit(
    bridge: &BridgeHandle,
    remote: std::net::SocketAddr,
    opcode: Opcode,
    frame: Vec<u8>,
) -> bool {
    let len = frame.len();
    match bridge.send(frame, remote) {
        Ok(()) => {
            tracing::trace!(%remote, %opcode, len, "datagram queued");
            true
        }
        Err(e) => {
            tracing::warn!(%remote, %opcode, error = %e, "I/O context unavailable");
            false
        }
    }
}
