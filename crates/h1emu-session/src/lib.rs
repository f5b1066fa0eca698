//! Peer session management for the H1emu session layer.
//!
//! This crate turns "a datagram arrived from `address:port`" into "this
//! is session X, in state Y":
//!
//! 1. **Identity**: a [`SessionId`] is derived from the peer endpoint
//! 2. **Admission**: [`SessionRegistry::admit`] is the single chokepoint
//!    that decides whether an unknown peer may create a session
//! 3. **State**: `Pending → Established`, driven by the application
//! 4. **Gating**: [`Session::may_send`] decides which outbound messages a
//!    session may receive
//!
//! # How it fits in the stack
//!
//! ```text
//! Orchestrator (above)  ← owns the registry, drives keepalive eviction
//!     ↕
//! Session Layer (this crate)  ← peer identity, admission, send policy
//!     ↕
//! Protocol Layer (below)  ← provides Opcode
//! ```

mod error;
mod registry;
mod session;

pub use error::SessionError;
pub use registry::{Admission, SessionRegistry};
pub use session::{Session, SessionId, SessionState};
