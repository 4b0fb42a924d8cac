//! Server error taxonomy.
//!
//! Failures inside one session's command processing are confined to that
//! session and reported to its viewers; they never cross the registry
//! boundary. `AlreadyExited` and `StaleRequest` are benign races that get
//! swallowed (logged, not propagated).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The hosted process could not start. Fatal to the session.
    #[error("failed to spawn hosted process: {0}")]
    SpawnFailed(String),

    /// Termination raced with natural exit. Benign; swallowed.
    #[error("hosted process already exited")]
    AlreadyExited,

    #[error("session {0} not found")]
    NotFound(String),

    /// Proxy target not yet listening. Surfaced to probing clients as a
    /// distinguishable response, never escalated server-side.
    #[error("backend on port {0} is not ready")]
    BackendUnready(u16),

    /// A permission response referencing a request that is no longer
    /// current. Ignored.
    #[error("permission response names stale request {0}")]
    StaleRequest(String),
}
