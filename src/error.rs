//! Error types for the dialogue trajectory engine.
//!
//! The taxonomy separates recoverable backend trouble from hard state and
//! integrity violations. Backend errors are retried inside the scheduler up
//! to a bounded budget; everything else is rejected at the call site with
//! the session left untouched.

use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::SchedulerState;

/// Errors surfaced by backend providers (generation or embedding).
#[derive(Debug, Error)]
pub enum BackendError {
    /// The HTTP transport failed or timed out.
    #[error("backend transport error: {message}")]
    Transport { message: String },

    /// The backend answered with a non-success status.
    #[error("backend returned status {status}: {message}")]
    Status { status: u16, message: String },

    /// The response body could not be decoded into the expected shape.
    #[error("backend response malformed: {message}")]
    Malformed { message: String },
}

/// Top-level error type for all engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A generation or embedding call failed after exhausting the retry
    /// budget. `attempts` counts the calls actually made.
    #[error("backend call failed after {attempts} attempts: {source}")]
    TransientBackend {
        #[source]
        source: BackendError,
        attempts: u32,
    },

    /// An operation is not legal in the session's current state. The state
    /// is left unchanged.
    #[error("invalid state transition: {operation} while {from:?}")]
    InvalidStateTransition {
        from: SchedulerState,
        operation: &'static str,
    },

    /// A mutation would corrupt the recorded series (finalized session,
    /// non-monotonic turn index, embedding dimension drift).
    #[error("data integrity violation: {detail}")]
    DataIntegrity { detail: String },

    /// The Analysis record was requested before `end()` completed.
    #[error("analysis not yet available for session {session_id}")]
    AnalysisNotReady { session_id: Uuid },

    /// No live session with this id exists in the registry.
    #[error("unknown session: {session_id}")]
    SessionNotFound { session_id: Uuid },

    /// The roster does not contain the named agent.
    #[error("unknown agent: {agent_id}")]
    UnknownAgent { agent_id: String },

    /// The session task went away while a caller was waiting on a reply.
    #[error("session {session_id} terminated before replying")]
    SessionGone { session_id: Uuid },

    /// Underlying storage failure from the session store.
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether the error is worth retrying at the scheduler level.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::TransientBackend { .. })
    }
}

// ============================================================================
// Tests
// ============================================================================
