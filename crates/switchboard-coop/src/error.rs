//! Error types for cooperation session operations.

use thiserror::Error;

/// Result type alias for cooperation operations.
pub type CoopResult<T> = Result<T, CooperationError>;

/// Errors reported to the caller of a cooperation operation.
///
/// Strategy configuration problems (a missing role) are not errors here:
/// they put the session into the error state instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CooperationError {
    /// A session with this id already exists.
    #[error("session already exists: {session_id}")]
    DuplicateSession { session_id: String },

    /// No session with this id is known.
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    /// The agent is not part of the session.
    #[error("agent '{agent_id}' is not part of session {session_id}")]
    AgentNotInSession { session_id: String, agent_id: String },
}

impl CooperationError {
    pub fn not_found(session_id: &str) -> Self {
        Self::SessionNotFound {
            session_id: session_id.to_string(),
        }
    }
}
