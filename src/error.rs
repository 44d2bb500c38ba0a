use thiserror::Error;

use crate::services::notification::NotifyError;
use crate::services::state_machine::TransitionError;

/// Engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// Version check on the grouping counter failed; the caller retries the
    /// whole ingestion with jittered backoff. Never surfaced to a user.
    #[error("Concurrent update on grouping counter")]
    ConcurrentUpdate,

    #[error("Direct paging requires a team or at least one user")]
    UserOrTeamRequired,

    #[error("Alert group is resolved and cannot be paged")]
    AlertGroupResolved,

    #[error("A user must keep at least one notification policy step")]
    LastPolicyStep,

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Notification delivery failed: {0}")]
    Delivery(#[from] NotifyError),

    #[error("Incident API error (status {status}): {message}")]
    RemoteIncident { status: u16, message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether a failed task carrying this error should be retried by the
    /// queue. Validation-class errors and terminal delivery failures are not;
    /// everything else goes back through the backoff machinery.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::NotFound(_)
            | EngineError::Validation(_)
            | EngineError::UserOrTeamRequired
            | EngineError::AlertGroupResolved
            | EngineError::LastPolicyStep
            | EngineError::Transition(_) => false,
            EngineError::Delivery(e) => e.is_transient(),
            // 404 from the incident API self-heals at the call site; anything
            // that still propagates here is worth another attempt.
            EngineError::RemoteIncident { .. } => true,
            EngineError::ConcurrentUpdate
            | EngineError::Database(_)
            | EngineError::Serialization(_)
            | EngineError::Internal(_) => true,
        }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
