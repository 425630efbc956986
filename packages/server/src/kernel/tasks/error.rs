//! Structured errors for the task engine.
//!
//! Pattern-matchable kinds instead of a generic error: the REST layer maps
//! these onto status codes, the worker loop branches on them.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use super::task::TaskStatus;

#[derive(Debug, Error)]
pub enum TaskError {
    /// Input failed a boundary check; reported synchronously to the submitter.
    #[error("{0}")]
    Validation(String),

    /// Task id unknown or soft-deleted.
    #[error("task {0} not found")]
    NotFound(Uuid),

    /// Task id already present at create.
    #[error("task {0} already exists")]
    Conflict(Uuid),

    /// Operation not applicable to the task's current state.
    #[error("task {id} is {status}")]
    InvalidStatus { id: Uuid, status: TaskStatus },

    /// The target URL is quarantined by its circuit breaker.
    #[error("circuit open for {url}")]
    CircuitOpen { url: String },

    /// `start` called on an engine that is already running.
    #[error("engine already started")]
    AlreadyStarted,

    /// Teardown did not finish within the caller's deadline.
    #[error("shutdown deadline of {0:?} exceeded")]
    ShutdownTimeout(Duration),

    /// A store call exceeded its soft timeout.
    #[error("store call timed out after {0:?}")]
    StoreTimeout(Duration),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TaskError {
    /// True for errors the submitter caused (4xx at the REST surface).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            TaskError::Validation(_)
                | TaskError::NotFound(_)
                | TaskError::Conflict(_)
                | TaskError::InvalidStatus { .. }
        )
    }
}
