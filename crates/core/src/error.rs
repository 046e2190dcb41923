//! Error model shared by background workers and their collaborators.

use std::time::Duration;

use thiserror::Error;

/// Result type returned by task handlers.
pub type TaskResult = Result<(), TaskError>;

/// Failure of an external persistence call (log batch insert, named computation).
///
/// Keep this focused on what the caller can observe; the backing store maps its own
/// driver errors into one of these variants.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store could not be reached (pool closed, network error).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected the operation (constraint, syntax, procedure error).
    #[error("store rejected operation: {0}")]
    Rejected(String),

    /// The call did not complete within the configured upper bound.
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// The request was malformed before reaching the store.
    #[error("invalid store request: {0}")]
    InvalidInput(String),
}

impl StoreError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

/// Failure of a task handler.
///
/// Handler failures never reach the code that enqueued the work; the dispatcher
/// reports them to the diagnostics sink and moves on.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The work item is missing a field this task type requires.
    #[error("invalid payload for {task}: {reason}")]
    InvalidPayload { task: String, reason: String },

    /// The external operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The handler did not finish within the configured upper bound.
    #[error("handler timed out after {0:?}")]
    Timeout(Duration),

    /// Any other handler-specific failure.
    #[error("handler failed: {0}")]
    Failed(String),
}

impl TaskError {
    pub fn invalid_payload(task: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            task: task.into(),
            reason: reason.into(),
        }
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// An identifier string could not be parsed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid {kind}: {reason}")]
pub struct ParseIdError {
    kind: &'static str,
    reason: String,
}

impl ParseIdError {
    pub fn new(kind: &'static str, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}
