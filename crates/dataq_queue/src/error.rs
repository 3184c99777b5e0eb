//! Error types for the task queue.

use thiserror::Error;

use crate::task::TaskStatus;

/// Queue operation result type.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Queue errors.
#[derive(Error, Debug)]
pub enum QueueError {
    /// A task with this id already exists
    #[error("Duplicate task id: {0}")]
    Duplicate(String),

    /// No task with this id
    #[error("Task not found: {0}")]
    NotFound(String),

    /// Task violates the action/content_hash invariant or has bad fields
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    /// Status change not allowed by the task state machine
    #[error("Invalid transition for task {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// Queue was closed
    #[error("Queue is closed")]
    Closed,

    /// SQLx error (connection, query, etc.)
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// IO error (append log)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    pub fn invalid_task(msg: impl Into<String>) -> Self {
        Self::InvalidTask(msg.into())
    }
}
