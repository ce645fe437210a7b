//! Error types for the scheduler.

use thiserror::Error;

use crate::JobStatus;

/// Errors raised by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The persisted document is not in the expected shape.
    #[error("corrupt job store: {0}")]
    Corrupt(String),

    /// The backend cannot currently serve requests.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Collection name is not a valid identifier.
    #[error("invalid collection name: {0}")]
    InvalidCollection(String),

    /// A blocking storage task panicked or was cancelled.
    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Storage backend failure. Aborts the current tick.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Job type is empty or otherwise unusable as a registry key.
    #[error("invalid job type: {0:?}")]
    InvalidJobType(String),

    /// Invalid job or scheduler configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A job was asked to move between states the lifecycle does not allow.
    #[error("invalid job transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// No handler is registered for the job's type.
    #[error("no handler registered for job type: {0}")]
    HandlerNotFound(String),
}
