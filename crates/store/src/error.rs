//! Error types for the durable store.

use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A terminal event is already recorded; callers treat this as a no-op.
    #[error("Execution {0} already has a terminal event")]
    TerminalRecorded(i64),

    /// Duplicate `(execution_id, event_id)` append.
    #[error("Duplicate event {event_id} for execution {execution_id}")]
    DuplicateEvent { execution_id: i64, event_id: i64 },

    /// Conflict (e.g. lease or broker slot held elsewhere).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Encryption error.
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid stored data (unparseable enum value, corrupt payload).
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Result type alias using StoreError.
pub type StoreResult<T> = Result<T, StoreError>;

impl From<floe_core::CoreError> for StoreError {
    fn from(err: floe_core::CoreError) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

impl From<envy::Error> for StoreError {
    fn from(err: envy::Error) -> Self {
        StoreError::Config(err.to_string())
    }
}
