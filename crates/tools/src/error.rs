//! Tool execution error types.

use thiserror::Error;

use floe_core::error::{ActionError, ErrorKind};

/// Errors that can occur during tool execution.
#[derive(Debug, Error)]
pub enum ToolError {
    /// No executor registered for the requested kind.
    #[error("Tool not found: {0}")]
    NotFound(String),

    /// Invalid or missing arguments.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Execution timed out.
    #[error("Execution timed out after {0} seconds")]
    Timeout(u64),

    /// Execution was cancelled.
    #[error("Execution cancelled")]
    Cancelled,

    /// HTTP request error.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),

    /// Process spawn/exit error.
    #[error("Process error: {0}")]
    Process(String),

    /// Script evaluation error.
    #[error("Script error: {0}")]
    Script(String),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(String),
}

impl ToolError {
    /// Map into the engine's closed error-kind set for event payloads.
    pub fn to_action_error(&self) -> ActionError {
        let kind = match self {
            ToolError::Timeout(_) => ErrorKind::Timeout,
            ToolError::Cancelled => ErrorKind::Cancelled,
            ToolError::NotFound(_) | ToolError::Configuration(_) => ErrorKind::Validation,
            ToolError::Http(_) | ToolError::Database(_) => ErrorKind::Dependency,
            ToolError::Process(_)
            | ToolError::Script(_)
            | ToolError::Json(_)
            | ToolError::Io(_) => ErrorKind::ExecutorException,
        };
        ActionError::new(kind, self.to_string())
    }
}

impl From<std::io::Error> for ToolError {
    fn from(e: std::io::Error) -> Self {
        ToolError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(e: serde_json::Error) -> Self {
        ToolError::Json(e.to_string())
    }
}

impl From<reqwest::Error> for ToolError {
    fn from(e: reqwest::Error) -> Self {
        ToolError::Http(e.to_string())
    }
}

impl From<tokio_postgres::Error> for ToolError {
    fn from(e: tokio_postgres::Error) -> Self {
        ToolError::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ToolError::NotFound("http".to_string());
        assert_eq!(err.to_string(), "Tool not found: http");

        let err = ToolError::Timeout(30);
        assert_eq!(err.to_string(), "Execution timed out after 30 seconds");
    }

    #[test]
    fn test_action_error_mapping() {
        assert_eq!(
            ToolError::Timeout(5).to_action_error().kind,
            ErrorKind::Timeout
        );
        assert_eq!(
            ToolError::Cancelled.to_action_error().kind,
            ErrorKind::Cancelled
        );
        assert_eq!(
            ToolError::Http("503".to_string()).to_action_error().kind,
            ErrorKind::Dependency
        );
        assert_eq!(
            ToolError::Script("oops".to_string()).to_action_error().kind,
            ErrorKind::ExecutorException
        );
    }
}
