//! Error types for the Floe core.
//!
//! `CoreError` covers failures of the pure layers (validation, templating,
//! serialization). `ErrorKind` is the closed set of error categories carried
//! in event payloads and executor envelopes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by the core (pure) layers.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Playbook or input inconsistency detected at runtime.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Template rendering or expression evaluation failure.
    #[error("Template error: {0}")]
    Template(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Parse error (YAML playbooks).
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Result type alias using CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

impl From<serde_yaml::Error> for CoreError {
    fn from(err: serde_yaml::Error) -> Self {
        CoreError::Parse(err.to_string())
    }
}

/// Closed set of error categories carried in events and executor envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Playbook or input inconsistency (e.g. missing step target).
    Validation,
    /// Expression evaluation failure.
    TemplateError,
    /// Unhandled exception inside an executor plugin.
    ExecutorException,
    /// Deadline exceeded.
    Timeout,
    /// Caller-initiated cancellation.
    Cancelled,
    /// Downstream system failure (HTTP 5xx, database error).
    Dependency,
    /// Retry policy exhausted or stop condition matched.
    Policy,
    /// Lease expired under the worker. Internal, never surfaced in events.
    LostLease,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::TemplateError => "template_error",
            ErrorKind::ExecutorException => "executor_exception",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Dependency => "dependency",
            ErrorKind::Policy => "policy",
            ErrorKind::LostLease => "lost_lease",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "validation" => Ok(ErrorKind::Validation),
            "template_error" => Ok(ErrorKind::TemplateError),
            "executor_exception" => Ok(ErrorKind::ExecutorException),
            "timeout" => Ok(ErrorKind::Timeout),
            "cancelled" => Ok(ErrorKind::Cancelled),
            "dependency" => Ok(ErrorKind::Dependency),
            "policy" => Ok(ErrorKind::Policy),
            "lost_lease" => Ok(ErrorKind::LostLease),
            other => Err(CoreError::Validation(format!(
                "Unknown error kind: {}",
                other
            ))),
        }
    }
}

/// Structured error attached to failure events and executor envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionError {
    /// Error category.
    pub kind: ErrorKind,

    /// Human-readable message.
    pub message: String,

    /// Protocol status code where applicable (HTTP status, exit code).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ActionError {
    /// Create a new action error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    /// Attach a protocol status code.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Dependency failure (downstream system).
    pub fn dependency(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Dependency, message)
    }

    /// Validation failure.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Template evaluation failure.
    pub fn template(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TemplateError, message)
    }

    /// Deadline exceeded.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Caller-initiated cancellation.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// Retry policy exhausted.
    pub fn policy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Policy, message)
    }
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{}: {} (status {})", self.kind, self.message, status),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_error_kind_roundtrip() {
        for kind in [
            ErrorKind::Validation,
            ErrorKind::TemplateError,
            ErrorKind::ExecutorException,
            ErrorKind::Timeout,
            ErrorKind::Cancelled,
            ErrorKind::Dependency,
            ErrorKind::Policy,
            ErrorKind::LostLease,
        ] {
            let parsed = ErrorKind::from_str(&kind.to_string()).unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_error_kind_unknown() {
        assert!(ErrorKind::from_str("explosion").is_err());
    }

    #[test]
    fn test_action_error_serialization() {
        let err = ActionError::dependency("connection refused").with_status(503);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "dependency");
        assert_eq!(json["status"], 503);

        let back: ActionError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_action_error_display() {
        let err = ActionError::timeout("deadline exceeded");
        assert_eq!(err.to_string(), "timeout: deadline exceeded");

        let err = ActionError::dependency("upstream 503").with_status(503);
        assert_eq!(err.to_string(), "dependency: upstream 503 (status 503)");
    }
}
