//! Normalized tool execution envelope.
//!
//! Workers forward `data` without interpreting it; the broker attaches it
//! to the step result. Errors carry the engine's closed error-kind set.

use serde::{Deserialize, Serialize};

use floe_core::error::ActionError;

/// Status of a tool execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    /// Tool executed successfully.
    Success,
    /// Tool execution failed.
    Error,
}

impl ToolStatus {
    /// Whether the status indicates success.
    pub fn is_success(&self) -> bool {
        matches!(self, ToolStatus::Success)
    }
}

impl std::fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolStatus::Success => write!(f, "success"),
            ToolStatus::Error => write!(f, "error"),
        }
    }
}

/// Result of a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Execution status.
    pub status: ToolStatus,

    /// Result data (tool-specific, opaque to the worker).
    pub data: serde_json::Value,

    /// Execution metadata (elapsed_ms, protocol details).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,

    /// Structured error when status is `error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionError>,
}

impl ToolResult {
    /// Successful result with data.
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            status: ToolStatus::Success,
            data,
            meta: None,
            error: None,
        }
    }

    /// Failed result with a structured error.
    pub fn failure(error: ActionError) -> Self {
        Self {
            status: ToolStatus::Error,
            data: serde_json::Value::Null,
            meta: None,
            error: Some(error),
        }
    }

    /// Attach metadata.
    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Attach (or keep) data on a failed result.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Whether the result indicates success.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}
