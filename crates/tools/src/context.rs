//! Execution context passed to tools.

use std::collections::HashMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Context for a single tool invocation.
///
/// Credentials arrive already resolved and revealed; they live only for the
/// duration of the invocation and are never serialized.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Execution the invocation belongs to.
    pub execution_id: i64,

    /// Step (or iteration) node id.
    pub node_id: String,

    /// Attempt number.
    pub attempt: i32,

    /// Ephemeral credential material: alias -> field -> value.
    pub auth: HashMap<String, HashMap<String, String>>,

    /// Hard deadline for the invocation.
    pub deadline: Option<Duration>,

    /// Cancellation signal; executors must honor it.
    pub cancel: CancellationToken,
}

impl ToolContext {
    /// Create a context for one invocation.
    pub fn new(execution_id: i64, node_id: impl Into<String>) -> Self {
        Self {
            execution_id,
            node_id: node_id.into(),
            attempt: 1,
            auth: HashMap::new(),
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Set the attempt number.
    pub fn with_attempt(mut self, attempt: i32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Set the resolved credentials.
    pub fn with_auth(mut self, auth: HashMap<String, HashMap<String, String>>) -> Self {
        self.auth = auth;
        self
    }

    /// Set the deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Look up one credential field.
    pub fn auth_field(&self, alias: &str, field: &str) -> Option<&str> {
        self.auth
            .get(alias)
            .and_then(|fields| fields.get(field))
            .map(|s| s.as_str())
    }
}
