//! Tool registry and dispatch.
//!
//! One executor per tool kind behind a narrow interface: execute with args
//! and context, honor the cancellation token. The registry is the closed
//! dispatch table the worker consults.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use floe_core::playbook::types::ToolKind;

use crate::context::ToolContext;
use crate::error::ToolError;
use crate::result::ToolResult;

/// Executable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The tool kind this executor implements.
    fn kind(&self) -> ToolKind;

    /// Execute with rendered arguments. Implementations must be re-entrant
    /// and honor `ctx.cancel`.
    async fn execute(
        &self,
        args: &serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError>;
}

/// Registry of available executors.
pub struct ToolRegistry {
    tools: HashMap<ToolKind, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register an executor.
    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        self.tools.insert(tool.kind(), Arc::new(tool));
    }

    /// Get an executor by kind.
    pub fn get(&self, kind: ToolKind) -> Option<Arc<dyn Tool>> {
        self.tools.get(&kind).cloned()
    }

    /// Whether an executor is registered.
    pub fn has(&self, kind: ToolKind) -> bool {
        self.tools.contains_key(&kind)
    }

    /// Registered kinds.
    pub fn kinds(&self) -> Vec<ToolKind> {
        self.tools.keys().copied().collect()
    }

    /// Execute by kind.
    pub async fn execute(
        &self,
        kind: ToolKind,
        args: &serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let tool = self
            .get(kind)
            .ok_or_else(|| ToolError::NotFound(kind.to_string()))?;
        tool.execute(args, ctx).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockTool;

    #[async_trait]
    impl Tool for MockTool {
        fn kind(&self) -> ToolKind {
            ToolKind::Noop
        }

        async fn execute(
            &self,
            _args: &serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<ToolResult, ToolError> {
            Ok(ToolResult::success(serde_json::json!({"mock": true})))
        }
    }

    #[test]
    fn test_registry_register() {
        let mut registry = ToolRegistry::new();
        registry.register(MockTool);

        assert!(registry.has(ToolKind::Noop));
        assert!(!registry.has(ToolKind::Http));
        assert_eq!(registry.kinds(), vec![ToolKind::Noop]);
    }

    #[tokio::test]
    async fn test_registry_execute() {
        let mut registry = ToolRegistry::new();
        registry.register(MockTool);

        let ctx = ToolContext::new(1, "step");
        let result = registry
            .execute(ToolKind::Noop, &serde_json::Value::Null, &ctx)
            .await
            .unwrap();
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_registry_execute_not_found() {
        let registry = ToolRegistry::new();
        let ctx = ToolContext::new(1, "step");
        let result = registry
            .execute(ToolKind::Http, &serde_json::Value::Null, &ctx)
            .await;
        assert!(matches!(result, Err(ToolError::NotFound(_))));
    }
}
