//! Pass-through executor for steps with no real work.

use async_trait::async_trait;

use floe_core::playbook::types::ToolKind;

use crate::context::ToolContext;
use crate::error::ToolError;
use crate::registry::Tool;
use crate::result::ToolResult;

/// Executor that returns its rendered arguments as the result.
#[derive(Debug, Default)]
pub struct NoopTool;

impl NoopTool {
    /// Create a new noop executor.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Tool for NoopTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Noop
    }

    async fn execute(
        &self,
        args: &serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let data = match args {
            serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
            other => other.clone(),
        };
        Ok(ToolResult::success(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_echoes_args() {
        let tool = NoopTool::new();
        let ctx = ToolContext::new(1, "start");

        let result = tool
            .execute(&serde_json::json!({"marker": 1}), &ctx)
            .await
            .unwrap();
        assert_eq!(result.data["marker"], 1);

        let result = tool.execute(&serde_json::Value::Null, &ctx).await.unwrap();
        assert_eq!(result.data, serde_json::json!({}));
    }
}
