//! Rhai script executor.
//!
//! Runs a script with the rendered arguments bound as `args`; the script's
//! return value becomes the result data. Evaluation happens on a blocking
//! thread so long scripts do not stall the worker runtime.

use async_trait::async_trait;
use rhai::{Dynamic, Engine, Scope};
use serde::{Deserialize, Serialize};

use floe_core::playbook::types::ToolKind;

use crate::context::ToolContext;
use crate::error::ToolError;
use crate::registry::Tool;
use crate::result::ToolResult;

/// Code executor arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeArgs {
    /// Rhai source to evaluate.
    pub source: String,

    /// Values bound as `args` inside the script.
    #[serde(default)]
    pub args: serde_json::Value,
}

/// Rhai script executor.
#[derive(Debug, Default)]
pub struct CodeTool;

impl CodeTool {
    /// Create a new code executor.
    pub fn new() -> Self {
        Self
    }

    fn create_engine() -> Engine {
        let mut engine = Engine::new();
        engine.set_max_operations(10_000_000);

        engine.register_fn("log", |msg: &str| {
            tracing::info!(target: "floe.code", "{}", msg);
        });
        engine.register_fn("timestamp", || chrono::Utc::now().timestamp());
        engine.register_fn("parse_json", |s: &str| -> Dynamic {
            match serde_json::from_str::<serde_json::Value>(s) {
                Ok(v) => rhai::serde::to_dynamic(&v).unwrap_or(Dynamic::UNIT),
                Err(_) => Dynamic::UNIT,
            }
        });
        engine.register_fn("to_json", |val: Dynamic| -> String {
            let json: serde_json::Value = rhai::serde::from_dynamic(&val)
                .unwrap_or(serde_json::Value::Null);
            serde_json::to_string(&json).unwrap_or_else(|_| "null".to_string())
        });

        engine
    }
}

#[async_trait]
impl Tool for CodeTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Code
    }

    async fn execute(
        &self,
        args: &serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let args: CodeArgs = serde_json::from_value(args.clone())
            .map_err(|e| ToolError::Configuration(format!("code args: {}", e)))?;

        if ctx.cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }

        let start = std::time::Instant::now();
        let source = args.source.clone();
        let bound = args.args.clone();

        let output = tokio::task::spawn_blocking(move || -> Result<serde_json::Value, ToolError> {
            let engine = CodeTool::create_engine();
            let mut scope = Scope::new();

            let args_dynamic = rhai::serde::to_dynamic(&bound)
                .map_err(|e| ToolError::Script(format!("args binding: {}", e)))?;
            scope.push_dynamic("args", args_dynamic);

            let result: Dynamic = engine
                .eval_with_scope(&mut scope, &source)
                .map_err(|e| ToolError::Script(e.to_string()))?;

            if result.is_unit() {
                return Ok(serde_json::Value::Null);
            }
            rhai::serde::from_dynamic(&result)
                .map_err(|e| ToolError::Script(format!("result conversion: {}", e)))
        })
        .await
        .map_err(|e| ToolError::Script(format!("script task panicked: {}", e)))??;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        Ok(ToolResult::success(output)
            .with_meta(serde_json::json!({ "elapsed_ms": elapsed_ms })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_eval_expression() {
        let tool = CodeTool::new();
        let ctx = ToolContext::new(1, "calc");
        let result = tool
            .execute(&serde_json::json!({"source": "40 + 2"}), &ctx)
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.data, serde_json::json!(42));
    }

    #[tokio::test]
    async fn test_args_binding() {
        let tool = CodeTool::new();
        let ctx = ToolContext::new(1, "calc");
        let result = tool
            .execute(
                &serde_json::json!({
                    "source": "args.a * args.b",
                    "args": {"a": 6, "b": 7}
                }),
                &ctx,
            )
            .await
            .unwrap();

        assert_eq!(result.data, serde_json::json!(42));
    }

    #[tokio::test]
    async fn test_map_result() {
        let tool = CodeTool::new();
        let ctx = ToolContext::new(1, "calc");
        let result = tool
            .execute(
                &serde_json::json!({"source": "#{ total: 3, ok: true }"}),
                &ctx,
            )
            .await
            .unwrap();

        assert_eq!(result.data["total"], 3);
        assert_eq!(result.data["ok"], true);
    }

    #[tokio::test]
    async fn test_script_error() {
        let tool = CodeTool::new();
        let ctx = ToolContext::new(1, "calc");
        let result = tool
            .execute(&serde_json::json!({"source": "missing_fn()"}), &ctx)
            .await;
        assert!(matches!(result, Err(ToolError::Script(_))));
    }
}
