//! File storage executor.
//!
//! The storage target for sink jobs: writes a JSON value to a local file,
//! either as one pretty document or appended as a JSON line.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use floe_core::playbook::types::ToolKind;

use crate::context::ToolContext;
use crate::error::ToolError;
use crate::registry::Tool;
use crate::result::ToolResult;

/// Write mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileMode {
    /// Append one JSON line.
    #[default]
    Jsonl,
    /// Overwrite with a pretty JSON document.
    Json,
}

/// File executor arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileArgs {
    /// Target path.
    pub path: String,

    /// Write mode.
    #[serde(default)]
    pub mode: FileMode,

    /// Value to persist (typically the rendered step result).
    pub data: serde_json::Value,
}

/// File storage executor.
#[derive(Debug, Default)]
pub struct FileTool;

impl FileTool {
    /// Create a new file executor.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Tool for FileTool {
    fn kind(&self) -> ToolKind {
        ToolKind::File
    }

    async fn execute(
        &self,
        args: &serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let args: FileArgs = serde_json::from_value(args.clone())
            .map_err(|e| ToolError::Configuration(format!("file args: {}", e)))?;

        if ctx.cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }

        if let Some(parent) = std::path::Path::new(&args.path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let bytes_written = match args.mode {
            FileMode::Jsonl => {
                let mut line = serde_json::to_vec(&args.data)?;
                line.push(b'\n');
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&args.path)
                    .await?;
                file.write_all(&line).await?;
                file.flush().await?;
                line.len()
            }
            FileMode::Json => {
                let content = serde_json::to_vec_pretty(&args.data)?;
                tokio::fs::write(&args.path, &content).await?;
                content.len()
            }
        };

        Ok(ToolResult::success(serde_json::json!({
            "path": args.path,
            "bytes_written": bytes_written,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_jsonl_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let tool = FileTool::new();
        let ctx = ToolContext::new(1, "load~sink");

        for i in 0..2 {
            let result = tool
                .execute(
                    &serde_json::json!({
                        "path": path.to_str().unwrap(),
                        "data": {"row": i}
                    }),
                    &ctx,
                )
                .await
                .unwrap();
            assert!(result.is_success());
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"row\":0"));
    }

    #[tokio::test]
    async fn test_json_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let tool = FileTool::new();
        let ctx = ToolContext::new(1, "load~sink");

        tool.execute(
            &serde_json::json!({
                "path": path.to_str().unwrap(),
                "mode": "json",
                "data": {"first": true}
            }),
            &ctx,
        )
        .await
        .unwrap();

        tool.execute(
            &serde_json::json!({
                "path": path.to_str().unwrap(),
                "mode": "json",
                "data": {"second": true}
            }),
            &ctx,
        )
        .await
        .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("second"));
        assert!(!content.contains("first"));
    }
}
