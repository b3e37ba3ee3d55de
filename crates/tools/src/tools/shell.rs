//! Shell command executor.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use floe_core::error::ActionError;
use floe_core::playbook::types::ToolKind;

use crate::context::ToolContext;
use crate::error::ToolError;
use crate::registry::Tool;
use crate::result::ToolResult;

/// Shell executor arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellArgs {
    /// Command line passed to the shell.
    pub command: String,

    /// Shell binary (default "bash").
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,

    /// Environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_shell() -> String {
    "bash".to_string()
}

/// Shell command executor.
#[derive(Debug, Default)]
pub struct ShellTool;

impl ShellTool {
    /// Create a new shell executor.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Shell
    }

    async fn execute(
        &self,
        args: &serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let args: ShellArgs = serde_json::from_value(args.clone())
            .map_err(|e| ToolError::Configuration(format!("shell args: {}", e)))?;

        let start = std::time::Instant::now();

        let mut cmd = Command::new(&args.shell);
        cmd.arg("-c").arg(&args.command);
        if let Some(dir) = &args.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &args.env {
            cmd.env(key, value);
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| ToolError::Process(format!("Failed to spawn process: {}", e)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_handle = tokio::spawn(async move {
            let mut output = String::new();
            if let Some(stdout) = stdout {
                let mut reader = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    output.push_str(&line);
                    output.push('\n');
                }
            }
            output
        });

        let stderr_handle = tokio::spawn(async move {
            let mut output = String::new();
            if let Some(stderr) = stderr {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    output.push_str(&line);
                    output.push('\n');
                }
            }
            output
        });

        let status = tokio::select! {
            status = child.wait() => {
                status.map_err(|e| ToolError::Process(format!("Wait failed: {}", e)))?
            }
            _ = ctx.cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(ToolError::Cancelled);
            }
        };

        let stdout = stdout_handle.await.unwrap_or_default();
        let stderr = stderr_handle.await.unwrap_or_default();
        let exit_code = status.code().unwrap_or(-1);
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let data = serde_json::json!({
            "exit_code": exit_code,
            "stdout": stdout,
            "stderr": stderr,
        });
        let meta = serde_json::json!({ "elapsed_ms": elapsed_ms });

        if status.success() {
            Ok(ToolResult::success(data).with_meta(meta))
        } else {
            let error = ActionError::dependency(format!(
                "Command exited with code {}",
                exit_code
            ))
            .with_status(exit_code.max(0) as u16);
            Ok(ToolResult::failure(error).with_data(data).with_meta(meta))
        }
    }
}
