//! Shell Tool
//!
//! Built-in `shell` tool: runs command lines through `bash -c` and hands
//! the captured output back to the invoking script step.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error};
use serde_json::{json, Value};
use tokio::process::Command;

use crate::error::ToolError;

use super::{Tool, ToolFactory, ToolInstance, ToolSet};

/// Factory for the built-in `shell` tool.
#[derive(Debug, Default)]
pub struct ShellFactory;

#[async_trait]
impl ToolFactory for ShellFactory {
    async fn build(&self, _deps: &ToolSet) -> Result<ToolInstance, ToolError> {
        Ok(Arc::new(ShellTool))
    }
}

/// Command runner backed by `bash -c`.
///
/// # Actions
///
/// - `run`: `args = { command, cwd? }`. Returns
///   `{ status, stdout, stderr }`; a non-zero exit status is an error.
#[derive(Debug)]
pub struct ShellTool;

#[async_trait]
impl Tool for ShellTool {
    fn properties(&self) -> Value {
        json!({ "shell": "bash" })
    }

    async fn invoke(&self, action: &str, args: &Value) -> Result<Value, ToolError> {
        match action {
            "run" => run_command(args).await,
            other => Err(ToolError::UnknownAction {
                tool: "shell".to_string(),
                action: other.to_string(),
            }),
        }
    }
}

async fn run_command(args: &Value) -> Result<Value, ToolError> {
    let command = args
        .get("command")
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::failed("shell", "'run' requires a 'command' argument"))?;

    let mut invocation = Command::new("bash");
    invocation.arg("-c").arg(command);

    if let Some(cwd) = args.get("cwd").and_then(Value::as_str) {
        invocation.current_dir(cwd);
    }

    debug!("shell: running '{}'", command);

    let output = invocation
        .output()
        .await
        .map_err(|err| ToolError::failed("shell", err))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    if !output.status.success() {
        if !stderr.trim().is_empty() {
            error!("shell: stderr:\n{}", stderr.trim());
        }
        return Err(ToolError::failed(
            "shell",
            format!(
                "command exited with status {}",
                output.status.code().unwrap_or(-1)
            ),
        ));
    }

    if !stdout.trim().is_empty() {
        debug!("shell: stdout:\n{}", stdout.trim());
    }

    Ok(json!({
        "status": output.status.code().unwrap_or(0),
        "stdout": stdout,
        "stderr": stderr,
    }))
}
