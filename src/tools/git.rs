//! Git Tool
//!
//! Built-in `git` tool: snapshots repository facts once, at construction
//! time, by shelling out to the `git` binary. The snapshot is exposed to
//! manifest expressions as properties:
//!
//! ```text
//! tools.git.branch
//! tools.git.commit.sha
//! tools.git.commit.abbrev
//! tools.git.last_tag
//! ```

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::error::ToolError;

use super::{Tool, ToolFactory, ToolInstance, ToolSet};

/// Factory for the built-in `git` tool. Snapshots the repository in the
/// process working directory.
#[derive(Debug, Default)]
pub struct GitFactory;

#[async_trait]
impl ToolFactory for GitFactory {
    async fn build(&self, _deps: &ToolSet) -> Result<ToolInstance, ToolError> {
        let snapshot = GitTool::snapshot(None).await?;
        Ok(Arc::new(snapshot))
    }
}

/// Repository facts captured when the tool was constructed.
#[derive(Debug, Clone)]
pub struct GitTool {
    branch: String,
    sha: String,
    abbrev: String,
    last_tag: Option<String>,
}

impl GitTool {
    /// Reads the current repository state. Fails when `git` is missing
    /// or the directory is not a repository with at least one commit.
    pub async fn snapshot(repo: Option<&Path>) -> Result<Self, ToolError> {
        let branch = git_output(repo, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        let sha = git_output(repo, &["rev-parse", "HEAD"]).await?;
        let abbrev = git_output(repo, &["rev-parse", "--short", "HEAD"]).await?;
        // Tagless repositories are common; this one is allowed to fail.
        let last_tag = git_output(repo, &["describe", "--tags", "--abbrev=0"])
            .await
            .ok();

        Ok(Self {
            branch,
            sha,
            abbrev,
            last_tag,
        })
    }
}

#[async_trait]
impl Tool for GitTool {
    fn properties(&self) -> Value {
        json!({
            "branch": self.branch,
            "commit": {
                "sha": self.sha,
                "abbrev": self.abbrev,
            },
            "last_tag": self.last_tag,
        })
    }

    async fn invoke(&self, action: &str, _args: &Value) -> Result<Value, ToolError> {
        Err(ToolError::UnknownAction {
            tool: "git".to_string(),
            action: action.to_string(),
        })
    }
}

async fn git_output(repo: Option<&Path>, args: &[&str]) -> Result<String, ToolError> {
    let mut invocation = Command::new("git");
    invocation.args(args);

    if let Some(dir) = repo {
        invocation.current_dir(dir);
    }

    let output = invocation
        .output()
        .await
        .map_err(|err| ToolError::failed("git", err))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ToolError::failed(
            "git",
            format!("git {} failed: {}", args.join(" "), stderr.trim()),
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
