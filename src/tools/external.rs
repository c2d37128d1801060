//! Out-of-process analysis tools declared in `crucible.toml`.
//!
//! The command runs through `sh -c` in the project directory. It receives
//! `{tool, arguments, project_dir}` as JSON on stdin and answers with
//! `{"success": bool, "result" | "error": ...}` on stdout. Plain text on
//! stdout is accepted as the result when the command exits 0.

use serde::Deserialize;
use serde_json::{Value, json};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::ToolOutput;
use crate::crucible_config::ExternalToolConfig;
use crate::errors::ToolError;
use crate::util::truncate;

#[derive(Debug, Deserialize)]
struct Reply {
    success: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

fn summarize(value: &Value) -> String {
    match value {
        Value::String(s) => truncate(s.lines().next().unwrap_or_default(), 120),
        other => truncate(&other.to_string(), 120),
    }
}

pub async fn run_external(
    tool: &ExternalToolConfig,
    project_dir: &Path,
    args: &Value,
    limit: Duration,
) -> Result<ToolOutput, ToolError> {
    let mut command_line = tool.command.clone();
    for arg in &tool.args {
        command_line.push(' ');
        command_line.push_str(arg);
    }
    let input = json!({
        "tool": tool.name,
        "arguments": args,
        "project_dir": project_dir.display().to_string(),
    })
    .to_string();

    debug!(tool = %tool.name, command = %command_line, "Running external tool");
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(&command_line)
        .current_dir(project_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ToolError::failed(&tool.name, format!("Failed to spawn '{}': {}", command_line, e)))?;

    let stdin = child.stdin.take();
    let feed = async move {
        if let Some(mut stdin) = stdin {
            // A tool that ignores its input may close stdin early.
            let _ = stdin.write_all(input.as_bytes()).await;
        }
    };
    let output = match timeout(limit, async { tokio::join!(feed, child.wait_with_output()).1 }).await {
        Ok(result) => result
            .map_err(|e| ToolError::failed(&tool.name, format!("Failed to wait for tool: {}", e)))?,
        Err(_) => {
            return Err(ToolError::Timeout {
                tool: tool.name.clone(),
                secs: limit.as_secs(),
            });
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    if let Ok(reply) = serde_json::from_str::<Reply>(stdout.trim()) {
        if reply.success {
            let value = reply.result.unwrap_or(Value::Null);
            let summary = summarize(&value);
            return Ok(ToolOutput {
                value,
                summary,
                ..Default::default()
            });
        }
        return Err(ToolError::failed(
            &tool.name,
            reply.error.unwrap_or_else(|| "tool reported failure".to_string()),
        ));
    }

    if output.status.success() {
        let value = Value::String(stdout.trim().to_string());
        let summary = summarize(&value);
        Ok(ToolOutput {
            value,
            summary,
            ..Default::default()
        })
    } else {
        let message = if stderr.trim().is_empty() {
            format!(
                "exited with code {}",
                output.status.code().unwrap_or(-1)
            )
        } else {
            truncate(stderr.trim(), 2000)
        };
        Err(ToolError::failed(&tool.name, message))
    }
}
