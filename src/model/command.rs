use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{ModelClient, ModelRequest, ModelResponse};
use crate::errors::ModelError;
use crate::util::truncate;

/// Model service reached through a local command.
///
/// The request is written to the command's stdin as JSON. Stdout is parsed
/// as a [`ModelResponse`]; anything else on stdout is taken as free text.
#[derive(Debug, Clone)]
pub struct CommandModel {
    command: String,
    args: Vec<String>,
    working_dir: PathBuf,
    timeout: Duration,
}

impl CommandModel {
    pub fn new(
        command: impl Into<String>,
        args: Vec<String>,
        working_dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            command: command.into(),
            args,
            working_dir: working_dir.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ModelClient for CommandModel {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        let input = serde_json::to_vec(request).map_err(ModelError::Encode)?;

        debug!(command = %self.command, phase = %request.phase, bytes = input.len(), "Invoking model");
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ModelError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        // Stdin is fed while stdout is drained so neither pipe can fill up,
        // and both sit under the timeout. Dropping the child on timeout
        // kills it.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&input).await?;
            }
            Ok::<(), std::io::Error>(())
        };
        let (fed, output) = timeout(self.timeout, async {
            tokio::join!(feed, child.wait_with_output())
        })
        .await
        .map_err(|_| ModelError::Timeout {
            secs: self.timeout.as_secs(),
        })?;
        let output = output.map_err(ModelError::Io)?;
        if let Err(e) = fed {
            debug!(error = %e, "Model command did not read the whole request");
        }

        if !output.status.success() {
            return Err(ModelError::NonZeroExit {
                code: output.status.code().unwrap_or(-1),
                stderr: truncate(String::from_utf8_lossy(&output.stderr).trim(), 2000),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match serde_json::from_str::<ModelResponse>(stdout.trim()) {
            Ok(response) => Ok(response),
            Err(_) => Ok(ModelResponse::text(stdout.trim())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::phase::Phase;
    use tempfile::tempdir;

    fn request() -> ModelRequest {
        ModelRequest {
            phase: Phase::Planning,
            iteration: 1,
            instructions: "Plan the work".to_string(),
            state_summary: "No tasks".to_string(),
            task: None,
            checkpoints: vec![],
            recent_actions: vec![],
            tools: vec![],
            intervention: None,
        }
    }

    fn shell(script: &str, secs: u64) -> (tempfile::TempDir, CommandModel) {
        let dir = tempdir().unwrap();
        let model = CommandModel::new(
            "sh",
            vec!["-c".to_string(), script.to_string()],
            dir.path(),
            Duration::from_secs(secs),
        );
        (dir, model)
    }

    #[tokio::test]
    async fn test_json_response() {
        let (_dir, model) = shell(
            r#"cat > /dev/null; echo '{"text": "ok", "tool_calls": [{"name": "read_file", "arguments": {"path": "a.py"}}]}'"#,
            10,
        );
        let response = model.complete(&request()).await.unwrap();
        assert_eq!(response.text, "ok");
        assert_eq!(response.tool_calls[0].name, "read_file");
    }

    #[tokio::test]
    async fn test_request_is_sent_on_stdin() {
        let (_dir, model) = shell(
            r#"if grep -q '"instructions":"Plan the work"'; then echo '{"text": "got it"}'; else exit 1; fi"#,
            10,
        );
        let response = model.complete(&request()).await.unwrap();
        assert_eq!(response.text, "got it");

        let (_dir, model) = shell("cat > /dev/null; echo plain words", 10);
        let response = model.complete(&request()).await.unwrap();
        assert_eq!(response, ModelResponse::text("plain words"));
    }

    #[tokio::test]
    async fn test_large_request_is_streamed() {
        let mut big = request();
        big.instructions = "x".repeat(512 * 1024);

        let (_dir, model) = shell("cat", 5);
        let done = tokio::time::timeout(Duration::from_secs(20), model.complete(&big)).await;
        assert!(done.expect("echoing command finished").is_ok());

        let (_dir, model) = shell("sleep 30", 1);
        let done = tokio::time::timeout(Duration::from_secs(20), model.complete(&big)).await;
        let err = done.expect("timeout fired").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_errors() {
        let (_dir, model) = shell("cat > /dev/null; echo boom >&2; exit 2", 10);
        let err = model.complete(&request()).await.unwrap_err();
        assert!(matches!(err, ModelError::NonZeroExit { code: 2, .. }));
        assert!(err.to_string().contains("boom"));

        let (_dir, model) = shell("sleep 5", 1);
        let err = model.complete(&request()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        let dir = tempdir().unwrap();
        let missing = CommandModel::new(
            "crucible-no-such-model",
            vec![],
            dir.path(),
            Duration::from_secs(1),
        );
        assert!(matches!(
            missing.complete(&request()).await.unwrap_err(),
            ModelError::Spawn { .. }
        ));
    }
}
