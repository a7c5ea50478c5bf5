//! Subprocess stage executor.
//!
//! Spawns the configured command, writes the stage context as JSON to stdin
//! and reads the outcome from stdout. Stdout that is JSON is interpreted
//! with `StageOutcome::from_response`; plain text becomes a string output.

use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::engine::{StageContext, StageExecutor, StageOutcome};

/// Stage executor backed by a local program
pub struct CommandExecutor {
    agent: String,
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(agent: impl Into<String>, program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            agent: agent.into(),
            program: program.into(),
            args,
            timeout,
        }
    }

    async fn run_process(&self, input: &[u8]) -> Result<String> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn '{}' for agent '{}'", self.program, self.agent))?;

        // Feed stdin alongside the wait so a child that never reads it can't
        // stall us past the timeout. Exiting early is not an error.
        let stdin = child.stdin.take();
        let payload = input.to_vec();
        let writer = tokio::spawn(async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(&payload).await {
                Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
                other => other,
            }
        });
        let abort_writer = writer.abort_handle();

        let exchange = async {
            let output = child
                .wait_with_output()
                .await
                .with_context(|| format!("Failed to wait for '{}'", self.program))?;
            writer
                .await
                .context("Stdin writer stopped unexpectedly")?
                .with_context(|| format!("Failed to write to '{}' stdin", self.program))?;
            Ok::<_, anyhow::Error>(output)
        };

        let output = match timeout(self.timeout, exchange).await {
            Ok(output) => output?,
            Err(_) => {
                abort_writer.abort();
                anyhow::bail!("Agent '{}' timed out after {:?}", self.agent, self.timeout);
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            anyhow::bail!(
                "Agent '{}' failed with exit code {}: {}",
                self.agent,
                exit_code,
                stderr.trim()
            );
        }

        String::from_utf8(output.stdout).with_context(|| format!("Output of '{}' is not valid UTF-8", self.program))
    }
}

#[async_trait]
impl StageExecutor for CommandExecutor {
    fn name(&self) -> &str {
        &self.agent
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutcome> {
        let input = serde_json::to_vec(ctx).context("Failed to encode stage context")?;
        let stdout = self.run_process(&input).await?;
        debug!(agent = %self.agent, stage = %ctx.stage_id, bytes = stdout.len(), "Command finished");

        let trimmed = stdout.trim();
        Ok(match serde_json::from_str::<Value>(trimmed) {
            Ok(body) => StageOutcome::from_response(body),
            Err(_) => StageOutcome::completed(Value::String(trimmed.to_string())),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::engine::OutcomeStatus;
    use serde_json::{json, Map};
    use uuid::Uuid;

    fn context() -> StageContext {
        StageContext {
            execution_id: Uuid::new_v4(),
            workflow_id: "pacing-check".to_string(),
            project_id: None,
            stage_id: "pull".to_string(),
            stage_name: "Pull Delivery".to_string(),
            agent: Some("pacing".to_string()),
            input: Map::new(),
            previous: Map::new(),
            branch: Some("ttd".to_string()),
        }
    }

    fn shell(script: &str, timeout: Duration) -> CommandExecutor {
        CommandExecutor::new("pacing", "sh", vec!["-c".to_string(), script.to_string()], timeout)
    }

    #[tokio::test]
    async fn test_context_is_piped_to_stdin() {
        let executor = shell("cat", Duration::from_secs(5));
        let outcome = executor.execute(&context()).await.unwrap();

        assert_eq!(outcome.status, OutcomeStatus::Completed);
        let output = outcome.output.unwrap();
        assert_eq!(output["stageId"], "pull");
        assert_eq!(output["branch"], "ttd");
    }

    #[tokio::test]
    async fn test_structured_outcome() {
        let executor = shell(
            r#"echo '{"status":"warning","output":{"spent":0.8},"error":"behind"}'"#,
            Duration::from_secs(5),
        );
        let outcome = executor.execute(&context()).await.unwrap();

        assert_eq!(outcome.status, OutcomeStatus::Warning);
        assert_eq!(outcome.output, Some(json!({ "spent": 0.8 })));
    }

    #[tokio::test]
    async fn test_plain_text_output() {
        let executor = shell("echo all good", Duration::from_secs(5));
        let outcome = executor.execute(&context()).await.unwrap();

        assert_eq!(outcome.output, Some(json!("all good")));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_an_error() {
        let executor = shell("echo nope >&2; exit 3", Duration::from_secs(5));
        let err = executor.execute(&context()).await.unwrap_err();

        assert!(err.to_string().contains("exit code 3"));
    }

    fn large_context() -> StageContext {
        let mut ctx = context();
        ctx.input.insert("report".to_string(), json!("x".repeat(256 * 1024)));
        ctx
    }

    #[tokio::test]
    async fn test_child_that_ignores_stdin_still_completes() {
        let executor = shell("echo ok", Duration::from_secs(5));
        let outcome = executor.execute(&large_context()).await.unwrap();

        assert_eq!(outcome.status, OutcomeStatus::Completed);
        assert_eq!(outcome.output, Some(json!("ok")));
    }

    #[tokio::test]
    async fn test_timeout_covers_unread_stdin() {
        let executor = shell("sleep 5", Duration::from_millis(200));
        let err = executor.execute(&large_context()).await.unwrap_err();

        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let executor = shell("sleep 5", Duration::from_millis(100));
        let err = executor.execute(&context()).await.unwrap_err();

        assert!(err.to_string().contains("timed out"));
    }
}
