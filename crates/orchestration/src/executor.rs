use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use relay_common::Task;
use serde_json::{json, Value};
use strip_ansi_escapes::strip;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as TokioCommand;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LOG_SNIPPET_LIMIT: usize = 2048;

/// What the dispatcher hands the executor alongside the task.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub worker: String,
    pub timeout: Duration,
    /// Cancelled when the deadline passes. Executors should stop promptly;
    /// the dispatcher records the timeout either way.
    pub cancel: CancellationToken,
}

/// Turns a task's input into an output payload. Opaque to the relay.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, task: &Task, ctx: ExecutionContext) -> Result<Value>;
}

/// Returns the task input unchanged.
#[derive(Debug, Default, Clone)]
pub struct EchoExecutor;

#[async_trait]
impl Executor for EchoExecutor {
    async fn execute(&self, task: &Task, ctx: ExecutionContext) -> Result<Value> {
        Ok(json!({
            "echo": task.input(),
            "worker": ctx.worker,
        }))
    }
}

/// Runs a shell command per task: the task JSON on stdin, the output
/// payload on stdout.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    command: String,
}

impl CommandExecutor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(&self, task: &Task, ctx: ExecutionContext) -> Result<Value> {
        let input = serde_json::to_vec(task).context("failed to serialise task")?;

        let mut command = TokioCommand::new("bash");
        command
            .arg("-lc")
            .arg(&self.command)
            .env("RELAY_TASK_ID", &task.task_id)
            .env("RELAY_WORKER", &ctx.worker)
            .env("RELAY_TIMEOUT_SECONDS", ctx.timeout.as_secs().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            worker = %ctx.worker,
            task_id = %task.task_id,
            command = %self.command,
            "Invoking executor command"
        );

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn executor command '{}'", self.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                // Commands that ignore stdin close it early; that is fine.
                let _ = stdin.write_all(&input).await;
            });
        }

        let output = tokio::select! {
            output = child.wait_with_output() => output.context("failed to wait for executor command")?,
            _ = ctx.cancel.cancelled() => bail!("executor command cancelled"),
        };

        let stdout_text = decode_and_strip(&output.stdout);
        let stderr_text = decode_and_strip(&output.stderr);
        debug!(
            task_id = %task.task_id,
            stdout = %summarize_for_log(&stdout_text),
            stderr = %summarize_for_log(&stderr_text),
            "Executor command finished"
        );

        if !output.status.success() {
            warn!(
                task_id = %task.task_id,
                code = ?output.status.code(),
                "Executor command exited with non-zero status"
            );
            bail!(
                "command exited with {}: {}",
                output.status,
                summarize_for_log(stderr_text.trim())
            );
        }

        Ok(parse_output(&stdout_text))
    }
}

/// JSON when stdout is JSON, otherwise the trimmed text.
fn parse_output(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

fn decode_and_strip(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }

    let decode = |data: &[u8]| String::from_utf8_lossy(data).to_string();

    if !bytes.contains(&b'\x1b') {
        return decode(bytes);
    }

    match strip(bytes) {
        Ok(clean) => decode(&clean),
        Err(err) => {
            warn!(?err, "Failed to strip ANSI escapes from executor output");
            decode(bytes)
        }
    }
}

fn summarize_for_log(payload: &str) -> String {
    if payload.len() <= LOG_SNIPPET_LIMIT {
        return payload.to_string();
    }
    let mut end = LOG_SNIPPET_LIMIT;
    while !payload.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{}… (truncated {} bytes)",
        &payload[..end],
        payload.len() - end
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            worker: "anga".into(),
            timeout: Duration::from_secs(5),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn output_parsing_prefers_json() {
        assert_eq!(parse_output("{\"a\":1}\n"), json!({"a": 1}));
        assert_eq!(parse_output("  done \n"), json!("done"));
        assert_eq!(parse_output(""), Value::Null);
    }

    #[test]
    fn strips_ansi_sequences() {
        assert_eq!(decode_and_strip(b"\x1b[31mred\x1b[0m"), "red");
    }

    #[tokio::test]
    async fn echo_returns_input() {
        let task = Task::with_description("t1", "hello");
        let value = EchoExecutor.execute(&task, ctx()).await.unwrap();
        assert_eq!(value["echo"], "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_reads_task_from_stdin() {
        let task = Task::with_description("t1", "hello");
        let executor = CommandExecutor::new("cat >/dev/null; printf '{\"id\":\"%s\"}' \"$RELAY_TASK_ID\"");
        let value = executor.execute(&task, ctx()).await.unwrap();
        assert_eq!(value, json!({"id": "t1"}));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let task = Task::with_description("t1", "hello");
        let executor = CommandExecutor::new("echo boom >&2; exit 3");
        let err = executor.execute(&task, ctx()).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
