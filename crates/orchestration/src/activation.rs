use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command as TokioCommand;
use tracing::debug;

pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Makes a worker's foreground session aware of a message.
#[async_trait]
pub trait ActivationSink: Send + Sync {
    async fn activate(&self, worker: &str, message: &str) -> Result<()>;
}

#[derive(Debug, Default, Clone)]
pub struct NoopActivationSink;

#[async_trait]
impl ActivationSink for NoopActivationSink {
    async fn activate(&self, worker: &str, message: &str) -> Result<()> {
        debug!(worker, message, "activation skipped (no sink configured)");
        Ok(())
    }
}

/// Runs a shell hook with the worker and message in its environment.
#[derive(Debug, Clone)]
pub struct HookActivationSink {
    command: String,
    timeout: Duration,
}

impl HookActivationSink {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: DEFAULT_HOOK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ActivationSink for HookActivationSink {
    async fn activate(&self, worker: &str, message: &str) -> Result<()> {
        let mut command = TokioCommand::new("bash");
        command
            .arg("-lc")
            .arg(&self.command)
            .env("RELAY_ACTIVATE_WORKER", worker)
            .env("RELAY_ACTIVATE_MESSAGE", message)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        debug!(worker, message, script = %self.command, "Spawning activation hook");

        let status = tokio::time::timeout(self.timeout, command.status())
            .await
            .map_err(|_| anyhow!("activation hook timed out after {}s", self.timeout.as_secs()))?
            .context("failed to run activation hook")?;
        if !status.success() {
            bail!("activation hook exited with status {}", status);
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn hook_receives_worker_and_message() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("seen");
        let sink = HookActivationSink::new(format!(
            "printf '%s|%s' \"$RELAY_ACTIVATE_WORKER\" \"$RELAY_ACTIVATE_MESSAGE\" > '{}'",
            out.display()
        ));

        sink.activate("anga", "task t1 complete").await.unwrap();
        assert_eq!(
            std::fs::read_to_string(&out).unwrap(),
            "anga|task t1 complete"
        );
    }

    #[tokio::test]
    async fn failing_hook_is_an_error() {
        let sink = HookActivationSink::new("exit 1");
        assert!(sink.activate("anga", "x").await.is_err());
    }
}
