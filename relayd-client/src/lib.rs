//! Relay Client Library
//!
//! Producer and monitor side of the relay: drop tasks into a worker's queue,
//! nudge it over its control pipe, wait for the terminal Result and read
//! liveness. Everything goes through the shared directory layout, so none of
//! it needs the worker to be running.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use relay_common::fs::{SafeFileWriter, WriteMode};
use relay_common::layout::is_valid_identifier;
use relay_common::{Layout, RelayConfig, RelayError, Task, TaskResult};
use relay_orchestration::{HeartbeatMonitor, HeartbeatRegistry, Liveness, TaskStore};
use tokio::time::{sleep, Instant};
use tracing::{debug, info};
use uuid::Uuid;

const RESULT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid worker id '{0}'")]
    InvalidWorker(String),
    #[error("invalid task: {0}")]
    InvalidTask(String),
    #[error("no result for task '{task_id}' after {}ms", .waited.as_millis())]
    Timeout { task_id: String, waited: Duration },
    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// How a [`RelayClient::notify`] message reached the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// A live listener read it from the control pipe.
    Pipe,
    /// Nobody was listening; it was queued as a task instead.
    TaskFile { task_id: String },
}

pub struct RelayClient {
    layout: Layout,
    writer: SafeFileWriter,
    stale_threshold: Duration,
}

impl RelayClient {
    pub fn new(layout: Layout) -> Self {
        Self {
            writer: SafeFileWriter::new(layout.roots()),
            layout,
            stale_threshold: Duration::from_secs(relay_common::config::DEFAULT_STALE_THRESHOLD_SECS),
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.layout()).with_stale_threshold(config.stale_threshold())
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    fn check_worker(worker: &str) -> Result<(), ClientError> {
        if is_valid_identifier(worker) {
            Ok(())
        } else {
            Err(ClientError::InvalidWorker(worker.to_string()))
        }
    }

    /// Atomically publishes `tasks/<worker>/<task_id>.json`. The worker only
    /// ever sees the complete file. Submitting an id that is already queued
    /// fails rather than replacing it.
    pub fn submit(&self, worker: &str, task: &Task) -> Result<PathBuf, ClientError> {
        Self::check_worker(worker)?;
        let mut task = task.clone();
        task.validate(&task.task_id)
            .map_err(ClientError::InvalidTask)?;
        if !is_valid_identifier(&task.task_id) {
            return Err(ClientError::InvalidTask(format!(
                "task_id '{}' is not a valid file name",
                task.task_id
            )));
        }
        task.worker.get_or_insert_with(|| worker.to_string());
        task.created_at.get_or_insert_with(Utc::now);
        task.claim = None;

        let path = self.layout.worker(worker).task_file(&task.task_id);
        self.writer.write_json(&path, &task, WriteMode::CreateNew)?;
        info!(worker, task_id = %task.task_id, "task submitted");
        Ok(path)
    }

    /// Tries the worker's control pipe for up to `timeout`; when nobody is
    /// listening the message is queued as a task so it is never lost.
    pub async fn notify(
        &self,
        worker: &str,
        message: &str,
        timeout: Duration,
    ) -> Result<Delivery, ClientError> {
        Self::check_worker(worker)?;

        #[cfg(unix)]
        {
            let pipe = self.layout.worker(worker).control_pipe;
            match relay_orchestration::ipc::send_timeout(&pipe, message, timeout).await {
                Ok(()) => {
                    debug!(worker, "message delivered over control pipe");
                    return Ok(Delivery::Pipe);
                }
                Err(RelayError::NoReceiver { .. }) => {
                    debug!(worker, "no pipe listener, queueing message as a task");
                }
                Err(err) => return Err(err.into()),
            }
        }
        #[cfg(not(unix))]
        let _ = timeout;

        let task_id = format!("msg-{}", Uuid::new_v4().simple());
        self.submit(worker, &Task::with_description(task_id.clone(), message))?;
        Ok(Delivery::TaskFile { task_id })
    }

    /// Polls the results directory until the Result appears.
    pub async fn wait_for_result(
        &self,
        worker: &str,
        task_id: &str,
        timeout: Duration,
    ) -> Result<TaskResult, ClientError> {
        Self::check_worker(worker)?;
        let store = TaskStore::new(&self.layout, worker);
        let started = Instant::now();
        loop {
            if let Some(result) = store.read_result(task_id)? {
                return Ok(result);
            }
            if started.elapsed() >= timeout {
                return Err(ClientError::Timeout {
                    task_id: task_id.to_string(),
                    waited: timeout,
                });
            }
            sleep(RESULT_POLL).await;
        }
    }

    /// Every worker's latest heartbeat with its staleness, ordered by worker.
    pub fn liveness(&self) -> Result<Vec<Liveness>, ClientError> {
        Ok(self.monitor().snapshot(Utc::now())?)
    }

    pub fn monitor(&self) -> HeartbeatMonitor {
        let registry = HeartbeatRegistry::new(self.layout.heartbeat_dir.clone());
        HeartbeatMonitor::new(Arc::new(registry), self.stale_threshold)
    }
}
