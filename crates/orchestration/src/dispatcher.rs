//! Claims tasks from one worker queue, runs them through the executor and
//! records their terminal Result.
//!
//! Triggers only say "look now"; every pass lists the directory and claims
//! the oldest pending file, so duplicate or dropped triggers cannot change
//! what gets processed. One task is in flight at a time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use relay_common::config::{DEFAULT_MAX_CLAIM_ATTEMPTS, DEFAULT_RECONCILE_INTERVAL_SECS};
use relay_common::{ClaimInfo, RelayError, RelayResult, Task, TaskResult, Trigger};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::activation::ActivationSink;
use crate::executor::{ExecutionContext, Executor};
use crate::heartbeat::WorkerState;
use crate::store::{ClaimMarker, ClaimedTask, TaskStore, WriteOutcome};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub reconcile_interval: Duration,
    /// Executions a task may start before an abandoned claim turns into an
    /// `error` Result instead of a re-queue.
    pub max_claim_attempts: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(DEFAULT_RECONCILE_INTERVAL_SECS),
            max_claim_attempts: DEFAULT_MAX_CLAIM_ATTEMPTS,
        }
    }
}

pub struct Dispatcher {
    store: Arc<TaskStore>,
    executor: Arc<dyn Executor>,
    sink: Arc<dyn ActivationSink>,
    state: watch::Sender<WorkerState>,
    reconcile: Arc<Notify>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<TaskStore>,
        executor: Arc<dyn Executor>,
        sink: Arc<dyn ActivationSink>,
        state: watch::Sender<WorkerState>,
        reconcile: Arc<Notify>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            executor,
            sink,
            state,
            reconcile,
            config,
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    fn worker(&self) -> &str {
        self.store.worker()
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    /// Claims the oldest pending task. Lost races and corrupt files move on
    /// to the next candidate; `None` means the queue is empty.
    pub fn claim_next(&self) -> RelayResult<Option<ClaimedTask>> {
        for candidate in self.store.pending()? {
            match self.store.claim(&candidate.task_id) {
                Ok(claimed) => return Ok(Some(claimed)),
                Err(err @ RelayError::ClaimLost { .. }) => {
                    debug!(worker = %self.worker(), task_id = %candidate.task_id, reason = %err, "skipping candidate");
                }
                Err(err @ RelayError::CorruptRecord { .. }) => {
                    warn!(worker = %self.worker(), task_id = %candidate.task_id, code = err.code(), error = %err, "skipping corrupt task");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    /// Runs the executor under the task's deadline. Never fails: every
    /// outcome becomes a Result.
    pub async fn execute(&self, task: &Task) -> TaskResult {
        let started_at = Utc::now();
        let timeout = task.timeout();
        let cancel = CancellationToken::new();
        let ctx = ExecutionContext {
            worker: self.worker().to_string(),
            timeout,
            cancel: cancel.clone(),
        };

        match time::timeout(timeout, self.executor.execute(task, ctx)).await {
            Ok(Ok(output)) => TaskResult::complete(task, output, started_at),
            Ok(Err(err)) => {
                let detail = format!("{:#}", err);
                let err = RelayError::ExecutorFailed {
                    task_id: task.task_id.clone(),
                    detail: detail.clone(),
                };
                warn!(worker = %self.worker(), code = err.code(), error = %err, "executor failed");
                TaskResult::failed(task, detail, started_at)
            }
            Err(_) => {
                // Dropping the future stops cooperative executors; anything
                // it spawned elsewhere may keep running.
                cancel.cancel();
                let err = RelayError::ExecutorTimeout {
                    task_id: task.task_id.clone(),
                    timeout,
                };
                warn!(worker = %self.worker(), code = err.code(), error = %err, "executor timed out");
                TaskResult::timed_out(task, started_at)
            }
        }
    }

    /// Claim to archive for one task. A Result left by an earlier run is
    /// honoured instead of executing again.
    pub async fn process(&self, claimed: ClaimedTask) -> RelayResult<TaskResult> {
        let task_id = claimed.task.task_id.clone();

        if let Some(existing) = self.existing_result(&task_id)? {
            self.store.archive(&task_id)?;
            info!(worker = %self.worker(), task_id = %task_id, status = %existing.status, "result already recorded, archived without executing");
            return Ok(existing);
        }

        self.set_state(WorkerState::busy(&task_id));
        let finished = self.run_to_result(&claimed.task).await;
        self.set_state(WorkerState::active());
        let result = finished?;

        self.activate(&result).await;
        Ok(result)
    }

    async fn run_to_result(&self, task: &Task) -> RelayResult<TaskResult> {
        let result = self.execute(task).await;
        match self.store.write_result(&result)? {
            WriteOutcome::Written | WriteOutcome::Unchanged => {}
            WriteOutcome::AlreadyPresent => {
                warn!(worker = %self.worker(), task_id = %task.task_id, "a different result was already recorded; keeping it");
            }
        }
        self.store.archive(&task.task_id)?;
        info!(
            worker = %self.worker(),
            task_id = %task.task_id,
            status = %result.status,
            attempt = task.attempt,
            "task finished"
        );
        Ok(result)
    }

    fn existing_result(&self, task_id: &str) -> RelayResult<Option<TaskResult>> {
        match self.store.read_result(task_id) {
            Ok(found) => Ok(found),
            Err(RelayError::CorruptRecord { path, reason }) => {
                warn!(worker = %self.worker(), task_id, path = %path.display(), reason = %reason, "quarantining corrupt result");
                self.store.quarantine_result(task_id)?;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn activate(&self, result: &TaskResult) {
        let message = format!("task {} {}", result.task_id, result.status);
        if let Err(err) = self.sink.activate(self.worker(), &message).await {
            warn!(worker = %self.worker(), task_id = %result.task_id, error = %err, "activation failed");
        }
    }

    /// Processes pending tasks oldest first until the queue is empty or
    /// shutdown is requested. Returns how many reached a Result.
    pub async fn drain(&self, cancel: &CancellationToken) -> RelayResult<usize> {
        let mut finished = 0;
        while !cancel.is_cancelled() {
            let Some(claimed) = self.claim_next()? else {
                break;
            };
            let task_id = claimed.task.task_id.clone();
            match self.process(claimed).await {
                Ok(_) => finished += 1,
                // The marker stays behind for recovery.
                Err(err) => {
                    warn!(worker = %self.worker(), task_id = %task_id, code = err.code(), error = %err, "task left claimed")
                }
            }
        }
        Ok(finished)
    }

    /// Deals with claim markers nobody is working on. A marker is abandoned
    /// once it is older than twice its task's timeout, or as soon as the
    /// process that claimed it is gone. A marker that cannot be handled is
    /// logged and left for the next pass.
    pub async fn recover_abandoned(&self) -> RelayResult<usize> {
        let now = Utc::now();
        let mut recovered = 0;

        for marker in self.store.markers()? {
            let task_id = marker.task_id.clone();
            match self.recover_marker(marker, now).await {
                Ok(true) => recovered += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(worker = %self.worker(), task_id = %task_id, code = err.code(), error = %err, "claim marker recovery failed")
                }
            }
        }

        Ok(recovered)
    }

    async fn recover_marker(&self, marker: ClaimMarker, now: DateTime<Utc>) -> RelayResult<bool> {
        let task_id = marker.task_id;
        let task = match marker.contents {
            Ok(task) => task,
            Err(err) => {
                warn!(worker = %self.worker(), task_id = %task_id, error = %err, "corrupt claim marker");
                self.store.quarantine_marker(&task_id);
                return Ok(false);
            }
        };

        if self.store.result_exists(&task_id) {
            self.store.archive(&task_id)?;
            info!(worker = %self.worker(), task_id = %task_id, "archived claimed task that already has a result");
            return Ok(true);
        }

        if self.store.paths().task_file(&task_id).exists() {
            // Re-queue was interrupted after the pending file came back.
            self.store.discard_marker(&task_id)?;
            return Ok(false);
        }

        let age = (now - marker.claimed_at).to_std().unwrap_or_default();
        let deadline = task.timeout().saturating_mul(2);
        let owner_gone = task.claim.as_ref().is_some_and(claim_owner_exited);
        if age <= deadline && !owner_gone {
            return Ok(false);
        }

        let attempts = task.attempt.saturating_add(1);
        if attempts >= self.config.max_claim_attempts {
            let result = TaskResult::failed(
                &task,
                format!("abandoned after {} attempts", attempts),
                marker.claimed_at,
            );
            self.store.write_result(&result)?;
            self.store.archive(&task_id)?;
            warn!(worker = %self.worker(), task_id = %task_id, attempts, "giving up on abandoned task");
            self.activate(&result).await;
        } else {
            self.store.requeue(&task)?;
            info!(worker = %self.worker(), task_id = %task_id, attempt = attempts, "re-queued abandoned task");
        }
        Ok(true)
    }

    /// Full pass: abandoned claims first, then everything pending.
    pub async fn reconcile(&self, cancel: &CancellationToken) -> RelayResult<usize> {
        let recovered = self.recover_abandoned().await?;
        let finished = self.drain(cancel).await?;
        if recovered > 0 || finished > 0 {
            debug!(worker = %self.worker(), recovered, finished, "reconciliation pass complete");
        }
        Ok(finished)
    }

    async fn reconcile_logged(&self, cancel: &CancellationToken) {
        if let Err(err) = self.reconcile(cancel).await {
            warn!(worker = %self.worker(), code = err.code(), error = %err, "reconciliation failed");
        }
    }

    async fn drain_logged(&self, cancel: &CancellationToken) {
        if let Err(err) = self.drain(cancel).await {
            warn!(worker = %self.worker(), code = err.code(), error = %err, "dispatch pass failed");
        }
    }

    /// Startup reconciliation, then one pass per trigger, per reconcile
    /// request and per reconcile interval, until cancelled.
    pub async fn run(
        self,
        mut intake: mpsc::Receiver<Trigger>,
        cancel: CancellationToken,
    ) -> RelayResult<()> {
        self.store.ensure_dirs()?;
        self.set_state(WorkerState::active());
        self.reconcile_logged(&cancel).await;

        let mut ticker = time::interval(self.config.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.reconcile.notified() => self.reconcile_logged(&cancel).await,
                trigger = intake.recv() => match trigger {
                    Some(trigger) => {
                        debug!(
                            worker = %trigger.worker_id,
                            task_id = %trigger.task_id,
                            source = %trigger.source,
                            "trigger received"
                        );
                        self.drain_logged(&cancel).await;
                    }
                    None => break,
                },
                _ = ticker.tick() => self.reconcile_logged(&cancel).await,
            }
        }

        info!(worker = %self.worker(), "dispatcher stopped");
        Ok(())
    }
}

#[cfg(unix)]
fn claim_owner_exited(claim: &ClaimInfo) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if claim.pid == std::process::id() {
        return false;
    }
    let Ok(raw) = i32::try_from(claim.pid) else {
        return false;
    };
    matches!(kill(Pid::from_raw(raw), None), Err(Errno::ESRCH))
}

#[cfg(not(unix))]
fn claim_owner_exited(_claim: &ClaimInfo) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::NoopActivationSink;
    use crate::executor::EchoExecutor;
    use async_trait::async_trait;
    use relay_common::fs::read_json;
    use relay_common::{Layout, ResultStatus};
    use serde_json::{json, Value};
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl Executor for Recorder {
        async fn execute(&self, task: &Task, _ctx: ExecutionContext) -> anyhow::Result<Value> {
            self.0.lock().unwrap().push(task.task_id.clone());
            if task.input() == json!("fail") {
                anyhow::bail!("refused");
            }
            Ok(json!("ok"))
        }
    }

    fn dispatcher(dir: &TempDir, executor: Arc<dyn Executor>) -> Dispatcher {
        let store = Arc::new(TaskStore::new(&Layout::under(dir.path()), "anga"));
        store.ensure_dirs().unwrap();
        let (state, _) = watch::channel(WorkerState::starting());
        Dispatcher::new(
            store,
            executor,
            Arc::new(NoopActivationSink),
            state,
            Arc::new(Notify::new()),
            DispatcherConfig::default(),
        )
    }

    fn put(dispatcher: &Dispatcher, task: &Task) {
        let path = dispatcher.store().paths().task_file(&task.task_id);
        fs::write(path, serde_json::to_vec(task).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn drains_in_created_order() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let dispatcher = dispatcher(&dir, recorder.clone());
        let base = Utc::now();
        for (n, id) in ["c", "a", "b"].iter().enumerate() {
            let mut task = Task::with_description(*id, "x");
            task.created_at = Some(base + chrono::Duration::seconds(n as i64));
            put(&dispatcher, &task);
        }

        let finished = dispatcher.drain(&CancellationToken::new()).await.unwrap();
        assert_eq!(finished, 3);
        assert_eq!(*recorder.0.lock().unwrap(), vec!["c", "a", "b"]);
        assert_eq!(dispatcher.store().queue_depth().unwrap(), 0);
    }

    #[tokio::test]
    async fn executor_error_becomes_error_result_and_is_archived() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let dispatcher = dispatcher(&dir, recorder);
        put(&dispatcher, &Task::with_description("t1", "fail"));

        dispatcher.drain(&CancellationToken::new()).await.unwrap();
        let paths = dispatcher.store().paths();
        let result: TaskResult = read_json(&paths.result_file("t1")).unwrap();
        assert_eq!(result.status, ResultStatus::Error);
        assert!(result.error.unwrap().contains("refused"));
        assert!(paths.archived_task("t1").exists());
    }

    #[tokio::test]
    async fn existing_result_short_circuits_execution() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let dispatcher = dispatcher(&dir, recorder.clone());
        let task = Task::with_description("t1", "x");
        put(&dispatcher, &task);
        dispatcher
            .store()
            .write_result(&TaskResult::complete(&task, json!("earlier"), Utc::now()))
            .unwrap();

        dispatcher.drain(&CancellationToken::new()).await.unwrap();
        assert!(recorder.0.lock().unwrap().is_empty());
        assert!(!dispatcher.store().paths().task_file("t1").exists());
    }

    #[tokio::test]
    async fn abandoned_claim_is_requeued_once_then_failed() {
        let dir = TempDir::new().unwrap();
        let dispatcher = dispatcher(&dir, Arc::new(EchoExecutor));
        let store = dispatcher.store();
        put(&dispatcher, &Task::with_description("t1", "x").with_timeout(1));

        // First abandonment: claimed long ago, never finished.
        let mut claimed = store.claim("t1").unwrap();
        claimed.task.claim = Some(ClaimInfo {
            attempt: 0,
            claimed_at: Utc::now() - chrono::Duration::seconds(10),
            pid: std::process::id(),
        });
        fs::write(&claimed.marker, serde_json::to_vec(&claimed.task).unwrap()).unwrap();

        assert_eq!(dispatcher.recover_abandoned().await.unwrap(), 1);
        let requeued: Task = read_json(&store.paths().task_file("t1")).unwrap();
        assert_eq!(requeued.attempt, 1);

        // Second abandonment exhausts the budget.
        let mut claimed = store.claim("t1").unwrap();
        claimed.task.claim = Some(ClaimInfo {
            attempt: 1,
            claimed_at: Utc::now() - chrono::Duration::seconds(10),
            pid: std::process::id(),
        });
        fs::write(&claimed.marker, serde_json::to_vec(&claimed.task).unwrap()).unwrap();

        assert_eq!(dispatcher.recover_abandoned().await.unwrap(), 1);
        let result: TaskResult = read_json(&store.paths().result_file("t1")).unwrap();
        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(result.error.as_deref(), Some("abandoned after 2 attempts"));
        assert!(!store.paths().claim_marker("t1").exists());
    }

    #[tokio::test]
    async fn claimed_task_with_result_is_archived_without_running() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let dispatcher = dispatcher(&dir, recorder.clone());
        let store = dispatcher.store();
        let task = Task::with_description("t1", "x");
        put(&dispatcher, &task);
        store.claim("t1").unwrap();
        let recorded = TaskResult::complete(&task, json!("earlier"), Utc::now());
        store.write_result(&recorded).unwrap();

        assert_eq!(dispatcher.recover_abandoned().await.unwrap(), 1);
        assert!(recorder.0.lock().unwrap().is_empty());
        assert!(!store.paths().claim_marker("t1").exists());
        assert!(store.paths().archived_task("t1").exists());
        assert_eq!(store.read_result("t1").unwrap(), Some(recorded));
    }

    #[tokio::test]
    async fn huge_timeout_keeps_claim_without_overflow() {
        let dir = TempDir::new().unwrap();
        let dispatcher = dispatcher(&dir, Arc::new(EchoExecutor));
        let store = dispatcher.store();
        put(&dispatcher, &Task::with_description("t1", "x").with_timeout(u64::MAX));

        let mut claimed = store.claim("t1").unwrap();
        claimed.task.claim = Some(ClaimInfo {
            attempt: 0,
            claimed_at: Utc::now() - chrono::Duration::days(365),
            pid: std::process::id(),
        });
        fs::write(&claimed.marker, serde_json::to_vec(&claimed.task).unwrap()).unwrap();

        assert_eq!(dispatcher.recover_abandoned().await.unwrap(), 0);
        assert!(store.paths().claim_marker("t1").exists());
    }

    #[tokio::test]
    async fn unrecoverable_marker_does_not_block_the_queue() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let dispatcher = dispatcher(&dir, recorder.clone());
        let store = dispatcher.store();

        let stuck = Task::with_description("stuck", "x");
        put(&dispatcher, &stuck);
        store.claim("stuck").unwrap();
        store
            .write_result(&TaskResult::complete(&stuck, json!("done"), Utc::now()))
            .unwrap();
        // A non-empty directory in the archive slot makes the rename fail.
        let blocked = store.paths().archived_task("stuck");
        fs::create_dir_all(&blocked).unwrap();
        fs::write(blocked.join("keep"), b"x").unwrap();

        put(&dispatcher, &Task::with_description("next", "x"));

        let finished = dispatcher.reconcile(&CancellationToken::new()).await.unwrap();
        assert_eq!(finished, 1);
        assert_eq!(*recorder.0.lock().unwrap(), vec!["next"]);
        assert!(store.paths().claim_marker("stuck").exists());
    }

    #[tokio::test]
    async fn fresh_claim_is_left_alone() {
        let dir = TempDir::new().unwrap();
        let dispatcher = dispatcher(&dir, Arc::new(EchoExecutor));
        put(&dispatcher, &Task::with_description("t1", "x"));
        dispatcher.store().claim("t1").unwrap();

        assert_eq!(dispatcher.recover_abandoned().await.unwrap(), 0);
        assert!(dispatcher.store().paths().claim_marker("t1").exists());
    }
}
