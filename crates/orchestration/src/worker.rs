//! Supervises one worker: the trigger watcher, the dispatcher, the heartbeat
//! publisher and, where available, the control pipe.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use relay_common::{
    ConfigError, RelayConfig, RelayError, RelayResult, Trigger, TriggerSource, WorkerPaths,
};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::activation::{ActivationSink, NoopActivationSink};
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::executor::{EchoExecutor, Executor};
use crate::heartbeat::{HeartbeatPublisher, HeartbeatRegistry, WorkerState};
use crate::signal::{BackendSelector, EventWatchBackend};
use crate::store::TaskStore;
use crate::watcher::TriggerWatcher;

/// Exclusive hold on a worker's queue. Released when dropped.
#[derive(Debug)]
pub struct WorkerLock {
    file: File,
    path: PathBuf,
}

impl WorkerLock {
    pub fn acquire(paths: &WorkerPaths) -> RelayResult<Self> {
        let path = paths.lock_file();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| RelayError::io(parent, err))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|err| RelayError::io(&path, err))?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { file, path }),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock
                || err.raw_os_error() == fs2::lock_contended_error().raw_os_error() =>
            {
                Err(ConfigError::AlreadyRunning {
                    worker: paths.worker.clone(),
                    path,
                }
                .into())
            }
            Err(err) => Err(RelayError::io(&path, err)),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl Drop for WorkerLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

pub struct WorkerBuilder {
    config: RelayConfig,
    executor: Arc<dyn Executor>,
    sink: Arc<dyn ActivationSink>,
    event_backend: Option<EventWatchBackend>,
}

impl WorkerBuilder {
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn activation_sink(mut self, sink: Arc<dyn ActivationSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replaces the event-watch backend, e.g. with
    /// [`EventWatchBackend::disabled`] to exercise the poll fallback.
    pub fn event_backend(mut self, backend: EventWatchBackend) -> Self {
        self.event_backend = Some(backend);
        self
    }

    pub fn build(self) -> RelayResult<Worker> {
        self.config.validate()?;
        let worker_id = self.config.require_worker()?.to_string();
        let layout = self.config.layout();
        let store = TaskStore::new(&layout, &worker_id).with_archive(self.config.archive_completed);
        let registry = HeartbeatRegistry::new(layout.heartbeat_dir.clone());

        Ok(Worker {
            worker_id,
            store: Arc::new(store),
            registry: Arc::new(registry),
            executor: self.executor,
            sink: self.sink,
            event_backend: self.event_backend,
            config: self.config,
        })
    }
}

pub struct Worker {
    worker_id: String,
    config: RelayConfig,
    store: Arc<TaskStore>,
    registry: Arc<HeartbeatRegistry>,
    executor: Arc<dyn Executor>,
    sink: Arc<dyn ActivationSink>,
    event_backend: Option<EventWatchBackend>,
}

impl Worker {
    pub fn builder(config: RelayConfig) -> WorkerBuilder {
        WorkerBuilder {
            config,
            executor: Arc::new(EchoExecutor),
            sink: Arc::new(NoopActivationSink),
            event_backend: None,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn paths(&self) -> &WorkerPaths {
        self.store.paths()
    }

    fn selector(&mut self) -> BackendSelector {
        let kind = self.config.signal_backend;
        let interval = self.config.poll_interval();
        match self.event_backend.take() {
            Some(event) => BackendSelector::with_event_backend(kind, event, interval),
            None => BackendSelector::new(kind, interval),
        }
    }

    /// Runs until `shutdown` is cancelled. Startup failures (lock held,
    /// signal backend unavailable) are returned before any task is touched.
    pub async fn run(mut self, shutdown: CancellationToken) -> RelayResult<()> {
        let lock = WorkerLock::acquire(self.store.paths())?;
        debug!(worker = %self.worker_id, path = %lock.path().display(), "worker lock acquired");
        self.store.ensure_dirs()?;

        let reconcile = Arc::new(Notify::new());
        let (intake_tx, intake_rx) = mpsc::channel::<Trigger>(self.config.intake_capacity);
        let mut watcher = TriggerWatcher::new(
            self.worker_id.clone(),
            self.store.paths().pending_dir.clone(),
            self.selector(),
            intake_tx,
            reconcile.clone(),
        );
        // No heartbeat is published until a signal backend is connected.
        let source = watcher.connect()?;
        self.announce(source);

        let (state_tx, state_rx) = watch::channel(WorkerState::starting());
        let mut publisher = HeartbeatPublisher::new(
            self.registry.clone(),
            self.store.clone(),
            state_rx,
            self.config.heartbeat_interval(),
        );
        publisher.publish(&WorkerState::starting())?;

        // Background tasks stop on `background`; the dispatcher stops on
        // `shutdown` so it can finish its in-flight task first.
        let background = CancellationToken::new();
        let heartbeat_stop = CancellationToken::new();

        let publisher_task = tokio::spawn(publisher.run(heartbeat_stop.clone()));
        let watcher_task = tokio::spawn(watcher.run(background.clone()));
        let pipe_task = self.spawn_control_pipe(reconcile.clone(), background.clone());

        let dispatcher = Dispatcher::new(
            self.store.clone(),
            self.executor.clone(),
            self.sink.clone(),
            state_tx,
            reconcile,
            DispatcherConfig {
                reconcile_interval: self.config.reconcile_interval(),
                max_claim_attempts: self.config.max_claim_attempts,
            },
        );
        let mut dispatcher_task = tokio::spawn(dispatcher.run(intake_rx, shutdown.clone()));

        let stopped_early = tokio::select! {
            _ = shutdown.cancelled() => None,
            joined = &mut dispatcher_task => Some(joined),
        };
        let outcome = match stopped_early {
            Some(joined) => flatten("dispatcher", joined),
            None => {
                info!(worker = %self.worker_id, "shutdown requested, finishing in-flight work");
                self.join_dispatcher(&mut dispatcher_task).await
            }
        };

        background.cancel();
        // A watcher that lost its backend mid-run closes the intake and ends
        // the dispatcher early; report that instead of a clean stop.
        let outcome = match (outcome, flatten("trigger watcher", watcher_task.await)) {
            (Ok(()), Err(err)) => {
                warn!(worker = %self.worker_id, code = err.code(), error = %err, "trigger watcher ended with error");
                Err(err)
            }
            (outcome, _) => outcome,
        };
        if let Some(task) = pipe_task {
            let _ = task.await;
        }

        heartbeat_stop.cancel();
        if let Err(err) = flatten("heartbeat publisher", publisher_task.await) {
            warn!(worker = %self.worker_id, error = %err, "final heartbeat not published");
        }

        drop(lock);
        info!(worker = %self.worker_id, "worker stopped");
        outcome
    }

    fn announce(&self, source: TriggerSource) {
        info!(
            worker = %self.worker_id,
            source = %source,
            task_dir = %self.store.paths().pending_dir.display(),
            poll_interval_ms = self.config.poll_interval_ms,
            "worker started"
        );
    }

    async fn join_dispatcher(
        &self,
        task: &mut JoinHandle<RelayResult<()>>,
    ) -> RelayResult<()> {
        let grace = self.config.shutdown_grace();
        match tokio::time::timeout(grace, &mut *task).await {
            Ok(joined) => flatten("dispatcher", joined),
            Err(_) => {
                warn!(
                    worker = %self.worker_id,
                    grace_secs = grace.as_secs(),
                    "in-flight task did not finish within the grace period; abandoning it to recovery"
                );
                task.abort();
                Ok(())
            }
        }
    }

    #[cfg(unix)]
    fn spawn_control_pipe(
        &self,
        reconcile: Arc<Notify>,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        use crate::ipc::PipeChannel;

        if !self.config.pipes_enabled {
            return None;
        }
        let channel = match PipeChannel::create(self.store.paths()) {
            Ok(channel) => channel,
            Err(err) => {
                warn!(worker = %self.worker_id, error = %err, "control pipe unavailable; task files only");
                return None;
            }
        };
        let messages = match channel.listen(cancel) {
            Ok(messages) => messages,
            Err(err) => {
                warn!(worker = %self.worker_id, error = %err, "control pipe listener failed to start");
                return None;
            }
        };

        let handler = ControlHandler {
            channel,
            registry: self.registry.clone(),
            sink: self.sink.clone(),
            reconcile,
        };
        Some(tokio::spawn(handler.run(messages)))
    }

    #[cfg(not(unix))]
    fn spawn_control_pipe(
        &self,
        _reconcile: Arc<Notify>,
        _cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        None
    }
}

#[cfg(unix)]
struct ControlHandler {
    channel: crate::ipc::PipeChannel,
    registry: Arc<HeartbeatRegistry>,
    sink: Arc<dyn ActivationSink>,
    reconcile: Arc<Notify>,
}

#[cfg(unix)]
impl ControlHandler {
    async fn run(self, mut messages: mpsc::Receiver<String>) {
        use crate::ipc::ControlMessage;

        let worker = self.channel.worker.clone();
        while let Some(line) = messages.recv().await {
            match ControlMessage::parse(&line) {
                Some(ControlMessage::Ping) => self.reply_status().await,
                Some(ControlMessage::Wake) => self.reconcile.notify_one(),
                Some(ControlMessage::Activate(message)) => {
                    if let Err(err) = self.sink.activate(&worker, &message).await {
                        warn!(worker = %worker, error = %err, "activation failed");
                    }
                    self.reconcile.notify_one();
                }
                None => {}
            }
        }
        debug!(worker = %worker, "control pipe closed");
    }

    async fn reply_status(&self) {
        let worker = &self.channel.worker;
        let reply = match self.registry.read(worker) {
            Ok(Some(record)) => serde_json::to_string(&record).unwrap_or_default(),
            Ok(None) => String::from("{}"),
            Err(err) => {
                warn!(worker = %worker, error = %err, "heartbeat unreadable for status reply");
                return;
            }
        };
        match self.channel.reply(&reply).await {
            Ok(()) => {}
            Err(RelayError::NoReceiver { .. }) => {
                debug!(worker = %worker, "status reply dropped, nobody reading")
            }
            Err(err) => warn!(worker = %worker, error = %err, "status reply failed"),
        }
    }
}

fn flatten(
    name: &str,
    joined: Result<RelayResult<()>, tokio::task::JoinError>,
) -> RelayResult<()> {
    match joined {
        Ok(result) => result,
        Err(err) if err.is_cancelled() => Ok(()),
        Err(err) => {
            error!(task = name, error = %err, "background task panicked");
            Err(RelayError::io(
                PathBuf::from(name),
                io::Error::new(io::ErrorKind::Other, err.to_string()),
            ))
        }
    }
}

/// Lets tests and embedders bound how long they wait for a worker's first
/// heartbeat.
pub async fn wait_for_heartbeat(
    registry: &HeartbeatRegistry,
    worker: &str,
    timeout: Duration,
) -> RelayResult<bool> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if registry.read(worker)?.is_some() {
            return Ok(true);
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
