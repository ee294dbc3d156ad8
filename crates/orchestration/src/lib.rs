//! Activation and signalling for file-queue workers: signal backends, the
//! trigger watcher, the task store and dispatcher, heartbeats and the
//! control pipe.

pub mod activation;
pub mod dispatcher;
pub mod executor;
pub mod heartbeat;
pub mod ipc;
pub mod signal;
pub mod store;
pub mod watcher;
pub mod worker;

pub use activation::{ActivationSink, HookActivationSink, NoopActivationSink};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use executor::{CommandExecutor, EchoExecutor, ExecutionContext, Executor};
pub use heartbeat::{
    is_stale, HeartbeatMonitor, HeartbeatPublisher, HeartbeatRegistry, Liveness, LivenessEvent,
    WorkerState,
};
pub use ipc::ControlMessage;
pub use signal::{BackendSelector, EventWatchBackend, PollBackend, SignalBackend, Subscription};
pub use store::{ClaimedTask, PendingTask, TaskStore, WriteOutcome};
pub use watcher::TriggerWatcher;
pub use worker::{Worker, WorkerBuilder, WorkerLock};
