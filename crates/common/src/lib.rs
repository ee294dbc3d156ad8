// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
//! Records, paths and configuration shared by the relay worker, its
//! producers and its monitors.

pub mod config;
pub mod error;
pub mod fs;
pub mod layout;
pub mod types;

pub use config::{RelayConfig, SignalBackendKind};
pub use error::{ConfigError, RelayError, RelayResult};
pub use layout::{Layout, WorkerPaths};
pub use types::{
    ClaimInfo, HeartbeatRecord, ResultStatus, Task, TaskResult, Trigger, TriggerSource,
    WorkerStatus, DEFAULT_TIMEOUT_SECS,
};
