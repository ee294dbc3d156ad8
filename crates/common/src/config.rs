use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::layout::{is_valid_identifier, Layout};

pub const DEFAULT_ROOT: &str = "/tmp/relay";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_STALE_THRESHOLD_SECS: u64 = 60;
pub const DEFAULT_INTAKE_CAPACITY: usize = 256;
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;
pub const DEFAULT_MAX_CLAIM_ATTEMPTS: u32 = 2;

const POLL_INTERVAL_RANGE_MS: (u64, u64) = (50, 60_000);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SignalBackendKind {
    /// Event-watch, downgrading to poll when it cannot start.
    #[default]
    Auto,
    Event,
    Poll,
}

impl FromStr for SignalBackendKind {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(SignalBackendKind::Auto),
            "event" | "event-watch" => Ok(SignalBackendKind::Event),
            "poll" => Ok(SignalBackendKind::Poll),
            _ => Err(ConfigError::invalid(
                "SIGNAL_BACKEND",
                raw,
                "expected one of auto, event, poll",
            )),
        }
    }
}

impl fmt::Display for SignalBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SignalBackendKind::Auto => "auto",
            SignalBackendKind::Event => "event",
            SignalBackendKind::Poll => "poll",
        })
    }
}

/// Resolved settings shared by `relayd`, producers and monitors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    pub worker_id: Option<String>,
    pub root: PathBuf,
    pub signal_backend: SignalBackendKind,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub stale_threshold_secs: u64,
    pub task_dir: Option<PathBuf>,
    pub result_dir: Option<PathBuf>,
    pub heartbeat_dir: Option<PathBuf>,
    pub pipe_dir: Option<PathBuf>,
    pub intake_capacity: usize,
    pub reconcile_interval_secs: u64,
    pub shutdown_grace_secs: u64,
    pub max_claim_attempts: u32,
    pub archive_completed: bool,
    pub pipes_enabled: bool,
    pub executor_command: Option<String>,
    pub activation_hook: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            root: PathBuf::from(DEFAULT_ROOT),
            signal_backend: SignalBackendKind::Auto,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            stale_threshold_secs: DEFAULT_STALE_THRESHOLD_SECS,
            task_dir: None,
            result_dir: None,
            heartbeat_dir: None,
            pipe_dir: None,
            intake_capacity: DEFAULT_INTAKE_CAPACITY,
            reconcile_interval_secs: DEFAULT_RECONCILE_INTERVAL_SECS,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            max_claim_attempts: DEFAULT_MAX_CLAIM_ATTEMPTS,
            archive_completed: true,
            pipes_enabled: cfg!(unix),
            executor_command: None,
            activation_hook: None,
        }
    }
}

impl RelayConfig {
    /// Defaults, then the optional TOML file, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_with(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlays environment variables read through `lookup`. Unset or blank
    /// variables leave the current value alone; malformed ones are errors.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(value) = get("WORKER_ID") {
            self.worker_id = Some(value.trim().to_string());
        }
        if let Some(value) = get("RELAY_ROOT") {
            self.root = PathBuf::from(value);
        }
        if let Some(value) = get("SIGNAL_BACKEND") {
            self.signal_backend = value.parse()?;
        }
        if let Some(value) = get("POLL_INTERVAL_MS") {
            self.poll_interval_ms = parse_number("POLL_INTERVAL_MS", &value)?;
        }
        if let Some(value) = get("HEARTBEAT_INTERVAL_S") {
            self.heartbeat_interval_secs = parse_number("HEARTBEAT_INTERVAL_S", &value)?;
        }
        if let Some(value) = get("STALE_THRESHOLD_S") {
            self.stale_threshold_secs = parse_number("STALE_THRESHOLD_S", &value)?;
        }
        if let Some(value) = get("TASK_DIR") {
            self.task_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = get("RESULT_DIR") {
            self.result_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = get("HEARTBEAT_DIR") {
            self.heartbeat_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = get("PIPE_DIR") {
            self.pipe_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = get("INTAKE_CAPACITY") {
            self.intake_capacity = parse_number("INTAKE_CAPACITY", &value)?;
        }
        if let Some(value) = get("RECONCILE_INTERVAL_S") {
            self.reconcile_interval_secs = parse_number("RECONCILE_INTERVAL_S", &value)?;
        }
        if let Some(value) = get("SHUTDOWN_GRACE_S") {
            self.shutdown_grace_secs = parse_number("SHUTDOWN_GRACE_S", &value)?;
        }
        if let Some(value) = get("MAX_CLAIM_ATTEMPTS") {
            self.max_claim_attempts = parse_number("MAX_CLAIM_ATTEMPTS", &value)?;
        }
        if let Some(value) = get("ARCHIVE_COMPLETED") {
            self.archive_completed = parse_bool("ARCHIVE_COMPLETED", &value)?;
        }
        if let Some(value) = get("PIPES_ENABLED") {
            self.pipes_enabled = parse_bool("PIPES_ENABLED", &value)?;
        }
        if let Some(value) = get("EXECUTOR_COMMAND") {
            self.executor_command = Some(value);
        }
        if let Some(value) = get("ACTIVATION_HOOK") {
            self.activation_hook = Some(value);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(worker) = &self.worker_id {
            if !is_valid_identifier(worker) {
                return Err(ConfigError::invalid(
                    "WORKER_ID",
                    worker,
                    "use letters, digits, '.', '_' or '-' without a leading dot",
                ));
            }
        }

        let (min_poll, max_poll) = POLL_INTERVAL_RANGE_MS;
        if !(min_poll..=max_poll).contains(&self.poll_interval_ms) {
            return Err(ConfigError::invalid(
                "POLL_INTERVAL_MS",
                self.poll_interval_ms,
                format!("must be within {}..={}", min_poll, max_poll),
            ));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "HEARTBEAT_INTERVAL_S",
                0,
                "must be positive",
            ));
        }
        if self.stale_threshold_secs <= self.heartbeat_interval_secs {
            return Err(ConfigError::invalid(
                "STALE_THRESHOLD_S",
                self.stale_threshold_secs,
                format!(
                    "must exceed the heartbeat interval ({}s)",
                    self.heartbeat_interval_secs
                ),
            ));
        }
        if self.intake_capacity == 0 {
            return Err(ConfigError::invalid("INTAKE_CAPACITY", 0, "must be positive"));
        }
        if self.reconcile_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "RECONCILE_INTERVAL_S",
                0,
                "must be positive",
            ));
        }
        if self.max_claim_attempts == 0 {
            return Err(ConfigError::invalid(
                "MAX_CLAIM_ATTEMPTS",
                0,
                "must be at least 1",
            ));
        }
        Ok(())
    }

    /// The worker id, required by anything that owns a queue.
    pub fn require_worker(&self) -> Result<&str, ConfigError> {
        self.worker_id
            .as_deref()
            .ok_or(ConfigError::Missing("WORKER_ID"))
    }

    pub fn layout(&self) -> Layout {
        let defaults = Layout::under(&self.root);
        Layout {
            task_dir: self.task_dir.clone().unwrap_or(defaults.task_dir),
            result_dir: self.result_dir.clone().unwrap_or(defaults.result_dir),
            heartbeat_dir: self.heartbeat_dir.clone().unwrap_or(defaults.heartbeat_dir),
            pipe_dir: self.pipe_dir.clone().unwrap_or(defaults.pipe_dir),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn parse_number<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|err| ConfigError::invalid(key, raw, err.to_string()))
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, raw, "expected a boolean")),
    }
}
