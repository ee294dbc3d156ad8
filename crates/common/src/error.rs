//! # Relay Error Types
//!
//! Failure taxonomy shared by every relay component. Each variant maps to a
//! stable machine-readable code and tells the caller whether the operation is
//! worth retrying.
//!
//! ## Categories
//!
//! - **Races**: transient IO and lost claims, expected under concurrency
//! - **Execution**: executor timeouts and failures, recorded as Results
//! - **Integrity**: corrupt records, quarantined and skipped
//! - **Environment**: unavailable signal backends, misconfiguration

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result alias for fallible relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    /// E_TRANSIENT_IO - a file was momentarily busy or missing during a race.
    ///
    /// Retried with backoff by [`crate::fs::retry_transient`]; only surfaced
    /// once the retry budget is exhausted.
    #[error("transient IO failure on {path}: {source}")]
    TransientIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// E_CLAIM_LOST - another claimant renamed the task first.
    #[error("claim lost for task '{task_id}'")]
    ClaimLost { task_id: String },

    /// E_EXECUTOR_TIMEOUT - the executor exceeded the task deadline.
    #[error("task '{task_id}' timed out after {}s", .timeout.as_secs())]
    ExecutorTimeout { task_id: String, timeout: Duration },

    /// E_EXECUTOR_FAILED - the executor returned an error.
    #[error("task '{task_id}' failed: {detail}")]
    ExecutorFailed { task_id: String, detail: String },

    /// E_BACKEND_UNAVAILABLE - the event-watch signal backend cannot start.
    #[error("signal backend unavailable: {reason}")]
    BackendUnavailable { reason: String },

    /// E_CORRUPT_RECORD - a task, result or heartbeat file failed validation.
    #[error("corrupt record {path}: {reason}")]
    CorruptRecord { path: PathBuf, reason: String },

    /// E_NO_RECEIVER - nobody holds the peer's control pipe open.
    #[error("no receiver listening on {path}")]
    NoReceiver { path: PathBuf },

    /// E_CONFIG - invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// E_IO - any other filesystem error.
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl RelayError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        RelayError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        RelayError::CorruptRecord {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            RelayError::TransientIo { .. } => "E_TRANSIENT_IO",
            RelayError::ClaimLost { .. } => "E_CLAIM_LOST",
            RelayError::ExecutorTimeout { .. } => "E_EXECUTOR_TIMEOUT",
            RelayError::ExecutorFailed { .. } => "E_EXECUTOR_FAILED",
            RelayError::BackendUnavailable { .. } => "E_BACKEND_UNAVAILABLE",
            RelayError::CorruptRecord { .. } => "E_CORRUPT_RECORD",
            RelayError::NoReceiver { .. } => "E_NO_RECEIVER",
            RelayError::Config(_) => "E_CONFIG",
            RelayError::Io { .. } => "E_IO",
        }
    }

    /// Executor outcomes are never retried automatically: their side effects
    /// are unknown.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::TransientIo { .. } | RelayError::NoReceiver { .. }
        )
    }
}

/// Configuration validation failures. Always fatal at startup (exit code 1).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("worker '{worker}' is already supervised (lock held on {path})")]
    AlreadyRunning { worker: String, path: PathBuf },
}

impl ConfigError {
    pub fn invalid(key: &'static str, value: impl ToString, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let err = RelayError::ClaimLost {
            task_id: "t1".into(),
        };
        assert_eq!(err.code(), "E_CLAIM_LOST");
        assert!(!err.is_retryable());

        let err = RelayError::Config(ConfigError::Missing("WORKER_ID"));
        assert_eq!(err.code(), "E_CONFIG");
        assert_eq!(err.to_string(), "missing required setting WORKER_ID");
    }

    #[test]
    fn timeout_message_reports_seconds() {
        let err = RelayError::ExecutorTimeout {
            task_id: "t9".into(),
            timeout: Duration::from_secs(2),
        };
        assert_eq!(err.to_string(), "task 't9' timed out after 2s");
    }
}
