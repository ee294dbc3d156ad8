use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

/// Durable unit of work, one JSON file per task in the worker's pending
/// directory.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Carried for producers; ordering stays FIFO by `created_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    /// Number of times this task was re-queued after an abandoned claim.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim: Option<ClaimInfo>,
}

impl Task {
    pub fn new(task_id: impl Into<String>, payload: Value) -> Self {
        Self {
            task_id: task_id.into(),
            worker: None,
            description: None,
            payload: Some(payload),
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
            created_at: Some(Utc::now()),
            priority: None,
            attempt: 0,
            claim: None,
        }
    }

    pub fn with_description(task_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            payload: None,
            ..Self::new(task_id, Value::Null)
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_seconds = secs;
        self
    }

    pub fn for_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    /// Input handed to the executor: `payload` wins over `description`.
    pub fn input(&self) -> Value {
        match (&self.payload, &self.description) {
            (Some(payload), _) => payload.clone(),
            (None, Some(description)) => Value::String(description.clone()),
            (None, None) => Value::Null,
        }
    }

    pub fn timeout(&self) -> Duration {
        match self.timeout_seconds {
            0 => Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            secs => Duration::from_secs(secs),
        }
    }

    /// Schema checks beyond what serde enforces. `expected_id` is the id
    /// derived from the file name, which is authoritative.
    pub fn validate(&self, expected_id: &str) -> Result<(), String> {
        if self.task_id.trim().is_empty() {
            return Err("task_id is empty".into());
        }
        if self.task_id != expected_id {
            return Err(format!(
                "task_id '{}' does not match file name '{}'",
                self.task_id, expected_id
            ));
        }
        let has_payload = self.payload.as_ref().is_some_and(|value| !value.is_null());
        if !has_payload && self.description.is_none() {
            return Err("task has neither description nor payload".into());
        }
        Ok(())
    }
}

/// Ownership metadata written into the in-progress marker after a claim.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimInfo {
    pub attempt: u32,
    pub claimed_at: DateTime<Utc>,
    pub pid: u32,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Complete,
    Error,
    Timeout,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Complete => "complete",
            ResultStatus::Error => "error",
            ResultStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of a task. `error` is populated iff `status` is not
/// `complete`; the constructors keep that invariant.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    pub status: ResultStatus,
    #[serde(default)]
    pub output: Value,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl TaskResult {
    pub fn complete(task: &Task, output: Value, started_at: DateTime<Utc>) -> Self {
        Self::build(task, ResultStatus::Complete, output, started_at, None)
    }

    pub fn failed(task: &Task, detail: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self::build(
            task,
            ResultStatus::Error,
            Value::Null,
            started_at,
            Some(detail.into()),
        )
    }

    pub fn timed_out(task: &Task, started_at: DateTime<Utc>) -> Self {
        let detail = format!("executor exceeded {}s deadline", task.timeout().as_secs());
        Self::build(
            task,
            ResultStatus::Timeout,
            Value::Null,
            started_at,
            Some(detail),
        )
    }

    fn build(
        task: &Task,
        status: ResultStatus,
        output: Value,
        started_at: DateTime<Utc>,
        error: Option<String>,
    ) -> Self {
        Self {
            task_id: task.task_id.clone(),
            worker: task.worker.clone(),
            status,
            output,
            started_at,
            completed_at: Utc::now(),
            error,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match (self.status, self.error.is_some()) {
            (ResultStatus::Complete, true) => Err("complete result carries an error".into()),
            (ResultStatus::Error | ResultStatus::Timeout, false) => {
                Err(format!("{} result without error detail", self.status))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Starting,
    Active,
    Busy,
    Stopped,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Starting => "starting",
            WorkerStatus::Active => "active",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liveness and load snapshot, `heartbeats/<worker>.json`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatRecord {
    pub worker: String,
    pub status: WorkerStatus,
    pub current_task: Option<String>,
    pub queue_size: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerSource {
    EventWatch,
    Poll,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::EventWatch => "event-watch",
            TriggerSource::Poll => "poll",
        }
    }
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ephemeral notice that a task file may be ready. Never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trigger {
    pub worker_id: String,
    pub task_id: String,
    pub observed_at: DateTime<Utc>,
    pub source: TriggerSource,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_defaults_from_minimal_json() {
        let task: Task =
            serde_json::from_str(r#"{"task_id":"t1","description":"x"}"#).unwrap();
        assert_eq!(task.timeout_seconds, DEFAULT_TIMEOUT_SECS);
        assert_eq!(task.attempt, 0);
        assert!(task.created_at.is_none());
        assert_eq!(task.input(), json!("x"));
        assert!(task.validate("t1").is_ok());
    }

    #[test]
    fn task_validation_rejects_mismatched_id() {
        let task = Task::with_description("t1", "x");
        let err = task.validate("t2").unwrap_err();
        assert!(err.contains("does not match"));
    }

    #[test]
    fn task_validation_requires_some_input() {
        let task: Task = serde_json::from_str(r#"{"task_id":"t1"}"#).unwrap();
        assert!(task.validate("t1").is_err());
    }

    #[test]
    fn payload_wins_over_description() {
        let mut task = Task::new("t1", json!({"k": 1}));
        task.description = Some("ignored".into());
        assert_eq!(task.input(), json!({"k": 1}));
    }

    #[test]
    fn zero_timeout_falls_back_to_default() {
        let task = Task::with_description("t1", "x").with_timeout(0);
        assert_eq!(task.timeout(), Duration::from_secs(DEFAULT_TIMEOUT_SECS));
    }

    #[test]
    fn result_constructors_keep_error_invariant() {
        let task = Task::with_description("t1", "x").with_timeout(2);
        let started = Utc::now();

        let ok = TaskResult::complete(&task, json!("done"), started);
        assert!(ok.error.is_none());
        assert!(ok.validate().is_ok());

        let timeout = TaskResult::timed_out(&task, started);
        assert_eq!(timeout.status, ResultStatus::Timeout);
        assert!(timeout.error.as_deref().unwrap().contains("2s"));
        assert!(timeout.validate().is_ok());
    }

    #[test]
    fn result_serializes_null_error() {
        let task = Task::with_description("t1", "x");
        let result = TaskResult::complete(&task, json!(1), Utc::now());
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "complete");
        assert!(value["error"].is_null());
    }

    #[test]
    fn heartbeat_uses_wire_names() {
        let record = HeartbeatRecord {
            worker: "anga".into(),
            status: WorkerStatus::Busy,
            current_task: Some("t1".into()),
            queue_size: 3,
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["status"], "busy");
        assert_eq!(value["queue_size"], 3);
        assert_eq!(value["current_task"], "t1");
    }
}
