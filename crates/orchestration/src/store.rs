//! Durable task and result files for one worker queue.
//!
//! The pending file's presence is the only authority for "not started";
//! renaming it to its claim marker is the only mutual exclusion between
//! claimants.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use relay_common::fs::{encode_record, quarantine, read_json, retry_transient, SafeFileWriter, WriteMode};
use relay_common::layout::{
    quarantine_path, task_id_from_file_name, task_id_from_marker_name, Layout, WorkerPaths,
};
use relay_common::{ClaimInfo, RelayError, RelayResult, Task, TaskResult};
use serde::Deserialize;
use tracing::{debug, warn};

/// A pending task file with its FIFO ordering key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTask {
    pub task_id: String,
    pub path: PathBuf,
    pub enqueued_at: DateTime<Utc>,
}

/// A task this process owns through its claim marker.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub task: Task,
    pub marker: PathBuf,
    pub claimed_at: DateTime<Utc>,
}

/// A claim marker found on disk, owned by whoever wrote it.
#[derive(Debug)]
pub struct ClaimMarker {
    pub task_id: String,
    pub path: PathBuf,
    pub claimed_at: DateTime<Utc>,
    pub contents: RelayResult<Task>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// A byte-identical Result was already there.
    Unchanged,
    /// A different Result already exists and was left untouched.
    AlreadyPresent,
}

#[derive(Deserialize)]
struct OrderKey {
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

pub struct TaskStore {
    paths: WorkerPaths,
    writer: SafeFileWriter,
    archive_completed: bool,
}

impl TaskStore {
    pub fn new(layout: &Layout, worker: &str) -> Self {
        Self {
            paths: layout.worker(worker),
            writer: SafeFileWriter::new(layout.roots()),
            archive_completed: true,
        }
    }

    /// `false` deletes finished tasks instead of moving them to `.archive/`.
    pub fn with_archive(mut self, archive_completed: bool) -> Self {
        self.archive_completed = archive_completed;
        self
    }

    pub fn paths(&self) -> &WorkerPaths {
        &self.paths
    }

    pub fn worker(&self) -> &str {
        &self.paths.worker
    }

    pub fn ensure_dirs(&self) -> RelayResult<()> {
        for dir in [&self.paths.pending_dir, &self.paths.result_dir] {
            fs::create_dir_all(dir).map_err(|err| RelayError::io(dir, err))?;
        }
        Ok(())
    }

    /// Pending tasks, oldest first. `created_at` orders them; files without
    /// one (or that do not parse) fall back to their mtime and are dealt with
    /// once claimed.
    pub fn pending(&self) -> RelayResult<Vec<PendingTask>> {
        let mut tasks = Vec::new();
        for (name, path) in self.entries()? {
            let Some(task_id) = task_id_from_file_name(&name) else {
                continue;
            };
            let Some(enqueued_at) = ordering_key(&path) else {
                continue;
            };
            tasks.push(PendingTask {
                task_id: task_id.to_string(),
                path,
                enqueued_at,
            });
        }

        tasks.sort_by(|a, b| {
            a.enqueued_at
                .cmp(&b.enqueued_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        Ok(tasks)
    }

    pub fn queue_depth(&self) -> RelayResult<usize> {
        let count = self
            .entries()?
            .into_iter()
            .filter(|(name, _)| task_id_from_file_name(name).is_some())
            .count();
        Ok(count)
    }

    /// Renames the pending file to its claim marker. Losing the rename race
    /// is `ClaimLost`; a file that fails validation is quarantined and
    /// reported as `CorruptRecord`.
    pub fn claim(&self, task_id: &str) -> RelayResult<ClaimedTask> {
        let pending = self.paths.task_file(task_id);
        let marker = self.paths.claim_marker(task_id);

        match retry_transient(&pending, || fs::rename(&pending, &marker)) {
            Ok(()) => {}
            Err(RelayError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                return Err(RelayError::ClaimLost {
                    task_id: task_id.to_string(),
                });
            }
            Err(err) => return Err(err),
        }

        let mut task = match load_task(&marker, task_id) {
            Ok(task) => task,
            Err(err) => {
                self.quarantine_marker(task_id);
                return Err(err);
            }
        };

        if task.worker.is_none() {
            task.worker = Some(self.paths.worker.clone());
        }
        let claimed_at = Utc::now();
        task.claim = Some(ClaimInfo {
            attempt: task.attempt,
            claimed_at,
            pid: std::process::id(),
        });
        self.writer.write_json(&marker, &task, WriteMode::Atomic)?;

        debug!(worker = %self.paths.worker, task_id, attempt = task.attempt, "task claimed");
        Ok(ClaimedTask {
            task,
            marker,
            claimed_at,
        })
    }

    pub fn result_exists(&self, task_id: &str) -> bool {
        self.paths.result_file(task_id).exists()
    }

    pub fn read_result(&self, task_id: &str) -> RelayResult<Option<TaskResult>> {
        let path = self.paths.result_file(task_id);
        match read_json::<TaskResult>(&path) {
            Ok(result) => Ok(Some(result)),
            Err(RelayError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Terminal and idempotent: the first Result written for a task wins.
    pub fn write_result(&self, result: &TaskResult) -> RelayResult<WriteOutcome> {
        let path = self.paths.result_file(&result.task_id);
        let bytes = encode_record(&path, result)?;

        if let Some(outcome) = compare_existing(&path, &bytes)? {
            return Ok(outcome);
        }

        match self.writer.write(&path, &bytes, WriteMode::CreateNew) {
            Ok(()) => Ok(WriteOutcome::Written),
            Err(RelayError::Io { source, .. }) if source.kind() == io::ErrorKind::AlreadyExists => {
                compare_existing(&path, &bytes)
                    .map(|outcome| outcome.unwrap_or(WriteOutcome::AlreadyPresent))
            }
            Err(err) => Err(err),
        }
    }

    /// Moves the claimed (or still pending) task out of the queue. Calling it
    /// again after success is a no-op.
    pub fn archive(&self, task_id: &str) -> RelayResult<()> {
        let marker = self.paths.claim_marker(task_id);
        let pending = self.paths.task_file(task_id);
        let source = if marker.exists() {
            marker
        } else if pending.exists() {
            pending
        } else {
            return Ok(());
        };

        let outcome = if self.archive_completed {
            let dir = self.paths.archive_dir();
            fs::create_dir_all(&dir).map_err(|err| RelayError::io(&dir, err))?;
            let target = self.paths.archived_task(task_id);
            retry_transient(&source, || fs::rename(&source, &target))
        } else {
            retry_transient(&source, || fs::remove_file(&source))
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(RelayError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Claim markers currently on disk, with the time their claim started.
    pub fn markers(&self) -> RelayResult<Vec<ClaimMarker>> {
        let mut markers = Vec::new();
        for (name, path) in self.entries()? {
            let Some(task_id) = task_id_from_marker_name(&name) else {
                continue;
            };
            let Some(modified) = modified_at(&path) else {
                continue;
            };
            let contents = load_task(&path, task_id);
            let claimed_at = contents
                .as_ref()
                .ok()
                .and_then(|task| task.claim.as_ref())
                .map(|claim| claim.claimed_at)
                .unwrap_or(modified);
            markers.push(ClaimMarker {
                task_id: task_id.to_string(),
                path,
                claimed_at,
                contents,
            });
        }
        Ok(markers)
    }

    /// Puts an abandoned task back in the queue with its attempt counter
    /// bumped. The pending file is written before the marker goes away.
    pub fn requeue(&self, task: &Task) -> RelayResult<()> {
        let mut next = task.clone();
        next.attempt += 1;
        next.claim = None;
        self.writer
            .write_json(&self.paths.task_file(&task.task_id), &next, WriteMode::Atomic)?;
        self.discard_marker(&task.task_id)
    }

    pub fn discard_marker(&self, task_id: &str) -> RelayResult<()> {
        let marker = self.paths.claim_marker(task_id);
        match fs::remove_file(&marker) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(RelayError::io(&marker, err)),
        }
    }

    /// Moves a bad marker to `<task_id>.json.invalid` in the pending dir.
    pub fn quarantine_marker(&self, task_id: &str) -> Option<PathBuf> {
        let marker = self.paths.claim_marker(task_id);
        let target = quarantine_path(&self.paths.task_file(task_id));
        match fs::rename(&marker, &target) {
            Ok(()) => {
                warn!(worker = %self.paths.worker, task_id, path = %target.display(), "quarantined corrupt task");
                Some(target)
            }
            Err(err) => {
                warn!(worker = %self.paths.worker, task_id, error = %err, "failed to quarantine corrupt task");
                None
            }
        }
    }

    /// Quarantines a corrupt Result so the task can be finished again.
    pub fn quarantine_result(&self, task_id: &str) -> RelayResult<PathBuf> {
        quarantine(&self.paths.result_file(task_id))
    }

    fn entries(&self) -> RelayResult<Vec<(String, PathBuf)>> {
        let dir = &self.paths.pending_dir;
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(RelayError::io(dir, err)),
        };

        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| RelayError::io(dir, err))?;
            let is_file = entry.file_type().map(|kind| kind.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            if let Ok(name) = entry.file_name().into_string() {
                out.push((name, entry.path()));
            }
        }
        Ok(out)
    }
}

fn load_task(path: &Path, task_id: &str) -> RelayResult<Task> {
    let task: Task = read_json(path)?;
    task.validate(task_id)
        .map_err(|reason| RelayError::corrupt(path, reason))?;
    Ok(task)
}

fn ordering_key(path: &Path) -> Option<DateTime<Utc>> {
    let parsed = fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<OrderKey>(&bytes).ok())
        .and_then(|key| key.created_at);
    parsed.or_else(|| modified_at(path))
}

/// `None` when the file vanished underneath us.
fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

fn compare_existing(path: &Path, bytes: &[u8]) -> RelayResult<Option<WriteOutcome>> {
    match fs::read(path) {
        Ok(existing) if existing == bytes => Ok(Some(WriteOutcome::Unchanged)),
        Ok(_) => {
            debug!(path = %path.display(), "result already present, keeping existing");
            Ok(Some(WriteOutcome::AlreadyPresent))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(RelayError::io(path, err)),
    }
}
