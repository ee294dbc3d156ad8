//! Liveness records: one atomically replaced file per worker, published on a
//! timer and on every state change, read back by monitors on their own
//! schedule.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use relay_common::fs::{quarantine, read_json, SafeFileWriter, WriteMode};
use relay_common::layout::{is_valid_identifier, task_id_from_file_name};
use relay_common::{HeartbeatRecord, RelayError, RelayResult, WorkerStatus};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::TaskStore;

/// `now - timestamp > threshold`. A record exactly `threshold` old is still
/// alive, and one from the future is never stale.
pub fn is_stale(record: &HeartbeatRecord, now: DateTime<Utc>, threshold: Duration) -> bool {
    match (now - record.timestamp).to_std() {
        Ok(age) => age > threshold,
        Err(_) => false,
    }
}

/// Age of a record, clamped at zero.
pub fn age_of(record: &HeartbeatRecord, now: DateTime<Utc>) -> Duration {
    (now - record.timestamp).to_std().unwrap_or(Duration::ZERO)
}

pub struct HeartbeatRegistry {
    dir: PathBuf,
    writer: SafeFileWriter,
}

impl HeartbeatRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            writer: SafeFileWriter::new(vec![dir.clone()]),
            dir,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, worker: &str) -> PathBuf {
        self.dir.join(format!("{}.json", worker))
    }

    pub fn publish(&self, record: &HeartbeatRecord) -> RelayResult<()> {
        if !is_valid_identifier(&record.worker) {
            return Err(RelayError::corrupt(
                self.path_for(&record.worker),
                format!("invalid worker id '{}'", record.worker),
            ));
        }
        self.writer
            .write_json(&self.path_for(&record.worker), record, WriteMode::Atomic)
    }

    pub fn read(&self, worker: &str) -> RelayResult<Option<HeartbeatRecord>> {
        match read_json::<HeartbeatRecord>(&self.path_for(worker)) {
            Ok(record) => Ok(Some(record)),
            Err(RelayError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Every readable record keyed by worker. Records that fail to parse, or
    /// whose `worker` disagrees with the file name, are quarantined.
    pub fn read_all(&self) -> RelayResult<BTreeMap<String, HeartbeatRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(RelayError::io(&self.dir, err)),
        };

        let mut records = BTreeMap::new();
        for entry in entries {
            let entry = entry.map_err(|err| RelayError::io(&self.dir, err))?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let Some(worker) = task_id_from_file_name(&name) else {
                continue;
            };
            let path = entry.path();

            let record = read_json::<HeartbeatRecord>(&path).and_then(|record| {
                if record.worker == worker {
                    Ok(record)
                } else {
                    Err(RelayError::corrupt(
                        &path,
                        format!("record names worker '{}'", record.worker),
                    ))
                }
            });

            match record {
                Ok(record) => {
                    records.insert(worker.to_string(), record);
                }
                Err(RelayError::CorruptRecord { reason, .. }) => {
                    warn!(path = %path.display(), reason = %reason, "quarantining corrupt heartbeat");
                    if let Err(err) = quarantine(&path) {
                        warn!(path = %path.display(), error = %err, "failed to quarantine heartbeat");
                    }
                }
                Err(RelayError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
        Ok(records)
    }

    /// Drops a decommissioned worker's record.
    pub fn remove(&self, worker: &str) -> RelayResult<()> {
        let path = self.path_for(worker);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(RelayError::io(&path, err)),
        }
    }
}

/// What the dispatcher is doing right now, as published in heartbeats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerState {
    pub status: WorkerStatus,
    pub current_task: Option<String>,
}

impl WorkerState {
    pub fn starting() -> Self {
        Self {
            status: WorkerStatus::Starting,
            current_task: None,
        }
    }

    pub fn active() -> Self {
        Self {
            status: WorkerStatus::Active,
            current_task: None,
        }
    }

    pub fn busy(task_id: impl Into<String>) -> Self {
        Self {
            status: WorkerStatus::Busy,
            current_task: Some(task_id.into()),
        }
    }
}

/// Publishes this worker's record on an interval and immediately after each
/// state change; a final `stopped` record when it exits.
pub struct HeartbeatPublisher {
    worker: String,
    registry: Arc<HeartbeatRegistry>,
    store: Arc<TaskStore>,
    state: watch::Receiver<WorkerState>,
    interval: Duration,
    last: Option<DateTime<Utc>>,
}

impl HeartbeatPublisher {
    pub fn new(
        registry: Arc<HeartbeatRegistry>,
        store: Arc<TaskStore>,
        state: watch::Receiver<WorkerState>,
        interval: Duration,
    ) -> Self {
        Self {
            worker: store.worker().to_string(),
            registry,
            store,
            state,
            interval,
            last: None,
        }
    }

    /// Strictly increasing even if the wall clock stalls or steps back.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last {
            Some(prev) if now <= prev => prev + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.last = Some(stamp);
        stamp
    }

    pub fn snapshot(&mut self, state: &WorkerState) -> HeartbeatRecord {
        let queue_size = self.store.queue_depth().unwrap_or_else(|err| {
            debug!(worker = %self.worker, error = %err, "queue depth unavailable");
            0
        });
        HeartbeatRecord {
            worker: self.worker.clone(),
            status: state.status,
            current_task: state.current_task.clone(),
            queue_size,
            timestamp: self.next_timestamp(),
        }
    }

    pub fn publish(&mut self, state: &WorkerState) -> RelayResult<HeartbeatRecord> {
        let record = self.snapshot(state);
        self.registry.publish(&record)?;
        Ok(record)
    }

    fn publish_logged(&mut self, state: &WorkerState) {
        match self.publish(state) {
            Ok(record) => debug!(
                worker = %record.worker,
                status = %record.status,
                queue_size = record.queue_size,
                "heartbeat published"
            ),
            Err(err) => warn!(worker = %self.worker, error = %err, "heartbeat publish failed"),
        }
    }

    pub async fn run(mut self, stop: CancellationToken) -> RelayResult<()> {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut watching = true;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let state = self.state.borrow().clone();
                    self.publish_logged(&state);
                }
                changed = self.state.changed(), if watching => {
                    if changed.is_err() {
                        // Dispatcher gone; keep the timer going until stopped.
                        watching = false;
                        continue;
                    }
                    let state = self.state.borrow_and_update().clone();
                    self.publish_logged(&state);
                }
            }
        }

        let stopped = WorkerState {
            status: WorkerStatus::Stopped,
            current_task: None,
        };
        let record = self.publish(&stopped)?;
        info!(worker = %record.worker, "published final heartbeat");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessEvent {
    Stale { worker: String, age: Duration },
    Recovered { worker: String },
    Stopped { worker: String },
    Vanished { worker: String },
}

/// One worker's record and its verdict at a given instant.
#[derive(Debug, Clone, PartialEq)]
pub struct Liveness {
    pub record: HeartbeatRecord,
    pub age: Duration,
    pub stale: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Alive,
    Stale,
    Stopped,
}

/// Polls the registry and raises per-worker transitions. Workers are judged
/// independently; nothing here is needed for correctness.
pub struct HeartbeatMonitor {
    registry: Arc<HeartbeatRegistry>,
    threshold: Duration,
    known: HashMap<String, Verdict>,
}

impl HeartbeatMonitor {
    pub fn new(registry: Arc<HeartbeatRegistry>, threshold: Duration) -> Self {
        Self {
            registry,
            threshold,
            known: HashMap::new(),
        }
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> RelayResult<Vec<Liveness>> {
        Ok(self
            .registry
            .read_all()?
            .into_values()
            .map(|record| Liveness {
                age: age_of(&record, now),
                stale: is_stale(&record, now, self.threshold),
                record,
            })
            .collect())
    }

    pub fn poll(&mut self) -> RelayResult<Vec<LivenessEvent>> {
        let records = self.registry.read_all()?;
        Ok(self.observe(&records, Utc::now()))
    }

    pub fn observe(
        &mut self,
        records: &BTreeMap<String, HeartbeatRecord>,
        now: DateTime<Utc>,
    ) -> Vec<LivenessEvent> {
        let mut events = Vec::new();

        for (worker, record) in records {
            let verdict = if record.status == WorkerStatus::Stopped {
                Verdict::Stopped
            } else if is_stale(record, now, self.threshold) {
                Verdict::Stale
            } else {
                Verdict::Alive
            };
            let previous = self.known.insert(worker.clone(), verdict);

            match (previous, verdict) {
                (prev, Verdict::Stale) if prev != Some(Verdict::Stale) => {
                    events.push(LivenessEvent::Stale {
                        worker: worker.clone(),
                        age: age_of(record, now),
                    })
                }
                (Some(Verdict::Stale | Verdict::Stopped), Verdict::Alive) => {
                    events.push(LivenessEvent::Recovered {
                        worker: worker.clone(),
                    })
                }
                (prev, Verdict::Stopped) if prev != Some(Verdict::Stopped) => {
                    events.push(LivenessEvent::Stopped {
                        worker: worker.clone(),
                    })
                }
                _ => {}
            }
        }

        let vanished: Vec<String> = self
            .known
            .keys()
            .filter(|worker| !records.contains_key(*worker))
            .cloned()
            .collect();
        for worker in vanished {
            self.known.remove(&worker);
            events.push(LivenessEvent::Vanished { worker });
        }

        events
    }

    pub async fn run(
        mut self,
        interval: Duration,
        events: mpsc::Sender<LivenessEvent>,
        cancel: CancellationToken,
    ) -> RelayResult<()> {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let batch = match self.poll() {
                Ok(batch) => batch,
                Err(err) => {
                    warn!(error = %err, "heartbeat scan failed");
                    continue;
                }
            };
            for event in batch {
                if events.send(event).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use relay_common::Layout;
    use tempfile::TempDir;

    fn record(worker: &str, status: WorkerStatus, timestamp: DateTime<Utc>) -> HeartbeatRecord {
        HeartbeatRecord {
            worker: worker.into(),
            status,
            current_task: None,
            queue_size: 0,
            timestamp,
        }
    }

    #[test]
    fn staleness_boundary_is_exclusive() {
        let now = Utc::now();
        let threshold = Duration::from_secs(60);

        let at = record("anga", WorkerStatus::Active, now - ChronoDuration::seconds(60));
        assert!(!is_stale(&at, now, threshold));

        let past = record(
            "anga",
            WorkerStatus::Active,
            now - ChronoDuration::seconds(60) - ChronoDuration::milliseconds(1),
        );
        assert!(is_stale(&past, now, threshold));

        let future = record("anga", WorkerStatus::Active, now + ChronoDuration::seconds(5));
        assert!(!is_stale(&future, now, threshold));
    }

    #[test]
    fn read_all_quarantines_corrupt_records() {
        let dir = TempDir::new().unwrap();
        let registry = HeartbeatRegistry::new(dir.path());
        registry
            .publish(&record("anga", WorkerStatus::Active, Utc::now()))
            .unwrap();
        fs::write(dir.path().join("broken.json"), b"{").unwrap();
        let imposter = record("someone-else", WorkerStatus::Active, Utc::now());
        fs::write(
            dir.path().join("bilal.json"),
            serde_json::to_vec(&imposter).unwrap(),
        )
        .unwrap();

        let all = registry.read_all().unwrap();
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["anga"]);
        assert!(dir.path().join("broken.json.invalid").exists());
        assert!(dir.path().join("bilal.json.invalid").exists());
    }

    #[test]
    fn publish_rejects_bad_worker_ids() {
        let dir = TempDir::new().unwrap();
        let registry = HeartbeatRegistry::new(dir.path());
        assert!(registry
            .publish(&record("../x", WorkerStatus::Active, Utc::now()))
            .is_err());
    }

    #[test]
    fn timestamps_strictly_increase() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::under(dir.path());
        let store = Arc::new(TaskStore::new(&layout, "anga"));
        let registry = Arc::new(HeartbeatRegistry::new(&layout.heartbeat_dir));
        let (_tx, rx) = watch::channel(WorkerState::starting());
        let mut publisher =
            HeartbeatPublisher::new(registry.clone(), store, rx, Duration::from_secs(10));

        let state = WorkerState::active();
        let first = publisher.publish(&state).unwrap();
        let second = publisher.publish(&state).unwrap();
        assert!(second.timestamp > first.timestamp);
        assert_eq!(registry.read("anga").unwrap().unwrap(), second);
    }

    #[tokio::test]
    async fn publisher_reacts_to_state_changes_and_stops() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::under(dir.path());
        let store = Arc::new(TaskStore::new(&layout, "anga"));
        let registry = Arc::new(HeartbeatRegistry::new(&layout.heartbeat_dir));
        let (tx, rx) = watch::channel(WorkerState::starting());
        let publisher =
            HeartbeatPublisher::new(registry.clone(), store, rx, Duration::from_secs(3600));

        let stop = CancellationToken::new();
        let handle = tokio::spawn(publisher.run(stop.clone()));

        tx.send(WorkerState::busy("t1")).unwrap();
        let mut seen_busy = false;
        for _ in 0..100 {
            if let Ok(Some(record)) = registry.read("anga") {
                if record.status == WorkerStatus::Busy {
                    assert_eq!(record.current_task.as_deref(), Some("t1"));
                    seen_busy = true;
                    break;
                }
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seen_busy);

        stop.cancel();
        handle.await.unwrap().unwrap();
        let last = registry.read("anga").unwrap().unwrap();
        assert_eq!(last.status, WorkerStatus::Stopped);
    }

    #[test]
    fn monitor_reports_transitions_once() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(HeartbeatRegistry::new(dir.path()));
        let mut monitor = HeartbeatMonitor::new(registry, Duration::from_secs(60));
        let now = Utc::now();

        let mut records = BTreeMap::new();
        records.insert("anga".to_string(), record("anga", WorkerStatus::Active, now));
        assert!(monitor.observe(&records, now).is_empty());

        let later = now + ChronoDuration::seconds(61);
        let events = monitor.observe(&records, later);
        assert!(matches!(&events[..], [LivenessEvent::Stale { worker, .. }] if worker == "anga"));
        assert!(monitor.observe(&records, later).is_empty());

        records.insert("anga".to_string(), record("anga", WorkerStatus::Busy, later));
        assert_eq!(
            monitor.observe(&records, later),
            vec![LivenessEvent::Recovered {
                worker: "anga".into()
            }]
        );

        records.insert("anga".to_string(), record("anga", WorkerStatus::Stopped, later));
        assert_eq!(
            monitor.observe(&records, later),
            vec![LivenessEvent::Stopped {
                worker: "anga".into()
            }]
        );

        records.clear();
        assert_eq!(
            monitor.observe(&records, later),
            vec![LivenessEvent::Vanished {
                worker: "anga".into()
            }]
        );
    }
}
