use std::fs;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use relay_common::{HeartbeatRecord, Layout, RelayError, Task, TaskResult, WorkerStatus};
use relay_orchestration::{is_stale, TaskStore, WriteOutcome};
use serde_json::json;
use tempfile::TempDir;

const CLAIMANTS: usize = 8;

#[test]
fn exactly_one_concurrent_claim_wins() {
    let dir = TempDir::new().unwrap();
    let layout = Layout::under(dir.path());
    let seed = TaskStore::new(&layout, "anga");
    seed.ensure_dirs().unwrap();
    fs::write(
        seed.paths().task_file("t1"),
        serde_json::to_vec(&Task::with_description("t1", "x")).unwrap(),
    )
    .unwrap();

    let barrier = Arc::new(Barrier::new(CLAIMANTS));
    let outcomes: Vec<_> = (0..CLAIMANTS)
        .map(|_| {
            let barrier = barrier.clone();
            let store = TaskStore::new(&layout, "anga");
            thread::spawn(move || {
                barrier.wait();
                store.claim("t1")
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    let winners = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
    let lost = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, Err(RelayError::ClaimLost { .. })))
        .count();
    assert_eq!(winners, 1);
    assert_eq!(lost, CLAIMANTS - 1);
    assert!(seed.paths().claim_marker("t1").exists());
    assert!(!seed.paths().task_file("t1").exists());
}

#[test]
fn result_write_is_idempotent_and_first_writer_wins() {
    let dir = TempDir::new().unwrap();
    let store = TaskStore::new(&Layout::under(dir.path()), "anga");
    store.ensure_dirs().unwrap();
    let task = Task::with_description("t1", "x");
    let result = TaskResult::complete(&task, json!("first"), Utc::now());

    assert_eq!(store.write_result(&result).unwrap(), WriteOutcome::Written);
    assert_eq!(store.write_result(&result).unwrap(), WriteOutcome::Unchanged);

    let other = TaskResult::failed(&task, "late duplicate", Utc::now());
    assert_eq!(store.write_result(&other).unwrap(), WriteOutcome::AlreadyPresent);
    assert_eq!(store.read_result("t1").unwrap(), Some(result));
}

#[test]
fn staleness_is_strictly_greater_than_threshold() {
    let now = Utc::now();
    let threshold = Duration::from_secs(60);
    let record = |age_ms: i64| HeartbeatRecord {
        worker: "anga".into(),
        status: WorkerStatus::Active,
        current_task: None,
        queue_size: 0,
        timestamp: now - chrono::Duration::milliseconds(age_ms),
    };

    assert!(!is_stale(&record(60_000), now, threshold));
    assert!(is_stale(&record(60_001), now, threshold));
    assert!(!is_stale(&record(-5_000), now, threshold));
}
