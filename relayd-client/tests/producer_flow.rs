use std::time::Duration;

use anyhow::Result;
use relay_common::{RelayConfig, ResultStatus, Task, WorkerStatus};
use relay_orchestration::Worker;
use relayd_client::{Delivery, RelayClient};
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn config(dir: &TempDir, pipes: bool) -> RelayConfig {
    RelayConfig {
        worker_id: Some("anga".into()),
        root: dir.path().to_path_buf(),
        poll_interval_ms: 100,
        heartbeat_interval_secs: 1,
        stale_threshold_secs: 5,
        reconcile_interval_secs: 1,
        pipes_enabled: pipes,
        ..RelayConfig::default()
    }
}

#[tokio::test]
async fn notify_without_listener_falls_back_to_task_file() -> Result<()> {
    let dir = TempDir::new()?;
    let client = RelayClient::from_config(&config(&dir, true));

    let delivery = client
        .notify("anga", "please review", Duration::from_millis(50))
        .await?;
    let Delivery::TaskFile { task_id } = delivery else {
        panic!("expected task-file delivery, got {:?}", delivery);
    };

    let path = client.layout().worker("anga").task_file(&task_id);
    let task: Task = relay_common::fs::read_json(&path)?;
    assert_eq!(task.description.as_deref(), Some("please review"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn submitted_task_is_answered_by_running_worker() -> Result<()> {
    let dir = TempDir::new()?;
    let cfg = config(&dir, false);
    let client = RelayClient::from_config(&cfg);

    let shutdown = CancellationToken::new();
    let worker = Worker::builder(cfg).build()?;
    let handle = tokio::spawn(worker.run(shutdown.clone()));

    client.submit("anga", &Task::new("job-1", json!({"n": 1})).with_timeout(5))?;
    let result = client
        .wait_for_result("anga", "job-1", Duration::from_secs(5))
        .await?;
    assert_eq!(result.status, ResultStatus::Complete);
    assert_eq!(result.output["echo"], json!({"n": 1}));

    let liveness = client.liveness()?;
    assert_eq!(liveness.len(), 1);
    assert_eq!(liveness[0].record.worker, "anga");
    assert!(!liveness[0].stale);

    shutdown.cancel();
    handle.await??;
    let liveness = client.liveness()?;
    assert_eq!(liveness[0].record.status, WorkerStatus::Stopped);
    Ok(())
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn notify_reaches_live_worker_over_pipe() -> Result<()> {
    let dir = TempDir::new()?;
    let cfg = config(&dir, true);
    let client = RelayClient::from_config(&cfg);

    let shutdown = CancellationToken::new();
    let worker = Worker::builder(cfg).build()?;
    let handle = tokio::spawn(worker.run(shutdown.clone()));

    let control = client.layout().worker("anga").control_pipe;
    for _ in 0..100 {
        if control.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let delivery = client
        .notify("anga", "wake", Duration::from_secs(3))
        .await?;
    assert_eq!(delivery, Delivery::Pipe);

    shutdown.cancel();
    handle.await??;
    Ok(())
}
