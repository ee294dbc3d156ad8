#![cfg(unix)]

use std::fs::File;
use std::io::Read;
use std::time::Duration;

use relay_common::Layout;
use relay_orchestration::ipc::{ensure_fifo, send_blocking, send_timeout};
use tempfile::TempDir;
use tokio::time::sleep;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_waits_for_a_reader() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let pipe = Layout::under(dir.path()).worker("anga").control_pipe;
    ensure_fifo(&pipe)?;

    let writer_path = pipe.clone();
    let writer = tokio::task::spawn_blocking(move || send_blocking(&writer_path, "wake"));

    sleep(Duration::from_millis(200)).await;
    assert!(!writer.is_finished(), "send returned without a reader");

    let reader = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
        let mut text = String::new();
        File::open(pipe)?.read_to_string(&mut text)?;
        Ok(text)
    });

    tokio::time::timeout(Duration::from_secs(2), writer).await???;
    let text = tokio::time::timeout(Duration::from_secs(2), reader).await???;
    assert_eq!(text, "wake\n");
    Ok(())
}

#[tokio::test]
async fn zero_timeout_send_reports_no_receiver() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let pipe = Layout::under(dir.path()).worker("anga").control_pipe;
    ensure_fifo(&pipe)?;

    let err = send_timeout(&pipe, "wake", Duration::ZERO).await.unwrap_err();
    assert_eq!(err.code(), "E_NO_RECEIVER");
    Ok(())
}
