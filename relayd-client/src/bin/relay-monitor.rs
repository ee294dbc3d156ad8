//! Relay Monitor
//!
//! Watches the heartbeat directory and logs liveness transitions, or prints
//! a one-off table with `--once`.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use relay_common::RelayConfig;
use relay_orchestration::LivenessEvent;
use relayd_client::RelayClient;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "relay-monitor", version)]
#[command(about = "Reports relay worker liveness from their heartbeat records")]
struct Cli {
    /// TOML configuration file
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    root: Option<PathBuf>,

    /// Seconds without a heartbeat before a worker counts as stale
    #[arg(long)]
    stale_threshold_secs: Option<u64>,

    /// How often to scan the heartbeat directory
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Print one snapshot and exit
    #[arg(long)]
    once: bool,

    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let fallback = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)))
        .with_writer(io::stderr)
        .init();

    let mut config =
        RelayConfig::load(cli.config.as_deref()).context("failed to load relay configuration")?;
    if let Some(root) = cli.root {
        config.root = root;
    }
    if let Some(secs) = cli.stale_threshold_secs {
        config.stale_threshold_secs = secs;
    }
    let client = RelayClient::from_config(&config);

    if cli.once {
        print_snapshot(&client)?;
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    info!(
        heartbeat_dir = %client.layout().heartbeat_dir.display(),
        stale_threshold_secs = config.stale_threshold_secs,
        "monitoring worker liveness"
    );

    let (tx, mut rx) = mpsc::channel(64);
    let monitor = client.monitor();
    let interval = Duration::from_millis(cli.interval_ms.max(50));
    let scanner = tokio::spawn(monitor.run(interval, tx, cancel.clone()));

    while let Some(event) = rx.recv().await {
        match event {
            LivenessEvent::Stale { worker, age } => {
                warn!(worker = %worker, age_secs = age.as_secs(), "worker heartbeat is stale")
            }
            LivenessEvent::Recovered { worker } => info!(worker = %worker, "worker is alive"),
            LivenessEvent::Stopped { worker } => info!(worker = %worker, "worker stopped"),
            LivenessEvent::Vanished { worker } => {
                warn!(worker = %worker, "worker heartbeat record disappeared")
            }
        }
    }

    scanner.await??;
    Ok(())
}

fn print_snapshot(client: &RelayClient) -> Result<()> {
    let workers = client.liveness()?;
    if workers.is_empty() {
        println!("no heartbeats under {}", client.layout().heartbeat_dir.display());
        return Ok(());
    }

    println!(
        "{:<24} {:<10} {:>8} {:<6} {:>6}  CURRENT",
        "WORKER", "STATUS", "AGE(s)", "STALE", "QUEUE"
    );
    for entry in workers {
        let record = &entry.record;
        println!(
            "{:<24} {:<10} {:>8} {:<6} {:>6}  {}",
            record.worker,
            record.status.as_str(),
            entry.age.as_secs(),
            if entry.stale { "yes" } else { "no" },
            record.queue_size,
            record.current_task.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}
