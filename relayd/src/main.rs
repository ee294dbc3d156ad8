use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use relay_common::{ConfigError, RelayConfig, RelayError, SignalBackendKind};
use relay_orchestration::{
    ActivationSink, CommandExecutor, EchoExecutor, Executor, HookActivationSink,
    NoopActivationSink, Worker,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const EXIT_CONFIG: u8 = 1;
const EXIT_BACKEND: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "relayd", version)]
#[command(about = "Supervises one relay worker: watches its task directory, runs tasks, publishes heartbeats")]
struct Cli {
    /// TOML configuration file
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Worker identifier (overrides WORKER_ID)
    #[arg(long)]
    worker: Option<String>,

    /// Root under which tasks/, results/, heartbeats/ and pipes/ live
    #[arg(long)]
    root: Option<PathBuf>,

    /// auto, event or poll
    #[arg(long)]
    signal_backend: Option<SignalBackendKind>,

    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Shell command run per task (task JSON on stdin, result JSON on stdout)
    #[arg(long)]
    executor_command: Option<String>,

    /// Shell command run to activate the worker's session
    #[arg(long)]
    activation_hook: Option<String>,

    /// Do not open the control/status pipes
    #[arg(long)]
    no_pipes: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut RelayConfig) {
        if let Some(worker) = &self.worker {
            config.worker_id = Some(worker.clone());
        }
        if let Some(root) = &self.root {
            config.root = root.clone();
        }
        if let Some(kind) = self.signal_backend {
            config.signal_backend = kind;
        }
        if let Some(interval) = self.poll_interval_ms {
            config.poll_interval_ms = interval;
        }
        if let Some(command) = &self.executor_command {
            config.executor_command = Some(command.clone());
        }
        if let Some(hook) = &self.activation_hook {
            config.activation_hook = Some(hook.clone());
        }
        if self.no_pipes {
            config.pipes_enabled = false;
        }
    }

    fn resolve_config(&self) -> Result<RelayConfig, ConfigError> {
        let mut config = RelayConfig::load(self.config.as_deref())?;
        self.apply_overrides(&mut config);
        config.validate()?;
        config.require_worker()?;
        Ok(config)
    }
}

fn init_tracing(debug: bool) {
    let fallback = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn exit_code_for(err: &RelayError) -> u8 {
    match err {
        RelayError::BackendUnavailable { .. } => EXIT_BACKEND,
        _ => EXIT_CONFIG,
    }
}

fn executor_for(config: &RelayConfig) -> Arc<dyn Executor> {
    match &config.executor_command {
        Some(command) => {
            info!(command = %command, "using command executor");
            Arc::new(CommandExecutor::new(command.clone()))
        }
        None => Arc::new(EchoExecutor),
    }
}

fn sink_for(config: &RelayConfig) -> Arc<dyn ActivationSink> {
    match &config.activation_hook {
        Some(hook) => {
            info!(hook = %hook, "activation hook enabled");
            Arc::new(HookActivationSink::new(hook.clone()))
        }
        None => Arc::new(NoopActivationSink),
    }
}

fn spawn_signal_handlers(shutdown: CancellationToken) {
    let on_ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C; shutting down worker");
            on_ctrl_c.cancel();
        }
    });

    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                return;
            }
        };
        tokio::spawn(async move {
            if sigterm.recv().await.is_some() {
                info!("Received SIGTERM; shutting down worker");
                shutdown.cancel();
            }
        });
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    info!(
        "{}",
        relay_build_info::formatted_banner("relayd", env!("CARGO_PKG_VERSION"))
    );

    let config = match cli.resolve_config() {
        Ok(config) => config,
        Err(err) => {
            error!(code = "E_CONFIG", error = %err, "invalid configuration");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let worker = match Worker::builder(config.clone())
        .executor(executor_for(&config))
        .activation_sink(sink_for(&config))
        .build()
    {
        Ok(worker) => worker,
        Err(err) => {
            error!(code = err.code(), error = %err, "worker setup failed");
            return ExitCode::from(exit_code_for(&err));
        }
    };

    let shutdown = CancellationToken::new();
    spawn_signal_handlers(shutdown.clone());

    match worker.run(shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(code = err.code(), error = %err, "worker exited");
            ExitCode::from(exit_code_for(&err))
        }
    }
}
