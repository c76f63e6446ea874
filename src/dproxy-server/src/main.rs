//! dproxy - daemon proxy gateway binary.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use dproxy_daemon::DaemonMode;
use dproxy_server::config::{LogFormat, LoggingConfig};
use dproxy_server::{ServerConfig, run_with_shutdown};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Noisy dependencies are capped unless RUST_LOG says otherwise.
const DEPENDENCY_FILTERS: &str = "bollard=warn,hyper=warn,hyper_util=warn,reqwest=warn";

/// Daemon proxy gateway
#[derive(Parser)]
#[command(name = "dproxy")]
#[command(about = "Authenticated HTTP gateway to ports inside a sandbox")]
#[command(version)]
struct Args {
    /// Configuration file path (YAML, or JSON with a .json extension)
    #[arg(short, long, env = "DAEMON_PROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Listen host
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Daemon mode: mock, host or docker
    #[arg(long)]
    daemon_mode: Option<DaemonMode>,

    /// Daemon port
    #[arg(long)]
    daemon_port: Option<u16>,

    /// Explicit daemon base URL
    #[arg(long)]
    daemon_url: Option<String>,

    /// Sandbox container name or ID
    #[arg(long)]
    container: Option<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long)]
    json_logs: bool,
}

impl Args {
    /// Flags win over everything else.
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(mode) = self.daemon_mode {
            config.daemon.mode = mode;
        }
        if let Some(port) = self.daemon_port {
            config.daemon.port = port;
        }
        if let Some(url) = &self.daemon_url {
            config.daemon.url = Some(url.clone());
        }
        if let Some(container) = &self.container {
            config.daemon.container_name = container.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.to_lowercase();
        }
        if self.json_logs {
            config.logging.format = LogFormat::Json;
        }
    }
}

/// Defaults, then the file, then the environment, then flags.
fn load_config(args: &Args) -> anyhow::Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    config.apply_env()?;
    args.apply(&mut config);
    config.validate()?;
    Ok(config)
}

fn setup_logging(logging: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},{}", logging.level, DEPENDENCY_FILTERS)));

    let console = match logging.format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer().pretty().boxed(),
    };

    let (file_layer, guard) = match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| anyhow::anyhow!("Failed to open log file {}: {}", path.display(), e))?;
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .init();

    Ok(guard)
}

async fn shutdown_signal(shutdown_timeout: u64) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown (timeout: {}s)...", shutdown_timeout);
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown (timeout: {}s)...", shutdown_timeout);
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = load_config(&args);
    let logging = match &config {
        Ok(config) => config.logging.clone(),
        Err(_) => {
            let mut fallback = ServerConfig::default();
            args.apply(&mut fallback);
            fallback.logging
        }
    };

    let _guard = match setup_logging(&logging) {
        Ok(guard) => guard,
        Err(e) => {
            let fallback = LoggingConfig {
                file: None,
                ..logging
            };
            let _ = setup_logging(&fallback);
            warn!("{}", e);
            None
        }
    };

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    info!(
        "Starting daemon proxy on {} (daemon mode: {:?})",
        config.listen_addr(),
        config.daemon.mode
    );
    info!("Press Ctrl+C to stop");

    let shutdown = shutdown_signal(config.server.shutdown_timeout);

    if let Err(e) = run_with_shutdown(config, shutdown).await {
        error!("Server error: {:#}", e);
        return ExitCode::FAILURE;
    }

    info!("Server stopped");
    ExitCode::SUCCESS
}
