use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use statbeam::config::{self, Config};
use statbeam::daemon::Daemon;

/// StatsD-compatible UDP metrics collector publishing to Graphite.
#[derive(Parser)]
#[command(name = "statbeam", about, version = version::full())]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// UDP port to listen for metrics on.
    #[arg(long)]
    port: Option<u16>,

    /// Address to bind the UDP listener to.
    #[arg(long)]
    address: Option<String>,

    /// Downstream Graphite TCP endpoint (host:port).
    #[arg(long)]
    graphite: Option<String>,

    /// Flush interval in seconds.
    #[arg(long)]
    interval: Option<u64>,

    /// Comma-separated signed percentiles (e.g. "50,90,-10"); a later
    /// occurrence replaces earlier ones entirely.
    #[arg(long)]
    percentiles: Option<String>,

    /// Bucket name for the received-samples counter; empty disables.
    #[arg(long)]
    receive_counter: Option<String>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via RUSTFLAGS or build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

impl Cli {
    /// Resolve the effective configuration: file values (or defaults), with
    /// explicitly-set flags layered on top.
    fn build_config(&self) -> Result<Config> {
        let mut cfg = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(address) = &self.address {
            cfg.address = address.clone();
        }
        if let Some(graphite) = &self.graphite {
            cfg.graphite = graphite.clone();
        }
        if let Some(interval) = self.interval {
            cfg.flush_interval = std::time::Duration::from_secs(interval);
        }
        if let Some(percentiles) = &self.percentiles {
            cfg.percentiles = config::parse_percentiles(percentiles)?;
        }
        if let Some(receive_counter) = &self.receive_counter {
            cfg.receive_counter = receive_counter.clone();
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("statbeam {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = cli.build_config()?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting statbeam",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // Start the daemon.
    let mut daemon = Daemon::new(cfg);
    daemon.start().await?;

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;

    // Graceful shutdown: one final publish, then exit.
    daemon.stop().await;

    tracing::info!("statbeam stopped");

    Ok(())
}
