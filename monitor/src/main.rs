//! keepsafed - change detection and archival daemon.
//!
//! Loads the registry once at startup, then checks every registered path on
//! a fixed interval and archives the ones that changed. Exits 0 on SIGINT or
//! SIGTERM after the pass in progress has finished and been persisted.
//!
//! # Environment Variables
//!
//! See the [`config`](keepsafe_monitor::config) module for available
//! configuration options. Command-line flags take precedence.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use keepsafe_monitor::config::Config;
use keepsafe_monitor::daemon::Daemon;
use keepsafe_monitor::monitor::Monitor;
use keepsafe_monitor::registry::Registry;

/// keepsafe daemon - archives registered paths when their content changes.
#[derive(Parser, Debug)]
#[command(name = "keepsafed")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    KEEPSAFE_INTERVAL_SECS     Seconds between checks (default: 10)
    KEEPSAFE_ARCHIVE_DIR       Archive destination (default: ~/.keepsafe/archive)
    KEEPSAFE_REGISTRY          Registry directory (default: ~/.keepsafe/registry)
    RUST_LOG                   Log filter (default: info)

EXAMPLES:
    # Register a path, then start the daemon
    keepsafe add ~/documents
    keepsafed

    # Check every minute, archiving to an external drive
    keepsafed --interval 60 --archive /mnt/backup/keepsafe
")]
struct Cli {
    /// Seconds between checks.
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    interval: Option<u64>,

    /// Directory that receives archives.
    #[arg(long, value_name = "DIR")]
    archive: Option<PathBuf>,

    /// Registry directory shared with the `keepsafe` CLI.
    #[arg(long, value_name = "DIR")]
    db: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(run_daemon(cli))
}

/// Runs the daemon until a shutdown signal arrives.
async fn run_daemon(cli: Cli) -> Result<()> {
    info!("Starting keepsafe daemon");

    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(secs) = cli.interval {
        config.interval = Duration::from_secs(secs);
    }
    if let Some(dir) = cli.archive {
        config.archive_dir = dir;
    }
    if let Some(dir) = cli.db {
        config.registry_dir = dir;
    }
    config.prepare().context("Invalid configuration")?;

    info!(
        interval_secs = config.interval.as_secs(),
        archive_dir = %config.archive_dir.display(),
        registry = %config.registry_dir.display(),
        "Configuration loaded"
    );

    let registry = Registry::open(&config.registry_dir).with_context(|| {
        format!(
            "Failed to open registry at {}",
            config.registry_dir.display()
        )
    })?;
    let monitor = Monitor::with_zip(&config.archive_dir);
    let daemon =
        Daemon::load(monitor, registry, config.interval).context("Failed to load registry")?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown().await;
        info!("Shutdown signal received, finishing current pass");
        let _ = stop_tx.send(true);
    });

    info!("Daemon running. Press Ctrl+C to stop.");

    let stats = daemon.run(stop_rx).await?;

    info!(
        passes = stats.passes,
        archived = stats.archived,
        failures = stats.failures,
        "Daemon exited"
    );
    Ok(())
}

/// Initializes the logging subsystem.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .init();
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
