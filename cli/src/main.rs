//! keepsafe - manage the registry of protected paths.
//!
//! # Commands
//!
//! - `keepsafe add PATH...`: Register paths for the daemon to protect
//! - `keepsafe remove PATH...`: Stop protecting paths
//! - `keepsafe list`: Show registered paths and their fingerprints
//!
//! The registry is shared with a running `keepsafed`, which only picks up
//! changes made here when it restarts.

mod commands;

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use keepsafe_monitor::config::Config;
use keepsafe_monitor::registry::Registry;

/// keepsafe - register paths to be archived whenever they change.
#[derive(Parser, Debug)]
#[command(name = "keepsafe")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    KEEPSAFE_REGISTRY          Registry directory (default: ~/.keepsafe/registry)

EXAMPLES:
    keepsafe add ~/documents ~/projects/thesis
    keepsafe list
    keepsafe remove ~/projects/thesis

    # Use a specific registry
    keepsafe --db ./backupdata list
")]
struct Cli {
    /// Registry directory shared with the daemon.
    #[arg(long, value_name = "DIR", global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Register paths to protect.
    ///
    /// Paths are stored as absolute paths. A path already registered, or
    /// nested inside (or containing) a registered path, is rejected.
    Add {
        #[arg(required = true, value_name = "PATH")]
        paths: Vec<PathBuf>,
    },

    /// Unregister paths.
    Remove {
        #[arg(required = true, value_name = "PATH")]
        paths: Vec<PathBuf>,
    },

    /// List registered paths with their last fingerprint.
    List,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging();

    let registry_dir = match cli.db {
        Some(dir) => dir,
        None => Config::registry_dir_from_env().context("Failed to locate registry")?,
    };
    let registry = Registry::open(&registry_dir)
        .with_context(|| format!("Failed to open registry at {}", registry_dir.display()))?;

    let mut out = io::stdout().lock();
    let mut err = io::stderr().lock();

    match cli.command {
        Command::Add { paths } => {
            let rejected = commands::add(&registry, &paths, &mut out, &mut err)?;
            if rejected > 0 {
                drop(out);
                drop(err);
                std::process::exit(1);
            }
        }
        Command::Remove { paths } => {
            commands::remove(&registry, &paths, &mut out, &mut err)?;
        }
        Command::List => {
            commands::list(&registry, &mut out, &mut err)?;
        }
    }

    Ok(())
}

/// Initializes the logging subsystem.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}
