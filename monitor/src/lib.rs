//! keepsafe monitor - change detection and archival for protected paths.
//!
//! This crate keeps a registry of filesystem paths, periodically fingerprints
//! each one, and archives any path whose content changed since its last
//! recorded fingerprint.
//!
//! # Overview
//!
//! The `keepsafed` daemon loads a snapshot of the registry at startup, runs a
//! detection pass on a fixed interval, and writes new fingerprints back to the
//! registry after every pass that archived something. The `keepsafe` CLI adds,
//! removes and lists registry entries, possibly while the daemon is running.
//!
//! # Modules
//!
//! - [`types`]: Registry records, fingerprints and the daemon snapshot
//! - [`hasher`]: Deterministic fingerprints for files and directory trees
//! - [`archiver`]: Atomic zip archival of changed paths
//! - [`registry`]: Durable, lock-protected store of registered paths
//! - [`monitor`]: A single detection pass over the snapshot
//! - [`daemon`]: Interval scheduler with cooperative shutdown
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types for keepsafe operations

pub mod archiver;
pub mod config;
pub mod daemon;
pub mod error;
pub mod hasher;
pub mod monitor;
pub mod registry;
pub mod types;

pub use archiver::{ArchiveError, Archiver, ZipArchiver};
pub use config::{Config, ConfigError};
pub use daemon::{persist_snapshot, Daemon, DaemonStats, State, Status};
pub use error::{MonitorError, Result};
pub use hasher::{fingerprint, HashError};
pub use monitor::{Monitor, PassFailure, PassOutcome};
pub use registry::{CorruptRecord, Registry, RegistryError, ScanReport, Visit};
pub use types::{Fingerprint, PathEntry, Snapshot, NEVER_ARCHIVED};
