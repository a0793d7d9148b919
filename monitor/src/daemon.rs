//! Scheduler that runs detection passes on a fixed interval.
//!
//! # Lifecycle
//!
//! ```text
//! load snapshot ─▶ Idle ─▶ Running(pass + persist) ─▶ Idle ─▶ ... ─▶ Stopped
//! ```
//!
//! The first pass starts right after loading. After each pass, updated
//! fingerprints are written back to the registry before the next wait
//! begins, so passes never overlap.
//!
//! The stop signal is a [`watch`] channel holding `true` once shutdown is
//! requested. It is only looked at while idle: a pass in progress always runs
//! to completion and persists before the daemon stops. Dropping the sender
//! counts as a stop request.
//!
//! The snapshot is read from the registry once, in [`Daemon::load`]. Paths
//! added or removed through the CLI afterwards are not seen until restart.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{MonitorError, Result};
use crate::monitor::{Monitor, PassOutcome};
use crate::registry::{Registry, RegistryError};
use crate::types::{PathEntry, Snapshot};

/// Daemon lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Waiting for the next tick or a stop signal.
    Idle,
    /// A pass (and its registry update) is in progress.
    Running,
    /// The daemon has exited its loop.
    Stopped,
}

/// Counters accumulated over the daemon's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DaemonStats {
    /// Completed passes.
    pub passes: u64,
    /// Paths archived across all passes.
    pub archived: u64,
    /// Per-path failures (unavailable or archive errors) across all passes.
    pub failures: u64,
}

/// Observable daemon status, published after every state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub state: State,
    pub stats: DaemonStats,
}

/// Runs [`Monitor`] passes on an interval and persists their results.
pub struct Daemon {
    monitor: Arc<Monitor>,
    registry: Registry,
    interval: Duration,
    snapshot: Snapshot,
    persist_pending: bool,
    stats: DaemonStats,
    status: watch::Sender<Status>,
}

impl Daemon {
    /// Loads the snapshot from `registry` and prepares the daemon in `Idle`.
    ///
    /// # Errors
    ///
    /// - [`MonitorError::Registry`] if the registry cannot be read.
    /// - [`MonitorError::EmptyRegistry`] if it holds no well-formed records.
    pub fn load(monitor: Monitor, registry: Registry, interval: Duration) -> Result<Self> {
        let (snapshot, report) = registry.snapshot()?;
        if !report.corrupt.is_empty() {
            warn!(
                corrupt = report.corrupt.len(),
                "Registry contains corrupt records; they will be ignored"
            );
        }
        if snapshot.is_empty() {
            return Err(MonitorError::EmptyRegistry);
        }

        info!(
            paths = snapshot.len(),
            registry = %registry.dir().display(),
            "Snapshot loaded"
        );

        let (status, _) = watch::channel(Status {
            state: State::Idle,
            stats: DaemonStats::default(),
        });

        Ok(Self {
            monitor: Arc::new(monitor),
            registry,
            interval,
            snapshot,
            persist_pending: false,
            stats: DaemonStats::default(),
            status,
        })
    }

    /// Subscribes to status updates.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    /// The current working snapshot.
    #[must_use]
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Runs passes until `stop` turns `true`, returning the final counters.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Task`] if a pass task panics. Per-path failures
    /// and registry write failures are logged and never end the loop.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> Result<DaemonStats> {
        loop {
            if *stop.borrow_and_update() {
                break;
            }

            self.publish(State::Running);
            self.tick().await?;
            self.publish(State::Idle);

            if self.wait_for_tick(&mut stop).await {
                break;
            }
        }

        info!(
            passes = self.stats.passes,
            archived = self.stats.archived,
            "Daemon stopped"
        );
        self.publish(State::Stopped);
        Ok(self.stats)
    }

    /// Waits for the next tick. Returns `true` if a stop was requested instead.
    async fn wait_for_tick(&self, stop: &mut watch::Receiver<bool>) -> bool {
        let deadline = Instant::now() + self.interval;
        loop {
            if *stop.borrow_and_update() {
                return true;
            }
            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() {
                        debug!("Stop channel closed");
                        return true;
                    }
                }
                () = tokio::time::sleep_until(deadline) => return false,
            }
        }
    }

    /// Runs one pass and persists its result on the blocking pool.
    async fn tick(&mut self) -> Result<()> {
        let monitor = Arc::clone(&self.monitor);
        let registry = self.registry.clone();
        let snapshot = std::mem::take(&mut self.snapshot);
        let persist_pending = self.persist_pending;

        let (outcome, persisted) = tokio::task::spawn_blocking(move || {
            debug!("Checking...");
            let outcome = monitor.run_pass(snapshot);
            let persisted = if outcome.archived > 0 || persist_pending {
                Some(persist_snapshot(&registry, &outcome.snapshot))
            } else {
                None
            };
            (outcome, persisted)
        })
        .await
        .map_err(|e| MonitorError::Task(e.to_string()))?;

        self.record(&outcome);

        match persisted {
            Some(Ok(updated)) => {
                debug!(updated, "Fingerprints persisted");
                self.persist_pending = false;
            }
            Some(Err(e)) => {
                error!(error = %e, "Failed to persist fingerprints, will retry after next pass");
                self.persist_pending = true;
            }
            None => {}
        }

        self.snapshot = outcome.snapshot;
        Ok(())
    }

    fn record(&mut self, outcome: &PassOutcome) {
        self.stats.passes += 1;
        self.stats.archived += outcome.archived as u64;
        self.stats.failures += outcome.failures.len() as u64;

        if outcome.archived > 0 {
            info!("Archived {} paths", outcome.archived);
        } else {
            info!("No changes");
        }
        if !outcome.failures.is_empty() {
            warn!(
                failures = outcome.failures.len(),
                "Some paths could not be checked or archived"
            );
        }
    }

    fn publish(&self, state: State) {
        self.status.send_replace(Status {
            state,
            stats: self.stats,
        });
    }
}

/// Writes fingerprints from `snapshot` back to the registry.
///
/// Only records whose stored fingerprint differs from the snapshot are
/// rewritten. Records the snapshot does not know about (added after the
/// daemon started) are left alone, and the sentinel is never written back.
/// Returns the number of records updated.
///
/// # Errors
///
/// Returns a [`RegistryError`] if the registry cannot be locked, read or
/// rewritten.
pub fn persist_snapshot(
    registry: &Registry,
    snapshot: &Snapshot,
) -> std::result::Result<usize, RegistryError> {
    registry.update_where(
        |entry| {
            snapshot
                .get(&entry.path)
                .is_some_and(|fp| !fp.is_never_archived() && *fp != entry.fingerprint)
        },
        |entry| PathEntry {
            path: entry.path.clone(),
            fingerprint: snapshot
                .get(&entry.path)
                .cloned()
                .unwrap_or_else(|| entry.fingerprint.clone()),
        },
    )
}
