//! One detection pass over the snapshot.
//!
//! For every registered path the pass computes a fresh fingerprint, compares
//! it with the recorded one, and archives the path when they differ. Failures
//! stay local to the offending path:
//!
//! - an unavailable path is skipped and keeps its old fingerprint;
//! - a failed archive keeps the old fingerprint, so the next pass retries it.
//!
//! The snapshot is passed in by value and handed back updated, so the caller
//! owns the single authoritative copy between passes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::archiver::{ArchiveError, Archiver, ZipArchiver};
use crate::hasher::{self, HashError};
use crate::types::Snapshot;

/// A path that could not be brought up to date during a pass.
#[derive(Debug)]
pub enum PassFailure {
    /// The path was missing or unreadable; it was skipped this pass.
    Unavailable { path: PathBuf, error: HashError },

    /// The path changed but archiving it failed; it will be retried.
    ArchiveWrite { path: PathBuf, error: ArchiveError },
}

impl PassFailure {
    /// The registered path this failure refers to.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Unavailable { path, .. } | Self::ArchiveWrite { path, .. } => path,
        }
    }
}

/// Result of a single pass.
#[derive(Debug, Default)]
pub struct PassOutcome {
    /// Number of paths archived in this pass.
    pub archived: usize,

    /// Artifacts written in this pass.
    pub artifacts: Vec<PathBuf>,

    /// Paths that were skipped or failed to archive.
    pub failures: Vec<PassFailure>,

    /// The snapshot with fingerprints of archived paths updated.
    pub snapshot: Snapshot,
}

/// Runs detection passes, archiving changed paths under a destination.
pub struct Monitor {
    destination: PathBuf,
    archiver: Arc<dyn Archiver>,
}

impl Monitor {
    /// Creates a monitor that archives with `archiver` into `destination`.
    #[must_use]
    pub fn new(destination: impl Into<PathBuf>, archiver: Arc<dyn Archiver>) -> Self {
        Self {
            destination: destination.into(),
            archiver,
        }
    }

    /// Creates a monitor that writes zip archives into `destination`.
    #[must_use]
    pub fn with_zip(destination: impl Into<PathBuf>) -> Self {
        Self::new(destination, Arc::new(ZipArchiver::new()))
    }

    /// Archive destination directory.
    #[must_use]
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Runs one pass over `snapshot`.
    ///
    /// Paths are visited in snapshot order. A path is archived when its
    /// current fingerprint differs from the recorded one, which includes the
    /// never-archived sentinel. Only successfully archived paths get their
    /// fingerprint replaced.
    pub fn run_pass(&self, mut snapshot: Snapshot) -> PassOutcome {
        let mut outcome = PassOutcome::default();

        for (path, recorded) in snapshot.iter_mut() {
            let current = match hasher::fingerprint(path) {
                Ok(fingerprint) => fingerprint,
                Err(error) => {
                    warn!(path = %path.display(), error = %error, "Skipping unavailable path");
                    outcome.failures.push(PassFailure::Unavailable {
                        path: path.clone(),
                        error,
                    });
                    continue;
                }
            };

            if current == *recorded {
                debug!(path = %path.display(), "Unchanged");
                continue;
            }

            match self.archiver.archive(path, &self.destination) {
                Ok(artifact) => {
                    info!(
                        path = %path.display(),
                        artifact = %artifact.display(),
                        fingerprint = %current,
                        "Archived changed path"
                    );
                    *recorded = current;
                    outcome.archived += 1;
                    outcome.artifacts.push(artifact);
                }
                Err(error) => {
                    error!(
                        path = %path.display(),
                        error = %error,
                        "Failed to archive, will retry next pass"
                    );
                    outcome.failures.push(PassFailure::ArchiveWrite {
                        path: path.clone(),
                        error,
                    });
                }
            }
        }

        outcome.snapshot = snapshot;
        outcome
    }
}
