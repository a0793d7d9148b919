//! Record types shared by the registry, the monitor pass and the CLI.
//!
//! All types serialize to the JSON shape stored one-per-line in the registry.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Fingerprint stored for paths that have never been archived.
pub const NEVER_ARCHIVED: &str = "Not yet archived";

/// Digest summarizing the content and structure of a file or directory tree.
///
/// Stored as lowercase hex, or as [`NEVER_ARCHIVED`] before the first archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wraps an already-computed hex digest.
    #[must_use]
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// The sentinel fingerprint for a path that was registered but never archived.
    #[must_use]
    pub fn never_archived() -> Self {
        Self(NEVER_ARCHIVED.to_string())
    }

    /// Returns `true` if this is the never-archived sentinel.
    #[must_use]
    pub fn is_never_archived(&self) -> bool {
        self.0 == NEVER_ARCHIVED
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A registered path and its last recorded fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathEntry {
    /// Filesystem path being protected. Unique within a registry.
    pub path: PathBuf,

    /// Fingerprint recorded after the last successful archive.
    pub fingerprint: Fingerprint,
}

impl PathEntry {
    /// Creates an entry for a freshly registered path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fingerprint: Fingerprint::never_archived(),
        }
    }
}

impl fmt::Display for PathEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.path.display(), self.fingerprint)
    }
}

/// The daemon's in-memory working copy of the registry: path to fingerprint.
///
/// Ordered so passes visit paths in a stable order.
pub type Snapshot = BTreeMap<PathBuf, Fingerprint>;
