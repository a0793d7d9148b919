//! Durable registry of protected paths.
//!
//! The registry lives in a directory shared between the daemon and the CLI:
//!
//! - `paths.jsonl` holds one JSON [`PathEntry`] per line.
//! - `.lock` is the advisory lock file. Scans take a shared lock; inserts,
//!   removals and updates take an exclusive one.
//!
//! # Durability
//!
//! - **Insert** appends a single line and syncs it before returning. A crash
//!   mid-append leaves at most one truncated line, which later scans report
//!   as corrupt; the next insert starts on a fresh line so it is never glued
//!   onto the fragment.
//! - **Remove / update** rewrite the whole file into a temporary file in the
//!   same directory and rename it over `paths.jsonl`. Readers see either the
//!   old or the new file, never a mix.
//! - Malformed lines are skipped and reported by scans and carried through
//!   rewrites untouched.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{PathEntry, Snapshot};

/// Name of the records file inside the registry directory.
pub const DATA_FILE: &str = "paths.jsonl";

/// Name of the advisory lock file inside the registry directory.
pub(crate) const LOCK_FILE: &str = ".lock";

/// Errors that can occur during registry operations.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The path is already registered.
    #[error("path already registered: {}", .0.display())]
    DuplicateKey(PathBuf),

    /// The path is an ancestor or descendant of an already registered path.
    #[error("{} overlaps registered path {}", path.display(), existing.display())]
    OverlappingPath { path: PathBuf, existing: PathBuf },

    /// A visitor stopped the scan with an error.
    #[error("scan aborted: {0}")]
    Aborted(String),

    /// Reading or writing the registry files failed.
    #[error("registry I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A record could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// What a [`Registry::for_each`] visitor wants to happen next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visit {
    /// Keep iterating.
    Continue,
    /// Stop iterating; the scan still succeeds.
    Stop,
    /// Stop iterating and fail the scan with [`RegistryError::Aborted`].
    Abort(String),
}

/// A registry line that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptRecord {
    /// 1-based line number in `paths.jsonl`.
    pub line: usize,
    /// Why the line was rejected.
    pub reason: String,
}

/// Summary of a scan over the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Number of well-formed records handed to the visitor.
    pub visited: usize,
    /// Lines skipped because they could not be parsed.
    pub corrupt: Vec<CorruptRecord>,
}

/// One raw line of the records file.
enum Line {
    Record { raw: Vec<u8>, entry: PathEntry },
    Corrupt { raw: Vec<u8>, record: CorruptRecord },
}

/// Handle to a registry directory.
///
/// Handles are cheap; every operation opens the files it needs and takes the
/// lock for its own duration only, so separate processes (or separate handles
/// in one process) can share a registry without further coordination.
#[derive(Debug, Clone)]
pub struct Registry {
    dir: PathBuf,
}

impl Registry {
    /// Opens the registry at `dir`, creating the directory and files if needed.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Io`] if the directory or its files cannot be
    /// created or opened.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;

        let registry = Self { dir };
        let data_path = registry.data_path();
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&data_path)
            .map_err(|e| io_error(&data_path, e))?;
        drop(registry.lock(false)?);

        debug!(registry = %registry.dir.display(), "Registry opened");
        Ok(registry)
    }

    /// Directory holding the registry files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Registers a new entry.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::DuplicateKey`] if `entry.path` is already present.
    /// - [`RegistryError::OverlappingPath`] if `entry.path` is nested inside,
    ///   or contains, a registered path.
    ///
    /// The store is left unchanged in both cases.
    pub fn insert(&self, entry: PathEntry) -> Result<(), RegistryError> {
        let _lock = self.lock(true)?;

        for line in self.read_lines()? {
            let Line::Record { entry: existing, .. } = line else {
                continue;
            };
            if existing.path == entry.path {
                return Err(RegistryError::DuplicateKey(entry.path));
            }
            if entry.path.starts_with(&existing.path) || existing.path.starts_with(&entry.path) {
                return Err(RegistryError::OverlappingPath {
                    path: entry.path,
                    existing: existing.path,
                });
            }
        }

        let mut record = serde_json::to_vec(&entry)?;
        record.push(b'\n');

        let data_path = self.data_path();
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&data_path)
            .map_err(|e| io_error(&data_path, e))?;
        if !ends_with_newline(&mut file).map_err(|e| io_error(&data_path, e))? {
            record.insert(0, b'\n');
        }
        file.write_all(&record)
            .and_then(|()| file.sync_all())
            .map_err(|e| io_error(&data_path, e))?;

        debug!(path = %entry.path.display(), "Registry entry inserted");
        Ok(())
    }

    /// Visits every well-formed record in file order.
    ///
    /// Malformed lines are skipped, logged and listed in the returned report.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Aborted`] if the visitor returns
    /// [`Visit::Abort`], or [`RegistryError::Io`] if the registry is unreadable.
    pub fn for_each<F>(&self, mut visitor: F) -> Result<ScanReport, RegistryError>
    where
        F: FnMut(&PathEntry) -> Visit,
    {
        let _lock = self.lock(false)?;
        let mut report = ScanReport::default();

        for line in self.read_lines()? {
            match line {
                Line::Record { entry, .. } => {
                    report.visited += 1;
                    match visitor(&entry) {
                        Visit::Continue => {}
                        Visit::Stop => break,
                        Visit::Abort(reason) => return Err(RegistryError::Aborted(reason)),
                    }
                }
                Line::Corrupt { record, .. } => {
                    warn!(
                        registry = %self.dir.display(),
                        line = record.line,
                        reason = %record.reason,
                        "Skipping corrupt registry record"
                    );
                    report.corrupt.push(record);
                }
            }
        }

        Ok(report)
    }

    /// Removes every record matching `predicate`, returning the removed records.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Io`] if the registry cannot be read or rewritten.
    pub fn remove_where<P>(&self, mut predicate: P) -> Result<Vec<PathEntry>, RegistryError>
    where
        P: FnMut(&PathEntry) -> bool,
    {
        let mut removed = Vec::new();
        self.rewrite(|entry| {
            if predicate(entry) {
                removed.push(entry.clone());
                Rewrite::Drop
            } else {
                Rewrite::Keep
            }
        })?;
        Ok(removed)
    }

    /// Replaces every record matching `predicate` with `transform(record)`.
    ///
    /// Returns the number of records that actually changed.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Io`] if the registry cannot be read or rewritten.
    pub fn update_where<P, T>(&self, mut predicate: P, mut transform: T) -> Result<usize, RegistryError>
    where
        P: FnMut(&PathEntry) -> bool,
        T: FnMut(&PathEntry) -> PathEntry,
    {
        let mut updated = 0;
        self.rewrite(|entry| {
            if !predicate(entry) {
                return Rewrite::Keep;
            }
            let replacement = transform(entry);
            if &replacement == entry {
                Rewrite::Keep
            } else {
                updated += 1;
                Rewrite::Replace(replacement)
            }
        })?;
        Ok(updated)
    }

    /// Collects every well-formed record.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Io`] if the registry is unreadable.
    pub fn entries(&self) -> Result<(Vec<PathEntry>, ScanReport), RegistryError> {
        let mut entries = Vec::new();
        let report = self.for_each(|entry| {
            entries.push(entry.clone());
            Visit::Continue
        })?;
        Ok((entries, report))
    }

    /// Builds the daemon's working snapshot of path to fingerprint.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Io`] if the registry is unreadable.
    pub fn snapshot(&self) -> Result<(Snapshot, ScanReport), RegistryError> {
        let mut snapshot = Snapshot::new();
        let report = self.for_each(|entry| {
            snapshot.insert(entry.path.clone(), entry.fingerprint.clone());
            Visit::Continue
        })?;
        Ok((snapshot, report))
    }

    fn data_path(&self) -> PathBuf {
        self.dir.join(DATA_FILE)
    }

    fn lock(&self, exclusive: bool) -> Result<LockGuard, RegistryError> {
        let lock_path = self.dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| io_error(&lock_path, e))?;

        let locked = if exclusive {
            FileExt::lock_exclusive(&file)
        } else {
            FileExt::lock_shared(&file)
        };
        locked.map_err(|e| io_error(&lock_path, e))?;

        Ok(LockGuard(file))
    }

    fn read_lines(&self) -> Result<Vec<Line>, RegistryError> {
        let data_path = self.data_path();
        let bytes = match fs::read(&data_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(io_error(&data_path, e)),
        };

        let lines = bytes
            .split(|b| *b == b'\n')
            .enumerate()
            .filter(|(_, raw)| !raw.iter().all(u8::is_ascii_whitespace))
            .map(|(index, raw)| match serde_json::from_slice::<PathEntry>(raw) {
                Ok(entry) => Line::Record {
                    raw: raw.to_vec(),
                    entry,
                },
                Err(e) => Line::Corrupt {
                    raw: raw.to_vec(),
                    record: CorruptRecord {
                        line: index + 1,
                        reason: e.to_string(),
                    },
                },
            })
            .collect();

        Ok(lines)
    }

    /// Rewrites the records file, applying `op` to every well-formed record.
    fn rewrite<F>(&self, mut op: F) -> Result<(), RegistryError>
    where
        F: FnMut(&PathEntry) -> Rewrite,
    {
        let _lock = self.lock(true)?;

        let mut changed = false;
        let mut output = Vec::new();
        for line in self.read_lines()? {
            match line {
                Line::Record { raw, entry } => match op(&entry) {
                    Rewrite::Keep => push_line(&mut output, &raw),
                    Rewrite::Replace(replacement) => {
                        changed = true;
                        push_line(&mut output, &serde_json::to_vec(&replacement)?);
                    }
                    Rewrite::Drop => changed = true,
                },
                Line::Corrupt { raw, .. } => push_line(&mut output, &raw),
            }
        }

        if !changed {
            return Ok(());
        }

        let data_path = self.data_path();
        let mut temp = tempfile::Builder::new()
            .prefix(".paths-")
            .tempfile_in(&self.dir)
            .map_err(|e| io_error(&self.dir, e))?;
        match fs::metadata(&data_path) {
            Ok(metadata) => temp
                .as_file()
                .set_permissions(metadata.permissions())
                .map_err(|e| io_error(temp.path(), e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(&data_path, e)),
        }
        temp.write_all(&output)
            .and_then(|()| temp.as_file().sync_all())
            .map_err(|e| io_error(temp.path(), e))?;
        temp.persist(&data_path)
            .map_err(|e| io_error(&data_path, e.error))?;

        #[cfg(unix)]
        {
            if let Err(e) = File::open(&self.dir).and_then(|dir| dir.sync_all()) {
                warn!(registry = %self.dir.display(), error = %e, "Failed to sync registry directory");
            }
        }

        Ok(())
    }
}

/// Outcome of a rewrite step for one record.
enum Rewrite {
    Keep,
    Replace(PathEntry),
    Drop,
}

/// Holds an advisory lock until dropped.
struct LockGuard(File);

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

fn push_line(output: &mut Vec<u8>, raw: &[u8]) {
    output.extend_from_slice(raw);
    output.push(b'\n');
}

fn ends_with_newline(file: &mut File) -> io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

fn io_error(path: &Path, source: io::Error) -> RegistryError {
    RegistryError::Io {
        path: path.to_path_buf(),
        source,
    }
}
