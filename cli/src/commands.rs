//! Registry commands: add, remove and list.
//!
//! Commands write their normal output to `out` and per-path problems to
//! `err`, so they can run against in-memory buffers in tests.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use keepsafe_monitor::registry::{Registry, RegistryError, Visit};
use keepsafe_monitor::types::PathEntry;

/// Registers each path, printing `+ PATH [fingerprint]` per new entry.
///
/// Duplicate or overlapping paths are reported on `err` and skipped; the
/// remaining paths are still registered. Registering a symlink succeeds but
/// warns, since links are never followed. Returns how many were rejected.
///
/// # Errors
///
/// Returns an error if the registry cannot be read or written.
pub fn add(
    registry: &Registry,
    paths: &[PathBuf],
    out: &mut impl Write,
    err: &mut impl Write,
) -> Result<usize> {
    let mut rejected = 0;

    for path in paths {
        let entry = PathEntry::new(absolutize(path)?);
        match registry.insert(entry.clone()) {
            Ok(()) => {
                writeln!(out, "+ {entry}")?;
                if is_symlink(&entry.path) {
                    writeln!(
                        err,
                        "! warning: {} is a symlink; only its target path is tracked, \
                         not the content it points to",
                        entry.path.display()
                    )?;
                }
            }
            Err(e @ (RegistryError::DuplicateKey(_) | RegistryError::OverlappingPath { .. })) => {
                writeln!(err, "! {e}")?;
                rejected += 1;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to add {}", path.display()));
            }
        }
    }

    Ok(rejected)
}

/// Unregisters each path, printing `- PATH [fingerprint]` per removed entry.
///
/// Paths that are not registered are reported on `err`. Returns how many
/// entries were removed.
///
/// # Errors
///
/// Returns an error if the registry cannot be read or rewritten.
pub fn remove(
    registry: &Registry,
    paths: &[PathBuf],
    out: &mut impl Write,
    err: &mut impl Write,
) -> Result<usize> {
    let mut targets: HashSet<PathBuf> = HashSet::new();
    for path in paths {
        targets.insert(path.clone());
        targets.insert(absolutize(path)?);
    }

    let removed = registry
        .remove_where(|entry| targets.contains(&entry.path))
        .context("Failed to remove paths")?;

    for entry in &removed {
        writeln!(out, "- {entry}")?;
    }
    for path in paths {
        let normalized = absolutize(path)?;
        if !removed
            .iter()
            .any(|e| e.path == *path || e.path == normalized)
        {
            writeln!(err, "! not registered: {}", path.display())?;
        }
    }

    Ok(removed.len())
}

/// Prints every registered entry as `= PATH [fingerprint]`.
///
/// Corrupt registry records are skipped and counted on `err`. Returns the
/// number of entries listed.
///
/// # Errors
///
/// Returns an error if the registry cannot be read.
pub fn list(registry: &Registry, out: &mut impl Write, err: &mut impl Write) -> Result<usize> {
    let mut write_error: Option<io::Error> = None;
    let report = registry
        .for_each(|entry| match writeln!(out, "= {entry}") {
            Ok(()) => Visit::Continue,
            Err(e) => {
                let reason = e.to_string();
                write_error = Some(e);
                Visit::Abort(reason)
            }
        })
        .map_err(|e| match write_error.take() {
            Some(io_err) => anyhow::Error::new(io_err),
            None => anyhow::Error::new(e),
        })
        .context("Failed to list paths")?;

    if !report.corrupt.is_empty() {
        writeln!(
            err,
            "! skipped {} corrupt record(s) in {}",
            report.corrupt.len(),
            registry.dir().display()
        )?;
    }

    Ok(report.visited)
}

/// Makes `path` absolute against the current directory and removes `.` and
/// `..` components without touching the filesystem.
///
/// # Errors
///
/// Returns an error if `path` is relative and the current directory is
/// unavailable.
pub fn absolutize(path: &Path) -> io::Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir()?.join(path)
    };
    Ok(normalize(&joined))
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|m| m.file_type().is_symlink())
}

fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Registry) {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let registry = Registry::open(dir.path().join("registry")).unwrap();
        (dir, registry)
    }

    fn text(buffer: Vec<u8>) -> String {
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn add_prints_new_entries() {
        let (_dir, registry) = setup();
        let (mut out, mut err) = (Vec::new(), Vec::new());

        let rejected = add(
            &registry,
            &[PathBuf::from("/data/a"), PathBuf::from("/data/b")],
            &mut out,
            &mut err,
        )
        .unwrap();

        assert_eq!(rejected, 0);
        assert_eq!(
            text(out),
            "+ /data/a [Not yet archived]\n+ /data/b [Not yet archived]\n"
        );
        assert!(err.is_empty());
    }

    #[test]
    fn add_reports_duplicates_and_continues() {
        let (_dir, registry) = setup();
        let (mut out, mut err) = (Vec::new(), Vec::new());

        let rejected = add(
            &registry,
            &[
                PathBuf::from("/data/a"),
                PathBuf::from("/data/a"),
                PathBuf::from("/data/c"),
            ],
            &mut out,
            &mut err,
        )
        .unwrap();

        assert_eq!(rejected, 1);
        assert!(text(err).contains("already registered: /data/a"));
        assert_eq!(registry.entries().unwrap().0.len(), 2);
    }

    #[test]
    fn add_reports_overlaps() {
        let (_dir, registry) = setup();
        let (mut out, mut err) = (Vec::new(), Vec::new());

        let rejected = add(
            &registry,
            &[PathBuf::from("/data"), PathBuf::from("/data/a")],
            &mut out,
            &mut err,
        )
        .unwrap();

        assert_eq!(rejected, 1);
        assert!(text(err).contains("overlaps"));
    }

    #[cfg(unix)]
    #[test]
    fn add_warns_about_symlinks() {
        let (dir, registry) = setup();
        let target = dir.path().join("real");
        let link = dir.path().join("link");
        fs::create_dir(&target).unwrap();
        std::os::unix::fs::symlink(&target, &link).unwrap();
        let (mut out, mut err) = (Vec::new(), Vec::new());

        let rejected = add(&registry, &[link.clone(), target], &mut out, &mut err).unwrap();

        assert_eq!(rejected, 0);
        assert_eq!(registry.entries().unwrap().0.len(), 2);
        let err = text(err);
        assert_eq!(err.lines().count(), 1);
        assert!(err.contains(&format!("{} is a symlink", link.display())));
    }

    #[test]
    fn remove_prints_removed_and_missing() {
        let (_dir, registry) = setup();
        registry.insert(PathEntry::new("/data/a")).unwrap();
        registry.insert(PathEntry::new("/data/b")).unwrap();
        let (mut out, mut err) = (Vec::new(), Vec::new());

        let removed = remove(
            &registry,
            &[PathBuf::from("/data/a/"), PathBuf::from("/data/zzz")],
            &mut out,
            &mut err,
        )
        .unwrap();

        assert_eq!(removed, 1);
        assert_eq!(text(out), "- /data/a [Not yet archived]\n");
        assert_eq!(text(err), "! not registered: /data/zzz\n");
        assert_eq!(
            registry.entries().unwrap().0,
            vec![PathEntry::new("/data/b")]
        );
    }

    #[test]
    fn list_prints_entries_and_corruption() {
        let (_dir, registry) = setup();
        registry.insert(PathEntry::new("/data/a")).unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(registry.dir().join(keepsafe_monitor::registry::DATA_FILE))
            .and_then(|mut f| f.write_all(b"oops\n"))
            .unwrap();
        let (mut out, mut err) = (Vec::new(), Vec::new());

        let listed = list(&registry, &mut out, &mut err).unwrap();

        assert_eq!(listed, 1);
        assert_eq!(text(out), "= /data/a [Not yet archived]\n");
        assert!(text(err).contains("skipped 1 corrupt record"));
    }

    #[test]
    fn normalize_resolves_dot_components() {
        assert_eq!(
            normalize(Path::new("/data/./a/../b/")),
            PathBuf::from("/data/b")
        );
    }

    #[test]
    fn absolutize_keeps_absolute_paths() {
        assert_eq!(
            absolutize(Path::new("/data/a")).unwrap(),
            PathBuf::from("/data/a")
        );
    }

    #[test]
    fn absolutize_joins_relative_paths() {
        let cwd = env::current_dir().unwrap();
        assert_eq!(absolutize(Path::new("rel")).unwrap(), cwd.join("rel"));
    }
}
