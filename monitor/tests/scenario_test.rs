//! End-to-end tests for change detection across successive passes.
//!
//! These tests drive the registry, the monitor pass and the daemon's
//! fingerprint write-back together, the way the daemon does on every tick.

use std::fs;
use std::path::{Path, PathBuf};

use keepsafe_monitor::daemon::persist_snapshot;
use keepsafe_monitor::hasher;
use keepsafe_monitor::monitor::Monitor;
use keepsafe_monitor::registry::Registry;
use keepsafe_monitor::types::{Fingerprint, PathEntry};
use tempfile::TempDir;
use walkdir::WalkDir;

// =============================================================================
// Test Helpers
// =============================================================================

struct Fixture {
    _dir: TempDir,
    data: PathBuf,
    archive: PathBuf,
    registry: Registry,
}

/// Creates `data/x.txt` containing "hello", registered as never archived.
fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data = dir.path().join("data").join("a");
    fs::create_dir_all(&data).unwrap();
    fs::write(data.join("x.txt"), b"hello").unwrap();

    let registry = Registry::open(dir.path().join("registry")).unwrap();
    registry.insert(PathEntry::new(&data)).unwrap();

    Fixture {
        archive: dir.path().join("archive"),
        data,
        registry,
        _dir: dir,
    }
}

fn count_artifacts(archive: &Path) -> usize {
    WalkDir::new(archive)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_type().is_file() && e.path().extension().and_then(|x| x.to_str()) == Some("zip")
        })
        .count()
}

fn stored_fingerprint(registry: &Registry, path: &Path) -> Fingerprint {
    let (snapshot, _) = registry.snapshot().unwrap();
    snapshot[path].clone()
}

// =============================================================================
// Scenario
// =============================================================================

/// Archive on first sight, stay quiet while unchanged, archive again after
/// an append.
#[test]
fn test_archive_quiet_then_archive_again() {
    let fx = fixture();
    let monitor = Monitor::with_zip(&fx.archive);

    // First pass: sentinel differs from anything, so the tree is archived.
    let (snapshot, _) = fx.registry.snapshot().unwrap();
    let first = monitor.run_pass(snapshot);
    assert_eq!(persist_snapshot(&fx.registry, &first.snapshot).unwrap(), 1);

    assert_eq!(first.archived, 1);
    assert_eq!(count_artifacts(&fx.archive), 1);
    let hello_fp = stored_fingerprint(&fx.registry, &fx.data);
    assert!(!hello_fp.is_never_archived());
    assert_eq!(hello_fp, hasher::fingerprint(&fx.data).unwrap());

    // Second pass: nothing changed.
    let second = monitor.run_pass(first.snapshot);
    assert_eq!(persist_snapshot(&fx.registry, &second.snapshot).unwrap(), 0);

    assert_eq!(second.archived, 0);
    assert_eq!(count_artifacts(&fx.archive), 1);
    assert_eq!(stored_fingerprint(&fx.registry, &fx.data), hello_fp);

    // Third pass: append " world".
    let mut content = fs::read(fx.data.join("x.txt")).unwrap();
    content.extend_from_slice(b" world");
    fs::write(fx.data.join("x.txt"), content).unwrap();

    let third = monitor.run_pass(second.snapshot);
    assert_eq!(persist_snapshot(&fx.registry, &third.snapshot).unwrap(), 1);

    assert_eq!(third.archived, 1);
    assert_eq!(count_artifacts(&fx.archive), 2);
    let world_fp = stored_fingerprint(&fx.registry, &fx.data);
    assert_ne!(world_fp, hello_fp);
    assert!(!world_fp.is_never_archived());
}

/// A path that disappears is skipped and keeps its fingerprint; once it comes
/// back unchanged nothing is archived.
#[test]
fn test_vanished_path_is_retried_next_pass() {
    let fx = fixture();
    let monitor = Monitor::with_zip(&fx.archive);

    let (snapshot, _) = fx.registry.snapshot().unwrap();
    let first = monitor.run_pass(snapshot);
    let recorded = first.snapshot[&fx.data].clone();

    let parked = fx.data.with_file_name("parked");
    fs::rename(&fx.data, &parked).unwrap();
    let gone = monitor.run_pass(first.snapshot);
    assert_eq!(gone.archived, 0);
    assert_eq!(gone.failures.len(), 1);
    assert_eq!(gone.snapshot[&fx.data], recorded);

    fs::rename(&parked, &fx.data).unwrap();
    let back = monitor.run_pass(gone.snapshot);
    assert_eq!(back.archived, 0);
    assert!(back.failures.is_empty());
}

/// Independent processes hashing the same bytes agree.
#[test]
fn test_identical_trees_in_different_places_agree() {
    let a = fixture();
    let b = fixture();

    assert_eq!(
        hasher::fingerprint(&a.data).unwrap(),
        hasher::fingerprint(&b.data).unwrap()
    );
}
