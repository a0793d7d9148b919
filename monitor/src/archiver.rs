//! Archival of changed paths into immutable zip artifacts.
//!
//! Every artifact is first written to a dot-prefixed temporary file inside its
//! final directory, synced, and only then moved to its final name with a
//! no-clobber rename. A crash mid-archive leaves at most a stray temporary
//! file, never a truncated artifact under a real name.
//!
//! # Layout
//!
//! ```text
//! <destination>/<basename>-<8 hex of SHA-256(source path)>/<UTC timestamp>.zip
//! ```
//!
//! Timestamps carry nanoseconds, and a `-N` suffix is appended should two
//! archives of the same source still collide.
//!
//! Entry names and stored link targets are percent-escaped: `%` becomes
//! `%25` and any byte that is not valid UTF-8 becomes `%XX`. Names that are
//! distinct on disk therefore stay distinct inside the archive.
//!
//! The source is read as it is at archive time. If it changed after being
//! hashed, the artifact holds the newer bytes while the recorded fingerprint
//! is the older one, so the next pass archives it again.

use std::fs::{self, File};
use std::io::{self, Seek, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::hasher::relative_bytes;

/// File extension of artifacts produced by [`ZipArchiver`].
pub const ARCHIVE_EXTENSION: &str = "zip";

/// Prefix used for in-progress temporary files.
const TEMP_PREFIX: &str = ".keepsafe-";

/// How many suffixed names to try before giving up on a collision.
const MAX_NAME_ATTEMPTS: u32 = 100;

/// Errors that can occur while archiving a path.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// The source path (or an entry below it) could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Source {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The artifact could not be written under the destination.
    #[error("cannot write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The zip container could not be assembled.
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// Produces one immutable artifact per archived path.
pub trait Archiver: Send + Sync {
    /// Archives `source` under `destination`, returning the artifact location.
    ///
    /// # Errors
    ///
    /// Returns an [`ArchiveError`] if the source is unreadable or the
    /// destination unwritable. No artifact is visible under its final name in
    /// that case.
    fn archive(&self, source: &Path, destination: &Path) -> Result<PathBuf, ArchiveError>;
}

/// Deflate-compressed zip archiver.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipArchiver;

impl ZipArchiver {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Archiver for ZipArchiver {
    fn archive(&self, source: &Path, destination: &Path) -> Result<PathBuf, ArchiveError> {
        let target_dir = destination.join(artifact_dir_name(source));
        fs::create_dir_all(&target_dir).map_err(|e| write_error(&target_dir, e))?;

        let mut temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(".partial")
            .tempfile_in(&target_dir)
            .map_err(|e| write_error(&target_dir, e))?;

        {
            let mut zip = ZipWriter::new(temp.as_file_mut());
            write_entries(&mut zip, source)?;
            zip.finish()?;
        }
        temp.as_file()
            .sync_all()
            .map_err(|e| write_error(temp.path(), e))?;

        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.9fZ").to_string();
        let mut attempt = 0u32;
        loop {
            let name = if attempt == 0 {
                format!("{stamp}.{ARCHIVE_EXTENSION}")
            } else {
                format!("{stamp}-{attempt}.{ARCHIVE_EXTENSION}")
            };
            let final_path = target_dir.join(name);

            match temp.persist_noclobber(&final_path) {
                Ok(_) => {
                    debug!(artifact = %final_path.display(), "Archive written");
                    return Ok(final_path);
                }
                Err(e)
                    if e.error.kind() == io::ErrorKind::AlreadyExists
                        && attempt < MAX_NAME_ATTEMPTS =>
                {
                    temp = e.file;
                    attempt += 1;
                }
                Err(e) => return Err(write_error(&final_path, e.error)),
            }
        }
    }
}

/// Directory (under the destination) that holds every artifact of `source`.
#[must_use]
pub fn artifact_dir_name(source: &Path) -> String {
    let base = source
        .file_name()
        .map(|n| escape_name(n.as_encoded_bytes()))
        .unwrap_or_else(|| "root".to_string());
    let digest = Sha256::digest(source.as_os_str().as_encoded_bytes());
    format!("{}-{}", base, &hex::encode(digest)[..8])
}

fn write_entries<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    source: &Path,
) -> Result<(), ArchiveError> {
    let metadata = fs::symlink_metadata(source).map_err(|e| source_error(source, e))?;

    if !metadata.is_dir() {
        let name = source
            .file_name()
            .map(|n| escape_name(n.as_encoded_bytes()))
            .unwrap_or_else(|| "file".to_string());
        return add_entry(zip, source, name, &metadata);
    }

    for entry in WalkDir::new(source)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(source).to_path_buf();
            source_error(&path, io::Error::from(e))
        })?;
        let metadata = fs::symlink_metadata(entry.path())
            .map_err(|e| source_error(entry.path(), e))?;
        let name = escape_name(&relative_bytes(source, entry.path()));
        add_entry(zip, entry.path(), name, &metadata)?;
    }

    Ok(())
}

fn add_entry<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    path: &Path,
    name: String,
    metadata: &fs::Metadata,
) -> Result<(), ArchiveError> {
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(metadata.len() >= u64::from(u32::MAX));
    #[cfg(unix)]
    let options = {
        use std::os::unix::fs::PermissionsExt;
        options.unix_permissions(metadata.permissions().mode() & 0o7777)
    };

    let file_type = metadata.file_type();
    if file_type.is_symlink() {
        let target = fs::read_link(path).map_err(|e| source_error(path, e))?;
        let target = escape_name(target.as_os_str().as_encoded_bytes());
        zip.add_symlink(name, target, options)?;
    } else if file_type.is_dir() {
        zip.add_directory(name, options)?;
    } else if file_type.is_file() {
        let mut file = File::open(path).map_err(|e| source_error(path, e))?;
        zip.start_file(name, options)?;
        io::copy(&mut file, zip).map_err(|e| source_error(path, e))?;
    } else {
        debug!(path = %path.display(), "Skipping special file");
    }

    Ok(())
}

/// Renders raw OS bytes as a zip name, escaping `%` and invalid UTF-8.
fn escape_name(bytes: &[u8]) -> String {
    let mut name = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        for c in chunk.valid().chars() {
            if c == '%' {
                name.push_str("%25");
            } else {
                name.push(c);
            }
        }
        for byte in chunk.invalid() {
            name.push_str(&format!("%{byte:02X}"));
        }
    }
    name
}

fn source_error(path: &Path, source: io::Error) -> ArchiveError {
    ArchiveError::Source {
        path: path.to_path_buf(),
        source,
    }
}

fn write_error(path: &Path, source: io::Error) -> ArchiveError {
    ArchiveError::Write {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;
    use zip::ZipArchive;

    fn write_file(root: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = root.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent dirs");
        }
        fs::write(&path, content).expect("Failed to write content");
        path
    }

    fn entries_in(artifact: &Path) -> Vec<String> {
        let archive = ZipArchive::new(File::open(artifact).unwrap()).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        names
    }

    fn files_under(dir: &Path) -> Vec<PathBuf> {
        WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect()
    }

    fn setup() -> (TempDir, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("data");
        let destination = dir.path().join("archive");
        write_file(&source, "x.txt", b"hello");
        write_file(&source, "sub/y.txt", b"world");
        (dir, source, destination)
    }

    #[test]
    fn archives_directory_tree() {
        let (_dir, source, destination) = setup();

        let artifact = ZipArchiver::new().archive(&source, &destination).unwrap();

        assert!(artifact.starts_with(destination.join(artifact_dir_name(&source))));
        assert_eq!(
            artifact.extension().and_then(|e| e.to_str()),
            Some(ARCHIVE_EXTENSION)
        );
        let names = entries_in(&artifact);
        assert!(names.contains(&"x.txt".to_string()));
        assert!(names.contains(&"sub/y.txt".to_string()));

        let mut archive = ZipArchive::new(File::open(&artifact).unwrap()).unwrap();
        let mut content = String::new();
        archive
            .by_name("x.txt")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "hello");
    }

    #[test]
    fn archives_single_file() {
        let (_dir, source, destination) = setup();
        let file = source.join("x.txt");

        let artifact = ZipArchiver::new().archive(&file, &destination).unwrap();

        assert_eq!(entries_in(&artifact), vec!["x.txt".to_string()]);
    }

    #[test]
    fn successive_archives_never_collide() {
        let (_dir, source, destination) = setup();
        let archiver = ZipArchiver::new();

        let first = archiver.archive(&source, &destination).unwrap();
        let second = archiver.archive(&source, &destination).unwrap();
        let third = archiver.archive(&source, &destination).unwrap();

        assert_ne!(first, second);
        assert_ne!(second, third);
        assert!(first.exists() && second.exists() && third.exists());
    }

    #[test]
    fn no_temporary_files_remain_after_success() {
        let (_dir, source, destination) = setup();

        ZipArchiver::new().archive(&source, &destination).unwrap();

        for file in files_under(&destination) {
            let name = file.file_name().unwrap().to_string_lossy().into_owned();
            assert!(!name.starts_with(TEMP_PREFIX), "stray temp file {name}");
        }
    }

    #[test]
    fn missing_source_leaves_no_artifact() {
        let (dir, _source, destination) = setup();
        let missing = dir.path().join("missing");

        let err = ZipArchiver::new().archive(&missing, &destination).unwrap_err();

        assert!(matches!(err, ArchiveError::Source { .. }));
        assert!(files_under(&destination).is_empty());
    }

    #[test]
    fn unwritable_destination_fails() {
        let (dir, source, _destination) = setup();
        let blocker = write_file(dir.path(), "not-a-dir", b"");

        let err = ZipArchiver::new().archive(&source, &blocker).unwrap_err();

        assert!(matches!(err, ArchiveError::Write { .. }));
    }

    #[test]
    fn artifact_dir_name_disambiguates_equal_basenames() {
        let a = artifact_dir_name(Path::new("/one/data"));
        let b = artifact_dir_name(Path::new("/two/data"));

        assert!(a.starts_with("data-"));
        assert!(b.starts_with("data-"));
        assert_ne!(a, b);
        assert_eq!(a, artifact_dir_name(Path::new("/one/data")));
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_stored_not_followed() {
        let (dir, source, destination) = setup();
        let outside = write_file(dir.path(), "outside.txt", b"secret");
        std::os::unix::fs::symlink(&outside, source.join("link")).unwrap();

        let artifact = ZipArchiver::new().archive(&source, &destination).unwrap();

        // A stored link holds its target path, not the target's content.
        let mut archive = ZipArchive::new(File::open(&artifact).unwrap()).unwrap();
        let mut stored = String::new();
        archive
            .by_name("link")
            .unwrap()
            .read_to_string(&mut stored)
            .unwrap();
        assert_eq!(stored, outside.to_string_lossy());
    }

    #[test]
    fn escape_name_keeps_plain_names() {
        assert_eq!(escape_name(b"sub/y.txt"), "sub/y.txt");
        assert_eq!(escape_name("caf\u{e9}.txt".as_bytes()), "caf\u{e9}.txt");
    }

    #[test]
    fn escape_name_is_unambiguous() {
        assert_eq!(escape_name(b"100%.txt"), "100%25.txt");
        assert_eq!(escape_name(b"n\xff"), "n%FF");
        assert_ne!(escape_name(b"n%FF"), escape_name(b"n\xff"));
        assert_ne!(escape_name(b"n\xfe"), escape_name(b"n\xff"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn non_utf8_siblings_are_archived_separately() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("t");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join(OsStr::from_bytes(b"n\xff")), b"first").unwrap();
        fs::write(source.join(OsStr::from_bytes(b"n\xfe")), b"second").unwrap();

        let artifact = ZipArchiver::new()
            .archive(&source, &dir.path().join("archive"))
            .unwrap();

        assert_eq!(
            entries_in(&artifact),
            vec!["n%FE".to_string(), "n%FF".to_string()]
        );
        let mut archive = ZipArchive::new(File::open(&artifact).unwrap()).unwrap();
        let mut content = String::new();
        archive
            .by_name("n%FF")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "first");
    }
}
