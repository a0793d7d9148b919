//! Deterministic content fingerprints for files and directory trees.
//!
//! # Scheme
//!
//! - A regular file hashes to `SHA-256(content)`.
//! - A directory hashes to a running SHA-256 that starts with a fixed domain
//!   tag and then folds every entry below the root, visited in file-name order:
//!   a kind tag (`d`, `f` or `l`), the `/`-joined relative path as raw OS
//!   bytes, a NUL, and then the file size (u64 LE) plus content digest for
//!   files, or the raw link target followed by a NUL for symlinks. Other
//!   special files (`o`) contribute only their name.
//! - Symlinks are never followed. Their target path string is what gets
//!   hashed, both for links inside a tree and for a registered path that is
//!   itself a link.
//!
//! Nothing time- or inode-dependent enters the digest, so two processes
//! hashing the same bytes agree. An empty directory hashes to the digest of
//! the domain tag alone.

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use walkdir::WalkDir;

use crate::types::Fingerprint;

/// Domain tag prefixed to every directory digest.
const TREE_DOMAIN: &[u8] = b"keepsafe-tree-v1\0";

/// Domain tag prefixed to the digest of a registered path that is a symlink.
const LINK_DOMAIN: &[u8] = b"keepsafe-link-v1\0";

/// Errors that can occur while fingerprinting a path.
#[derive(Error, Debug)]
pub enum HashError {
    /// The path (or an entry below it) is missing or unreadable, including
    /// entries that vanish while the tree is being scanned.
    #[error("path unavailable: {}: {source}", path.display())]
    Unavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Computes the fingerprint of a file, directory tree or symlink.
///
/// # Errors
///
/// Returns [`HashError::Unavailable`] if `path` or anything below it cannot
/// be read.
pub fn fingerprint(path: &Path) -> Result<Fingerprint, HashError> {
    let metadata = fs::symlink_metadata(path).map_err(|e| unavailable(path, e))?;
    let file_type = metadata.file_type();

    let digest = if file_type.is_symlink() {
        let mut hasher = Sha256::new();
        hasher.update(LINK_DOMAIN);
        hasher.update(link_target(path)?);
        hasher.finalize().into()
    } else if file_type.is_dir() {
        hash_tree(path)?
    } else {
        hash_file(path)?.1
    };

    Ok(Fingerprint::from_hex(hex::encode(digest)))
}

/// Hashes a directory tree in canonical order.
fn hash_tree(root: &Path) -> Result<[u8; 32], HashError> {
    let mut tree = Sha256::new();
    tree.update(TREE_DOMAIN);

    for entry in WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            HashError::Unavailable {
                path,
                source: io::Error::from(e),
            }
        })?;
        let name = relative_bytes(root, entry.path());
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            tree.update(b"l");
            tree.update(&name);
            tree.update([0u8]);
            tree.update(link_target(entry.path())?);
            tree.update([0u8]);
        } else if file_type.is_dir() {
            tree.update(b"d");
            tree.update(&name);
            tree.update([0u8]);
        } else if file_type.is_file() {
            let (size, digest) = hash_file(entry.path())?;
            tree.update(b"f");
            tree.update(&name);
            tree.update([0u8]);
            tree.update(size.to_le_bytes());
            tree.update(digest);
        } else {
            // Sockets, FIFOs and devices: presence only, never opened.
            tree.update(b"o");
            tree.update(&name);
            tree.update([0u8]);
        }
    }

    Ok(tree.finalize().into())
}

/// Hashes a single file, returning the number of bytes read and the digest.
fn hash_file(path: &Path) -> Result<(u64, [u8; 32]), HashError> {
    let mut file = File::open(path).map_err(|e| unavailable(path, e))?;
    let mut hasher = Sha256::new();
    let size = io::copy(&mut file, &mut hasher).map_err(|e| unavailable(path, e))?;
    Ok((size, hasher.finalize().into()))
}

/// Raw bytes of a symlink's target, without following it.
fn link_target(path: &Path) -> Result<Vec<u8>, HashError> {
    let target = fs::read_link(path).map_err(|e| unavailable(path, e))?;
    Ok(target.as_os_str().as_encoded_bytes().to_vec())
}

/// Relative path of `path` under `root` as raw OS bytes, components joined
/// with `/` on every platform.
///
/// Names are never decoded, so two names that differ only in bytes that are
/// not valid UTF-8 stay distinct.
pub(crate) fn relative_bytes(root: &Path, path: &Path) -> Vec<u8> {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let mut name = Vec::new();
    for part in relative.components().filter_map(|c| match c {
        Component::Normal(part) => Some(part),
        _ => None,
    }) {
        if !name.is_empty() {
            name.push(b'/');
        }
        name.extend_from_slice(part.as_encoded_bytes());
    }
    name
}

fn unavailable(path: &Path, source: io::Error) -> HashError {
    HashError::Unavailable {
        path: path.to_path_buf(),
        source,
    }
}
