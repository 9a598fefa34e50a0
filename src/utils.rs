//! Utility functions for snapsync
//!
//! File hashing, path normalization and atomic writes shared by the walker,
//! the chain store and the restore flow.
//!
//! ## Path conventions
//!
//! Entry paths are always relative to the tree root and use `/` as the
//! separator regardless of platform. [`normalize_relative`] produces that
//! form from a filesystem path and [`safe_join`] turns it back into a
//! filesystem path, refusing anything that would escape the root.

use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tracing::trace;

/// Hash a file's content using SHA-256
///
/// Reads the file in 8KB chunks so memory stays flat for large files.
///
/// # Returns
///
/// The digest as a 64-character lowercase hexadecimal string.
///
/// # Errors
///
/// - [`SyncError::Io`] if the file cannot be opened or read
pub fn hash_file_content(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash in-memory data using SHA-256
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Last modification time of a file as UTC, full precision
pub fn modified_time(metadata: &fs::Metadata) -> Result<DateTime<Utc>> {
    Ok(DateTime::<Utc>::from(metadata.modified()?))
}

/// Make a path relative to a base path
///
/// Tries a lexical strip first so symlinked paths keep their own name, and
/// only canonicalizes both sides when that fails.
///
/// # Errors
///
/// - [`SyncError::OutsideRoot`] if `path` is not under `base`
/// - [`SyncError::Io`] if canonicalization fails
pub fn make_relative(path: &Path, base: &Path) -> Result<PathBuf> {
    if let Ok(relative) = path.strip_prefix(base) {
        return Ok(relative.to_path_buf());
    }

    let path_canon = path.canonicalize()?;
    let base_canon = base.canonicalize()?;

    path_canon
        .strip_prefix(&base_canon)
        .map(|p| p.to_path_buf())
        .map_err(|_| SyncError::OutsideRoot {
            path: path_canon.clone(),
            root: base_canon.clone(),
        })
}

/// Convert a relative filesystem path to the slash-separated entry form
///
/// # Errors
///
/// - [`SyncError::PathConversion`] if a component is not valid UTF-8
/// - [`SyncError::UnsafePath`] if the path is absolute or contains `..`
pub fn normalize_relative(path: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                let part = part
                    .to_str()
                    .ok_or_else(|| SyncError::PathConversion(part.to_os_string()))?;
                parts.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(SyncError::UnsafePath(path.to_path_buf()));
            }
        }
    }
    Ok(parts.join("/"))
}

/// Join a slash-separated entry path onto `root`
///
/// # Errors
///
/// - [`SyncError::UnsafePath`] if the entry path is empty, absolute or
///   climbs out of the root
pub fn safe_join(root: &Path, relative: &str) -> Result<PathBuf> {
    let mut joined = root.to_path_buf();
    let mut depth = 0usize;

    for part in relative.split('/') {
        match part {
            "" | "." => {}
            ".." => return Err(SyncError::UnsafePath(PathBuf::from(relative))),
            part if cfg!(windows) && (part.contains(':') || part.contains('\\')) => {
                return Err(SyncError::UnsafePath(PathBuf::from(relative)));
            }
            part => {
                joined.push(part);
                depth += 1;
            }
        }
    }

    if depth == 0 || relative.starts_with('/') {
        return Err(SyncError::UnsafePath(PathBuf::from(relative)));
    }
    Ok(joined)
}

/// Create the parent directory of `path` if it is missing
pub fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            trace!("Created directory: {:?}", parent);
        }
    }
    Ok(())
}

/// Format bytes in human-readable form
///
/// Uses binary units. Values below 1024 are printed as whole bytes, larger
/// ones with two decimals.
///
/// ```rust
/// use snapsync::utils::format_bytes;
///
/// assert_eq!(format_bytes(1023), "1023 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Atomic file write (write to temp file then rename)
///
/// The temp file lives next to the target so the rename never crosses a
/// filesystem boundary. Readers see either the old file or the new one.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    ensure_parent(path)?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    std::io::Write::write_all(&mut temp, content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| SyncError::Io(e.error))?;

    trace!("Atomically wrote {} bytes to {:?}", content.len(), path);
    Ok(())
}
