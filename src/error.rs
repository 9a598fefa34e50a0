//! Error types for the snapsync library
//!
//! This module defines all error types that can occur while diffing,
//! persisting, archiving and restoring snapshots. The taxonomy follows the
//! way a run can fail:
//!
//! - **Configuration errors** are fatal and reported before any work starts
//! - **No changes** on backup is fatal for the run but leaves the chain intact
//! - **Per-entry I/O failures** during restore never surface here; they are
//!   collected as warnings in [`RestoreReport`](crate::types::RestoreReport)

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the snapsync library
pub type Result<T> = std::result::Result<T, SyncError>;

/// Main error type for all snapsync operations
#[derive(Debug, Error)]
pub enum SyncError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// A backup found nothing to archive
    #[error("No changes detected")]
    NoChanges,

    /// Invalid or missing configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Chain blob could not be encoded or decoded
    #[error("Chain codec error: {0}")]
    Codec(String),

    /// Archive container is malformed or missing a required entry
    #[error("Archive error: {0}")]
    Archive(String),

    /// Archive entry path escapes the restore root
    #[error("Unsafe archive path: {0:?}")]
    UnsafePath(PathBuf),

    /// Path is not under the tree root
    #[error("Path {path:?} is not under root {root:?}")]
    OutsideRoot {
        /// Offending path
        path: PathBuf,
        /// Tree root
        root: PathBuf,
    },

    /// Path conversion error
    #[error("Path conversion error: {0:?}")]
    PathConversion(std::ffi::OsString),

    /// Catalog lock acquisition timeout
    #[error("Lock acquisition timeout: {0:?}")]
    LockTimeout(PathBuf),

    /// Catalog store error
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Create a configuration error with a custom message
    pub fn config(msg: impl Into<String>) -> Self {
        SyncError::InvalidConfiguration(msg.into())
    }

    /// Create a codec error with a custom message
    pub fn codec(msg: impl Into<String>) -> Self {
        SyncError::Codec(msg.into())
    }

    /// Create an archive error with a custom message
    pub fn archive(msg: impl Into<String>) -> Self {
        SyncError::Archive(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        SyncError::Internal(msg.into())
    }

    /// Check if this error is recoverable
    ///
    /// Recoverable errors leave every persisted artifact untouched, so the
    /// same run can simply be retried.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SyncError::NoChanges | SyncError::LockTimeout(_))
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            SyncError::NoChanges => {
                "No changes detected since the last backup. Nothing was archived.".to_string()
            }
            SyncError::InvalidConfiguration(msg) => {
                format!("{}. Run with --help to see the available options.", msg)
            }
            SyncError::LockTimeout(path) => {
                format!(
                    "Timed out waiting for the catalog lock {:?}. Another run is still \
                     recording to this catalog.",
                    path
                )
            }
            _ => self.to_string(),
        }
    }
}
