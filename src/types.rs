//! Core data types used throughout the snapsync library
//!
//! This module contains the data model shared by the engine and its
//! collaborators.
//!
//! ## Overview
//!
//! - **Change model**: [`Entry`], [`EntryAction`] - one path and what happened to it
//! - **Summaries**: [`ChangeStats`] - counts derived from a diff snapshot
//! - **Run results**: [`BackupReport`], [`RestoreReport`]
//! - **Progress**: [`ProgressInfo`], [`ProgressCallback`]
//!
//! ## Examples
//!
//! ```rust
//! use snapsync::types::{Entry, EntryAction};
//! use chrono::Utc;
//!
//! let entry = Entry::new("docs/readme.md", "ab12", 42, Utc::now())
//!     .with_action(EntryAction::Move { from: "readme.md".to_string() });
//!
//! assert_eq!(entry.action.move_source(), Some("readme.md"));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What a diff snapshot says happened to a path
///
/// Only meaningful inside a diff snapshot; a state snapshot carries
/// [`EntryAction::None`] on every entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryAction {
    /// Unchanged
    #[default]
    None,
    /// New or modified; the content must be re-transmitted
    Add,
    /// Deleted from the tree
    Remove,
    /// Renamed from another path with identical content and mtime
    Move {
        /// Previous relative path
        from: String,
    },
}

impl EntryAction {
    /// True for every variant except [`EntryAction::None`]
    pub fn is_change(&self) -> bool {
        !matches!(self, EntryAction::None)
    }

    /// Source path of a move
    pub fn move_source(&self) -> Option<&str> {
        match self {
            EntryAction::Move { from } => Some(from),
            _ => None,
        }
    }

    /// Short label used in logs and CLI listings
    pub fn label(&self) -> &'static str {
        match self {
            EntryAction::None => "none",
            EntryAction::Add => "add",
            EntryAction::Remove => "remove",
            EntryAction::Move { .. } => "move",
        }
    }
}

/// The atomic unit of change: one file in one snapshot
///
/// `path` is relative to the tree root and always uses `/` separators, so
/// chains written on one platform restore on another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Slash-normalized path relative to the tree root
    pub path: String,
    /// SHA-256 of the file content, lowercase hex
    pub digest: String,
    /// Size in bytes
    pub length: u64,
    /// Last content modification
    pub last_modified: DateTime<Utc>,
    /// Change tag, see [`EntryAction`]
    #[serde(default)]
    pub action: EntryAction,
}

impl Entry {
    /// Create an untagged entry
    pub fn new(
        path: impl Into<String>,
        digest: impl Into<String>,
        length: u64,
        last_modified: DateTime<Utc>,
    ) -> Self {
        Self {
            path: path.into(),
            digest: digest.into(),
            length,
            last_modified,
            action: EntryAction::None,
        }
    }

    /// Same entry with a different action
    pub fn with_action(mut self, action: EntryAction) -> Self {
        self.action = action;
        self
    }

    /// Copy of this entry tagged [`EntryAction::None`]
    pub fn reset(&self) -> Self {
        self.clone().with_action(EntryAction::None)
    }
}

/// Statistics about a diff snapshot
///
/// # Examples
///
/// ```rust
/// # use snapsync::types::ChangeStats;
/// let stats = ChangeStats {
///     files_added: 3,
///     files_removed: 1,
///     files_moved: 2,
///     bytes_added: 4096,
/// };
///
/// assert!(stats.has_changes());
/// assert_eq!(stats.total_operations(), 6);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeStats {
    /// Entries tagged `Add` (new or modified)
    pub files_added: usize,
    /// Entries tagged `Remove`
    pub files_removed: usize,
    /// Entries tagged `Move`
    pub files_moved: usize,
    /// Total length of `Add` entries, i.e. the payload size
    pub bytes_added: u64,
}

impl ChangeStats {
    /// Tally the actions of a set of entries
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a Entry>) -> Self {
        let mut stats = ChangeStats::default();
        for entry in entries {
            match entry.action {
                EntryAction::None => {}
                EntryAction::Add => {
                    stats.files_added += 1;
                    stats.bytes_added += entry.length;
                }
                EntryAction::Remove => stats.files_removed += 1,
                EntryAction::Move { .. } => stats.files_moved += 1,
            }
        }
        stats
    }

    /// Check if there are any changes
    pub fn has_changes(&self) -> bool {
        self.total_operations() > 0
    }

    /// Get total number of tagged entries
    pub fn total_operations(&self) -> usize {
        self.files_added + self.files_removed + self.files_moved
    }
}

/// Result of a backup run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupReport {
    /// Date of the diff snapshot appended to the chain
    pub snapshot_date: DateTime<Utc>,
    /// What the diff contains
    pub stats: ChangeStats,
    /// Number of payload files written to the archive
    pub files_archived: usize,
    /// Payload bytes written to the archive
    pub bytes_archived: u64,
    /// Number of snapshots in the chain after the append
    pub chain_length: usize,
    /// Time taken in milliseconds
    pub duration_ms: u64,
    /// Payload files that could not be archived
    pub warnings: Vec<String>,
}

/// Result of a restore run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreReport {
    /// Date of the diff snapshot that was applied
    pub snapshot_date: Option<DateTime<Utc>>,
    /// Live files deleted by `Remove` actions
    pub files_removed: usize,
    /// Live files renamed by `Move` actions
    pub files_moved: usize,
    /// Payload files written into place
    pub files_restored: usize,
    /// Payload bytes written
    pub bytes_written: u64,
    /// Time taken in milliseconds
    pub duration_ms: u64,
    /// Per-entry failures that were skipped
    pub warnings: Vec<String>,
}

impl RestoreReport {
    /// Whether every entry was applied
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Progress callback for long-running operations
pub type ProgressCallback = Arc<dyn Fn(ProgressInfo) + Send + Sync>;

/// Information passed to progress callbacks
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Operation being performed
    pub operation: String,
    /// Current item being processed
    pub current_item: Option<String>,
    /// Items processed so far
    pub processed: usize,
    /// Total items to process (if known)
    pub total: Option<usize>,
    /// Bytes processed so far
    pub bytes_processed: u64,
}

impl ProgressInfo {
    /// Get progress as a percentage (0-100)
    pub fn percentage(&self) -> Option<f32> {
        match self.total {
            Some(total) if total > 0 => Some((self.processed as f32 / total as f32) * 100.0),
            _ => None,
        }
    }
}
