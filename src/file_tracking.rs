//! File-tree walker producing state snapshots
//!
//! [`FileTracker`] walks a root directory and turns every regular file into
//! an untagged [`Entry`]: slash-normalized relative path, SHA-256 digest,
//! length and full-precision mtime. The result is a state [`Snapshot`] that
//! the orchestrator diffs against the reconstructed base.
//!
//! ## Filtering
//!
//! The walk is built on the `ignore` crate:
//!
//! - `.snapsyncignore` files anywhere in the tree are honored, with
//!   gitignore syntax
//! - `.gitignore` files are **not** honored; a backup wants ignored build
//!   output too unless told otherwise
//! - custom patterns from [`SyncConfig`](crate::config::SyncConfig) are
//!   applied as overrides
//! - restore staging directories (`.snapsync-*`) are always skipped
//! - explicitly excluded paths (the chain file, the archive being written)
//!   are dropped after the walk
//!
//! ## Example
//!
//! ```rust,no_run
//! use snapsync::file_tracking::FileTracker;
//! use snapsync::types::ProgressInfo;
//!
//! # fn main() -> snapsync::Result<()> {
//! let tracker = FileTracker::new("./photos".into())
//!     .with_ignore_patterns(vec!["*.tmp".to_string()])
//!     .with_max_file_size(512 * 1024 * 1024);
//!
//! let state = tracker.scan::<fn(ProgressInfo)>(None)?;
//! println!("{} files", state.len());
//! # Ok(())
//! # }
//! ```

use crate::collections::{self, FastSet};
use crate::error::{Result, SyncError};
use crate::snapshot::Snapshot;
use crate::types::{Entry, ProgressInfo};
use crate::utils;
use chrono::Utc;
use ignore::{overrides::OverrideBuilder, WalkBuilder, WalkState};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Per-directory ignore file name
pub const IGNORE_FILE_NAME: &str = ".snapsyncignore";

/// Prefix of the staging directories created by restore
pub const STAGING_PREFIX: &str = ".snapsync-";

/// Walks a tree and builds state snapshots
#[derive(Debug, Clone)]
pub struct FileTracker {
    /// Root directory to walk
    root_path: PathBuf,
    /// Custom ignore patterns (gitignore syntax)
    ignore_patterns: Vec<String>,
    /// Maximum file size in bytes (0 = unlimited)
    max_file_size: u64,
    /// Whether to follow symbolic links
    follow_symlinks: bool,
    /// Threads used for walking and hashing
    parallel_workers: usize,
    /// Files never included, whatever the patterns say
    excluded_paths: Vec<PathBuf>,
}

impl FileTracker {
    /// Create a tracker with default settings
    ///
    /// No custom patterns, no size limit, symlinks not followed, one worker
    /// per CPU core.
    pub fn new(root_path: PathBuf) -> Self {
        Self {
            root_path,
            ignore_patterns: Vec::new(),
            max_file_size: 0,
            follow_symlinks: false,
            parallel_workers: num_cpus::get(),
            excluded_paths: Vec::new(),
        }
    }

    /// Set custom ignore patterns
    ///
    /// Patterns use gitignore syntax. A leading `!` turns the pattern into a
    /// whitelist entry.
    pub fn with_ignore_patterns(mut self, patterns: Vec<String>) -> Self {
        self.ignore_patterns = patterns;
        self
    }

    /// Skip files larger than `size` bytes (0 = unlimited)
    pub fn with_max_file_size(mut self, size: u64) -> Self {
        self.max_file_size = size;
        self
    }

    /// Follow symbolic links during the walk
    pub fn with_follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    /// Number of walker and hashing threads (0 = one per CPU)
    pub fn with_parallel_workers(mut self, workers: usize) -> Self {
        self.parallel_workers = if workers == 0 { num_cpus::get() } else { workers };
        self
    }

    /// Files to leave out even when they live under the root
    pub fn with_excluded_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.excluded_paths = paths;
        self
    }

    /// Root this tracker walks
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Walk the root and build a state snapshot dated now
    ///
    /// Paths are collected by the parallel walker first, then hashed on the
    /// rayon pool. Files that vanish or cannot be read mid-walk are logged
    /// and skipped.
    ///
    /// # Errors
    ///
    /// - [`SyncError::Io`](crate::SyncError::Io) if the root is not a
    ///   readable directory
    pub fn scan<F>(&self, progress_callback: Option<F>) -> Result<Snapshot>
    where
        F: Fn(ProgressInfo) + Send + Sync,
    {
        let start = Instant::now();
        let date = Utc::now();

        if !fs::metadata(&self.root_path)?.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{:?} is not a directory", self.root_path),
            )
            .into());
        }

        let mut walker_builder = WalkBuilder::new(&self.root_path);
        walker_builder
            .follow_links(self.follow_symlinks)
            .hidden(false)
            .parents(false)
            .ignore(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .require_git(false)
            .add_custom_ignore_filename(IGNORE_FILE_NAME)
            .threads(self.parallel_workers);

        let mut override_builder = OverrideBuilder::new(&self.root_path);
        override_builder.add(&format!("!{}*/", STAGING_PREFIX)).ok();

        for pattern in &self.ignore_patterns {
            // Overrides invert gitignore polarity
            let final_pattern = match pattern.strip_prefix('!') {
                Some(whitelisted) => whitelisted.to_string(),
                None => format!("!{}", pattern),
            };

            if let Err(e) = override_builder.add(&final_pattern) {
                warn!("Invalid ignore pattern '{}': {}", pattern, e);
            }
        }

        match override_builder.build() {
            Ok(overrides) => {
                walker_builder.overrides(overrides);
            }
            Err(e) => warn!("Ignoring override patterns: {}", e),
        }

        let paths_to_process = Arc::new(Mutex::new(Vec::<PathBuf>::new()));

        walker_builder.build_parallel().run(|| {
            let paths_to_process = Arc::clone(&paths_to_process);

            Box::new(move |entry_result| {
                match entry_result {
                    Ok(entry) => {
                        let is_file = entry.file_type().map(|ft| ft.is_file()).unwrap_or(false);
                        let is_ignore_file = entry.file_name() == IGNORE_FILE_NAME;
                        if is_file && !is_ignore_file {
                            paths_to_process.lock().push(entry.into_path());
                        }
                    }
                    Err(e) => {
                        warn!("Walk error: {}", e);
                    }
                }

                WalkState::Continue
            })
        });

        let paths = std::mem::take(&mut *paths_to_process.lock());
        let excluded = self.excluded_relative_paths();
        let processed_count = AtomicUsize::new(0);
        let total_size = AtomicU64::new(0);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.parallel_workers)
            .build()
            .map_err(|e| SyncError::internal(format!("Thread pool: {}", e)))?;

        let entries: Vec<Entry> = pool.install(|| {
            paths
                .par_iter()
                .filter_map(|path| {
                    let entry = process_file_entry(path, &self.root_path, self.max_file_size)
                        .unwrap_or_else(|e| {
                            warn!("Error processing entry {:?}: {}", path, e);
                            None
                        })?;

                    if excluded.contains(entry.path.as_str()) {
                        trace!("Excluded: {}", entry.path);
                        return None;
                    }

                    let processed = processed_count.fetch_add(1, Ordering::Relaxed) + 1;
                    let bytes = total_size.fetch_add(entry.length, Ordering::Relaxed) + entry.length;
                    if let Some(ref callback) = progress_callback {
                        callback(ProgressInfo {
                            operation: "Scanning files".to_string(),
                            current_item: Some(entry.path.clone()),
                            processed,
                            total: Some(paths.len()),
                            bytes_processed: bytes,
                        });
                    }

                    Some(entry)
                })
                .collect()
        });

        debug!(
            "Scanned {} files ({}) in {:?}",
            entries.len(),
            utils::format_bytes(total_size.load(Ordering::Relaxed)),
            start.elapsed()
        );

        Ok(Snapshot::from_entries(date, entries))
    }

    /// Excluded paths that fall under the root, in entry form
    fn excluded_relative_paths(&self) -> FastSet<String> {
        let mut excluded = collections::set_with_capacity(self.excluded_paths.len());
        let Ok(root) = std::path::absolute(&self.root_path) else {
            return excluded;
        };

        for path in &self.excluded_paths {
            let relative = std::path::absolute(path)
                .ok()
                .and_then(|abs| utils::make_relative(&abs, &root).ok())
                .and_then(|rel| utils::normalize_relative(&rel).ok());

            match relative {
                Some(rel) if !rel.is_empty() => {
                    excluded.insert(rel);
                }
                _ => trace!("Exclusion {:?} is outside the root", path),
            }
        }
        excluded
    }
}

/// Turn one walked file into an untagged entry
///
/// Returns `Ok(None)` for files that disappeared or exceed the size limit.
pub fn process_file_entry(path: &Path, root_path: &Path, max_file_size: u64) -> Result<Option<Entry>> {
    let metadata = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) => {
            trace!("Skipping entry {:?}: {}", path, e);
            return Ok(None);
        }
    };

    if max_file_size > 0 && metadata.len() > max_file_size {
        trace!("Skipping large file {:?} ({} bytes)", path, metadata.len());
        return Ok(None);
    }

    let relative = utils::make_relative(path, root_path)?;
    let relative = utils::normalize_relative(&relative)?;
    let digest = utils::hash_file_content(path)?;

    Ok(Some(Entry::new(
        relative,
        digest,
        metadata.len(),
        utils::modified_time(&metadata)?,
    )))
}
