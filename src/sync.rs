//! Backup and restore orchestration
//!
//! [`Synchronizer`] ties the engine to the filesystem. It owns no state
//! between runs; every call loads what it needs, does its work and writes
//! the results back.
//!
//! ## Backup
//!
//! 1. rebuild the base state from the chain as of now
//! 2. walk the root into a live state snapshot
//! 3. `base.synchronize(live).trim()`; an empty diff is
//!    [`SyncError::NoChanges`] and leaves the chain untouched
//! 4. append the diff
//! 5. write the archive: chain blob first, then the content of every `Add`
//!    entry. Unreadable payloads are skipped with a warning; a payload cut
//!    short mid-write aborts the run
//! 6. save the chain once the archive is complete
//!
//! ## Restore
//!
//! 1. unpack the archive into a `.snapsync-*` staging directory inside the
//!    root
//! 2. decode the bundled chain and take its latest diff
//! 3. delete `Remove` paths, rename `Move` sources, then move every staged
//!    payload into place
//!
//! Each restore step is best-effort: a failing entry becomes a warning in
//! the [`RestoreReport`] and the run goes on.
//!
//! ## Example
//!
//! ```rust,no_run
//! use snapsync::Synchronizer;
//! use std::path::Path;
//!
//! # fn main() -> snapsync::Result<()> {
//! let sync = Synchronizer::builder()
//!     .ignore_patterns(vec!["*.tmp".to_string()])
//!     .build("./photos".into())?;
//!
//! let report = sync.backup_to_file(Path::new("photos.chain"), Path::new("photos-1.tar"))?;
//! println!("archived {} files", report.files_archived);
//!
//! let restored = sync.restore_from_file(Path::new("photos-1.tar"))?;
//! assert!(restored.is_clean());
//! # Ok(())
//! # }
//! ```

use crate::archive::{self, ArchiveWriter};
use crate::catalog::{Catalog, EventLevel, RunMode, RunOutcome, RunRecord};
use crate::chain::SnapshotChain;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::file_tracking::{FileTracker, STAGING_PREFIX};
use crate::snapshot::Snapshot;
use crate::types::{BackupReport, EntryAction, ProgressCallback, ProgressInfo, RestoreReport};
use crate::utils;
use chrono::Utc;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, instrument, trace, warn};
use walkdir::WalkDir;

/// Runs backups and restores for one tree root
pub struct Synchronizer {
    root_path: PathBuf,
    config: SyncConfig,
    catalog: Option<Catalog>,
    progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("root_path", &self.root_path)
            .field("config", &self.config)
            .field("catalog", &self.catalog.as_ref().map(|c| c.dir().to_path_buf()))
            .finish()
    }
}

/// Diff computed by the first half of a backup
struct PreparedBackup {
    chain: SnapshotChain,
    diff: Snapshot,
}

impl Synchronizer {
    /// Synchronizer with default configuration and no catalog
    pub fn new(root_path: PathBuf) -> Self {
        Self {
            root_path,
            config: SyncConfig::default(),
            catalog: None,
            progress: None,
        }
    }

    /// Start building a configured synchronizer
    pub fn builder() -> SynchronizerBuilder {
        SynchronizerBuilder::new()
    }

    /// Tree root
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Active configuration
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run catalog, when configured
    pub fn catalog(&self) -> Option<&Catalog> {
        self.catalog.as_ref()
    }

    /// Reconstruct the tree state recorded in a chain file as of now
    pub fn current_state(&self, chain_path: &Path) -> Snapshot {
        SnapshotChain::load(chain_path, &self.root_path).build_state(Utc::now())
    }

    /// Back up the root, streaming the archive into `output`
    ///
    /// The chain file at `chain_path` is read, extended and written back.
    /// It is never packaged itself, even when it lives under the root.
    ///
    /// # Errors
    ///
    /// - [`SyncError::NoChanges`] if the tree matches the chain; nothing is
    ///   written
    /// - [`SyncError::Io`] if the root cannot be walked or the chain or
    ///   archive cannot be written
    #[instrument(skip(self, output))]
    pub fn backup<W: Write>(&self, chain_path: &Path, output: W) -> Result<BackupReport> {
        self.run_backup(chain_path, vec![chain_path.to_path_buf()], || Ok(output))
    }

    /// Back up the root into the archive file `output_path`
    ///
    /// The archive file is only created once a non-empty diff exists, and is
    /// excluded from the walk.
    #[instrument(skip(self))]
    pub fn backup_to_file(&self, chain_path: &Path, output_path: &Path) -> Result<BackupReport> {
        let excluded = vec![chain_path.to_path_buf(), output_path.to_path_buf()];
        self.run_backup(chain_path, excluded, || {
            utils::ensure_parent(output_path)?;
            Ok(BufWriter::new(File::create(output_path)?))
        })
    }

    fn run_backup<W, F>(&self, chain_path: &Path, excluded: Vec<PathBuf>, open_output: F) -> Result<BackupReport>
    where
        W: Write,
        F: FnOnce() -> Result<W>,
    {
        let _flusher = self
            .catalog
            .as_ref()
            .map(|c| c.start_flusher(self.config.flush_interval()));
        let run = RunRecord::start(RunMode::Backup, &self.root_path);
        let run_id = run.id;

        let result = self.prepare_backup(chain_path, excluded).and_then(|prepared| {
            let output = open_output()?;
            self.write_backup(chain_path, prepared, output, run_id)
        });

        if let Some(catalog) = &self.catalog {
            let mut run = run;
            let outcome = match &result {
                Ok(report) => {
                    run.files_added = report.stats.files_added;
                    run.files_removed = report.stats.files_removed;
                    run.files_moved = report.stats.files_moved;
                    run.bytes = report.bytes_archived;
                    run.warnings = report.warnings.len();
                    RunOutcome::Succeeded
                }
                Err(SyncError::NoChanges) => RunOutcome::NoChanges,
                Err(e) => {
                    run.message = Some(e.to_string());
                    catalog.add_event(Some(run_id), EventLevel::Error, "backup", e.to_string());
                    RunOutcome::Failed
                }
            };
            catalog.record_run(run.finish(outcome));
        }

        result
    }

    fn prepare_backup(&self, chain_path: &Path, excluded: Vec<PathBuf>) -> Result<PreparedBackup> {
        info!("Backing up {:?}", self.root_path);

        let chain = SnapshotChain::load(chain_path, &self.root_path);
        let base = chain.build_state(Utc::now());
        debug!("Base state has {} entries from {} diff(s)", base.len(), chain.len());

        let progress = self.progress.clone();
        let live = self
            .tracker()
            .with_excluded_paths(excluded)
            .scan(progress.map(|cb| move |info: ProgressInfo| cb(info)))?;

        let diff = base.synchronize(&live).trim();
        if diff.is_empty() {
            info!("No changes detected in {:?}", self.root_path);
            return Err(SyncError::NoChanges);
        }

        Ok(PreparedBackup { chain, diff })
    }

    fn write_backup<W: Write>(
        &self,
        chain_path: &Path,
        prepared: PreparedBackup,
        output: W,
        run_id: uuid::Uuid,
    ) -> Result<BackupReport> {
        let start = Instant::now();
        let PreparedBackup { mut chain, diff } = prepared;
        let stats = diff.stats();
        let snapshot_date = diff.date;

        chain.append(diff.clone());

        let mut writer = ArchiveWriter::new(output);
        writer.append_chain(&chain.to_bytes()?)?;

        let total = stats.files_added;
        let mut warnings = Vec::new();
        for (idx, entry) in diff.payload_entries().enumerate() {
            let appended = utils::safe_join(&self.root_path, &entry.path)
                .and_then(|source| writer.append_payload(&entry.path, &source));

            if let Err(e) = appended {
                if writer.is_broken() {
                    return Err(e);
                }
                warn!("Skipping payload {}: {}", entry.path, e);
                self.note_warning(run_id, &entry.path, &e.to_string());
                warnings.push(format!("Failed to archive {}: {}", entry.path, e));
            }

            self.report_progress("Archiving files", Some(&entry.path), idx + 1, Some(total), writer.bytes());
        }

        let files_archived = writer.files();
        let bytes_archived = writer.bytes();
        let mut output = writer.finish()?;
        output.flush()?;

        // only a complete archive may advance the chain
        chain.save(chain_path)?;

        let report = BackupReport {
            snapshot_date,
            stats,
            files_archived,
            bytes_archived,
            chain_length: chain.len(),
            duration_ms: start.elapsed().as_millis() as u64,
            warnings,
        };

        info!(
            "Backup complete: +{} -{} ~{} ({} archived, {})",
            report.stats.files_added,
            report.stats.files_removed,
            report.stats.files_moved,
            report.files_archived,
            utils::format_bytes(report.bytes_archived)
        );
        Ok(report)
    }

    /// Apply the latest diff of an archive stream to the root
    ///
    /// # Errors
    ///
    /// - [`SyncError::Archive`] or [`SyncError::UnsafePath`] if the archive
    ///   is malformed
    /// - [`SyncError::Codec`] if the bundled chain cannot be decoded
    ///
    /// Failures on individual entries are reported as warnings instead.
    #[instrument(skip(self, input))]
    pub fn restore<R: Read>(&self, input: R) -> Result<RestoreReport> {
        let _flusher = self
            .catalog
            .as_ref()
            .map(|c| c.start_flusher(self.config.flush_interval()));
        let run = RunRecord::start(RunMode::Restore, &self.root_path);
        let run_id = run.id;

        let result = self.run_restore(input, run_id);

        if let Some(catalog) = &self.catalog {
            let mut run = run;
            let outcome = match &result {
                Ok(report) => {
                    run.files_added = report.files_restored;
                    run.files_removed = report.files_removed;
                    run.files_moved = report.files_moved;
                    run.bytes = report.bytes_written;
                    run.warnings = report.warnings.len();
                    RunOutcome::Succeeded
                }
                Err(e) => {
                    run.message = Some(e.to_string());
                    catalog.add_event(Some(run_id), EventLevel::Error, "restore", e.to_string());
                    RunOutcome::Failed
                }
            };
            catalog.record_run(run.finish(outcome));
        }

        result
    }

    /// Apply the latest diff of the archive file `input_path` to the root
    pub fn restore_from_file(&self, input_path: &Path) -> Result<RestoreReport> {
        let file = File::open(input_path)?;
        self.restore(BufReader::new(file))
    }

    fn run_restore<R: Read>(&self, input: R, run_id: uuid::Uuid) -> Result<RestoreReport> {
        info!("Restoring into {:?}", self.root_path);
        let start = Instant::now();

        fs::create_dir_all(&self.root_path)?;
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&self.root_path)?;

        let extracted = archive::extract_to(input, staging.path())?;
        let chain = SnapshotChain::from_bytes(&extracted.chain_blob)?;

        let mut report = RestoreReport::default();
        match chain.latest() {
            Some(diff) => {
                report.snapshot_date = Some(diff.date);
                self.apply_removes(diff, run_id, &mut report);
                self.apply_moves(diff, run_id, &mut report);
            }
            None => warn!("Archive chain is empty, only payloads will be restored"),
        }
        self.apply_payloads(&extracted.payload_root, run_id, &mut report);

        if let Err(e) = staging.close() {
            warn!("Failed to remove staging directory: {}", e);
            report.warnings.push(format!("Failed to remove staging directory: {}", e));
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Restore complete in {}ms ({} removed, {} moved, {} restored, {} warning(s))",
            report.duration_ms,
            report.files_removed,
            report.files_moved,
            report.files_restored,
            report.warnings.len()
        );
        Ok(report)
    }

    fn apply_removes(&self, diff: &Snapshot, run_id: uuid::Uuid, report: &mut RestoreReport) {
        for entry in diff.entries().iter().filter(|e| e.action == EntryAction::Remove) {
            let removed = utils::safe_join(&self.root_path, &entry.path).and_then(|path| {
                if path.symlink_metadata().is_err() {
                    trace!("Already absent: {}", entry.path);
                    return Ok(false);
                }
                fs::remove_file(&path)?;
                Ok(true)
            });

            match removed {
                Ok(true) => {
                    trace!("Removed {}", entry.path);
                    report.files_removed += 1;
                }
                Ok(false) => {}
                Err(e) => self.restore_warning(run_id, report, "remove", &entry.path, e),
            }
        }
    }

    fn apply_moves(&self, diff: &Snapshot, run_id: uuid::Uuid, report: &mut RestoreReport) {
        for entry in diff.entries() {
            let EntryAction::Move { from } = &entry.action else {
                continue;
            };

            let moved = utils::safe_join(&self.root_path, from).and_then(|source| {
                let destination = utils::safe_join(&self.root_path, &entry.path)?;
                if !source.is_file() {
                    if destination.is_file() {
                        trace!("Move {} -> {} already applied", from, entry.path);
                        return Ok(false);
                    }
                    return Err(SyncError::internal(format!("move source {} is missing", from)));
                }
                utils::ensure_parent(&destination)?;
                replace_file(&source, &destination)?;
                Ok(true)
            });

            match moved {
                Ok(true) => {
                    trace!("Moved {} -> {}", from, entry.path);
                    report.files_moved += 1;
                }
                Ok(false) => {}
                Err(e) => self.restore_warning(run_id, report, "move", &entry.path, e),
            }
        }
    }

    fn apply_payloads(&self, payload_root: &Path, run_id: uuid::Uuid, report: &mut RestoreReport) {
        if !payload_root.is_dir() {
            return;
        }

        for item in WalkDir::new(payload_root).sort_by_file_name() {
            let staged = match item {
                Ok(item) if item.file_type().is_file() => item.into_path(),
                Ok(_) => continue,
                Err(e) => {
                    let context = e.path().map(|p| p.display().to_string()).unwrap_or_default();
                    self.restore_warning(run_id, report, "restore", &context, e.into());
                    continue;
                }
            };

            let placed = utils::make_relative(&staged, payload_root)
                .and_then(|rel| utils::normalize_relative(&rel))
                .and_then(|rel| {
                    let destination = utils::safe_join(&self.root_path, &rel)?;
                    let length = fs::metadata(&staged)?.len();
                    utils::ensure_parent(&destination)?;
                    replace_file(&staged, &destination)?;
                    Ok((rel, length))
                });

            match placed {
                Ok((rel, length)) => {
                    trace!("Restored {}", rel);
                    report.files_restored += 1;
                    report.bytes_written += length;
                    self.report_progress("Restoring files", Some(&rel), report.files_restored, None, report.bytes_written);
                }
                Err(e) => {
                    let context = staged.display().to_string();
                    self.restore_warning(run_id, report, "restore", &context, e);
                }
            }
        }
    }

    fn restore_warning(
        &self,
        run_id: uuid::Uuid,
        report: &mut RestoreReport,
        step: &str,
        path: &str,
        error: SyncError,
    ) {
        warn!("Failed to {} {}: {}", step, path, error);
        self.note_warning(run_id, path, &error.to_string());
        report.warnings.push(format!("Failed to {} {}: {}", step, path, error));
    }

    fn note_warning(&self, run_id: uuid::Uuid, context: &str, message: &str) {
        if let Some(catalog) = &self.catalog {
            catalog.add_event(Some(run_id), EventLevel::Warning, context, message);
        }
    }

    fn report_progress(&self, operation: &str, item: Option<&str>, processed: usize, total: Option<usize>, bytes: u64) {
        if let Some(callback) = &self.progress {
            callback(ProgressInfo {
                operation: operation.to_string(),
                current_item: item.map(str::to_string),
                processed,
                total,
                bytes_processed: bytes,
            });
        }
    }

    fn tracker(&self) -> FileTracker {
        FileTracker::new(self.root_path.clone())
            .with_ignore_patterns(self.config.ignore_patterns.clone())
            .with_max_file_size(self.config.max_file_size)
            .with_follow_symlinks(self.config.follow_symlinks)
            .with_parallel_workers(self.config.parallel_workers)
    }
}

/// Rename `source` over `destination`, copying when rename is refused
fn replace_file(source: &Path, destination: &Path) -> Result<()> {
    if destination.is_dir() {
        return Err(SyncError::internal(format!(
            "{} is a directory",
            destination.display()
        )));
    }

    match fs::rename(source, destination) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            trace!("Rename failed ({}), copying instead", rename_err);
            if destination.exists() {
                fs::remove_file(destination)?;
            }
            fs::copy(source, destination)?;
            fs::remove_file(source)?;
            Ok(())
        }
    }
}

/// Builder for configuring a [`Synchronizer`]
///
/// # Examples
///
/// ```rust,no_run
/// use snapsync::Synchronizer;
///
/// # fn main() -> snapsync::Result<()> {
/// let sync = Synchronizer::builder()
///     .max_file_size(100 * 1024 * 1024)
///     .parallel_workers(4)
///     .catalog_dir("/var/lib/snapsync".into())
///     .build("/srv/data".into())?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct SynchronizerBuilder {
    config: SyncConfig,
    catalog: Option<Catalog>,
    progress: Option<ProgressCallback>,
}

impl SynchronizerBuilder {
    /// Builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Set ignore patterns (gitignore syntax)
    pub fn ignore_patterns(mut self, patterns: Vec<String>) -> Self {
        self.config.ignore_patterns = patterns;
        self
    }

    /// Skip files larger than `size` bytes (0 = no limit)
    pub fn max_file_size(mut self, size: u64) -> Self {
        self.config.max_file_size = size;
        self
    }

    /// Walker and hashing threads (0 = one per CPU)
    pub fn parallel_workers(mut self, count: usize) -> Self {
        self.config.parallel_workers = count;
        self
    }

    /// Follow symbolic links while walking
    pub fn follow_symlinks(mut self, follow: bool) -> Self {
        self.config.follow_symlinks = follow;
        self
    }

    /// Record runs in the catalog stored in `dir`
    pub fn catalog_dir(mut self, dir: PathBuf) -> Self {
        self.config.catalog_dir = Some(dir);
        self
    }

    /// Use an already opened catalog
    pub fn catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Receive progress updates while walking, archiving and restoring
    pub fn progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Build the synchronizer for `root_path`
    ///
    /// # Errors
    ///
    /// - [`SyncError::InvalidConfiguration`] if the configuration is invalid
    /// - any error from opening the catalog directory
    pub fn build(self, root_path: PathBuf) -> Result<Synchronizer> {
        self.config.validate()?;

        let catalog = match (self.catalog, &self.config.catalog_dir) {
            (Some(catalog), _) => Some(catalog),
            (None, Some(dir)) => Some(Catalog::open(dir.clone())?),
            (None, None) => None,
        };

        Ok(Synchronizer {
            root_path,
            config: self.config,
            catalog,
            progress: self.progress,
        })
    }
}
