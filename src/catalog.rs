//! Run catalog
//!
//! A small JSON store that remembers every backup and restore run and the
//! warnings they produced. It lives in its own directory:
//!
//! - `runs.json`: one [`RunRecord`] per run
//! - `events.json`: [`EventRecord`]s (skipped payloads, failed restores,
//!   fatal errors)
//!
//! Several processes may share one catalog. Writers take an exclusive OS
//! lock on `catalog.lock` (bounded wait) and, before writing, merge any
//! records other processes appended since this process last read the
//! files. Records are append-only, so the merge is a splice.
//!
//! Long runs flush periodically through [`Catalog::start_flusher`]; the
//! returned [`FlushGuard`] stops the thread and flushes one last time when
//! dropped.

use crate::error::{Result, SyncError};
use crate::utils;
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use uuid::Uuid;

const RUNS_FILE: &str = "runs.json";
const EVENTS_FILE: &str = "events.json";
const LOCK_FILE: &str = "catalog.lock";

/// Default bound on waiting for `catalog.lock`
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between attempts on a contended lock
const LOCK_RETRY: Duration = Duration::from_millis(25);

/// Which flow a run executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Walk, diff and archive
    Backup,
    /// Apply an archive to a tree
    Restore,
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Still in progress (or the process died)
    Running,
    /// Finished, possibly with warnings
    Succeeded,
    /// Backup found nothing to archive
    NoChanges,
    /// Aborted with an error
    Failed,
}

/// One backup or restore run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Unique run id
    pub id: Uuid,
    /// Machine the run executed on
    pub host: String,
    /// Backup or restore
    pub mode: RunMode,
    /// Tree root
    pub root: PathBuf,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time, unset while running
    pub finished_at: Option<DateTime<Utc>>,
    /// Final state
    pub outcome: RunOutcome,
    /// Files added (backup) or restored (restore)
    pub files_added: usize,
    /// Files removed
    pub files_removed: usize,
    /// Files moved
    pub files_moved: usize,
    /// Payload bytes archived or written
    pub bytes: u64,
    /// Number of warnings
    pub warnings: usize,
    /// Error message for failed runs
    pub message: Option<String>,
}

impl RunRecord {
    /// Record for a run starting now on this host
    pub fn start(mode: RunMode, root: impl Into<PathBuf>) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            id: Uuid::new_v4(),
            host,
            mode,
            root: root.into(),
            started_at: Utc::now(),
            finished_at: None,
            outcome: RunOutcome::Running,
            files_added: 0,
            files_removed: 0,
            files_moved: 0,
            bytes: 0,
            warnings: 0,
            message: None,
        }
    }

    /// Stamp the end time and outcome
    pub fn finish(mut self, outcome: RunOutcome) -> Self {
        self.finished_at = Some(Utc::now());
        self.outcome = outcome;
        self
    }
}

/// Severity of an [`EventRecord`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    /// Informational
    Info,
    /// Skipped entry, processing continued
    Warning,
    /// Run aborted
    Error,
}

/// A message tied to a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// When it happened
    pub time: DateTime<Utc>,
    /// Run that produced it
    pub run_id: Option<Uuid>,
    /// Severity
    pub level: EventLevel,
    /// What was being worked on, usually an entry path
    pub context: String,
    /// Description
    pub message: String,
}

#[derive(Debug, Default)]
struct CatalogState {
    runs: Vec<RunRecord>,
    events: Vec<EventRecord>,
    persisted_runs: usize,
    persisted_events: usize,
}

/// Shared handle on a catalog directory
///
/// Cloning is cheap; all clones see the same in-memory records.
#[derive(Debug, Clone)]
pub struct Catalog {
    dir: PathBuf,
    lock_timeout: Duration,
    state: Arc<Mutex<CatalogState>>,
}

impl Catalog {
    /// Open (creating if needed) the catalog in `dir`
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_timeout(dir, DEFAULT_LOCK_TIMEOUT)
    }

    /// Open with a custom bound on lock waits
    pub fn open_with_timeout(dir: impl Into<PathBuf>, lock_timeout: Duration) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let (runs, events) = {
            let _lock = CatalogLock::acquire(&dir, lock_timeout)?;
            (
                read_records::<RunRecord>(&dir.join(RUNS_FILE))?,
                read_records::<EventRecord>(&dir.join(EVENTS_FILE))?,
            )
        };

        debug!(
            "Opened catalog {:?}: {} run(s), {} event(s)",
            dir,
            runs.len(),
            events.len()
        );

        let state = CatalogState {
            persisted_runs: runs.len(),
            persisted_events: events.len(),
            runs,
            events,
        };

        Ok(Self {
            dir,
            lock_timeout,
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Directory backing this catalog
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append a run record
    ///
    /// Records are never rewritten once flushed, so callers record a run
    /// when it has finished.
    pub fn record_run(&self, run: RunRecord) {
        self.state.lock().runs.push(run);
    }

    /// Append an event
    pub fn add_event(
        &self,
        run_id: Option<Uuid>,
        level: EventLevel,
        context: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.state.lock().events.push(EventRecord {
            time: Utc::now(),
            run_id,
            level,
            context: context.into(),
            message: message.into(),
        });
    }

    /// Snapshot of all run records
    pub fn runs(&self) -> Vec<RunRecord> {
        self.state.lock().runs.clone()
    }

    /// Snapshot of all events
    pub fn events(&self) -> Vec<EventRecord> {
        self.state.lock().events.clone()
    }

    /// Write pending records, merging what other processes appended
    ///
    /// # Errors
    ///
    /// - [`SyncError::LockTimeout`] if the lock cannot be taken in time
    /// - [`SyncError::Catalog`] if a catalog file is malformed
    pub fn flush(&self) -> Result<()> {
        // file lock first so recording never waits on another process
        let _lock = CatalogLock::acquire(&self.dir, self.lock_timeout)?;
        let mut state = self.state.lock();

        let CatalogState {
            runs,
            events,
            persisted_runs,
            persisted_events,
        } = &mut *state;

        merge_and_write(&self.dir.join(RUNS_FILE), runs, persisted_runs)?;
        merge_and_write(&self.dir.join(EVENTS_FILE), events, persisted_events)?;
        trace!("Flushed catalog {:?}", self.dir);
        Ok(())
    }

    /// Flush every `interval` on a background thread until the guard drops
    pub fn start_flusher(&self, interval: Duration) -> FlushGuard {
        let signal = Arc::new((Mutex::new(false), Condvar::new()));
        let catalog = self.clone();
        let thread_signal = Arc::clone(&signal);

        let spawned = std::thread::Builder::new()
            .name("snapsync-catalog".to_string())
            .spawn(move || {
                let (stop, cvar) = &*thread_signal;
                loop {
                    {
                        let mut stopped = stop.lock();
                        if !*stopped {
                            cvar.wait_for(&mut stopped, interval);
                        }
                        if *stopped {
                            break;
                        }
                    }
                    if let Err(e) = catalog.flush() {
                        warn!("Periodic catalog flush failed: {}", e);
                    }
                }
            });

        let handle = match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Could not start catalog flusher, flushing on drop only: {}", e);
                None
            }
        };

        FlushGuard {
            catalog: self.clone(),
            signal,
            handle,
        }
    }
}

/// Stops the periodic flusher and flushes once more when dropped
pub struct FlushGuard {
    catalog: Catalog,
    signal: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for FlushGuard {
    fn drop(&mut self) {
        {
            let (stop, cvar) = &*self.signal;
            *stop.lock() = true;
            cvar.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Catalog flusher thread panicked");
            }
        }
        if let Err(e) = self.catalog.flush() {
            warn!("Final catalog flush failed: {}", e);
        }
    }
}

/// Exclusive OS lock on `catalog.lock`, released when dropped
struct CatalogLock {
    file: File,
}

impl CatalogLock {
    fn acquire(dir: &Path, timeout: Duration) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let start = Instant::now();

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file }),
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    if start.elapsed() >= timeout {
                        return Err(SyncError::LockTimeout(path));
                    }
                    std::thread::sleep(LOCK_RETRY);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for CatalogLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release catalog lock: {}", e);
        }
    }
}

fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::Catalog(format!("{:?} is malformed: {}", path, e))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Splice records appended on disk since `persisted` ahead of ours, write
fn merge_and_write<T>(path: &Path, records: &mut Vec<T>, persisted: &mut usize) -> Result<()>
where
    T: Serialize + DeserializeOwned,
{
    let on_disk: Vec<T> = read_records(path)?;
    if on_disk.len() > *persisted {
        let foreign = on_disk.len() - *persisted;
        debug!("Merging {} record(s) appended to {:?} by another process", foreign, path);
        let mine = records.split_off(*persisted);
        *records = on_disk;
        records.extend(mine);
    }

    utils::atomic_write(path, &serde_json::to_vec_pretty(records)?)?;
    *persisted = records.len();
    Ok(())
}
