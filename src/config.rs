//! Run configuration
//!
//! [`SyncConfig`] holds the knobs that are not part of a single command
//! line: walker filters, worker count and where the run catalog lives. It is
//! read from JSON, either an explicit `--config` file or `snapsync.json` in
//! the working directory. Every field has a default, so a partial file is
//! fine.
//!
//! ```json
//! {
//!   "ignore_patterns": ["*.tmp", "cache/"],
//!   "max_file_size": 1073741824,
//!   "catalog_dir": "/var/lib/snapsync"
//! }
//! ```

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// File name looked up in the working directory when no `--config` is given
pub const DEFAULT_CONFIG_FILE: &str = "snapsync.json";

/// Settings shared by backup and restore
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Extra ignore patterns, gitignore syntax
    pub ignore_patterns: Vec<String>,
    /// Follow symbolic links while walking
    pub follow_symlinks: bool,
    /// Walker and hashing threads (0 = one per CPU)
    pub parallel_workers: usize,
    /// Skip files larger than this many bytes (0 = unlimited)
    pub max_file_size: u64,
    /// Directory of the run catalog; no catalog when unset
    pub catalog_dir: Option<PathBuf>,
    /// Seconds between background catalog flushes
    pub flush_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ignore_patterns: Vec::new(),
            follow_symlinks: false,
            parallel_workers: 0,
            max_file_size: 0,
            catalog_dir: None,
            flush_interval_secs: 5,
        }
    }
}

impl SyncConfig {
    /// Read a configuration file
    ///
    /// # Errors
    ///
    /// - [`SyncError::InvalidConfiguration`] if the file is missing, is not
    ///   valid JSON or fails validation
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .map_err(|e| SyncError::config(format!("Cannot read config {:?}: {}", path, e)))?;
        let config: SyncConfig = serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::config(format!("Malformed config {:?}: {}", path, e)))?;
        config.validate()?;

        debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Resolve the configuration for a run
    ///
    /// An explicit path must exist. Without one, `snapsync.json` in
    /// `working_dir` is used when present, otherwise the defaults.
    pub fn discover(explicit: Option<&Path>, working_dir: &Path) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        let candidate = working_dir.join(DEFAULT_CONFIG_FILE);
        if candidate.is_file() {
            Self::load(&candidate)
        } else {
            Ok(Self::default())
        }
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> Result<()> {
        if self.flush_interval_secs == 0 {
            return Err(SyncError::config("flush_interval_secs must be at least 1"));
        }
        Ok(())
    }

    /// Catalog flush period
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}
