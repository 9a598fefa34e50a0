//! Persisted chain of diff snapshots
//!
//! A [`SnapshotChain`] is the append-only history of one tree. Every backup
//! appends one trimmed diff; any historical state is rebuilt by folding
//! [`Snapshot::patch`] over the diffs in date order.
//!
//! The whole chain is serialized as JSON and compressed with the codec in
//! [`crate::compression`]. The same blob is written to the chain file and
//! bundled into every archive, so an archive is self-describing.

use crate::compression;
use crate::error::Result;
use crate::snapshot::Snapshot;
use crate::utils;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Ordered diff snapshots for one tree root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotChain {
    /// Root the chain describes
    pub archive_path: PathBuf,
    snapshots: Vec<Snapshot>,
}

impl SnapshotChain {
    /// Empty chain for `archive_path`
    pub fn new(archive_path: impl Into<PathBuf>) -> Self {
        Self {
            archive_path: archive_path.into(),
            snapshots: Vec::new(),
        }
    }

    /// Load the chain stored at `path`
    ///
    /// A missing file yields an empty chain. So does a file that cannot be
    /// read or decoded; that case is logged as a warning because the next
    /// backup will then start a fresh history.
    pub fn load(path: &Path, archive_path: &Path) -> Self {
        if !path.exists() {
            debug!("No chain at {:?}, starting empty", path);
            return Self::new(archive_path);
        }

        let loaded = fs::read(path)
            .map_err(Into::into)
            .and_then(|bytes| Self::from_bytes(&bytes));

        match loaded {
            Ok(chain) => {
                debug!("Loaded chain with {} snapshot(s) from {:?}", chain.len(), path);
                chain
            }
            Err(e) => {
                warn!("Chain at {:?} is unreadable, treating it as empty: {}", path, e);
                Self::new(archive_path)
            }
        }
    }

    /// Decode a chain blob
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let json = compression::decode(bytes)?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// Encode this chain into a blob
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        Ok(compression::encode(&json))
    }

    /// Write the chain to `path` atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        utils::atomic_write(path, &bytes)?;
        info!(
            "Saved chain with {} snapshot(s) to {:?} ({})",
            self.len(),
            path,
            utils::format_bytes(bytes.len() as u64)
        );
        Ok(())
    }

    /// Append a diff snapshot
    pub fn append(&mut self, diff: Snapshot) {
        debug!("Appending diff dated {} with {} entries", diff.date, diff.len());
        self.snapshots.push(diff);
    }

    /// Reconstruct the tree state as of `as_of`
    ///
    /// Diffs are ordered by date (ties keep insertion order) and every diff
    /// dated at or before `as_of` is patched onto an empty state. When no
    /// diff qualifies the result is an empty state.
    pub fn build_state(&self, as_of: DateTime<Utc>) -> Snapshot {
        let mut ordered: Vec<&Snapshot> = self
            .snapshots
            .iter()
            .filter(|snapshot| snapshot.date <= as_of)
            .collect();
        ordered.sort_by_key(|snapshot| snapshot.date);

        let state = ordered
            .iter()
            .fold(Snapshot::empty(), |state, diff| state.patch(diff));

        debug!(
            "Built state as of {} from {} diff(s): {} entries",
            as_of,
            ordered.len(),
            state.len()
        );
        state
    }

    /// Most recent diff; on equal dates the one appended last
    pub fn latest(&self) -> Option<&Snapshot> {
        self.snapshots
            .iter()
            .enumerate()
            .max_by_key(|(idx, snapshot)| (snapshot.date, *idx))
            .map(|(_, snapshot)| snapshot)
    }

    /// Diffs in insertion order
    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    /// Number of diffs
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Whether the chain has no diffs
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
