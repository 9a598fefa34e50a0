//! Snapshot diffing, patching and trimming
//!
//! A [`Snapshot`] is an ordered set of [`Entry`] values keyed by path. The
//! same type plays two roles:
//!
//! - a **state** snapshot describes a concrete tree; every action is
//!   [`EntryAction::None`]
//! - a **diff** snapshot describes how to get from one state to the next;
//!   entries carry `Add`, `Remove` or `Move` tags
//!
//! All three operations borrow their inputs and build a fresh result, so a
//! snapshot is never modified after it has been produced.
//!
//! ## Rename detection
//!
//! `synchronize` indexes the base by digest, keeping only digests that occur
//! once. A new path whose digest hits that index is a rename when the
//! candidate also has the exact same mtime and has disappeared from the
//! target. Anything else is an `Add`.
//!
//! ## Example
//!
//! ```rust
//! use snapsync::{Entry, EntryAction, Snapshot};
//! use chrono::{Duration, Utc};
//!
//! let t0 = Utc::now();
//! let base = Snapshot::from_entries(t0, vec![
//!     Entry::new("a.txt", "h-a", 1, t0),
//!     Entry::new("b.txt", "h-b", 1, t0),
//! ]);
//! let live = Snapshot::from_entries(t0 + Duration::hours(1), vec![
//!     Entry::new("a.txt", "h-a", 1, t0),
//!     Entry::new("c.txt", "h-b", 1, t0),
//! ]);
//!
//! let diff = base.synchronize(&live).trim();
//! assert_eq!(diff.len(), 1);
//! assert_eq!(diff.get("c.txt").unwrap().action, EntryAction::Move { from: "b.txt".into() });
//!
//! let next = base.patch(&diff);
//! assert!(next.is_state());
//! assert!(next.get("b.txt").is_none());
//! ```

use crate::collections::{self, FastMap, FastSet};
use crate::types::{ChangeStats, Entry, EntryAction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Entries of one point in time, sorted and unique by path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Creation timestamp, orders snapshots within a chain
    pub date: DateTime<Utc>,
    entries: Vec<Entry>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::empty()
    }
}

impl Snapshot {
    /// Empty state snapshot dated at the Unix epoch
    pub fn empty() -> Self {
        Self {
            date: DateTime::<Utc>::default(),
            entries: Vec::new(),
        }
    }

    /// Build a snapshot from arbitrary entries
    ///
    /// Entries are sorted by path. When a path appears more than once the
    /// last occurrence wins.
    pub fn from_entries(date: DateTime<Utc>, entries: Vec<Entry>) -> Self {
        let total = entries.len();
        let map: BTreeMap<String, Entry> = entries
            .into_iter()
            .map(|entry| (entry.path.clone(), entry))
            .collect();
        if map.len() != total {
            debug!("Dropped {} duplicate path(s) while building snapshot", total - map.len());
        }
        Self::from_map(date, map)
    }

    fn from_map(date: DateTime<Utc>, map: BTreeMap<String, Entry>) -> Self {
        Self {
            date,
            entries: map.into_values().collect(),
        }
    }

    /// All entries, ordered by path
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Look up an entry by its relative path
    pub fn get(&self, path: &str) -> Option<&Entry> {
        self.entries
            .binary_search_by(|entry| entry.path.as_str().cmp(path))
            .ok()
            .map(|idx| &self.entries[idx])
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when every entry is untagged
    pub fn is_state(&self) -> bool {
        self.entries.iter().all(|entry| !entry.action.is_change())
    }

    /// Entries whose content has to travel with a backup
    pub fn payload_entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries
            .iter()
            .filter(|entry| entry.action == EntryAction::Add)
    }

    /// Counts of each action in this snapshot
    pub fn stats(&self) -> ChangeStats {
        ChangeStats::from_entries(&self.entries)
    }

    /// Compare this state (the base) with `target` and tag the differences
    ///
    /// Both inputs are expected to be state snapshots. The result contains
    /// every base entry (untouched ones stay `None`) plus every new target
    /// entry, and is dated with the target's date.
    pub fn synchronize(&self, target: &Snapshot) -> Snapshot {
        let candidates = self.rename_candidates();
        let target_paths: FastSet<&str> = target
            .entries
            .iter()
            .map(|entry| entry.path.as_str())
            .collect();
        let mut consumed: FastSet<&str> = FastSet::default();

        let mut result: BTreeMap<String, Entry> = self
            .entries
            .iter()
            .map(|entry| (entry.path.clone(), entry.reset()))
            .collect();

        for incoming in &target.entries {
            if let Some(existing) = result.get_mut(incoming.path.as_str()) {
                if incoming.last_modified > existing.last_modified {
                    trace!("Modified: {}", incoming.path);
                    existing.last_modified = incoming.last_modified;
                    existing.digest = incoming.digest.clone();
                    existing.length = incoming.length;
                    existing.action = EntryAction::Add;
                }
                continue;
            }

            let rename_source = candidates.get(incoming.digest.as_str()).filter(|candidate| {
                candidate.last_modified == incoming.last_modified
                    && !target_paths.contains(candidate.path.as_str())
                    && !consumed.contains(candidate.path.as_str())
            });

            match rename_source {
                Some(source) => {
                    trace!("Moved: {} -> {}", source.path, incoming.path);
                    consumed.insert(source.path.as_str());
                    result.remove(source.path.as_str());
                    let moved = incoming.clone().with_action(EntryAction::Move {
                        from: source.path.clone(),
                    });
                    result.insert(incoming.path.clone(), moved);
                }
                None => {
                    trace!("Added: {}", incoming.path);
                    result.insert(
                        incoming.path.clone(),
                        incoming.clone().with_action(EntryAction::Add),
                    );
                }
            }
        }

        for entry in &self.entries {
            if target_paths.contains(entry.path.as_str()) {
                continue;
            }
            // Absent when the entry was consumed by a rename
            if let Some(gone) = result.get_mut(entry.path.as_str()) {
                trace!("Removed: {}", entry.path);
                gone.action = EntryAction::Remove;
            }
        }

        let diff = Snapshot::from_map(target.date, result);
        debug!(
            "Synchronized {} base entries against {} target entries: {:?}",
            self.len(),
            target.len(),
            diff.stats()
        );
        diff
    }

    /// Apply a diff on top of this state and return the next state
    ///
    /// The result is dated with the diff's date and every entry is `None`.
    /// Re-applying a diff that has already been applied leaves the state
    /// unchanged.
    pub fn patch(&self, diff: &Snapshot) -> Snapshot {
        let removed: FastSet<&str> = diff
            .entries
            .iter()
            .filter(|entry| entry.action == EntryAction::Remove)
            .map(|entry| entry.path.as_str())
            .collect();

        let mut result: BTreeMap<String, Entry> = self
            .entries
            .iter()
            .filter(|entry| !removed.contains(entry.path.as_str()))
            .map(|entry| (entry.path.clone(), entry.reset()))
            .collect();

        for added in diff.payload_entries() {
            match result.get_mut(added.path.as_str()) {
                Some(existing) => {
                    // never regress
                    if added.last_modified >= existing.last_modified {
                        existing.last_modified = added.last_modified;
                        existing.digest = added.digest.clone();
                        existing.length = added.length;
                    }
                }
                None => {
                    result.insert(added.path.clone(), added.reset());
                }
            }
        }

        for moved in &diff.entries {
            let EntryAction::Move { from } = &moved.action else {
                continue;
            };

            if let Some(mut source) = result.remove(from.as_str()) {
                source.path = moved.path.clone();
                source.last_modified = moved.last_modified;
                source.digest = moved.digest.clone();
                source.length = moved.length;
                result.insert(moved.path.clone(), source);
                continue;
            }

            match result.get(moved.path.as_str()) {
                Some(existing) if existing.digest == moved.digest => {
                    trace!("Move {} -> {} already applied", from, moved.path);
                }
                _ => {
                    trace!("Move source {} missing, inserting {}", from, moved.path);
                    result.insert(moved.path.clone(), moved.reset());
                }
            }
        }

        Snapshot::from_map(diff.date, result)
    }

    /// Keep only the tagged entries
    pub fn trim(&self) -> Snapshot {
        Snapshot {
            date: self.date,
            entries: self
                .entries
                .iter()
                .filter(|entry| entry.action.is_change())
                .cloned()
                .collect(),
        }
    }

    /// Base entries whose digest is unique, keyed by digest
    fn rename_candidates(&self) -> FastMap<&str, &Entry> {
        let mut by_digest: FastMap<&str, Option<&Entry>> = collections::map_with_capacity(self.entries.len());
        for entry in &self.entries {
            by_digest
                .entry(entry.digest.as_str())
                .and_modify(|slot| *slot = None)
                .or_insert(Some(entry));
        }

        by_digest
            .into_iter()
            .filter_map(|(digest, entry)| entry.map(|entry| (digest, entry)))
            .collect()
    }
}
