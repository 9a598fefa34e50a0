//! # snapsync
//!
//! Incremental, content-addressed backup of a file tree built on composable
//! diff snapshots.
//!
//! ## Overview
//!
//! snapsync detects what changed in a directory since the last backup
//! (additions, removals, renames, modifications), stores that change-set as a
//! compact diff snapshot, and ships it together with the content of the new
//! or modified files in a single tar archive. Any historical state of the
//! tree can be rebuilt by folding the chain of diffs, and an archive can be
//! replayed onto a live tree to bring it forward.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use snapsync::Synchronizer;
//! use std::path::Path;
//!
//! # fn main() -> snapsync::Result<()> {
//! let sync = Synchronizer::new("./documents".into());
//!
//! // First run archives everything, later runs only what changed
//! let report = sync.backup_to_file(Path::new("documents.chain"), Path::new("backup-1.tar"))?;
//! println!(
//!     "+{} -{} ~{}",
//!     report.stats.files_added, report.stats.files_removed, report.stats.files_moved
//! );
//!
//! // Replay the archive onto another copy of the tree
//! let mirror = Synchronizer::new("./mirror".into());
//! let restored = mirror.restore_from_file(Path::new("backup-1.tar"))?;
//! println!("{} files written", restored.files_restored);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ### The engine
//!
//! The core is pure and lives in [`snapshot`] and [`chain`]:
//!
//! - [`Snapshot::synchronize`] compares a base state with a target state and
//!   tags every path `Add`, `Remove`, `Move { from }` or `None`
//! - [`Snapshot::patch`] applies a diff to a state
//! - [`Snapshot::trim`] drops untagged entries
//! - [`SnapshotChain::build_state`] folds the chain up to a point in time
//!
//! None of these touch the filesystem or mutate their inputs.
//!
//! ### Rename detection
//!
//! A new path is a rename of an old one when their content digests match,
//! that digest is unique in the base, the mtimes are identical and the old
//! path is gone. Anything less certain is recorded as an add, which costs
//! bandwidth but never loses data.
//!
//! ### Collaborators
//!
//! - [`file_tracking`]: parallel walker producing state snapshots
//! - [`compression`]: LZ4 codec for the persisted chain
//! - [`archive`]: tar layout of a backup
//! - [`catalog`]: JSON log of runs and their warnings
//! - [`config`]: JSON configuration file
//! - [`sync`]: backup and restore flows
//!
//! ## Error Handling
//!
//! All fallible operations return [`Result<T>`] with [`SyncError`]. A backup
//! with nothing to do returns [`SyncError::NoChanges`]. Restore never fails
//! on a single entry; such failures are listed in
//! [`RestoreReport::warnings`].

// Public API modules
pub mod archive;
pub mod catalog;
pub mod chain;
pub mod compression;
pub mod config;
pub mod error;
pub mod file_tracking;
pub mod snapshot;
pub mod sync;
pub mod types;
pub mod utils;

// Internal modules
mod collections;

// Re-export main types for convenience
pub use catalog::{Catalog, EventLevel, EventRecord, RunMode, RunOutcome, RunRecord};
pub use chain::SnapshotChain;
pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use snapshot::Snapshot;
pub use sync::{Synchronizer, SynchronizerBuilder};
pub use types::*;
