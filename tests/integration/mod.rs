//! Integration tests for snapsync
//!
//! Drives several backup generations against a live tree and replays each
//! archive onto a mirror, checking that the mirror and the chain both track
//! the source exactly.

use ::snapsync::file_tracking::FileTracker;
use ::snapsync::utils::hash_data;
use ::snapsync::*;
use filetime::FileTime;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::info;

/// First mtime handed out by the harness clock
const EPOCH_SECS: i64 = 1_600_000_000;

/// Test harness for multi-generation backup scenarios
pub struct SyncTestHarness {
    pub source_dir: TempDir,
    pub mirror_dir: TempDir,
    pub work_dir: TempDir,
    pub source: Synchronizer,
    pub mirror: Synchronizer,
    pub rng: StdRng,
    pub clock: i64,
    pub generation: usize,
    next_id: usize,
}

impl SyncTestHarness {
    /// Create a new harness with an empty source and mirror
    pub fn new(seed: u64) -> Self {
        let source_dir = TempDir::new().unwrap();
        let mirror_dir = TempDir::new().unwrap();
        let work_dir = TempDir::new().unwrap();

        let source = Synchronizer::builder()
            .parallel_workers(2)
            .catalog_dir(work_dir.path().join("catalog"))
            .build(source_dir.path().to_path_buf())
            .unwrap();
        let mirror = Synchronizer::new(mirror_dir.path().to_path_buf());

        Self {
            source_dir,
            mirror_dir,
            work_dir,
            source,
            mirror,
            rng: StdRng::seed_from_u64(seed),
            clock: EPOCH_SECS,
            generation: 0,
            next_id: 0,
        }
    }

    pub fn chain_path(&self) -> PathBuf {
        self.work_dir.path().join("source.chain")
    }

    fn random_content(&mut self) -> Vec<u8> {
        let id = self.next_id;
        self.next_id += 1;
        let size = self.rng.random_range(16..512);
        let mut content = format!("{}:", id).into_bytes();
        content.extend((0..size).map(|_| self.rng.random::<u8>()));
        content
    }

    /// Write a file stamped with the current harness clock
    pub fn write_file(&mut self, relative: &str, content: &[u8]) -> anyhow::Result<()> {
        let path = self.source_dir.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content)?;
        filetime::set_file_mtime(&path, FileTime::from_unix_time(self.clock, 0))?;
        Ok(())
    }

    /// Relative paths of every file in the source
    pub fn live_files(&self) -> Vec<String> {
        tree_digests(self.source_dir.path()).into_keys().collect()
    }

    /// Apply a random mix of edits, deletions, renames and new files
    pub fn churn(&mut self) -> anyhow::Result<()> {
        self.generation += 1;
        self.clock += 10;

        for relative in self.live_files() {
            match self.rng.random_range(0..10) {
                0 | 1 => {
                    let content = self.random_content();
                    self.write_file(&relative, &content)?;
                }
                2 => fs::remove_file(self.source_dir.path().join(&relative))?,
                3 => {
                    let target = format!("renamed/gen{}_{}.bin", self.generation, self.next_id);
                    self.next_id += 1;
                    let to = self.source_dir.path().join(&target);
                    fs::create_dir_all(to.parent().unwrap())?;
                    fs::rename(self.source_dir.path().join(&relative), to)?;
                }
                _ => {}
            }
        }

        let new_files = self.rng.random_range(1..5);
        for idx in 0..new_files {
            let content = self.random_content();
            let relative = format!("gen{}/dir{}/file{}.bin", self.generation, idx % 2, idx);
            self.write_file(&relative, &content)?;
        }
        Ok(())
    }

    /// Back up the source, restore into the mirror, check both agree
    pub fn round(&mut self) -> anyhow::Result<BackupReport> {
        let archive = self.work_dir.path().join(format!("gen_{:03}.tar", self.generation));
        let report = self.source.backup_to_file(&self.chain_path(), &archive)?;
        info!("Generation {}: {:?}", self.generation, report.stats);

        let restored = self.mirror.restore_from_file(&archive)?;
        anyhow::ensure!(restored.is_clean(), "restore warnings: {:?}", restored.warnings);
        anyhow::ensure!(
            tree_digests(self.source_dir.path()) == tree_digests(self.mirror_dir.path()),
            "mirror diverged at generation {}",
            self.generation
        );

        let recorded: Vec<(String, String)> = self
            .source
            .current_state(&self.chain_path())
            .entries()
            .iter()
            .map(|e| (e.path.clone(), e.digest.clone()))
            .collect();
        let live: Vec<(String, String)> = FileTracker::new(self.source_dir.path().to_path_buf())
            .with_excluded_paths(vec![self.chain_path()])
            .scan(None::<fn(ProgressInfo)>)?
            .entries()
            .iter()
            .map(|e| (e.path.clone(), e.digest.clone()))
            .collect();
        anyhow::ensure!(recorded == live, "chain state diverged at generation {}", self.generation);

        Ok(report)
    }
}

/// Map of relative path to content digest for every file under `root`
pub fn tree_digests(root: &Path) -> BTreeMap<String, String> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/");
            (rel, hash_data(&fs::read(e.path()).unwrap()))
        })
        .collect()
}

fn numbered_lines(start: usize, end: usize) -> String {
    (start..end).map(|i| i.to_string()).collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_then_restore_two_generations() {
        let holding = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        let destination = TempDir::new().unwrap();
        let chain = holding.path().join("snap.chain");
        let base_time = FileTime::from_unix_time(EPOCH_SECS, 0);
        let later = FileTime::from_unix_time(EPOCH_SECS + 100, 0);

        let add_file = |name: &str, start: usize, end: usize, mtime: FileTime| {
            let path = source.path().join(name);
            fs::write(&path, numbered_lines(start, end)).unwrap();
            filetime::set_file_mtime(&path, mtime).unwrap();
        };

        for (name, start) in [
            ("file1.txt", 1000),
            ("file2.txt", 2000),
            ("file3.txt", 3000),
            ("file4.txt", 4000),
            ("file5.txt", 5000),
            ("file7.txt", 7000),
        ] {
            add_file(name, start, start + 1000, base_time);
        }

        let sync = Synchronizer::new(source.path().to_path_buf());
        let first = sync
            .backup_to_file(&chain, &holding.path().join("01_test.tar"))
            .unwrap();
        assert_eq!(first.stats.files_added, 6);

        fs::remove_file(source.path().join("file1.txt")).unwrap();
        add_file("file5.txt", 5500, 6000, later);
        add_file("file6.txt", 6000, 7000, later);
        fs::rename(source.path().join("file7.txt"), source.path().join("file8.txt")).unwrap();

        let second = sync
            .backup_to_file(&chain, &holding.path().join("02_test.tar"))
            .unwrap();
        assert_eq!(second.stats.files_added, 2);
        assert_eq!(second.stats.files_removed, 1);
        assert_eq!(second.stats.files_moved, 1);
        assert_eq!(second.files_archived, 2);
        assert_eq!(second.chain_length, 2);

        let target = Synchronizer::new(destination.path().to_path_buf());
        let read = |name: &str| fs::read_to_string(destination.path().join(name)).unwrap();

        target.restore_from_file(&holding.path().join("01_test.tar")).unwrap();
        assert_eq!(read("file1.txt"), numbered_lines(1000, 2000));
        assert_eq!(read("file2.txt"), numbered_lines(2000, 3000));
        assert_eq!(read("file3.txt"), numbered_lines(3000, 4000));
        assert_eq!(read("file4.txt"), numbered_lines(4000, 5000));
        assert_eq!(read("file5.txt"), numbered_lines(5000, 6000));
        assert_eq!(read("file7.txt"), numbered_lines(7000, 8000));

        let report = target.restore_from_file(&holding.path().join("02_test.tar")).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.files_removed, 1);
        assert_eq!(report.files_moved, 1);
        assert_eq!(report.files_restored, 2);
        assert!(!destination.path().join("file1.txt").exists());
        assert!(!destination.path().join("file7.txt").exists());
        assert_eq!(read("file2.txt"), numbered_lines(2000, 3000));
        assert_eq!(read("file3.txt"), numbered_lines(3000, 4000));
        assert_eq!(read("file4.txt"), numbered_lines(4000, 5000));
        assert_eq!(read("file5.txt"), numbered_lines(5500, 6000));
        assert_eq!(read("file6.txt"), numbered_lines(6000, 7000));
        assert_eq!(read("file8.txt"), numbered_lines(7000, 8000));
    }

    #[test]
    fn test_state_as_of_earlier_generation() {
        let mut harness = SyncTestHarness::new(7);
        harness.write_file("keep.txt", b"keep").unwrap();
        harness.write_file("drop.txt", b"drop").unwrap();
        harness.round().unwrap();
        let first_date = chrono::Utc::now();

        std::thread::sleep(std::time::Duration::from_millis(10));
        fs::remove_file(harness.source_dir.path().join("drop.txt")).unwrap();
        harness.generation += 1;
        harness.round().unwrap();

        let chain = SnapshotChain::load(&harness.chain_path(), harness.source_dir.path());
        assert_eq!(chain.len(), 2);

        let then: Vec<_> = chain
            .build_state(first_date)
            .entries()
            .iter()
            .map(|e| e.path.clone())
            .collect();
        assert_eq!(then, vec!["drop.txt", "keep.txt"]);

        let now = chain.build_state(chrono::Utc::now());
        assert!(now.get("drop.txt").is_none());
        assert!(now.get("keep.txt").is_some());
    }

    #[test]
    fn test_random_churn_keeps_mirror_in_sync() {
        let mut harness = SyncTestHarness::new(42);
        for idx in 0..12 {
            let content = format!("seed file {}", idx);
            harness
                .write_file(&format!("seed/{}/file{}.txt", idx % 3, idx), content.as_bytes())
                .unwrap();
        }
        harness.round().unwrap();

        let mut moved = 0;
        for _ in 0..6 {
            harness.churn().unwrap();
            let report = harness.round().unwrap();
            moved += report.stats.files_moved;
        }
        assert!(moved > 0, "seeded churn should include renames");

        let runs = harness.source.catalog().unwrap().runs();
        assert_eq!(runs.len(), 7);
        assert!(runs.iter().all(|r| r.outcome == RunOutcome::Succeeded));
    }

    #[test]
    fn test_renamed_directory_is_a_set_of_moves() {
        let mut harness = SyncTestHarness::new(3);
        for idx in 0..5 {
            harness
                .write_file(&format!("album/photo{}.jpg", idx), format!("pixels {}", idx).as_bytes())
                .unwrap();
        }
        harness.round().unwrap();

        fs::rename(
            harness.source_dir.path().join("album"),
            harness.source_dir.path().join("album-2024"),
        )
        .unwrap();
        harness.generation += 1;
        let report = harness.round().unwrap();

        assert_eq!(report.stats.files_moved, 5);
        assert_eq!(report.stats.files_added, 0);
        assert_eq!(report.files_archived, 0);
    }
}
