//! Main test module for snapsync
//!
//! This module includes all test suites:
//! - Integration tests for multi-run backup and restore scenarios
//! - Property-based tests for the snapshot engine

pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::snapsync::*;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn backup_and_restore(source: &Path, work: &Path, name: &str) -> (BackupReport, RestoreReport) {
        let chain = work.join("tree.chain");
        let archive = work.join(format!("{}.tar", name));
        let mirror = work.join("mirror");

        let backup = Synchronizer::new(source.to_path_buf())
            .backup_to_file(&chain, &archive)
            .unwrap();
        let restore = Synchronizer::new(mirror).restore_from_file(&archive).unwrap();
        (backup, restore)
    }

    #[test]
    fn test_empty_directory() {
        let temp_dir = TempDir::new().unwrap();
        let work_dir = TempDir::new().unwrap();
        let chain = work_dir.path().join("empty.chain");
        let output = work_dir.path().join("empty.tar");

        let err = Synchronizer::new(temp_dir.path().to_path_buf())
            .backup_to_file(&chain, &output)
            .unwrap_err();

        assert!(matches!(err, SyncError::NoChanges));
        assert!(!chain.exists());
        assert!(!output.exists());
    }

    #[test]
    fn test_special_filenames() {
        let temp_dir = TempDir::new().unwrap();
        let work_dir = TempDir::new().unwrap();

        let special_names = vec![
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file_with_underscores.txt",
            "file.multiple.dots.txt",
            "UPPERCASE.TXT",
            "文件.txt",
            "файл.txt",
            "🦀.rs",
        ];
        for name in &special_names {
            fs::write(temp_dir.path().join(name), format!("content of {}", name)).unwrap();
        }

        let (backup, restore) = backup_and_restore(temp_dir.path(), work_dir.path(), "special");
        assert_eq!(backup.stats.files_added, special_names.len());
        assert!(restore.is_clean());

        for name in &special_names {
            let restored = fs::read_to_string(work_dir.path().join("mirror").join(name)).unwrap();
            assert_eq!(restored, format!("content of {}", name));
        }
    }

    #[test]
    fn test_long_nested_paths() {
        let temp_dir = TempDir::new().unwrap();
        let work_dir = TempDir::new().unwrap();

        // well past the 100 byte ustar name field
        let mut relative = String::new();
        for level in 0..8 {
            relative.push_str(&format!("directory_level_{:02}_with_a_long_name/", level));
        }
        relative.push_str("deeply_nested_file_with_a_long_name.txt");
        assert!(relative.len() > 255);

        let source_file = temp_dir.path().join(&relative);
        fs::create_dir_all(source_file.parent().unwrap()).unwrap();
        fs::write(&source_file, "deep").unwrap();

        let (backup, restore) = backup_and_restore(temp_dir.path(), work_dir.path(), "deep");
        assert_eq!(backup.files_archived, 1);
        assert!(restore.is_clean());
        assert_eq!(
            fs::read_to_string(work_dir.path().join("mirror").join(&relative)).unwrap(),
            "deep"
        );
    }

    #[test]
    fn test_empty_file() {
        let temp_dir = TempDir::new().unwrap();
        let work_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("empty.txt"), "").unwrap();

        let (backup, restore) = backup_and_restore(temp_dir.path(), work_dir.path(), "empty-file");
        assert_eq!(backup.files_archived, 1);
        assert_eq!(backup.bytes_archived, 0);
        assert_eq!(restore.files_restored, 1);
        assert!(work_dir.path().join("mirror/empty.txt").is_file());
    }

    #[test]
    fn test_restore_same_archive_twice() {
        let temp_dir = TempDir::new().unwrap();
        let work_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("docs")).unwrap();
        fs::write(temp_dir.path().join("docs/a.md"), "a").unwrap();
        fs::write(temp_dir.path().join("b.md"), "b").unwrap();

        let (_, first) = backup_and_restore(temp_dir.path(), work_dir.path(), "twice");
        assert!(first.is_clean());

        let mirror = Synchronizer::new(work_dir.path().join("mirror"));
        let second = mirror
            .restore_from_file(&work_dir.path().join("twice.tar"))
            .unwrap();
        assert!(second.is_clean());
        assert_eq!(second.files_restored, 2);
        assert_eq!(fs::read_to_string(work_dir.path().join("mirror/docs/a.md")).unwrap(), "a");
    }

    #[test]
    fn test_garbage_archive_is_rejected() {
        let work_dir = TempDir::new().unwrap();
        let bogus = work_dir.path().join("bogus.tar");
        fs::write(&bogus, b"this is not a tar archive, not even close").unwrap();

        let target = work_dir.path().join("target");
        let result = Synchronizer::new(target.clone()).restore_from_file(&bogus);
        assert!(result.is_err());

        // the staging directory never outlives the run
        let leftovers = fs::read_dir(&target).map(|d| d.count()).unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_huge_declared_chain_size_is_rejected() {
        let work_dir = TempDir::new().unwrap();
        let mut header = tar::Header::new_gnu();
        header.set_path("snapshot.chain").unwrap();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(1 << 40);
        header.set_cksum();

        let mut bytes = header.as_bytes().to_vec();
        bytes.extend_from_slice(b"SNC1");
        bytes.resize(1024, 0);
        let hostile = work_dir.path().join("hostile.tar");
        fs::write(&hostile, &bytes).unwrap();

        let result = Synchronizer::new(work_dir.path().join("target")).restore_from_file(&hostile);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_archive_file() {
        let work_dir = TempDir::new().unwrap();
        let result = Synchronizer::new(work_dir.path().join("target"))
            .restore_from_file(&work_dir.path().join("nope.tar"));
        assert!(matches!(result, Err(SyncError::Io(_))));
    }

    #[test]
    fn test_unreadable_chain_starts_over() {
        let temp_dir = TempDir::new().unwrap();
        let work_dir = TempDir::new().unwrap();
        let chain = work_dir.path().join("tree.chain");
        fs::write(temp_dir.path().join("a.txt"), "a").unwrap();
        fs::write(&chain, b"definitely not a chain").unwrap();

        let report = Synchronizer::new(temp_dir.path().to_path_buf())
            .backup(&chain, std::io::sink())
            .unwrap();

        // treated as a first run
        assert_eq!(report.stats.files_added, 1);
        assert_eq!(report.chain_length, 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_not_followed_by_default() {
        let temp_dir = TempDir::new().unwrap();
        let work_dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret.txt"), "outside").unwrap();
        fs::write(temp_dir.path().join("real.txt"), "inside").unwrap();
        std::os::unix::fs::symlink(outside.path(), temp_dir.path().join("link")).unwrap();

        let (backup, _) = backup_and_restore(temp_dir.path(), work_dir.path(), "links");
        assert_eq!(backup.stats.files_added, 1);
        assert!(!work_dir.path().join("mirror/link").exists());
    }
}
