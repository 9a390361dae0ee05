//! Main test module for xfer
//!
//! This module includes all test suites:
//! - Integration tests for full sync scenarios
//! - Chaos tests for interruption, log damage and tampering
//! - Property-based tests for encoding and diff invariants
//! - Edge cases and stress tests below

pub mod chaos;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::xfer::*;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn sync(source: &Path, dest: &Path, log: &Path) -> SessionResult {
        SessionBuilder::new()
            .build(source.to_path_buf(), dest.to_path_buf(), log.to_path_buf())
            .unwrap()
            .run()
            .unwrap()
    }

    #[test]
    fn test_special_filenames() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("source");
        let dest = temp_dir.path().join("dest");
        fs::create_dir(&source).unwrap();

        let special_names = vec![
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file_with_underscores.txt",
            "file.multiple.dots.txt",
            "quote\"d.txt",
            "back\\slash.txt",
            "#not-a-comment.txt",
            "UPPERCASE.TXT",
            "🦀.txt",
            "文件.txt",
        ];
        for name in &special_names {
            fs::write(source.join(name), name.as_bytes()).unwrap();
        }

        let result = sync(&source, &dest, &temp_dir.path().join("sync.log"));
        assert!(result.is_complete());
        assert_eq!(result.progress.files_transferred, special_names.len() as u64);

        for name in &special_names {
            assert_eq!(fs::read(dest.join(name)).unwrap(), name.as_bytes());
        }

        // Every name survives the log encoding
        let log = replay(&temp_dir.path().join("sync.log")).unwrap();
        assert_eq!(log.completed.len(), special_names.len());
        assert!(log.is_sealed());
    }

    #[test]
    fn test_empty_files_and_empty_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("source");
        let dest = temp_dir.path().join("dest");
        fs::create_dir_all(source.join("empty_dir")).unwrap();
        fs::create_dir_all(source.join("a/b/c")).unwrap();
        fs::write(source.join("empty.txt"), b"").unwrap();
        fs::write(source.join("a/b/c/deep.txt"), b"deep").unwrap();

        let snapshot = build_manifest(&source).unwrap();
        assert_eq!(snapshot.manifest.len(), 2);
        assert_eq!(snapshot.get(Path::new("empty.txt")).unwrap().size, 0);

        let result = sync(&source, &dest, &temp_dir.path().join("sync.log"));
        assert!(result.is_complete());
        assert_eq!(fs::read(dest.join("empty.txt")).unwrap(), b"");
        assert_eq!(fs::read(dest.join("a/b/c/deep.txt")).unwrap(), b"deep");
        // Directories without files carry no entry and are not recreated
        assert!(!dest.join("empty_dir").exists());
    }

    #[test]
    fn test_log_in_missing_directory() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("source");
        fs::create_dir(&source).unwrap();
        fs::write(source.join("f"), b"x").unwrap();

        let log = temp_dir.path().join("logs/nested/sync.log");
        let result = sync(&source, &temp_dir.path().join("dest"), &log);
        assert!(result.is_complete());
        assert!(log.exists());
    }

    #[test]
    fn test_destination_is_a_file() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("source");
        fs::create_dir(&source).unwrap();
        fs::write(source.join("f"), b"x").unwrap();
        let dest = temp_dir.path().join("dest");
        fs::write(&dest, b"not a directory").unwrap();

        let err = SessionBuilder::new()
            .build(source, dest, temp_dir.path().join("sync.log"))
            .unwrap_err();
        assert!(matches!(err, XferError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_same_roots_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().to_path_buf();
        let err = SessionBuilder::new()
            .build(root.clone(), root, temp_dir.path().join("sync.log"))
            .unwrap_err();
        assert!(matches!(err, XferError::InvalidConfiguration(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_is_synced() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("source");
        let dest = temp_dir.path().join("dest");
        fs::create_dir(&source).unwrap();
        std::os::unix::fs::symlink("does/not/exist", source.join("dangling")).unwrap();

        let result = sync(&source, &dest, &temp_dir.path().join("sync.log"));
        assert!(result.is_complete());
        assert_eq!(
            fs::read_link(dest.join("dangling")).unwrap(),
            Path::new("does/not/exist")
        );
    }
}

#[cfg(test)]
mod stress_tests {
    use ::xfer::*;
    use std::fs;
    use std::time::Instant;
    use tempfile::TempDir;
    use tracing::info;

    #[test]
    #[ignore] // Run with --ignored flag for stress tests
    fn test_many_files() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("source");
        let dest = temp_dir.path().join("dest");

        for i in 0..5_000 {
            let dir = source.join(format!("dir_{:03}", i / 100));
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join(format!("file_{}.txt", i)), format!("content {}", i)).unwrap();
        }

        let start = Instant::now();
        let result = SessionBuilder::new()
            .workers(num_cpus::get())
            .build(source, dest, temp_dir.path().join("sync.log"))
            .unwrap()
            .run()
            .unwrap();
        info!("Synced 5000 files in {:?}", start.elapsed());

        assert!(result.is_complete());
        assert_eq!(result.progress.files_transferred, 5_000);
    }

    #[test]
    #[ignore]
    fn test_large_file() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("source");
        let dest = temp_dir.path().join("dest");
        fs::create_dir(&source).unwrap();

        let content: Vec<u8> = (0..64 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        fs::write(source.join("large.bin"), &content).unwrap();

        let result = SessionBuilder::new()
            .build(source, dest.clone(), temp_dir.path().join("sync.log"))
            .unwrap()
            .run()
            .unwrap();

        assert!(result.is_complete());
        assert_eq!(result.progress.bytes_transferred, content.len() as u64);
        assert_eq!(
            hash_file(&dest.join("large.bin"), DigestAlgorithm::Sha512).unwrap().0,
            hash_bytes(&content, DigestAlgorithm::Sha512)
        );
    }
}
