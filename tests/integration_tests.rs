//! Integration tests for complete database workflows.

use caskdb::{BatchOptions, Database, Error, Options};
use tempfile::TempDir;

fn test_key(i: usize) -> Vec<u8> {
    format!("db-test-key-{}", i).into_bytes()
}

/// Deterministic pseudo-random value of the given length.
fn test_value(i: usize, len: usize) -> Vec<u8> {
    let mut value = vec![0u8; len];
    let mut state = (i as u64).wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    for byte in value.iter_mut() {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        *byte = (state >> 33) as u8;
    }
    value
}

/// Total bytes of the regular files in a directory.
fn dir_size(path: &std::path::Path) -> u64 {
    std::fs::read_dir(path)
        .unwrap()
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.metadata().map(|m| m.len()).unwrap_or(0))
        .sum()
}

/// Test complete CRUD workflow.
#[test]
fn integration_crud_workflow() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(Options::new(dir.path())).unwrap();

    // Create
    db.put(b"user:1", b"Alice").unwrap();
    db.put(b"user:2", b"Bob").unwrap();
    db.put(b"user:3", b"Charlie").unwrap();

    // Read
    assert_eq!(db.get(b"user:1").unwrap().as_ref(), b"Alice");
    assert_eq!(db.get(b"user:2").unwrap().as_ref(), b"Bob");
    assert_eq!(db.get(b"user:3").unwrap().as_ref(), b"Charlie");

    // Update
    db.put(b"user:2", b"Bobby").unwrap();
    assert_eq!(db.get(b"user:2").unwrap().as_ref(), b"Bobby");

    // Delete
    db.del(b"user:3").unwrap();
    assert_eq!(db.get(b"user:3").unwrap_err(), Error::KeyNotFound);

    // Verify remaining
    assert_eq!(db.get(b"user:1").unwrap().as_ref(), b"Alice");
    assert_eq!(db.get(b"user:2").unwrap().as_ref(), b"Bobby");
}

/// Test a large committed batch surviving close and reopen.
#[test]
fn integration_batch_put_and_reopen() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(Options::new(dir.path())).unwrap();

    let count = 10_000;
    let mut batch = db.new_batch(BatchOptions::new());
    for i in 0..count {
        batch.put(&test_key(i), &test_value(i, 128)).unwrap();
    }
    batch.commit().unwrap();

    for i in 0..count {
        assert_eq!(db.get(&test_key(i)).unwrap(), test_value(i, 128));
    }

    db.close().unwrap();
    let db = Database::open(Options::new(dir.path())).unwrap();
    for i in 0..count {
        assert_eq!(db.get(&test_key(i)).unwrap(), test_value(i, 128));
    }
}

/// Test batches spilling across several small segments.
#[test]
fn integration_batch_across_segments() {
    let dir = TempDir::new().unwrap();
    let options = Options::new(dir.path())
        .segment_size(512 * 1024)
        .block_cache(256 * 1024);
    let db = Database::open(options.clone()).unwrap();

    let count = 500;
    let mut batch = db.new_batch(BatchOptions::new());
    for i in 0..count {
        batch.put(&test_key(i), &test_value(i, 4096)).unwrap();
    }
    batch.commit().unwrap();

    db.close().unwrap();
    let db = Database::open(options).unwrap();
    for i in 0..count {
        assert_eq!(db.get(&test_key(i)).unwrap(), test_value(i, 4096));
    }
}

/// Test delete inside a batch and across reopen.
#[test]
fn integration_delete_through_batch() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(Options::new(dir.path())).unwrap();

    db.put(&test_key(99), &test_value(99, 128)).unwrap();
    db.del(&test_key(99)).unwrap();
    assert!(!db.exist(&test_key(99)).unwrap());

    // A put and delete inside one batch leaves no trace either
    let mut batch = db.new_batch(BatchOptions::new());
    batch.put(&test_key(200), &test_value(200, 100)).unwrap();
    batch.del(&test_key(200)).unwrap();
    assert!(!batch.exist(&test_key(200)).unwrap());
    batch.commit().unwrap();

    db.close().unwrap();
    let db = Database::open(Options::new(dir.path())).unwrap();
    assert!(!db.exist(&test_key(99)).unwrap());
    assert!(!db.exist(&test_key(200)).unwrap());
}

/// Test rollback discarding buffered writes.
#[test]
fn integration_rollback() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(Options::new(dir.path())).unwrap();

    let mut batch = db.new_batch(BatchOptions::new());
    batch.put(b"key", b"value").unwrap();
    batch.rollback().unwrap();

    assert_eq!(db.get(b"key").unwrap_err(), Error::KeyNotFound);
}

/// Test atomicity: either every key of a batch is visible or none is.
#[test]
fn integration_batch_atomicity_across_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let db = Database::open(Options::new(dir.path())).unwrap();
        let mut batch = db.new_batch(BatchOptions::new());
        batch.put(b"account:1", b"1000").unwrap();
        batch.put(b"account:2", b"500").unwrap();
        batch.del(b"account:1").unwrap();
        batch.commit().unwrap();
        // Drop without close - simulates a crash after commit
    }

    let db = Database::open(Options::new(dir.path())).unwrap();
    assert_eq!(db.get(b"account:1").unwrap_err(), Error::KeyNotFound);
    assert_eq!(db.get(b"account:2").unwrap().as_ref(), b"500");
}

/// Test merge reclaiming space while preserving the live set.
#[test]
fn integration_merge_reclaims_space() {
    let dir = TempDir::new().unwrap();
    let options = Options::new(dir.path())
        .segment_size(512 * 1024)
        .block_cache(256 * 1024);
    let db = Database::open(options.clone()).unwrap();

    let count = 1000;
    // Overwrite every key several times, then delete some
    for round in 0..5 {
        for i in 0..count {
            db.put(&test_key(i), &test_value(i * 31 + round, 512)).unwrap();
        }
    }
    for i in 0..100 {
        db.del(&test_key(i)).unwrap();
    }

    let before = dir_size(dir.path());
    db.merge(true).unwrap();
    let after = dir_size(dir.path());
    assert!(
        after < before,
        "merge should shrink the directory ({} -> {})",
        before,
        after
    );

    for i in 0..100 {
        assert_eq!(db.get(&test_key(i)).unwrap_err(), Error::KeyNotFound);
    }
    for i in 100..count {
        assert_eq!(db.get(&test_key(i)).unwrap(), test_value(i * 31 + 4, 512));
    }

    // The compacted state must survive a reopen
    db.close().unwrap();
    let db = Database::open(options).unwrap();
    for i in 0..100 {
        assert_eq!(db.get(&test_key(i)).unwrap_err(), Error::KeyNotFound);
    }
    for i in 100..count {
        assert_eq!(db.get(&test_key(i)).unwrap(), test_value(i * 31 + 4, 512));
    }
    let stat = db.stat().unwrap();
    assert_eq!(stat.key_count, (count - 100) as u64);
}

/// Test that writes after a merge coexist with the compacted data.
#[test]
fn integration_merge_then_write() {
    let dir = TempDir::new().unwrap();
    let options = Options::new(dir.path())
        .segment_size(256 * 1024)
        .block_cache(128 * 1024);
    let db = Database::open(options.clone()).unwrap();

    for i in 0..300 {
        db.put(&test_key(i), &test_value(i, 600)).unwrap();
    }
    db.merge(true).unwrap();

    for i in 300..400 {
        db.put(&test_key(i), &test_value(i, 600)).unwrap();
    }
    db.del(&test_key(0)).unwrap();

    db.close().unwrap();
    let db = Database::open(options).unwrap();
    assert_eq!(db.get(&test_key(0)).unwrap_err(), Error::KeyNotFound);
    for i in 1..400 {
        assert_eq!(db.get(&test_key(i)).unwrap(), test_value(i, 600));
    }
}

/// Test per-batch sync override.
#[test]
fn integration_sync_batch() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(Options::new(dir.path())).unwrap();

    let mut batch = db.new_batch(BatchOptions::new().sync_writes(true));
    batch.put(b"durable", b"yes").unwrap();
    batch.commit().unwrap();

    assert_eq!(db.get(b"durable").unwrap().as_ref(), b"yes");
}

fn check_sync_policy(options: Options, dir: &TempDir) {
    let db = Database::open(options).unwrap();
    for i in 0..200 {
        db.put(&test_key(i), &test_value(i, 128)).unwrap();
    }
    db.close().unwrap();

    let db = Database::open(Options::new(dir.path())).unwrap();
    for i in 0..200 {
        assert_eq!(db.get(&test_key(i)).unwrap(), test_value(i, 128));
    }
}

/// Test sync-every-write and bytes-per-sync configurations.
#[test]
fn integration_sync_policies() {
    let dir = TempDir::new().unwrap();
    check_sync_policy(Options::new(dir.path()).sync_writes(true), &dir);

    let dir = TempDir::new().unwrap();
    check_sync_policy(Options::new(dir.path()).bytes_per_sync(4096), &dir);
}

/// Test values large enough to span several 32KiB blocks.
#[test]
fn integration_large_values() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(Options::new(dir.path())).unwrap();

    for i in 0..10 {
        db.put(&test_key(i), &test_value(i, 100 * 1024)).unwrap();
    }

    db.close().unwrap();
    let db = Database::open(Options::new(dir.path())).unwrap();
    for i in 0..10 {
        assert_eq!(db.get(&test_key(i)).unwrap(), test_value(i, 100 * 1024));
    }
}

/// Test a value exceeding the segment size being rejected.
#[test]
fn integration_value_too_large() {
    let dir = TempDir::new().unwrap();
    let options = Options::new(dir.path())
        .segment_size(64 * 1024)
        .block_cache(0);
    let db = Database::open(options).unwrap();

    let err = db.put(b"big", &vec![0u8; 128 * 1024]).unwrap_err();
    assert!(matches!(err, Error::ValueTooLarge { .. }));

    // The failed put must not leave a visible key behind
    assert!(!db.exist(b"big").unwrap());
}
