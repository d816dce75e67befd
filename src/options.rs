//! Configuration options for caskdb.

use std::path::PathBuf;

use crate::{Error, Result};

/// One kibibyte.
pub const KIB: u64 = 1024;

/// One mebibyte.
pub const MIB: u64 = 1024 * KIB;

/// One gibibyte.
pub const GIB: u64 = 1024 * MIB;

/// Default maximum size of a segment file (1GiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = GIB;

/// Default total size of the block cache (ten 32KiB blocks).
pub const DEFAULT_BLOCK_CACHE_SIZE: u64 = 32 * KIB * 10;

/// Database configuration options.
#[derive(Debug, Clone)]
pub struct Options {
    /// Database directory. Must exist before `Database::open`.
    pub dir_path: PathBuf,

    /// Maximum bytes per segment file; the rollover threshold.
    pub segment_size: u64,

    /// Total bytes reserved for the block cache; 0 disables caching.
    pub block_cache: u64,

    /// Fsync the active segment after every committing append.
    pub sync_writes: bool,

    /// Fsync once this many unsynced bytes accumulate; 0 disables.
    pub bytes_per_sync: u32,
}

impl Options {
    /// Create options for the given directory with default tuning.
    pub fn new(dir_path: impl Into<PathBuf>) -> Self {
        Self {
            dir_path: dir_path.into(),
            segment_size: DEFAULT_SEGMENT_SIZE,
            block_cache: DEFAULT_BLOCK_CACHE_SIZE,
            sync_writes: false,
            bytes_per_sync: 0,
        }
    }

    /// Set the segment rollover threshold.
    pub fn segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    /// Set the block cache budget in bytes.
    pub fn block_cache(mut self, bytes: u64) -> Self {
        self.block_cache = bytes;
        self
    }

    /// Enable or disable fsync-per-write.
    pub fn sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    /// Set the unsynced-bytes threshold for periodic fsync.
    pub fn bytes_per_sync(mut self, bytes: u32) -> Self {
        self.bytes_per_sync = bytes;
        self
    }

    /// Validate the options.
    pub fn validate(&self) -> Result<()> {
        if self.dir_path.as_os_str().is_empty() {
            return Err(Error::InvalidConfiguration(
                "dir_path must not be empty".into(),
            ));
        }
        if self.segment_size == 0 {
            return Err(Error::InvalidConfiguration(
                "segment_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Per-batch overrides for write behavior.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOptions {
    /// Fsync the WAL when this batch commits, even if the database
    /// default does not.
    pub sync_writes: bool,

    /// Reject mutations; the batch holds the database lock in shared mode.
    pub read_only: bool,
}

impl BatchOptions {
    /// Batch options with defaults (writable, no forced sync).
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an fsync on commit.
    pub fn sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    /// Make the batch read-only.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}
