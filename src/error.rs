//! Error types for caskdb.

use std::io;
use thiserror::Error;

/// Result type alias for caskdb operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for database operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// I/O error from file operations.
    #[error("I/O error: {0}")]
    Io(String),

    /// Data corruption detected.
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Empty key is not allowed.
    #[error("Empty key is not allowed")]
    EmptyKey,

    /// Key does not exist in the database.
    #[error("Key not found")]
    KeyNotFound,

    /// Database directory is locked by another process.
    #[error("Database is locked by another process")]
    DatabaseLocked,

    /// Database is closed.
    #[error("Database is closed")]
    DatabaseClosed,

    /// Mutation attempted through a read-only batch.
    #[error("Batch is read-only")]
    ReadOnlyBatch,

    /// Batch has already been committed.
    #[error("Batch has already been committed")]
    BatchCommitted,

    /// Batch has already been rolled back.
    #[error("Batch has already been rolled back")]
    BatchRollbacked,

    /// A merge is already in progress.
    #[error("Merge is already running")]
    MergeRunning,

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Value is too large to fit in a single segment.
    #[error("Value too large: {size} bytes (max: {max})")]
    ValueTooLarge { size: u64, max: u64 },

    /// Operation on a closed segment.
    #[error("Segment is closed")]
    SegmentClosed,

    /// The segment referenced by a position no longer exists.
    #[error("Segment {0} not found")]
    SegmentNotFound(u32),

    /// CRC checksum mismatch.
    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    /// Reached the end of a segment while reading sequentially.
    #[error("End of segment")]
    EndOfSegment,

    /// Reached the end of the last segment while reading sequentially.
    #[error("End of segments")]
    EndOfSegments,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl Error {
    /// Create a corruption error with the given message.
    pub fn corruption<S: Into<String>>(msg: S) -> Self {
        Error::Corruption(msg.into())
    }

    /// Check if this error indicates corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_) | Error::CrcMismatch { .. })
    }
}
