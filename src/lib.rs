//! # caskdb
//!
//! An embedded, log-structured key-value store based on the Bitcask
//! design.
//!
//! ## Features
//!
//! - **Append-only storage**: all mutations go to a segmented
//!   write-ahead log; reads are one in-memory index lookup plus one
//!   bounded disk read
//! - **Atomic batches**: groups of writes commit together, sealed by a
//!   finish marker the recovery replay keys on
//! - **Crash recovery**: the index is rebuilt from a hint file and a
//!   WAL replay; half-written batches are invisible
//! - **Compaction**: an offline merge rewrites only live records and
//!   reclaims the rest
//! - **Tunable durability**: fsync per write, per byte budget, or not
//!   at all
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use caskdb::{Database, Options};
//!
//! let db = Database::open(Options::new("./my_data"))?;
//!
//! // Single-key operations
//! db.put(b"hello", b"world")?;
//! let value = db.get(b"hello")?;
//! db.del(b"hello")?;
//!
//! // Atomic batches
//! let mut batch = db.new_batch(Default::default());
//! batch.put(b"key1", b"value1")?;
//! batch.put(b"key2", b"value2")?;
//! batch.commit()?;
//! ```

// Public modules
pub mod error;
pub mod options;

// Internal modules
mod batch;
mod cache;
mod db;
mod index;
mod record;
mod snowflake;
mod util;
mod wal;

// Re-export main types for convenience
pub use error::{Error, Result};
pub use options::{BatchOptions, Options};

// Database
pub use batch::Batch;
pub use db::{Database, DatabaseStat};
