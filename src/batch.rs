//! Atomic write batches.
//!
//! A batch buffers mutations in memory and applies them atomically on
//! commit: every pending record is appended to the WAL stamped with a
//! fresh batch id, a finish marker seals the group, and only then does
//! the in-memory index move. Recovery replays a batch's records only if
//! its finish marker made it to disk, so a crash mid-commit leaves the
//! batch invisible.
//!
//! A batch holds the database lock for its whole lifetime: shared for
//! read-only batches, exclusive otherwise. A thread must not hold two
//! batches on the same database at once.

use std::collections::HashMap;
use std::ops::Deref;

use bytes::Bytes;
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::db::{Database, DbInner};
use crate::options::BatchOptions;
use crate::record::{LogRecord, LogRecordType};
use crate::snowflake;
use crate::wal::ChunkPosition;
use crate::{Error, Result};

/// Node id used for batch id generation.
const BATCH_ID_NODE: u32 = 1;

/// The database lock held by a batch.
enum DbGuard<'a> {
    Shared(RwLockReadGuard<'a, DbInner>),
    Exclusive(RwLockWriteGuard<'a, DbInner>),
}

impl Deref for DbGuard<'_> {
    type Target = DbInner;

    fn deref(&self) -> &DbInner {
        match self {
            DbGuard::Shared(guard) => guard,
            DbGuard::Exclusive(guard) => guard,
        }
    }
}

/// A set of pending mutations committed atomically.
pub struct Batch<'a> {
    db: &'a Database,
    /// Present until the batch commits or rolls back.
    guard: Option<DbGuard<'a>>,
    /// Latest pending record per key.
    pending: HashMap<Bytes, LogRecord>,
    id_node: snowflake::Node,
    options: BatchOptions,
    committed: bool,
    rolled_back: bool,
}

impl<'a> Batch<'a> {
    pub(crate) fn new(db: &'a Database, options: BatchOptions) -> Self {
        let guard = if options.read_only {
            DbGuard::Shared(db.inner.read())
        } else {
            DbGuard::Exclusive(db.inner.write())
        };
        Self {
            db,
            guard: Some(guard),
            pending: HashMap::new(),
            id_node: snowflake::Node::new(BATCH_ID_NODE),
            options,
            committed: false,
            rolled_back: false,
        }
    }

    /// Live view of the database state, or the reason this batch can no
    /// longer be used.
    fn inner(&self) -> Result<&DbInner> {
        match &self.guard {
            Some(guard) => {
                let inner: &DbInner = guard;
                if inner.closed {
                    return Err(Error::DatabaseClosed);
                }
                Ok(inner)
            }
            None => Err(self.finished_error()),
        }
    }

    fn finished_error(&self) -> Error {
        if self.committed {
            Error::BatchCommitted
        } else {
            Error::BatchRollbacked
        }
    }

    /// Buffer a put. The write reaches disk at commit time.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        self.inner()?;
        if self.options.read_only {
            return Err(Error::ReadOnlyBatch);
        }

        let key = Bytes::copy_from_slice(key);
        let record = LogRecord::normal(key.clone(), Bytes::copy_from_slice(value));
        self.pending.insert(key, record);
        Ok(())
    }

    /// Buffer a delete.
    ///
    /// If the key exists in the index a tombstone is recorded; if it only
    /// exists as a pending put in this batch, that put is erased and no
    /// tombstone is written.
    pub fn del(&mut self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        self.inner()?;
        if self.options.read_only {
            return Err(Error::ReadOnlyBatch);
        }

        if self.inner()?.index.get_ref(key).is_some() {
            let key = Bytes::copy_from_slice(key);
            self.pending.insert(key.clone(), LogRecord::tombstone(key));
        } else {
            self.pending.remove(key);
        }
        Ok(())
    }

    /// Get a value, seeing this batch's own pending writes first.
    pub fn get(&self, key: &[u8]) -> Result<Bytes> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        let inner = self.inner()?;

        if let Some(record) = self.pending.get(key) {
            return match record.record_type() {
                LogRecordType::Deleted => Err(Error::KeyNotFound),
                _ => Ok(record.value().clone()),
            };
        }

        let position = inner.index.get(key).ok_or(Error::KeyNotFound)?;
        let chunk = inner.data_files.read(&position)?;
        let record = LogRecord::decode(&chunk)?;
        if record.record_type() == LogRecordType::Deleted {
            // I6: the index must only reference live records
            return Err(Error::corruption("tombstone reached through the index"));
        }
        Ok(record.into_value())
    }

    /// Check key existence, seeing this batch's pending writes first.
    pub fn exist(&self, key: &[u8]) -> Result<bool> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        let inner = self.inner()?;

        if let Some(record) = self.pending.get(key) {
            return Ok(record.record_type() != LogRecordType::Deleted);
        }
        Ok(inner.index.get_ref(key).is_some())
    }

    /// Commit the batch: append every pending record plus a finish
    /// marker, then publish the index updates. Releases the database
    /// lock.
    pub fn commit(&mut self) -> Result<()> {
        let guard = match self.guard.take() {
            Some(guard) => guard,
            None => return Err(self.finished_error()),
        };
        if guard.closed {
            self.rolled_back = true;
            return Err(Error::DatabaseClosed);
        }
        if self.options.read_only || self.pending.is_empty() {
            self.committed = true;
            return Ok(());
        }
        let mut inner = match guard {
            DbGuard::Exclusive(inner) => inner,
            DbGuard::Shared(_) => {
                self.rolled_back = true;
                return Err(Error::ReadOnlyBatch);
            }
        };

        let batch_id = self.id_node.gen();
        let mut positions: HashMap<Bytes, ChunkPosition> =
            HashMap::with_capacity(self.pending.len());

        // Phase one: everything on disk, nothing in the index. Records
        // without a finish marker are skipped by recovery, so aborting
        // here leaves no visible effect.
        for record in self.pending.values_mut() {
            record.set_batch_id(batch_id);
            let position = match inner.data_files.write(&record.encode()) {
                Ok(position) => position,
                Err(e) => {
                    self.rolled_back = true;
                    return Err(e);
                }
            };
            positions.insert(record.key().clone(), position);
        }

        let finish = LogRecord::finished(batch_id);
        if let Err(e) = inner.data_files.write(&finish.encode()) {
            self.rolled_back = true;
            return Err(e);
        }

        if self.options.sync_writes && !self.db.options().sync_writes {
            if let Err(e) = inner.data_files.sync() {
                self.rolled_back = true;
                return Err(e);
            }
        }

        // Phase two: publish.
        for (key, record) in &self.pending {
            match record.record_type() {
                LogRecordType::Deleted => {
                    inner.index.del(key);
                }
                _ => {
                    if let Some(position) = positions.get(key) {
                        inner.index.put(key.clone(), *position);
                    }
                }
            }
        }

        self.committed = true;
        Ok(())
    }

    /// Discard pending writes without touching disk. Releases the
    /// database lock.
    pub fn rollback(&mut self) -> Result<()> {
        let guard = match self.guard.take() {
            Some(guard) => guard,
            None => return Err(self.finished_error()),
        };
        if guard.closed {
            self.rolled_back = true;
            return Err(Error::DatabaseClosed);
        }

        if !self.options.read_only {
            self.pending.clear();
        }
        self.rolled_back = true;
        Ok(())
    }
}
