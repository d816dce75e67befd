//! Database - core lifecycle and recovery.
//!
//! A database is a single directory owned exclusively by one process:
//! data segments (`.SEG`), a hint file (`.HINT`) accelerating reopen, a
//! merge-boundary marker (`.MERGEFIN`) and an advisory `FLOCK`. On open
//! the in-memory index is rebuilt from the hint file and a replay of the
//! data WAL; merge compacts the sealed segments into a shadow directory
//! and promotes the result on completion.
//!
//! # Thread safety
//!
//! The database is thread-safe. A reader/writer lock guards the index
//! and file handles; batches hold it for their full lifetime (shared
//! when read-only, exclusive otherwise).

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write as IoWrite;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::batch::Batch;
use crate::index::KeyDir;
use crate::options::{BatchOptions, Options, KIB};
use crate::record::{IndexRecord, LogRecord, LogRecordType};
use crate::util::filename::{
    lock_file_path, merge_dir_path, segment_file_name, HINT_FILE_EXT, MERGE_FIN_FILE_EXT,
    SEG_FILE_EXT,
};
use crate::wal::{ChunkPosition, SegmentId, Wal, WalOptions};
use crate::{Error, Result};

/// Batch id stamped on records rewritten by a merge. Replay applies such
/// records directly; every real batch id is a nonzero snowflake.
pub(crate) const MERGE_FINISHED_BATCH_ID: u64 = 0;

/// Block cache budget for reading the hint file at startup.
const HINT_BLOCK_CACHE: u64 = 32 * KIB * 10;

/// Size of an encoded hint-record position prefix.
const HINT_POSITION_SIZE: usize = 16;

/// Point-in-time database statistics.
#[derive(Debug, Clone, Copy)]
pub struct DatabaseStat {
    /// Number of live keys in the index.
    pub key_count: u64,
    /// Total bytes of the files in the database directory.
    pub disk_size: u64,
}

/// Mutable database state behind the reader/writer lock.
#[derive(Debug)]
pub(crate) struct DbInner {
    pub(crate) data_files: Arc<Wal>,
    pub(crate) hint_file: Wal,
    pub(crate) index: KeyDir,
    pub(crate) closed: bool,
}

/// An embedded log-structured key-value store.
#[derive(Debug)]
pub struct Database {
    options: Options,
    merging: AtomicBool,
    lock_file: File,
    pub(crate) inner: RwLock<DbInner>,
}

impl Database {
    /// Open the database in `options.dir_path`.
    ///
    /// The directory must already exist. Fails with
    /// [`Error::DatabaseLocked`] when another process holds it.
    pub fn open(options: Options) -> Result<Self> {
        options.validate()?;
        if !options.dir_path.exists() {
            return Err(Error::NotFound(format!(
                "database directory does not exist: {}",
                options.dir_path.display()
            )));
        }

        let lock_file = Self::acquire_lock(&options.dir_path)?;

        // Promote (or abandon) leftovers of an interrupted merge before
        // any segment file is opened.
        load_merge_files(&options.dir_path)?;

        let data_files = open_data_files(&options)?;
        let mut index = KeyDir::new();
        let hint_file = open_hint_file(&options.dir_path, HINT_BLOCK_CACHE)?;
        load_index_from_hint(&hint_file, &mut index)?;
        load_index_from_wal(&options.dir_path, &data_files, &mut index)?;

        info!(
            dir = %options.dir_path.display(),
            keys = index.len(),
            "database opened"
        );
        Ok(Self {
            options,
            merging: AtomicBool::new(false),
            lock_file,
            inner: RwLock::new(DbInner {
                data_files: Arc::new(data_files),
                hint_file,
                index,
                closed: false,
            }),
        })
    }

    /// Acquire the exclusive advisory lock on the database directory.
    fn acquire_lock(db_path: &Path) -> Result<File> {
        let lock_path = lock_file_path(db_path);
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let ret = unsafe { libc::flock(lock_file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if ret != 0 {
                return Err(Error::DatabaseLocked);
            }
        }

        Ok(lock_file)
    }

    /// The options this database was opened with.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.read().closed
    }

    /// Whether a merge is currently running.
    pub fn is_merging(&self) -> bool {
        self.merging.load(Ordering::SeqCst)
    }

    /// Start a batch. The batch holds the database lock until it commits
    /// or rolls back.
    pub fn new_batch(&self, options: BatchOptions) -> Batch<'_> {
        Batch::new(self, options)
    }

    /// Store a key-value pair.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = self.new_batch(BatchOptions::new());
        if let Err(e) = batch.put(key, value) {
            let _ = batch.rollback();
            return Err(e);
        }
        batch.commit()
    }

    /// Get the value stored under a key.
    pub fn get(&self, key: &[u8]) -> Result<Bytes> {
        let mut batch = self.new_batch(BatchOptions::new().read_only(true));
        let result = batch.get(key);
        batch.commit()?;
        result
    }

    /// Delete a key.
    pub fn del(&self, key: &[u8]) -> Result<()> {
        let mut batch = self.new_batch(BatchOptions::new());
        if let Err(e) = batch.del(key) {
            let _ = batch.rollback();
            return Err(e);
        }
        batch.commit()
    }

    /// Check whether a key exists.
    pub fn exist(&self, key: &[u8]) -> Result<bool> {
        let mut batch = self.new_batch(BatchOptions::new().read_only(true));
        let result = batch.exist(key);
        batch.commit()?;
        result
    }

    /// Fsync the data WAL.
    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.write();
        if inner.closed {
            return Err(Error::DatabaseClosed);
        }
        inner.data_files.sync()
    }

    /// Current statistics.
    pub fn stat(&self) -> Result<DatabaseStat> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(Error::DatabaseClosed);
        }
        let mut disk_size = 0;
        for entry in fs::read_dir(&self.options.dir_path)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                disk_size += entry.metadata()?.len();
            }
        }
        Ok(DatabaseStat {
            key_count: inner.index.len() as u64,
            disk_size,
        })
    }

    /// Close the database, releasing the directory lock.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Ok(());
        }
        inner.data_files.close()?;
        inner.hint_file.close()?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe { libc::flock(self.lock_file.as_raw_fd(), libc::LOCK_UN) };
        }

        inner.closed = true;
        Ok(())
    }

    /// Compact the database: rewrite the live records of all sealed
    /// segments into fresh ones and emit a hint file for fast reopen.
    ///
    /// With `reopen` the database swaps to the compacted files in place;
    /// otherwise promotion happens on the next [`Database::open`].
    pub fn merge(&self, reopen: bool) -> Result<()> {
        self.do_merge()?;
        if !reopen {
            return Ok(());
        }

        let mut inner = self.inner.write();
        inner.data_files.close()?;
        inner.hint_file.close()?;

        load_merge_files(&self.options.dir_path)?;

        inner.data_files = Arc::new(open_data_files(&self.options)?);
        inner.hint_file = open_hint_file(&self.options.dir_path, HINT_BLOCK_CACHE)?;

        let DbInner {
            data_files,
            hint_file,
            index,
            ..
        } = &mut *inner;
        load_index_from_hint(hint_file, index)?;
        load_index_from_wal(&self.options.dir_path, data_files, index)?;
        Ok(())
    }

    fn do_merge(&self) -> Result<()> {
        let (prev_active_id, data_files) = {
            let inner = self.inner.write();
            if inner.closed {
                return Err(Error::DatabaseClosed);
            }
            if inner.data_files.empty() {
                return Ok(());
            }
            if self.merging.swap(true, Ordering::SeqCst) {
                return Err(Error::MergeRunning);
            }
            let prev_active_id = inner.data_files.active_segment_id();
            if let Err(e) = inner.data_files.rotate_active_segment() {
                self.merging.store(false, Ordering::SeqCst);
                return Err(e);
            }
            (prev_active_id, Arc::clone(&inner.data_files))
        };
        let _merging = MergingGuard(&self.merging);

        info!(boundary = prev_active_id, "merge started");
        self.copy_live_records(prev_active_id, &data_files)
    }

    /// The copy phase: stream every sealed record and rewrite the ones
    /// the index still points at. Runs without the database lock;
    /// concurrent writers land in segments past the boundary.
    fn copy_live_records(&self, prev_active_id: SegmentId, data_files: &Wal) -> Result<()> {
        let merge_db = self.open_merge_db()?;
        let mut reader = data_files.reader_with_max(prev_active_id);
        let mut copied = 0u64;

        {
            let merge_inner = merge_db.inner.read();
            loop {
                let (chunk, position) = match reader.next() {
                    Ok(next) => next,
                    Err(Error::EndOfSegments) => break,
                    Err(e) => return Err(e),
                };
                let mut record = LogRecord::decode(&chunk)?;
                if record.record_type() != LogRecordType::Normal {
                    continue;
                }

                let live = self.inner.read().index.get(record.key()) == Some(position);
                if !live {
                    continue;
                }

                record.set_batch_id(MERGE_FINISHED_BATCH_ID);
                let new_position = merge_inner.data_files.write(&record.encode())?;
                let hint = encode_hint_record(record.key(), &new_position);
                merge_inner.hint_file.write(&hint)?;
                copied += 1;
            }

            // Merged data must be durable before the boundary marker
            // makes the promotion eligible.
            merge_inner.data_files.sync()?;
            merge_inner.hint_file.sync()?;
        }
        merge_db.close()?;

        write_merge_fin(&merge_dir_path(&self.options.dir_path), prev_active_id)?;
        info!(records = copied, "merge finished");
        Ok(())
    }

    /// Open the shadow database the merge copies into.
    fn open_merge_db(&self) -> Result<Database> {
        let merge_path = merge_dir_path(&self.options.dir_path);
        if merge_path.exists() {
            fs::remove_dir_all(&merge_path)?;
        }
        fs::create_dir_all(&merge_path)?;

        let options = Options {
            dir_path: merge_path.clone(),
            sync_writes: false,
            bytes_per_sync: 0,
            ..self.options.clone()
        };
        let merge_db = Database::open(options)?;

        // The merge only appends hints; swap in a cache-less writer.
        let hint_file = Wal::open(WalOptions {
            dir_path: merge_path,
            segment_size: u64::MAX,
            segment_file_ext: HINT_FILE_EXT.to_string(),
            block_cache: 0,
            sync_writes: false,
            bytes_per_sync: 0,
        })?;
        merge_db.inner.write().hint_file = hint_file;
        Ok(merge_db)
    }
}

/// Clears the merging flag when the merge ends, however it ends.
struct MergingGuard<'a>(&'a AtomicBool);

impl Drop for MergingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn open_data_files(options: &Options) -> Result<Wal> {
    Wal::open(WalOptions {
        dir_path: options.dir_path.clone(),
        segment_size: options.segment_size,
        segment_file_ext: SEG_FILE_EXT.to_string(),
        block_cache: options.block_cache,
        sync_writes: options.sync_writes,
        bytes_per_sync: options.bytes_per_sync,
    })
}

/// Open the hint WAL: one effectively unbounded segment, never synced on
/// a policy.
fn open_hint_file(dir: &Path, block_cache: u64) -> Result<Wal> {
    Wal::open(WalOptions {
        dir_path: dir.to_path_buf(),
        segment_size: u64::MAX,
        segment_file_ext: HINT_FILE_EXT.to_string(),
        block_cache,
        sync_writes: false,
        bytes_per_sync: 0,
    })
}

/// Encode a hint record: a 16-byte position prefix followed by the key.
fn encode_hint_record(key: &Bytes, position: &ChunkPosition) -> Bytes {
    let mut buf = BytesMut::with_capacity(HINT_POSITION_SIZE + key.len());
    buf.put_u32_le(position.segment_id);
    buf.put_u32_le(position.block_number);
    buf.put_i64_le(position.chunk_offset);
    buf.put_slice(key);
    buf.freeze()
}

/// Decode a hint record; the key length is implied by the chunk size.
fn decode_hint_record(mut data: &[u8]) -> Result<(Bytes, ChunkPosition)> {
    if data.len() < HINT_POSITION_SIZE {
        return Err(Error::corruption("hint record too short"));
    }
    let segment_id = data.get_u32_le();
    let block_number = data.get_u32_le();
    let chunk_offset = data.get_i64_le();
    let key = Bytes::copy_from_slice(data);
    Ok((
        key,
        ChunkPosition {
            segment_id,
            block_number,
            chunk_offset,
            chunk_size: 0,
        },
    ))
}

/// Read the merge boundary segment id recorded in `dir`, 0 when absent.
fn merge_fin_segment_id(dir: &Path) -> SegmentId {
    let path = segment_file_name(dir, MERGE_FIN_FILE_EXT, 1);
    match fs::read(path) {
        Ok(data) if data.len() >= 4 => u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
        _ => 0,
    }
}

/// Persist the merge boundary marker. This is the merge's commit point:
/// promotion only happens once this file exists.
fn write_merge_fin(dir: &Path, id: SegmentId) -> Result<()> {
    let path = segment_file_name(dir, MERGE_FIN_FILE_EXT, 1);
    let mut file = File::create(path)?;
    file.write_all(&id.to_le_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Finish an interrupted merge: move the compacted segments, hint file
/// and boundary marker from `<dir>-merge/` into `dir`, or abandon the
/// merge directory when it never reached its commit point. Idempotent
/// under crashes at any step.
pub(crate) fn load_merge_files(dir: &Path) -> Result<()> {
    let merge_dir = merge_dir_path(dir);
    if !merge_dir.exists() {
        return Ok(());
    }

    let boundary = merge_fin_segment_id(&merge_dir);
    if boundary == 0 {
        warn!(dir = %merge_dir.display(), "abandoning unfinished merge");
        fs::remove_dir_all(&merge_dir)?;
        return Ok(());
    }

    info!(boundary, "promoting merged segments");
    for id in 1..=boundary {
        let dest = segment_file_name(dir, SEG_FILE_EXT, id);
        if dest.exists() {
            fs::remove_file(&dest)?;
        }
        let src = segment_file_name(&merge_dir, SEG_FILE_EXT, id);
        let src_len = fs::metadata(&src).map(|m| m.len()).unwrap_or(0);
        if src.is_file() && src_len > 0 {
            fs::rename(&src, &dest)?;
        }
    }

    let hint_src = segment_file_name(&merge_dir, HINT_FILE_EXT, 1);
    if hint_src.is_file() {
        fs::rename(&hint_src, segment_file_name(dir, HINT_FILE_EXT, 1))?;
    }
    let fin_src = segment_file_name(&merge_dir, MERGE_FIN_FILE_EXT, 1);
    if fin_src.is_file() {
        fs::rename(&fin_src, segment_file_name(dir, MERGE_FIN_FILE_EXT, 1))?;
    }

    fs::remove_dir_all(&merge_dir)?;
    Ok(())
}

/// Rebuild index entries recorded by the last merge.
fn load_index_from_hint(hint_file: &Wal, index: &mut KeyDir) -> Result<()> {
    let mut reader = hint_file.reader();
    loop {
        let (chunk, _) = match reader.next() {
            Ok(next) => next,
            Err(Error::EndOfSegments) => break,
            Err(e) => return Err(e),
        };
        let (key, position) = decode_hint_record(&chunk)?;
        index.put(key, position);
    }
    Ok(())
}

/// Replay the data WAL into the index.
///
/// Segments at or below the merge boundary are skipped (the hint file
/// covers them). A batch's records only take effect once its finish
/// marker is seen; merge-rewritten records (batch id 0) apply directly.
fn load_index_from_wal(dir: &Path, data_files: &Wal, index: &mut KeyDir) -> Result<()> {
    let boundary = merge_fin_segment_id(dir);
    let mut pending: HashMap<u64, Vec<IndexRecord>> = HashMap::new();

    let mut reader = data_files.reader();
    loop {
        while let Some(id) = reader.current_segment_id() {
            if id <= boundary {
                reader.skip_current_segment();
            } else {
                break;
            }
        }
        let (chunk, position) = match reader.next() {
            Ok(next) => next,
            Err(Error::EndOfSegments) => break,
            Err(e) => return Err(e),
        };

        let record = LogRecord::decode(&chunk)?;
        match record.record_type() {
            LogRecordType::Finished => {
                let key = record.key();
                let batch_id = key
                    .as_ref()
                    .try_into()
                    .map(u64::from_le_bytes)
                    .map_err(|_| Error::corruption("finish record key is not a batch id"))?;
                if let Some(records) = pending.remove(&batch_id) {
                    for index_record in records {
                        match index_record.record_type {
                            LogRecordType::Normal => {
                                index.put(index_record.key, index_record.position);
                            }
                            LogRecordType::Deleted => {
                                index.del(&index_record.key);
                            }
                            LogRecordType::Finished => {}
                        }
                    }
                }
            }
            LogRecordType::Normal if record.batch_id() == MERGE_FINISHED_BATCH_ID => {
                index.put(record.key().clone(), position);
            }
            _ => {
                pending
                    .entry(record.batch_id())
                    .or_default()
                    .push(IndexRecord {
                        key: record.key().clone(),
                        record_type: record.record_type(),
                        position,
                    });
            }
        }
    }

    if !pending.is_empty() {
        debug!(
            batches = pending.len(),
            "dropping uncommitted batches found during replay"
        );
    }
    Ok(())
}
