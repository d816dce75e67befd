//! Write-ahead log.
//!
//! The WAL is an ordered collection of segments inside one directory,
//! with exactly one active (append) segment whose id is greater than any
//! older segment's. Writes go to the active segment and roll over to a
//! fresh one when it would exceed the configured size; durability is
//! governed by `sync_writes` and the `bytes_per_sync` counter. A
//! multi-segment reader streams every record in (segment, offset) order.

mod segment;

pub use segment::{
    ChunkPosition, ChunkType, Segment, SegmentId, SegmentReader, BLOCK_SIZE, CHUNK_HEADER_SIZE,
};

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::debug;

use crate::cache::BlockCache;
use crate::util::filename::parse_segment_file_name;
use crate::{Error, Result};

/// Id of the segment created in an empty directory.
const INITIAL_SEGMENT_ID: SegmentId = 1;

/// Write-ahead log configuration.
#[derive(Debug, Clone)]
pub struct WalOptions {
    /// Directory holding the segment files; created if missing.
    pub dir_path: PathBuf,
    /// Maximum bytes per segment; the rollover threshold.
    pub segment_size: u64,
    /// Segment file extension, including the leading dot.
    pub segment_file_ext: String,
    /// Total bytes for the block cache; 0 disables it.
    pub block_cache: u64,
    /// Fsync after every write.
    pub sync_writes: bool,
    /// Fsync when this many unsynced bytes accumulate; 0 disables.
    pub bytes_per_sync: u32,
}

/// Segment set behind the WAL's reader/writer lock.
#[derive(Debug)]
struct WalInner {
    active_segment: Arc<Segment>,
    older_segments: BTreeMap<SegmentId, Arc<Segment>>,
    /// Bytes appended since the last fsync.
    bytes_write: u64,
}

/// The write-ahead log.
#[derive(Debug)]
pub struct Wal {
    options: WalOptions,
    cache: Option<Arc<BlockCache>>,
    inner: RwLock<WalInner>,
}

impl Wal {
    /// Open a WAL over the segment files in `options.dir_path`.
    ///
    /// The directory is scanned for files carrying the configured
    /// extension; the highest id becomes the active segment. An empty
    /// directory gets a fresh segment 1.
    pub fn open(options: WalOptions) -> Result<Self> {
        if !options.segment_file_ext.starts_with('.') {
            return Err(Error::InvalidConfiguration(
                "segment file extension must start with '.'".into(),
            ));
        }
        if options.block_cache > options.segment_size {
            return Err(Error::InvalidConfiguration(
                "block cache must not exceed segment size".into(),
            ));
        }
        fs::create_dir_all(&options.dir_path)?;

        let cache = if options.block_cache > 0 {
            let blocks = options.block_cache.div_ceil(BLOCK_SIZE as u64) as usize;
            Some(Arc::new(BlockCache::new(blocks)))
        } else {
            None
        };

        let mut segment_ids = Vec::new();
        for entry in fs::read_dir(&options.dir_path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            if let Some(id) =
                parse_segment_file_name(&name.to_string_lossy(), &options.segment_file_ext)
            {
                segment_ids.push(id);
            }
        }
        segment_ids.sort_unstable();

        let mut older_segments = BTreeMap::new();
        let active_segment = match segment_ids.last() {
            None => Arc::new(Segment::open(
                &options.dir_path,
                &options.segment_file_ext,
                INITIAL_SEGMENT_ID,
                cache.clone(),
            )?),
            Some(&active_id) => {
                for &id in &segment_ids[..segment_ids.len() - 1] {
                    let segment = Segment::open(
                        &options.dir_path,
                        &options.segment_file_ext,
                        id,
                        cache.clone(),
                    )?;
                    older_segments.insert(id, Arc::new(segment));
                }
                Arc::new(Segment::open(
                    &options.dir_path,
                    &options.segment_file_ext,
                    active_id,
                    cache.clone(),
                )?)
            }
        };

        Ok(Self {
            options,
            cache,
            inner: RwLock::new(WalInner {
                active_segment,
                older_segments,
                bytes_write: 0,
            }),
        })
    }

    /// The WAL configuration.
    pub fn options(&self) -> &WalOptions {
        &self.options
    }

    /// Whether the WAL holds no data at all.
    pub fn empty(&self) -> bool {
        let inner = self.inner.read();
        inner.older_segments.is_empty() && inner.active_segment.size() == 0
    }

    /// Id of the active segment.
    pub fn active_segment_id(&self) -> SegmentId {
        self.inner.read().active_segment.id()
    }

    /// Append a record, rolling to a new segment if the active one would
    /// overflow. Returns the record's position.
    pub fn write(&self, data: &[u8]) -> Result<ChunkPosition> {
        let mut inner = self.inner.write();

        let needed = data.len() as u64 + CHUNK_HEADER_SIZE as u64;
        if needed > self.options.segment_size {
            return Err(Error::ValueTooLarge {
                size: data.len() as u64,
                max: self.options.segment_size.saturating_sub(CHUNK_HEADER_SIZE as u64),
            });
        }
        if inner.active_segment.size() + needed > self.options.segment_size {
            inner.active_segment.sync()?;
            inner.bytes_write = 0;
            self.roll_active_segment(&mut inner)?;
        }

        let position = inner.active_segment.write(data)?;
        inner.bytes_write += u64::from(position.chunk_size);

        let need_sync = self.options.sync_writes
            || (self.options.bytes_per_sync > 0
                && inner.bytes_write >= u64::from(self.options.bytes_per_sync));
        if need_sync {
            inner.active_segment.sync()?;
            inner.bytes_write = 0;
        }
        Ok(position)
    }

    /// Read the record at `position`.
    pub fn read(&self, position: &ChunkPosition) -> Result<Bytes> {
        let inner = self.inner.read();
        let segment = if position.segment_id == inner.active_segment.id() {
            &inner.active_segment
        } else {
            inner
                .older_segments
                .get(&position.segment_id)
                .ok_or(Error::SegmentNotFound(position.segment_id))?
        };
        segment.read(position.block_number, position.chunk_offset)
    }

    /// Seal the active segment and start a fresh one with the next id.
    pub fn rotate_active_segment(&self) -> Result<()> {
        let mut inner = self.inner.write();
        inner.active_segment.sync()?;
        self.roll_active_segment(&mut inner)
    }

    fn roll_active_segment(&self, inner: &mut WalInner) -> Result<()> {
        let next_id = inner.active_segment.id() + 1;
        debug!(segment_id = next_id, "rolling to new active segment");
        let segment = Arc::new(Segment::open(
            &self.options.dir_path,
            &self.options.segment_file_ext,
            next_id,
            self.cache.clone(),
        )?);
        let previous = std::mem::replace(&mut inner.active_segment, segment);
        inner.older_segments.insert(previous.id(), previous);
        Ok(())
    }

    /// Fsync the active segment.
    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.write();
        inner.active_segment.sync()
    }

    /// Close every segment and drop the block cache.
    pub fn close(&self) -> Result<()> {
        let inner = self.inner.write();
        if let Some(cache) = &self.cache {
            cache.clear();
        }
        for segment in inner.older_segments.values() {
            segment.close();
        }
        inner.active_segment.close();
        Ok(())
    }

    /// Close every segment and unlink its file.
    pub fn remove_files(&self) -> Result<()> {
        let inner = self.inner.write();
        if let Some(cache) = &self.cache {
            cache.clear();
        }
        for segment in inner.older_segments.values() {
            segment.remove()?;
        }
        inner.active_segment.remove()
    }

    /// A reader over every segment, oldest first.
    pub fn reader(&self) -> WalReader {
        self.reader_with_max(0)
    }

    /// A reader over the segments with id at most `max_segment_id`
    /// (0 means all). The segment set is snapshotted at call time;
    /// segments created afterwards are not visible.
    pub fn reader_with_max(&self, max_segment_id: SegmentId) -> WalReader {
        let inner = self.inner.read();

        let mut readers: Vec<SegmentReader> = inner
            .older_segments
            .values()
            .filter(|segment| max_segment_id == 0 || segment.id() <= max_segment_id)
            .map(|segment| segment.reader())
            .collect();
        if max_segment_id == 0 || inner.active_segment.id() <= max_segment_id {
            readers.push(inner.active_segment.reader());
        }
        readers.sort_by_key(|reader| reader.id());

        WalReader {
            readers,
            current: 0,
        }
    }
}

/// Streaming reader over a snapshot of a WAL's segments.
pub struct WalReader {
    readers: Vec<SegmentReader>,
    current: usize,
}

impl WalReader {
    /// Read the next record in log order, moving to the next segment
    /// when the current one is exhausted. Returns `EndOfSegments` after
    /// the last segment.
    pub fn next(&mut self) -> Result<(Bytes, ChunkPosition)> {
        loop {
            let reader = match self.readers.get_mut(self.current) {
                Some(reader) => reader,
                None => return Err(Error::EndOfSegments),
            };
            match reader.next() {
                Err(Error::EndOfSegment) => self.current += 1,
                other => return other,
            }
        }
    }

    /// Skip the rest of the current segment.
    pub fn skip_current_segment(&mut self) {
        self.current += 1;
    }

    /// Id of the segment the cursor is in, or `None` when exhausted.
    pub fn current_segment_id(&self) -> Option<SegmentId> {
        self.readers.get(self.current).map(|reader| reader.id())
    }
}
