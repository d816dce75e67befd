//! Segment files.
//!
//! A segment is a single append-only file made of fixed-size 32KiB
//! blocks. Each block holds a sequence of chunks: a 7-byte header (CRC,
//! length, chunk type) followed by the payload. A record that does not
//! fit in the remaining block space is split across consecutive blocks
//! with First/Middle/Last chunk types; a block tail too small for a
//! header is zero padding.
//!
//! # Block format
//!
//! ```text
//! +---------+---------+-----------+--- ... ---+---------+
//! | crc (4) | len (2) | type (1)  |  payload  | padding |
//! +---------+---------+-----------+--- ... ---+---------+
//! ```
//!
//! The CRC covers the length and type bytes followed by the payload.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::debug;

use crate::cache::BlockCache;
use crate::util::crc::checksum_parts;
use crate::util::filename::segment_file_name;
use crate::{Error, Result};

/// Identifier of a segment within a WAL, also its file name prefix.
pub type SegmentId = u32;

/// Size of a logical block inside a segment file (32KiB).
pub const BLOCK_SIZE: usize = 32 * 1024;

/// Size of a chunk header: CRC (4) + length (2) + type (1).
pub const CHUNK_HEADER_SIZE: usize = 7;

/// Permission bits for newly created segment files.
const SEGMENT_FILE_MODE: u32 = 0o644;

/// Chunk framing types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkType {
    /// Complete record in a single chunk.
    Full = 0,
    /// First chunk of a record spanning blocks.
    First = 1,
    /// Interior chunk of a spanning record.
    Middle = 2,
    /// Final chunk of a spanning record.
    Last = 3,
}

impl ChunkType {
    /// Create from byte value.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(ChunkType::Full),
            1 => Some(ChunkType::First),
            2 => Some(ChunkType::Middle),
            3 => Some(ChunkType::Last),
            _ => None,
        }
    }

    /// Convert to byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Location of a record in the WAL.
///
/// Equality compares segment, block and offset only; `chunk_size` is
/// informational and depends on whether the producer was a write (header
/// bytes plus payload) or a sequential reader (cursor distance, which may
/// include block padding).
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkPosition {
    /// Segment the record lives in.
    pub segment_id: SegmentId,
    /// Block holding the record's first chunk.
    pub block_number: u32,
    /// Byte offset of the first chunk header within that block.
    pub chunk_offset: i64,
    /// Total bytes occupied by the record's chunks.
    pub chunk_size: u32,
}

impl PartialEq for ChunkPosition {
    fn eq(&self, other: &Self) -> bool {
        self.segment_id == other.segment_id
            && self.block_number == other.block_number
            && self.chunk_offset == other.chunk_offset
    }
}

impl Eq for ChunkPosition {}

/// Append cursor of a segment.
#[derive(Debug)]
struct SegmentState {
    /// Index of the block currently being filled.
    block_number: u32,
    /// Bytes used in that block.
    block_size: u32,
    /// Whether the segment has been closed.
    closed: bool,
}

/// A single append-only segment file.
#[derive(Debug)]
pub struct Segment {
    id: SegmentId,
    path: PathBuf,
    file: File,
    cache: Option<Arc<BlockCache>>,
    state: Mutex<SegmentState>,
}

impl Segment {
    /// Open (or create) the segment file for `id` in `dir`.
    ///
    /// The append cursor is derived from the current file size.
    pub fn open(
        dir: &Path,
        ext: &str,
        id: SegmentId,
        cache: Option<Arc<BlockCache>>,
    ) -> Result<Self> {
        let path = segment_file_name(dir, ext, id);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .mode(SEGMENT_FILE_MODE)
            .open(&path)?;
        let size = file.metadata()?.len();
        debug!(path = %path.display(), size, "opened segment file");

        Ok(Self {
            id,
            path,
            file,
            cache,
            state: Mutex::new(SegmentState {
                block_number: (size / BLOCK_SIZE as u64) as u32,
                block_size: (size % BLOCK_SIZE as u64) as u32,
                closed: false,
            }),
        })
    }

    /// The segment id.
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Current size of the segment in bytes.
    pub fn size(&self) -> u64 {
        let state = self.state.lock();
        Self::size_of(&state)
    }

    fn size_of(state: &SegmentState) -> u64 {
        u64::from(state.block_number) * BLOCK_SIZE as u64 + u64::from(state.block_size)
    }

    /// Whether the segment has been closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Fsync the segment file.
    pub fn sync(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SegmentClosed);
        }
        self.file.sync_all()?;
        Ok(())
    }

    /// Mark the segment closed. Further reads and writes fail.
    pub fn close(&self) {
        self.state.lock().closed = true;
    }

    /// Close the segment and unlink its file.
    pub fn remove(&self) -> Result<()> {
        self.close();
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    /// Append a record, chunking it across blocks as needed.
    ///
    /// Returns the position of the record's first chunk; its
    /// `chunk_size` counts one header per emitted chunk plus the payload.
    pub fn write(&self, data: &[u8]) -> Result<ChunkPosition> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::SegmentClosed);
        }

        // A block tail that cannot hold a header plus any payload is
        // zero-padded; the file is extended to the block boundary and
        // the cursor moves to the next block.
        if state.block_size as usize + CHUNK_HEADER_SIZE >= BLOCK_SIZE {
            if (state.block_size as usize) < BLOCK_SIZE {
                let padding = BLOCK_SIZE as u64 - u64::from(state.block_size);
                self.file.set_len(Self::size_of(&state) + padding)?;
            }
            state.block_number += 1;
            state.block_size = 0;
        }

        let mut position = ChunkPosition {
            segment_id: self.id,
            block_number: state.block_number,
            chunk_offset: i64::from(state.block_size),
            chunk_size: data.len() as u32,
        };

        if state.block_size as usize + CHUNK_HEADER_SIZE + data.len() <= BLOCK_SIZE {
            self.write_chunk(&mut state, data, ChunkType::Full)?;
            position.chunk_size = (CHUNK_HEADER_SIZE + data.len()) as u32;
            return Ok(position);
        }

        // Spanning record: carve First/Middle*/Last slices, each filling
        // its block to the boundary.
        let mut left = data.len();
        let mut chunk_count = 0u32;
        while left > 0 {
            let space = BLOCK_SIZE - state.block_size as usize - CHUNK_HEADER_SIZE;
            let take = space.min(left);
            let begin = data.len() - left;
            let chunk_type = if left == data.len() {
                ChunkType::First
            } else if left == take {
                ChunkType::Last
            } else {
                ChunkType::Middle
            };
            self.write_chunk(&mut state, &data[begin..begin + take], chunk_type)?;
            left -= take;
            chunk_count += 1;
        }
        position.chunk_size = chunk_count * CHUNK_HEADER_SIZE as u32 + data.len() as u32;
        Ok(position)
    }

    /// Emit one chunk and advance the cursor, rolling to the next block
    /// when this chunk fills it exactly.
    fn write_chunk(&self, state: &mut SegmentState, data: &[u8], chunk_type: ChunkType) -> Result<()> {
        debug_assert!(data.len() <= u16::MAX as usize);

        let mut header = [0u8; CHUNK_HEADER_SIZE];
        header[4..6].copy_from_slice(&(data.len() as u16).to_le_bytes());
        header[6] = chunk_type.to_byte();
        let crc = checksum_parts(&[&header[4..7], data]);
        header[0..4].copy_from_slice(&crc.to_le_bytes());

        (&self.file).write_all(&header)?;
        (&self.file).write_all(data)?;

        state.block_size += (CHUNK_HEADER_SIZE + data.len()) as u32;
        debug_assert!(state.block_size as usize <= BLOCK_SIZE);
        if state.block_size as usize == BLOCK_SIZE {
            state.block_number += 1;
            state.block_size = 0;
        }
        Ok(())
    }

    /// Read the record whose first chunk lives at (block, offset).
    pub fn read(&self, block_number: u32, chunk_offset: i64) -> Result<Bytes> {
        let mut position = ChunkPosition {
            segment_id: self.id,
            block_number,
            chunk_offset,
            chunk_size: 0,
        };
        self.read_internal(&mut position)
    }

    /// Read the record starting at `position` and advance `position` to
    /// the first chunk after it.
    fn read_internal(&self, position: &mut ChunkPosition) -> Result<Bytes> {
        let segment_size = {
            let state = self.state.lock();
            if state.closed {
                return Err(Error::SegmentClosed);
            }
            Self::size_of(&state)
        };

        let mut block_number = position.block_number;
        let mut chunk_offset = position.chunk_offset.max(0) as u64;
        let mut result = BytesMut::new();

        loop {
            let block_start = u64::from(block_number) * BLOCK_SIZE as u64;
            if block_start >= segment_size {
                return Err(Error::EndOfSegment);
            }
            let slice_size = (BLOCK_SIZE as u64).min(segment_size - block_start) as usize;
            if chunk_offset >= slice_size as u64 {
                return Err(Error::EndOfSegment);
            }

            let block = self.fetch_block(block_number, block_start, slice_size)?;
            let offset = chunk_offset as usize;
            if offset + CHUNK_HEADER_SIZE > block.len() {
                return Err(Error::corruption("chunk header extends past block"));
            }
            let header = &block[offset..offset + CHUNK_HEADER_SIZE];
            let stored_crc = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let length = u16::from_le_bytes([header[4], header[5]]) as usize;
            let chunk_type = ChunkType::from_byte(header[6])
                .ok_or_else(|| Error::corruption(format!("invalid chunk type {}", header[6])))?;

            let payload_start = offset + CHUNK_HEADER_SIZE;
            if payload_start + length > block.len() {
                return Err(Error::corruption("chunk payload extends past block"));
            }
            let payload = &block[payload_start..payload_start + length];
            let actual = checksum_parts(&[&header[4..7], payload]);
            if actual != stored_crc {
                return Err(Error::CrcMismatch {
                    expected: stored_crc,
                    actual,
                });
            }
            result.extend_from_slice(payload);

            let chunk_end = payload_start + length;
            match chunk_type {
                ChunkType::Full | ChunkType::Last => {
                    position.block_number = block_number;
                    position.chunk_offset = chunk_end as i64;
                    // The tail past this chunk is padding; the next chunk
                    // starts on the following block.
                    if chunk_end + CHUNK_HEADER_SIZE >= BLOCK_SIZE {
                        position.block_number += 1;
                        position.chunk_offset = 0;
                    }
                    break;
                }
                ChunkType::First | ChunkType::Middle => {
                    block_number += 1;
                    chunk_offset = 0;
                }
            }
        }
        Ok(result.freeze())
    }

    /// Fetch a block, consulting the shared cache. Only full-size (hence
    /// immutable) blocks are inserted.
    fn fetch_block(&self, block_number: u32, block_start: u64, slice_size: usize) -> Result<Bytes> {
        if let Some(cache) = &self.cache {
            if let Some(block) = cache.get(self.id, block_number) {
                return Ok(block);
            }
        }

        let mut buf = vec![0u8; slice_size];
        self.file.read_exact_at(&mut buf, block_start)?;
        let block = Bytes::from(buf);

        if slice_size == BLOCK_SIZE {
            if let Some(cache) = &self.cache {
                cache.put(self.id, block_number, block.clone());
            }
        }
        Ok(block)
    }

    /// A streaming cursor over this segment's records, starting at the
    /// first chunk of the first block.
    pub fn reader(self: &Arc<Self>) -> SegmentReader {
        SegmentReader {
            segment: Arc::clone(self),
            block_number: 0,
            chunk_offset: 0,
        }
    }
}

/// Sequential reader over one segment.
pub struct SegmentReader {
    segment: Arc<Segment>,
    block_number: u32,
    chunk_offset: i64,
}

impl SegmentReader {
    /// Id of the segment being read.
    pub fn id(&self) -> SegmentId {
        self.segment.id
    }

    /// Read the next record and the position it came from, advancing the
    /// cursor past it. Returns `EndOfSegment` at the tail.
    pub fn next(&mut self) -> Result<(Bytes, ChunkPosition)> {
        if self.segment.is_closed() {
            return Err(Error::SegmentClosed);
        }

        let mut next_position = ChunkPosition {
            segment_id: self.segment.id,
            block_number: self.block_number,
            chunk_offset: self.chunk_offset,
            chunk_size: 0,
        };
        let data = self.segment.read_internal(&mut next_position)?;

        // chunk_size here is the cursor distance, which also covers any
        // block-tail padding skipped after the record.
        let begin = u64::from(self.block_number) * BLOCK_SIZE as u64 + self.chunk_offset as u64;
        let end =
            u64::from(next_position.block_number) * BLOCK_SIZE as u64 + next_position.chunk_offset as u64;
        let position = ChunkPosition {
            segment_id: self.segment.id,
            block_number: self.block_number,
            chunk_offset: self.chunk_offset,
            chunk_size: (end - begin) as u32,
        };

        self.block_number = next_position.block_number;
        self.chunk_offset = next_position.chunk_offset;
        Ok((data, position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_segment(dir: &Path, id: SegmentId) -> Segment {
        Segment::open(dir, ".SEG", id, None).unwrap()
    }

    #[test]
    fn test_write_read_full_chunks() {
        let dir = tempdir().unwrap();
        let seg = open_segment(dir.path(), 1);

        let data1: Vec<u8> = (0..100).map(|i| (i * 7 % 251) as u8).collect();
        let data2: Vec<u8> = (0..100).map(|i| (i * 13 % 251) as u8).collect();

        let pos1 = seg.write(&data1).unwrap();
        let pos2 = seg.write(&data2).unwrap();

        assert_eq!(seg.read(pos1.block_number, pos1.chunk_offset).unwrap(), &data1[..]);
        assert_eq!(seg.read(pos2.block_number, pos2.chunk_offset).unwrap(), &data2[..]);
    }

    #[test]
    fn test_write_read_many() {
        let dir = tempdir().unwrap();
        let seg = open_segment(dir.path(), 1);

        let data = vec![0x23u8; 100];
        for _ in 0..10_000 {
            let pos = seg.write(&data).unwrap();
            let value = seg.read(pos.block_number, pos.chunk_offset).unwrap();
            assert_eq!(value, &data[..]);
        }
    }

    #[test]
    fn test_write_block_sized() {
        let dir = tempdir().unwrap();
        let seg = open_segment(dir.path(), 1);

        let data = vec![0x23u8; BLOCK_SIZE - CHUNK_HEADER_SIZE];

        let pos1 = seg.write(&data).unwrap();
        assert_eq!(pos1.block_number, 0);
        assert_eq!(pos1.chunk_offset, 0);
        assert_eq!(seg.read(pos1.block_number, pos1.chunk_offset).unwrap(), &data[..]);

        let pos2 = seg.write(&data).unwrap();
        assert_eq!(pos2.block_number, 1);
        assert_eq!(pos2.chunk_offset, 0);
        assert_eq!(seg.read(pos2.block_number, pos2.chunk_offset).unwrap(), &data[..]);
    }

    #[test]
    fn test_write_pads_short_block_tail() {
        let dir = tempdir().unwrap();
        let seg = open_segment(dir.path(), 1);

        // Leaves 3 bytes in block 0, less than a chunk header
        let data = vec![0x23u8; BLOCK_SIZE - CHUNK_HEADER_SIZE - 3];

        let pos1 = seg.write(&data).unwrap();
        assert_eq!(pos1.block_number, 0);

        let pos2 = seg.write(&data).unwrap();
        assert_eq!(pos2.block_number, 1);
        assert_eq!(pos2.chunk_offset, 0);

        assert_eq!(seg.read(pos1.block_number, pos1.chunk_offset).unwrap(), &data[..]);
        assert_eq!(seg.read(pos2.block_number, pos2.chunk_offset).unwrap(), &data[..]);
    }

    #[test]
    fn test_write_read_spanning() {
        let dir = tempdir().unwrap();
        let seg = open_segment(dir.path(), 1);

        let data = vec![0x23u8; BLOCK_SIZE + 100];
        for _ in 0..3 {
            let pos = seg.write(&data).unwrap();
            assert_eq!(seg.read(pos.block_number, pos.chunk_offset).unwrap(), &data[..]);
        }

        let data2 = vec![0x23u8; BLOCK_SIZE * 3 + 100];
        let pos = seg.write(&data2).unwrap();
        assert_eq!(seg.read(pos.block_number, pos.chunk_offset).unwrap(), &data2[..]);
    }

    #[test]
    fn test_chunk_size_accounting() {
        let dir = tempdir().unwrap();
        let seg = open_segment(dir.path(), 1);

        let pos = seg.write(&[0x23u8; 100]).unwrap();
        assert_eq!(pos.chunk_size, (CHUNK_HEADER_SIZE + 100) as u32);

        // Spans two blocks: two headers
        let pos = seg.write(&vec![0x23u8; BLOCK_SIZE]).unwrap();
        assert_eq!(pos.chunk_size, (2 * CHUNK_HEADER_SIZE + BLOCK_SIZE) as u32);
    }

    #[test]
    fn test_reader_returns_records_in_order() {
        let dir = tempdir().unwrap();
        let seg = Arc::new(open_segment(dir.path(), 1));

        let data = vec![0x23u8; BLOCK_SIZE + 100];
        let pos1 = seg.write(&data).unwrap();
        let pos2 = seg.write(&data).unwrap();

        let mut reader = seg.reader();

        let (value, rpos) = reader.next().unwrap();
        assert_eq!(value, &data[..]);
        assert_eq!(rpos, pos1);

        let (value, rpos) = reader.next().unwrap();
        assert_eq!(value, &data[..]);
        assert_eq!(rpos, pos2);

        assert_eq!(reader.next().unwrap_err(), Error::EndOfSegment);
    }

    #[test]
    fn test_reader_many_chunks_with_cache() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(BlockCache::new(5));
        let seg = Arc::new(Segment::open(dir.path(), ".SEG", 1, Some(cache)).unwrap());

        let data = vec![0x23u8; 128];
        let mut positions = Vec::new();
        for _ in 0..10_000 {
            positions.push(seg.write(&data).unwrap());
        }

        let mut reader = seg.reader();
        let mut i = 0;
        loop {
            match reader.next() {
                Ok((value, rpos)) => {
                    assert_eq!(value, &data[..]);
                    assert_eq!(rpos, positions[i]);
                    i += 1;
                }
                Err(Error::EndOfSegment) => break,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(i, positions.len());
    }

    #[test]
    fn test_reopen_preserves_cursor() {
        let dir = tempdir().unwrap();
        let data = vec![0x42u8; 300];

        let pos1 = {
            let seg = open_segment(dir.path(), 1);
            seg.write(&data).unwrap()
        };

        let seg = open_segment(dir.path(), 1);
        let pos2 = seg.write(&data).unwrap();
        assert_ne!(pos1, pos2);
        assert_eq!(seg.read(pos1.block_number, pos1.chunk_offset).unwrap(), &data[..]);
        assert_eq!(seg.read(pos2.block_number, pos2.chunk_offset).unwrap(), &data[..]);
    }

    #[test]
    fn test_closed_segment_rejects_operations() {
        let dir = tempdir().unwrap();
        let seg = open_segment(dir.path(), 1);
        let pos = seg.write(b"data").unwrap();

        seg.close();
        assert_eq!(seg.write(b"more").unwrap_err(), Error::SegmentClosed);
        assert_eq!(
            seg.read(pos.block_number, pos.chunk_offset).unwrap_err(),
            Error::SegmentClosed
        );
        assert_eq!(seg.sync().unwrap_err(), Error::SegmentClosed);
    }

    #[test]
    fn test_corrupted_payload_fails_crc() {
        let dir = tempdir().unwrap();
        let seg = open_segment(dir.path(), 1);
        let pos = seg.write(&[0x23u8; 100]).unwrap();

        // Flip a payload byte behind the segment's back
        let path = segment_file_name(dir.path(), ".SEG", 1);
        let file = OpenOptions::new().write(true).open(path).unwrap();
        file.write_all_at(&[0xFF], CHUNK_HEADER_SIZE as u64 + 10).unwrap();

        let err = seg.read(pos.block_number, pos.chunk_offset).unwrap_err();
        assert!(matches!(err, Error::CrcMismatch { .. }));
    }

    #[test]
    fn test_remove_deletes_file() {
        let dir = tempdir().unwrap();
        let seg = open_segment(dir.path(), 1);
        seg.write(b"data").unwrap();

        let path = segment_file_name(dir.path(), ".SEG", 1);
        assert!(path.exists());
        seg.remove().unwrap();
        assert!(!path.exists());
    }
}
