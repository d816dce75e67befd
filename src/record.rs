//! Log record codec.
//!
//! A log record is the logical payload written through the WAL. Every
//! record carries the id of the batch that produced it; a batch is sealed
//! by a `Finished` record whose key holds the batch id. All integer
//! fields are little-endian.
//!
//! # Format
//!
//! ```text
//! type (1) | batch_id (8) | key_len (4) | value_len (4) | key | value
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::wal::ChunkPosition;
use crate::{Error, Result};

/// Size of the fixed record prefix before key and value bytes.
pub const RECORD_HEADER_SIZE: usize = 17;

/// Record types in the data log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogRecordType {
    /// A live key-value pair.
    Normal = 0,
    /// A tombstone marking key removal.
    Deleted = 1,
    /// A commit marker sealing a batch.
    Finished = 2,
}

impl LogRecordType {
    /// Create from byte value.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(LogRecordType::Normal),
            1 => Some(LogRecordType::Deleted),
            2 => Some(LogRecordType::Finished),
            _ => None,
        }
    }

    /// Convert to byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// A decoded or to-be-written log record.
#[derive(Debug, Clone)]
pub struct LogRecord {
    key: Bytes,
    value: Bytes,
    record_type: LogRecordType,
    batch_id: u64,
}

impl LogRecord {
    /// Create a record.
    pub fn new(key: Bytes, value: Bytes, record_type: LogRecordType, batch_id: u64) -> Self {
        Self {
            key,
            value,
            record_type,
            batch_id,
        }
    }

    /// Create a live key-value record.
    pub fn normal(key: Bytes, value: Bytes) -> Self {
        Self::new(key, value, LogRecordType::Normal, 0)
    }

    /// Create a tombstone for a key.
    pub fn tombstone(key: Bytes) -> Self {
        Self::new(key, Bytes::new(), LogRecordType::Deleted, 0)
    }

    /// Create the commit marker for a batch. The batch id travels in the
    /// key so replay can recover it without a value lookup.
    pub fn finished(batch_id: u64) -> Self {
        Self::new(
            Bytes::copy_from_slice(&batch_id.to_le_bytes()),
            Bytes::new(),
            LogRecordType::Finished,
            0,
        )
    }

    /// The record key.
    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// The record value.
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    /// The record type.
    pub fn record_type(&self) -> LogRecordType {
        self.record_type
    }

    /// The id of the batch this record belongs to.
    pub fn batch_id(&self) -> u64 {
        self.batch_id
    }

    /// Stamp the batch id, done once at commit time.
    pub fn set_batch_id(&mut self, batch_id: u64) {
        self.batch_id = batch_id;
    }

    /// Consume the record, returning its value.
    pub fn into_value(self) -> Bytes {
        self.value
    }

    /// Serialize to the on-disk layout.
    pub fn encode(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(RECORD_HEADER_SIZE + self.key.len() + self.value.len());
        buf.put_u8(self.record_type.to_byte());
        buf.put_u64_le(self.batch_id);
        buf.put_u32_le(self.key.len() as u32);
        buf.put_u32_le(self.value.len() as u32);
        buf.put_slice(&self.key);
        buf.put_slice(&self.value);
        buf.freeze()
    }

    /// Decode a record from a chunk payload.
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < RECORD_HEADER_SIZE {
            return Err(Error::corruption("log record too short"));
        }

        let type_byte = data.get_u8();
        let record_type = LogRecordType::from_byte(type_byte)
            .ok_or_else(|| Error::corruption(format!("invalid record type {}", type_byte)))?;
        let batch_id = data.get_u64_le();
        let key_len = data.get_u32_le() as usize;
        let value_len = data.get_u32_le() as usize;

        if data.len() < key_len + value_len {
            return Err(Error::corruption("log record key/value truncated"));
        }
        let key = Bytes::copy_from_slice(&data[..key_len]);
        data.advance(key_len);
        let value = Bytes::copy_from_slice(&data[..value_len]);

        Ok(Self {
            key,
            value,
            record_type,
            batch_id,
        })
    }
}

/// A buffered index update captured during WAL replay, applied once the
/// owning batch's commit marker is seen.
#[derive(Debug, Clone)]
pub struct IndexRecord {
    pub key: Bytes,
    pub record_type: LogRecordType,
    pub position: ChunkPosition,
}
