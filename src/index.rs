//! In-memory key directory.
//!
//! Maps each live key to the position of its most recent record on disk.
//! The map itself is not synchronized; the database reader/writer lock
//! protects it.

use std::collections::HashMap;

use bytes::Bytes;

use crate::wal::ChunkPosition;

/// Key directory: key bytes to chunk position.
#[derive(Debug, Default)]
pub struct KeyDir {
    map: HashMap<Bytes, ChunkPosition>,
}

impl KeyDir {
    /// Create an empty key directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the position for a key.
    pub fn put(&mut self, key: Bytes, position: ChunkPosition) {
        self.map.insert(key, position);
    }

    /// Look up a key's position by value.
    pub fn get(&self, key: &[u8]) -> Option<ChunkPosition> {
        self.map.get(key).copied()
    }

    /// Look up a key's position by reference.
    pub fn get_ref(&self, key: &[u8]) -> Option<&ChunkPosition> {
        self.map.get(key)
    }

    /// Remove a key. Returns true if it was present.
    pub fn del(&mut self, key: &[u8]) -> bool {
        self.remove(key).is_some()
    }

    /// Remove a key, returning its position if it was present.
    pub fn remove(&mut self, key: &[u8]) -> Option<ChunkPosition> {
        self.map.remove(key)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Check if the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
