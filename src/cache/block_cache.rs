//! Block cache shared by the segments of one write-ahead log.
//!
//! Caches decoded 32KiB blocks to avoid repeated disk reads. The cache is
//! handed to every segment of a WAL by reference; a mutex serializes
//! access so the single-threaded LRU core underneath stays sound.

use bytes::Bytes;
use parking_lot::Mutex;

use super::lru::LruCache;

/// Key for a cached block: `(segment_id << 32) | block_number`.
fn block_key(segment_id: u32, block_number: u32) -> u64 {
    (u64::from(segment_id) << 32) | u64::from(block_number)
}

/// Block cache keyed by segment id and block number.
#[derive(Debug)]
pub struct BlockCache {
    cache: Mutex<LruCache<u64, Bytes>>,
}

impl BlockCache {
    /// Create a block cache holding up to `capacity` blocks.
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Get a cached block.
    pub fn get(&self, segment_id: u32, block_number: u32) -> Option<Bytes> {
        self.cache.lock().get(&block_key(segment_id, block_number))
    }

    /// Insert a block.
    pub fn put(&self, segment_id: u32, block_number: u32, block: Bytes) {
        self.cache.lock().put(block_key(segment_id, block_number), block);
    }

    /// Number of cached blocks.
    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    /// Drop every cached block.
    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}
