//! LRU cache implementation.
//!
//! A single-threaded LRU with configurable capacity and elasticity.
//! Inserts may overshoot the capacity by up to `elasticity` entries
//! before a prune pass evicts back down to `capacity`; this amortizes
//! eviction work across bursts of insertions.
//!
//! Entries live in a compact slab ordered by a doubly-linked recency
//! chain; removal swaps the last slot into the hole so the slab never
//! fragments. The cache has no internal synchronization - concurrent
//! callers wrap it in a lock (see [`super::block_cache::BlockCache`]).

use std::collections::HashMap;
use std::hash::Hash;

/// Default number of entries an insert burst may overshoot capacity by.
pub const DEFAULT_ELASTICITY: usize = 10;

/// Slot index marking the end of the recency chain.
const NIL: usize = usize::MAX;

/// One slab slot: an entry plus its position in the recency chain.
#[derive(Debug)]
struct Entry<K, V> {
    key: K,
    value: V,
    /// Neighbor toward the most recently used end; NIL at the head.
    newer: usize,
    /// Neighbor toward the least recently used end; NIL at the tail.
    older: usize,
}

/// An LRU cache ordered by recency of access.
///
/// A capacity of 0 disables eviction entirely.
#[derive(Debug)]
pub struct LruCache<K, V> {
    /// Maximum number of entries after a prune pass.
    capacity: usize,
    /// Entries tolerated beyond capacity before pruning.
    elasticity: usize,
    /// Map from key to slab slot.
    index: HashMap<K, usize>,
    /// Dense entry storage; slots hold live entries only.
    entries: Vec<Entry<K, V>>,
    /// Most recently used slot, NIL when empty.
    head: usize,
    /// Least recently used slot, NIL when empty.
    tail: usize,
}

impl<K: Hash + Eq + Clone, V: Clone> LruCache<K, V> {
    /// Create a cache with the given capacity and default elasticity.
    pub fn new(capacity: usize) -> Self {
        Self::with_elasticity(capacity, DEFAULT_ELASTICITY)
    }

    /// Create a cache with explicit capacity and elasticity.
    pub fn with_elasticity(capacity: usize, elasticity: usize) -> Self {
        Self {
            capacity,
            elasticity,
            index: HashMap::with_capacity(capacity + elasticity),
            entries: Vec::with_capacity(capacity + elasticity),
            head: NIL,
            tail: NIL,
        }
    }

    /// Get a value, promoting the entry to most recently used.
    pub fn get(&mut self, key: &K) -> Option<V> {
        let slot = *self.index.get(key)?;
        self.touch(slot);
        Some(self.entries[slot].value.clone())
    }

    /// Insert or update a value, promoting it to most recently used.
    ///
    /// Returns the number of entries evicted by the prune pass.
    pub fn put(&mut self, key: K, value: V) -> usize {
        if let Some(&slot) = self.index.get(&key) {
            self.entries[slot].value = value;
            self.touch(slot);
            return 0;
        }

        let slot = self.entries.len();
        self.entries.push(Entry {
            key: key.clone(),
            value,
            newer: NIL,
            older: NIL,
        });
        self.index.insert(key, slot);
        self.attach_front(slot);
        self.prune()
    }

    /// Remove an entry, returning its value if present.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.index.remove(key)?;
        Some(self.take_slot(slot).value)
    }

    /// Check whether a key is cached without promoting it.
    pub fn contains_key(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Capacity after pruning.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.index.clear();
        self.entries.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    /// Evict least recently used entries once the overshoot budget is
    /// spent, bringing the size back down to capacity.
    fn prune(&mut self) -> usize {
        if self.capacity == 0 || self.entries.len() <= self.capacity + self.elasticity {
            return 0;
        }
        let mut evicted = 0;
        while self.entries.len() > self.capacity {
            let victim = self.take_slot(self.tail);
            self.index.remove(&victim.key);
            evicted += 1;
        }
        evicted
    }

    /// Move a slot to the head of the recency chain.
    fn touch(&mut self, slot: usize) {
        if self.head == slot {
            return;
        }
        self.detach(slot);
        self.attach_front(slot);
    }

    /// Unlink a slot from the recency chain, leaving it in the slab.
    fn detach(&mut self, slot: usize) {
        let newer = self.entries[slot].newer;
        let older = self.entries[slot].older;
        match newer {
            NIL => self.head = older,
            n => self.entries[n].older = older,
        }
        match older {
            NIL => self.tail = newer,
            o => self.entries[o].newer = newer,
        }
    }

    /// Link a slot in as the most recently used entry.
    fn attach_front(&mut self, slot: usize) {
        self.entries[slot].newer = NIL;
        self.entries[slot].older = self.head;
        match self.head {
            NIL => self.tail = slot,
            h => self.entries[h].newer = slot,
        }
        self.head = slot;
    }

    /// Unlink a slot and pull it out of the slab. The last slot is
    /// swapped into the hole, so its chain neighbors and index entry are
    /// rewired to the new position.
    fn take_slot(&mut self, slot: usize) -> Entry<K, V> {
        self.detach(slot);
        let removed = self.entries.swap_remove(slot);

        if slot < self.entries.len() {
            let newer = self.entries[slot].newer;
            let older = self.entries[slot].older;
            match newer {
                NIL => self.head = slot,
                n => self.entries[n].older = slot,
            }
            match older {
                NIL => self.tail = slot,
                o => self.entries[o].newer = slot,
            }
            let moved_key = self.entries[slot].key.clone();
            self.index.insert(moved_key, slot);
        }
        removed
    }
}
