//! Caching layer.

mod block_cache;
mod lru;

pub use block_cache::BlockCache;
pub use lru::LruCache;
