//! Chunk integrity checksums.
//!
//! Chunk headers carry a CRC-32 (IEEE) over the header tail followed by
//! the payload, so the checksum is computed over a sequence of slices
//! rather than one contiguous buffer.

use crc32fast::Hasher;

/// CRC-32 over several byte slices, fed in order.
pub fn checksum_parts(parts: &[&[u8]]) -> u32 {
    let mut hasher = Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}
