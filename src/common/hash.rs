//! Key partitioning and checksums
//!
//! - `shard_for_key` maps the keyspace onto a fixed number of shards
//! - CRC32 guards snapshot blobs against corruption

/// Number of shards the keyspace is partitioned into
pub const N_SHARDS: usize = 10;

/// Compute the shard a key belongs to.
///
/// Uses the first byte of the key so that clients and servers agree without
/// sharing any state; the empty key lives in shard 0.
pub fn shard_for_key(key: &str) -> usize {
    key.as_bytes()
        .first()
        .map(|b| *b as usize % N_SHARDS)
        .unwrap_or(0)
}

/// Calculate CRC32 checksum
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}
