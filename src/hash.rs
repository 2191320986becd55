//! xxHash-based business-key hashing.
//!
//! Key hashes are deterministic 64-bit identifiers for grouping rows by
//! business key. Hashing always goes through the tagged [`Value`] encoding,
//! so NULL, the empty string, and zero never collide, and composite keys
//! cannot alias across column boundaries.

use xxhash_rust::xxh64::xxh64;

use crate::value::Value;

/// Fixed seed for deterministic hashing across processes.
pub const KEY_HASH_SEED: u64 = 0x9e3779b97f4a7c15;

/// Hash raw bytes with the pipeline seed.
pub fn key_hash_bytes(input: &[u8]) -> u64 {
    xxh64(input, KEY_HASH_SEED)
}

/// Hash a composite key from its values.
pub fn key_hash(values: &[Value]) -> u64 {
    let mut buf = Vec::with_capacity(values.len() * 9);
    for v in values {
        v.encode_to(&mut buf);
    }
    key_hash_bytes(&buf)
}
