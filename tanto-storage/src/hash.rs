//! Keyed 64-bit hash of key bytes.
//!
//! The seed comes from configuration so two engines in one process can hash
//! differently; the same seed always produces the same hash for the same key.

use gxhash::gxhash64;

#[derive(Debug, Clone, Copy)]
pub struct KeyHasher {
    seed: i64,
}

impl KeyHasher {
    pub fn new(seed: i64) -> Self {
        Self { seed }
    }

    #[inline]
    pub fn hash(&self, key: &[u8]) -> u64 {
        gxhash64(key, self.seed)
    }
}
