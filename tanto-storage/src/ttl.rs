//! # Expiration Index
//!
//! Second-bucketed TTL bookkeeping. Admission is O(1): an expiring key is
//! appended to the bucket for its absolute expiry second inside one of `S`
//! shards (`S` a power of two, picked from the CPU count). The sweeper walks
//! every second between the watermark and "now", detaches the matching
//! buckets, and deletes the keys through the table's public delete — so the
//! log records an expiry exactly like a client delete and replay stays
//! equivalent.
//!
//! Buckets hold stable identifiers (key bytes plus cached hash), never
//! references into the table, so the index and the table share no mutable
//! state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

/// One expiry bucket: every key expiring in the same second, with its hash.
type Bucket = HashMap<Bytes, u64>;

pub struct TtlIndex {
    shards: Vec<Mutex<HashMap<i64, Bucket>>>,
    shard_mask: u64,
    /// Watermark of the last second the sweeper processed.
    last_deleted: AtomicI64,
}

impl TtlIndex {
    /// `shard_count` must be a power of two.
    pub fn new(shard_count: usize, now: i64) -> Self {
        debug_assert!(shard_count.is_power_of_two());
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(HashMap::new())).collect(),
            shard_mask: (shard_count - 1) as u64,
            last_deleted: AtomicI64::new(now),
        }
    }

    /// Register `key` for expiry and return the entry's absolute expiry
    /// second (0 when `ttl <= 0`, i.e. no expiry).
    ///
    /// A computed expiry at or below the sweep watermark is treated as
    /// already expired and lands in the next sweepable second instead, so
    /// the key still dies on the following tick.
    pub(crate) fn admit(&self, key: Bytes, hash: u64, ttl: i64, now: i64) -> i64 {
        if ttl <= 0 {
            return 0;
        }
        let shard = &self.shards[(hash & self.shard_mask) as usize];
        let mut buckets = shard.lock();

        let mut future = now + ttl;
        let last = self.last_deleted.load(Ordering::Acquire);
        if future <= last {
            future = last + 1;
        }

        buckets.entry(future).or_default().insert(key, hash);
        future
    }

    /// Remove a membership on explicit delete or TTL overwrite. A no-op when
    /// the bucket was already detached by a racing sweep.
    pub(crate) fn remove(&self, key: &Bytes, hash: u64, expiry: i64) {
        if expiry <= 0 {
            return;
        }
        let shard = &self.shards[(hash & self.shard_mask) as usize];
        let mut buckets = shard.lock();
        if let Some(bucket) = buckets.get_mut(&expiry) {
            bucket.remove(key);
            if bucket.is_empty() {
                buckets.remove(&expiry);
            }
        }
    }

    /// Process every second in `(watermark, now]`: detach each shard's bucket
    /// under the shard lock, then invoke `del` for the detached keys outside
    /// it. Advances the watermark to `now`.
    pub fn sweep(&self, now: i64, mut del: impl FnMut(&Bytes) -> bool) {
        let last = self.last_deleted.load(Ordering::Acquire);
        for second in last + 1..=now {
            for shard in &self.shards {
                let bucket = shard.lock().remove(&second);
                if let Some(bucket) = bucket {
                    for key in bucket.keys() {
                        del(key);
                    }
                }
            }
        }
        self.last_deleted.store(now, Ordering::Release);
    }

    pub fn last_deleted(&self) -> i64 {
        self.last_deleted.load(Ordering::Acquire)
    }

    /// Total membership count across all shards and seconds.
    pub fn membership_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().values().map(Bucket::len).sum::<usize>())
            .sum()
    }
}
