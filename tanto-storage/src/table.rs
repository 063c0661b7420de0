//! # Sharded Hash Table
//!
//! The concurrent map behind one database. `B` buckets (power of two,
//! initially 2048) hold collision chains; `L` shard locks (power of two,
//! derived from the CPU count, `L <= B`) guard disjoint bucket subsets.
//! Bucket index is `hash & (B-1)`, shard index is `hash & (L-1)` — and since
//! both are powers of two, a bucket's owning shard never changes across
//! resizes, so each shard can own its slice of the bucket array outright:
//! bucket `b` lives in shard `b & (L-1)` at local slot `b >> log2(L)`.
//!
//! A table-wide read/write lock wraps the whole structure; every operation
//! holds it for read, and only resize and the compaction snapshot take it
//! for write. Mutations of a single key serialize through the shard write
//! lock; the log enqueue happens before that lock is released, which is what
//! keeps log order consistent with the per-key linearization.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::info;

use tanto_core::utils::unix_now_secs;

use crate::aof::{Action, LiveEntry, LogQueue};
use crate::entry::Entry;
use crate::hash::KeyHasher;
use crate::ttl::TtlIndex;

/// Initial bucket count; also the upper bound on the shard-lock count so
/// every shard owns at least one bucket.
pub const INITIAL_BUCKETS: usize = 2048;

/// Load factor above which the bucket array doubles.
const LOAD_FACTOR: f64 = 0.75;

/// Capacity of the resize-probe queue; probes beyond it are dropped.
pub(crate) const PROBE_QUEUE_CAP: usize = 1000;

pub(crate) enum ProbeMessage {
    Bump,
    Shutdown,
}

/// Non-blocking sender for resize probes, bumped on every insert that added
/// a new entry.
pub(crate) struct ProbeQueue {
    tx: SyncSender<ProbeMessage>,
    closed: AtomicBool,
}

impl ProbeQueue {
    pub(crate) fn new(tx: SyncSender<ProbeMessage>) -> Self {
        Self {
            tx,
            closed: AtomicBool::new(false),
        }
    }

    fn bump(&self) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        let _ = self.tx.try_send(ProbeMessage::Bump);
    }

    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(ProbeMessage::Shutdown);
        }
    }
}

type Bucket = Vec<Entry>;

struct Shard {
    buckets: RwLock<Vec<Bucket>>,
}

struct TableState {
    shards: Vec<Shard>,
    bucket_count: usize,
}

pub struct Table {
    name: String,
    hasher: KeyHasher,
    lock_count: usize,
    lock_shift: u32,
    state: RwLock<TableState>,
    entries: AtomicU64,
    deleted: AtomicU64,
    ttl: Arc<TtlIndex>,
    log: LogQueue,
    probes: ProbeQueue,
}

impl Table {
    /// `lock_count` must be a power of two and divide [`INITIAL_BUCKETS`].
    pub(crate) fn new(
        name: String,
        hasher: KeyHasher,
        lock_count: usize,
        ttl: Arc<TtlIndex>,
        log: LogQueue,
        probes: ProbeQueue,
    ) -> Self {
        debug_assert!(lock_count.is_power_of_two());
        debug_assert!(lock_count <= INITIAL_BUCKETS);

        let per_shard = INITIAL_BUCKETS / lock_count;
        let shards = (0..lock_count)
            .map(|_| Shard {
                buckets: RwLock::new((0..per_shard).map(|_| Bucket::new()).collect()),
            })
            .collect();

        Self {
            name,
            hasher,
            lock_count,
            lock_shift: lock_count.trailing_zeros(),
            state: RwLock::new(TableState {
                shards,
                bucket_count: INITIAL_BUCKETS,
            }),
            entries: AtomicU64::new(0),
            deleted: AtomicU64::new(0),
            ttl,
            log,
            probes,
        }
    }

    #[inline]
    fn shard_index(&self, hash: u64) -> usize {
        (hash as usize) & (self.lock_count - 1)
    }

    #[inline]
    fn local_index(&self, hash: u64, bucket_count: usize) -> usize {
        ((hash as usize) & (bucket_count - 1)) >> self.lock_shift
    }

    /// Upsert. Always returns true. An overwrite with the identical value
    /// still counts as a mutation and is logged.
    pub fn set(&self, key: Bytes, value: Bytes, ttl: i64) -> bool {
        let hash = self.hasher.hash(&key);
        let now = unix_now_secs();

        let state = self.state.read();
        let shard = &state.shards[self.shard_index(hash)];
        let mut buckets = shard.buckets.write();
        let bucket = &mut buckets[self.local_index(hash, state.bucket_count)];

        if let Some(entry) = bucket.iter_mut().find(|e| e.key == key) {
            if entry.expiry != 0 {
                self.ttl.remove(&entry.key, hash, entry.expiry);
            }
            entry.value = value.clone();
            entry.expiry = self.ttl.admit(key.clone(), hash, ttl, now);
            self.log.enqueue(Action::Set, key, value, ttl);
            return true;
        }

        let expiry = self.ttl.admit(key.clone(), hash, ttl, now);
        bucket.push(Entry {
            hash,
            key: key.clone(),
            value: value.clone(),
            expiry,
        });
        self.entries.fetch_add(1, Ordering::Relaxed);
        self.probes.bump();
        self.log.enqueue(Action::Set, key, value, ttl);
        true
    }

    /// Insert only when absent; the lookup and the insert happen under one
    /// shard write lock. Returns false (and logs nothing) when the key is
    /// already present.
    pub fn set_if_absent(&self, key: Bytes, value: Bytes, ttl: i64) -> bool {
        let hash = self.hasher.hash(&key);
        let now = unix_now_secs();

        let state = self.state.read();
        let shard = &state.shards[self.shard_index(hash)];
        let mut buckets = shard.buckets.write();
        let bucket = &mut buckets[self.local_index(hash, state.bucket_count)];

        if bucket.iter().any(|e| e.key == key) {
            return false;
        }

        let expiry = self.ttl.admit(key.clone(), hash, ttl, now);
        bucket.push(Entry {
            hash,
            key: key.clone(),
            value: value.clone(),
            expiry,
        });
        self.entries.fetch_add(1, Ordering::Relaxed);
        self.probes.bump();
        self.log.enqueue(Action::Set, key, value, ttl);
        true
    }

    /// Add `amount` to the stored signed 64-bit decimal. When the key is
    /// absent, stores `amount` verbatim. Returns false when the current
    /// value or the amount does not parse; the table is left untouched and
    /// nothing is logged. Overflow wraps (two's complement).
    pub fn increment(&self, key: Bytes, amount: Bytes, ttl: i64) -> bool {
        let hash = self.hasher.hash(&key);
        let now = unix_now_secs();

        let state = self.state.read();
        let shard = &state.shards[self.shard_index(hash)];
        let mut buckets = shard.buckets.write();
        let bucket = &mut buckets[self.local_index(hash, state.bucket_count)];

        if let Some(entry) = bucket.iter_mut().find(|e| e.key == key) {
            let Some(current) = parse_i64(&entry.value) else {
                return false;
            };
            let Some(add) = parse_i64(&amount) else {
                return false;
            };
            entry.value = Bytes::from(current.wrapping_add(add).to_string());
            if entry.expiry != 0 {
                self.ttl.remove(&entry.key, hash, entry.expiry);
            }
            entry.expiry = self.ttl.admit(key.clone(), hash, ttl, now);
            self.log.enqueue(Action::Incr, key, amount, ttl);
            return true;
        }

        let expiry = self.ttl.admit(key.clone(), hash, ttl, now);
        bucket.push(Entry {
            hash,
            key: key.clone(),
            value: amount.clone(),
            expiry,
        });
        self.entries.fetch_add(1, Ordering::Relaxed);
        self.probes.bump();
        self.log.enqueue(Action::Incr, key, amount, ttl);
        true
    }

    /// Never blocks writers in other shards.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        let hash = self.hasher.hash(key);

        let state = self.state.read();
        let shard = &state.shards[self.shard_index(hash)];
        let buckets = shard.buckets.read();
        let bucket = &buckets[self.local_index(hash, state.bucket_count)];

        bucket
            .iter()
            .find(|e| e.key.as_ref() == key)
            .map(|e| e.value.clone())
    }

    /// Remove a key. A delete of an absent key returns false but is still
    /// logged, so replay stays idempotent.
    pub fn delete(&self, key: &[u8]) -> bool {
        let hash = self.hasher.hash(key);

        let state = self.state.read();
        let shard = &state.shards[self.shard_index(hash)];
        let mut buckets = shard.buckets.write();
        let bucket = &mut buckets[self.local_index(hash, state.bucket_count)];

        match bucket.iter().position(|e| e.key.as_ref() == key) {
            Some(pos) => {
                let entry = bucket.swap_remove(pos);
                if entry.expiry != 0 {
                    self.ttl.remove(&entry.key, hash, entry.expiry);
                }
                self.entries.fetch_sub(1, Ordering::Relaxed);
                self.deleted.fetch_add(1, Ordering::Relaxed);
                self.log.enqueue(Action::Del, entry.key, Bytes::new(), 0);
                true
            }
            None => {
                self.log
                    .enqueue(Action::Del, Bytes::copy_from_slice(key), Bytes::new(), 0);
                false
            }
        }
    }

    /// Current entry count; approximate under concurrency.
    pub fn entry_count(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }

    pub fn bucket_count(&self) -> usize {
        self.state.read().bucket_count
    }

    /// Entries deleted since the counter was last reset (compaction
    /// heuristic input).
    pub fn deleted_count(&self) -> u64 {
        self.deleted.load(Ordering::Relaxed)
    }

    pub fn reset_deleted(&self) {
        self.deleted.store(0, Ordering::Relaxed);
    }

    /// Evaluate the load factor under the table write lock and double the
    /// bucket array when it exceeds 0.75.
    pub fn check_resize(&self) {
        let mut state = self.state.write();
        let load = self.entries.load(Ordering::Relaxed) as f64 / state.bucket_count as f64;
        if load > LOAD_FACTOR {
            self.grow(&mut state);
        }
    }

    fn grow(&self, state: &mut TableState) {
        let new_count = state.bucket_count * 2;
        for shard in &mut state.shards {
            let buckets = shard.buckets.get_mut();
            let old = std::mem::replace(
                buckets,
                (0..new_count / self.lock_count).map(|_| Bucket::new()).collect(),
            );
            for bucket in old {
                for entry in bucket {
                    let local = self.local_index(entry.hash, new_count);
                    buckets[local].push(entry);
                }
            }
        }
        state.bucket_count = new_count;
        info!(
            table = %self.name,
            "resized table to {new_count} buckets ({} entries)",
            self.entries.load(Ordering::Relaxed)
        );
    }

    /// Copy out every live entry under the table write lock, for compaction.
    /// Also advances the log epoch; the returned fence tells the writer
    /// which queued records the snapshot already covers.
    pub(crate) fn snapshot(&self) -> (Vec<LiveEntry>, u64) {
        let mut state = self.state.write();
        let fence = self.log.fence();
        let mut out = Vec::with_capacity(self.entries.load(Ordering::Relaxed) as usize);
        for shard in &mut state.shards {
            for bucket in shard.buckets.get_mut().iter() {
                for entry in bucket {
                    out.push(LiveEntry {
                        key: entry.key.clone(),
                        value: entry.value.clone(),
                        expiry: entry.expiry,
                    });
                }
            }
        }
        (out, fence)
    }

    pub(crate) fn begin_replay(&self) {
        self.log.begin_replay();
    }

    pub(crate) fn end_replay(&self) {
        self.log.end_replay();
    }

    pub(crate) fn close_log(&self) {
        self.log.close();
    }

    pub(crate) fn shutdown_probes(&self) {
        self.probes.close();
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn parse_i64(raw: &[u8]) -> Option<i64> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::sync_channel;

    // The channel receivers drop immediately, which turns every enqueue into
    // an ignored send error; these tests only exercise the in-memory map.
    fn test_table() -> Table {
        let (log_tx, _) = sync_channel(16);
        let (probe_tx, _) = sync_channel(16);
        Table::new(
            "TESTTABLE".to_string(),
            KeyHasher::new(0),
            4,
            Arc::new(TtlIndex::new(4, unix_now_secs())),
            LogQueue::new(log_tx),
            ProbeQueue::new(probe_tx),
        )
    }

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn test_set_get_overwrite() {
        let t = test_table();
        assert!(t.set(b("k"), b("v1"), 0));
        assert_eq!(t.get(b"k").unwrap(), b("v1"));
        assert!(t.set(b("k"), b("v2"), 0));
        assert_eq!(t.get(b"k").unwrap(), b("v2"));
        assert_eq!(t.entry_count(), 1);
    }

    #[test]
    fn test_delete() {
        let t = test_table();
        t.set(b("k"), b("v"), 0);
        assert!(t.delete(b"k"));
        assert!(t.get(b"k").is_none());
        assert!(!t.delete(b"k"));
        assert_eq!(t.entry_count(), 0);
        assert_eq!(t.deleted_count(), 1);
    }

    #[test]
    fn test_set_if_absent() {
        let t = test_table();
        assert!(t.set_if_absent(b("k"), b("v1"), 0));
        assert!(!t.set_if_absent(b("k"), b("v2"), 0));
        assert_eq!(t.get(b"k").unwrap(), b("v1"));
    }

    #[test]
    fn test_increment() {
        let t = test_table();
        t.set(b("n"), b("10"), 0);
        assert!(t.increment(b("n"), b("5"), 0));
        assert_eq!(t.get(b"n").unwrap(), b("15"));
        assert!(t.increment(b("n"), b("-20"), 0));
        assert_eq!(t.get(b"n").unwrap(), b("-5"));

        // absent key stores the amount verbatim
        assert!(t.increment(b("fresh"), b("7"), 0));
        assert_eq!(t.get(b"fresh").unwrap(), b("7"));

        // non-numeric current value refuses and leaves state alone
        t.set(b("s"), b("abc"), 0);
        assert!(!t.increment(b("s"), b("1"), 0));
        assert_eq!(t.get(b"s").unwrap(), b("abc"));

        // non-numeric amount refuses too
        assert!(!t.increment(b("n"), b("one"), 0));
    }

    #[test]
    fn test_increment_overflow_wraps() {
        let t = test_table();
        t.set(b("n"), Bytes::from(i64::MAX.to_string()), 0);
        assert!(t.increment(b("n"), b("1"), 0));
        assert_eq!(t.get(b"n").unwrap(), Bytes::from(i64::MIN.to_string()));
    }

    #[test]
    fn test_resize_doubles_buckets_and_keeps_entries() {
        let t = test_table();
        for i in 0..INITIAL_BUCKETS {
            t.set(b(&format!("key:{i}")), b(&format!("val:{i}")), 0);
        }
        assert_eq!(t.bucket_count(), INITIAL_BUCKETS);

        t.check_resize();
        assert_eq!(t.bucket_count(), INITIAL_BUCKETS * 2);

        for i in 0..INITIAL_BUCKETS {
            assert_eq!(
                t.get(format!("key:{i}").as_bytes()).unwrap(),
                b(&format!("val:{i}"))
            );
        }
    }

    #[test]
    fn test_resize_not_triggered_under_load_factor() {
        let t = test_table();
        for i in 0..100 {
            t.set(b(&format!("k{i}")), b("v"), 0);
        }
        t.check_resize();
        assert_eq!(t.bucket_count(), INITIAL_BUCKETS);
    }
}
