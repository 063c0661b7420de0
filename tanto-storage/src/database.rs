//! # Database
//!
//! One named database bundles a sharded [`Table`], a [`TtlIndex`] with its
//! sweeper thread, an append-only log with its writer thread, and a growth
//! monitor. [`Db::open`] replays the log before going live; [`Db::close`]
//! stops the sweeper, closes the log queue, and waits for the writer to
//! drain.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info};

use tanto_core::error::Result;
use tanto_core::utils::{shard_count, unix_now_secs};

use crate::aof::{self, Aof, LogQueue, LOG_QUEUE_CAP};
use crate::hash::KeyHasher;
use crate::table::{ProbeMessage, ProbeQueue, Table, INITIAL_BUCKETS, PROBE_QUEUE_CAP};
use crate::ttl::TtlIndex;

/// Probes between load-factor evaluations.
const RESIZE_CHECK_EVERY: u64 = 1000;

/// Cadence of the periodic resize check and compaction heuristic.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Engine knobs a database is opened with.
#[derive(Debug, Clone)]
pub struct DbOptions {
    pub hash_seed: i64,
    pub cpu_multiplier: usize,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            hash_seed: 0,
            cpu_multiplier: 16,
        }
    }
}

pub struct Db {
    name: String,
    table: Arc<Table>,
    ttl: Arc<TtlIndex>,
    aof: Aof,
    sweeper: Mutex<Option<Sweeper>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Db {
    /// Open (or create) the database backed by `<db_folder>/<UPPER>.bin`,
    /// replay the log, then start the log writer and the expiration sweeper.
    /// IO failures during open or replay propagate and leave nothing
    /// running.
    pub fn open(name: &str, db_folder: &Path, opts: &DbOptions) -> Result<Db> {
        let upper = name.to_uppercase();
        let path = db_folder.join(format!("{upper}.bin"));

        let shards = shard_count(opts.cpu_multiplier);
        // Each shard owns a slice of the bucket array, so there can be at
        // most one lock per initial bucket.
        let lock_count = shards.min(INITIAL_BUCKETS);
        debug!(db = %upper, "using {lock_count} shard locks, {shards} expiry shards");

        let (log_tx, log_rx) = mpsc::sync_channel(LOG_QUEUE_CAP);
        let (probe_tx, probe_rx) = mpsc::sync_channel(PROBE_QUEUE_CAP);
        let (compact_tx, compact_rx) = mpsc::sync_channel(1);

        let ttl = Arc::new(TtlIndex::new(shards, unix_now_secs()));
        let table = Arc::new(Table::new(
            upper.clone(),
            KeyHasher::new(opts.hash_seed),
            lock_count,
            ttl.clone(),
            LogQueue::new(log_tx),
            ProbeQueue::new(probe_tx),
        ));

        // The growth monitor starts before replay so a large log can already
        // trigger resizes while it streams in.
        let monitor = spawn_growth_monitor(
            upper.clone(),
            table.clone(),
            probe_rx,
            compact_tx.clone(),
        );

        let stop_monitor = |table: &Table, monitor: JoinHandle<()>| {
            table.shutdown_probes();
            let _ = monitor.join();
        };

        table.begin_replay();
        let applied = match aof::replay(&path, &table) {
            Ok(n) => n,
            Err(e) => {
                stop_monitor(&table, monitor);
                return Err(e);
            }
        };
        table.end_replay();
        if applied > 0 {
            info!(db = %upper, "replayed {applied} log records, {} entries", table.entry_count());
        }

        let snapshot_table = table.clone();
        let aof = match Aof::start(
            &upper,
            path,
            log_rx,
            compact_rx,
            compact_tx,
            Box::new(move || snapshot_table.snapshot()),
        ) {
            Ok(aof) => aof,
            Err(e) => {
                stop_monitor(&table, monitor);
                return Err(e);
            }
        };

        let sweeper = Sweeper::start(upper.clone(), table.clone(), ttl.clone());

        Ok(Db {
            name: upper,
            table,
            ttl,
            aof,
            sweeper: Mutex::new(Some(sweeper)),
            monitor: Mutex::new(Some(monitor)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn aof_path(&self) -> &Path {
        self.aof.path()
    }

    pub fn set(&self, key: Bytes, value: Bytes, ttl: i64) -> bool {
        self.table.set(key, value, ttl)
    }

    pub fn set_if_absent(&self, key: Bytes, value: Bytes, ttl: i64) -> bool {
        self.table.set_if_absent(key, value, ttl)
    }

    pub fn increment(&self, key: Bytes, amount: Bytes, ttl: i64) -> bool {
        self.table.increment(key, amount, ttl)
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.table.get(key)
    }

    pub fn delete(&self, key: &[u8]) -> bool {
        self.table.delete(key)
    }

    pub fn entry_count(&self) -> u64 {
        self.table.entry_count()
    }

    pub fn bucket_count(&self) -> usize {
        self.table.bucket_count()
    }

    /// Evaluate the load factor now instead of waiting for the monitor.
    pub fn check_resize(&self) {
        self.table.check_resize();
    }

    /// Ask the log writer to compact; the request is processed before a
    /// subsequent [`Db::close`] returns.
    pub fn force_compaction(&self) {
        self.aof.signal_compaction();
    }

    pub fn ttl_index(&self) -> &TtlIndex {
        &self.ttl
    }

    /// Stop the sweeper and the growth monitor, close the log queue, and
    /// wait for the writer to drain, flush and fsync. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        }
        self.table.shutdown_probes();
        if let Some(monitor) = self.monitor.lock().take() {
            let _ = monitor.join();
        }
        self.table.close_log();
        let result = self.aof.join();
        info!(db = %self.name, "database closed");
        result
    }
}

/// Expiration sweeper: wakes aligned to the wall-clock second and deletes
/// expired keys through the table's public delete.
struct Sweeper {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    fn start(name: String, table: Arc<Table>, ttl: Arc<TtlIndex>) -> Sweeper {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name(format!("ttl-{name}"))
            .spawn(move || loop {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default();
                let next_second = now.as_secs() as i64 + 1;
                let until_tick =
                    Duration::from_secs(1).saturating_sub(Duration::from_nanos(now.subsec_nanos() as u64));

                match stop_rx.recv_timeout(until_tick) {
                    Err(RecvTimeoutError::Timeout) => {
                        ttl.sweep(next_second, |key| table.delete(key));
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        debug!(db = %table.name(), "expiration sweeper stopped");
                        return;
                    }
                }
            })
            .expect("spawn expiration sweeper thread");
        Sweeper { stop_tx, handle }
    }

    fn stop(self) {
        drop(self.stop_tx);
        let _ = self.handle.join();
    }
}

/// Growth monitor: consumes resize probes (one per new entry, load checked
/// every 1000) and runs a 60-second maintenance tick that re-checks the load
/// factor and applies the compaction heuristic
/// `deleted >= max(entries, 2) / 2`.
fn spawn_growth_monitor(
    name: String,
    table: Arc<Table>,
    probe_rx: Receiver<ProbeMessage>,
    compact_tx: SyncSender<()>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name(format!("growth-{name}"))
        .spawn(move || {
            let mut inputs: u64 = 0;
            let mut next_tick = Instant::now() + MAINTENANCE_INTERVAL;

            loop {
                let wait = next_tick.saturating_duration_since(Instant::now());
                match probe_rx.recv_timeout(wait) {
                    Ok(ProbeMessage::Bump) => {
                        inputs += 1;
                        if inputs % RESIZE_CHECK_EVERY == 0 {
                            table.check_resize();
                            inputs = 0;
                        }
                    }
                    Ok(ProbeMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {
                        table.check_resize();

                        let entries = table.entry_count();
                        let deleted = table.deleted_count();
                        if deleted >= entries.max(2) / 2 && deleted > 0 {
                            if compact_tx.try_send(()).is_ok() {
                                debug!(db = %name, "requested log compaction ({deleted} deletes, {entries} entries)");
                            }
                            table.reset_deleted();
                        }
                        next_tick = Instant::now() + MAINTENANCE_INTERVAL;
                    }
                }
            }
            debug!(db = %name, "growth monitor stopped");
        })
        .expect("spawn growth monitor thread")
}
