//! # Append-Only Log
//!
//! One binary file per database, `<db_folder>/<UPPERCASE_NAME>.bin`, the
//! sole durable artifact.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Live Write Path                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Mutation 1 ──┐                                                 │
//! │  Mutation 2 ──┼──► Bounded Queue ──► Writer Thread ──► BufWriter│
//! │  Mutation 3 ──┘    (blocks when full)   │                       │
//! │                                         └─► flush+fsync / 100ms │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The writer thread is the only path that touches the file; ordering is the
//! whole point. It also services compaction requests: snapshot the live
//! entries, stream them into `<NAME>.tmp.bin`, fsync, atomically rename over
//! the live file, reopen in append mode. A crash at any point leaves either
//! the old or the new file intact.
//!
//! ## The compaction fence
//!
//! Every record carries the queue epoch observed at enqueue time, and the
//! enqueue happens under the same shard lock as the table mutation. The
//! snapshot bumps the epoch while holding the table write lock, so a record
//! with a pre-fence epoch is *always* reflected in the snapshot and must be
//! dropped rather than re-appended (replaying an already-counted `incr`
//! would double-apply it). Post-fence records belong after the snapshot and
//! are carried over into the fresh file.

mod frame;

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use tanto_core::error::{Error, Result};

use crate::table::Table;

/// Capacity of the in-memory record queue. A full queue blocks mutators,
/// which is what bounds the client write rate under a slow disk.
pub(crate) const LOG_QUEUE_CAP: usize = 100_000;

const WRITE_BUF_SIZE: usize = 64 * 1024;
const COMPACT_BUF_SIZE: usize = 16 * 1024 * 1024;
const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Wire actions, also the replay dispatch keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Set,
    Del,
    Incr,
}

impl Action {
    pub(crate) fn wire(self) -> &'static [u8] {
        match self {
            Action::Set => b"set",
            Action::Del => b"del",
            Action::Incr => b"incr",
        }
    }
}

/// One mutation, as enqueued by the table under its shard lock.
#[derive(Debug)]
pub(crate) struct Record {
    epoch: u64,
    action: Action,
    key: Bytes,
    value: Bytes,
    ttl: i64,
}

pub(crate) enum LogMessage {
    Record(Record),
    Shutdown,
}

/// Sending side of the log, owned by the table. During replay the queue is
/// bypassed entirely; after close all sends become no-ops.
pub(crate) struct LogQueue {
    tx: SyncSender<LogMessage>,
    epoch: AtomicU64,
    bypass: AtomicBool,
    closed: AtomicBool,
}

impl LogQueue {
    pub(crate) fn new(tx: SyncSender<LogMessage>) -> Self {
        Self {
            tx,
            epoch: AtomicU64::new(0),
            bypass: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue a record; blocks when the queue is full. Must be called with
    /// the mutating shard lock held so the record's epoch agrees with the
    /// table state.
    pub(crate) fn enqueue(&self, action: Action, key: Bytes, value: Bytes, ttl: i64) {
        if self.bypass.load(Ordering::Relaxed) || self.closed.load(Ordering::Relaxed) {
            return;
        }
        let record = Record {
            epoch: self.epoch.load(Ordering::Acquire),
            action,
            key,
            value,
            ttl,
        };
        let _ = self.tx.send(LogMessage::Record(record));
    }

    /// Advance the epoch and return the fence: records at or below it are
    /// covered by the snapshot being taken. Must be called under the table
    /// write lock.
    pub(crate) fn fence(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn begin_replay(&self) {
        self.bypass.store(true, Ordering::Relaxed);
    }

    pub(crate) fn end_replay(&self) {
        self.bypass.store(false, Ordering::Relaxed);
    }

    /// Close the queue. Records enqueued before the close are still drained
    /// by the writer.
    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(LogMessage::Shutdown);
        }
    }
}

/// A snapshot of one live entry, produced under the table write lock for
/// compaction. `expiry` is the absolute unix second (0 = never).
pub(crate) struct LiveEntry {
    pub key: Bytes,
    pub value: Bytes,
    pub expiry: i64,
}

pub(crate) type SnapshotFn = Box<dyn Fn() -> (Vec<LiveEntry>, u64) + Send>;

/// Handle to a running log writer.
pub(crate) struct Aof {
    path: PathBuf,
    compact_tx: SyncSender<()>,
    handle: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Aof {
    /// Open the log file in append mode and start the writer thread. An open
    /// failure propagates and prevents the database from being registered.
    pub(crate) fn start(
        name: &str,
        path: PathBuf,
        rx: Receiver<LogMessage>,
        compact_rx: Receiver<()>,
        compact_tx: SyncSender<()>,
        snapshot: SnapshotFn,
    ) -> Result<Self> {
        let file = open_append(&path)?;
        let thread_path = path.clone();
        let handle = thread::Builder::new()
            .name(format!("aof-{name}"))
            .spawn(move || writer_loop(file, thread_path, rx, compact_rx, snapshot))
            .expect("spawn log writer thread");

        Ok(Self {
            path,
            compact_tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Request a compaction; dropped when one is already pending.
    pub(crate) fn signal_compaction(&self) {
        let _ = self.compact_tx.try_send(());
    }

    /// Wait for the writer to drain, flush, fsync and close. The log queue
    /// must already be closed.
    pub(crate) fn join(&self) -> Result<()> {
        if let Some(handle) = self.handle.lock().take() {
            handle.join().map_err(|_| Error::Internal {
                message: "log writer thread panicked".to_string(),
            })??;
        }
        Ok(())
    }
}

/// Replay the log into `table` (which must be in replay mode). Halts cleanly
/// at a truncated trailing frame; unknown actions are skipped.
pub(crate) fn replay(path: &Path, table: &Table) -> Result<u64> {
    if !path.exists() {
        return Ok(0);
    }
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(WRITE_BUF_SIZE, file);

    let mut applied = 0u64;
    loop {
        match frame::read_frame(&mut reader)? {
            None => break,
            Some(f) => {
                match f.action.as_slice() {
                    b"set" => {
                        table.set(f.key, f.value, f.ttl);
                    }
                    b"del" => {
                        table.delete(&f.key);
                    }
                    b"incr" => {
                        table.increment(f.key, f.value, f.ttl);
                    }
                    _ => {}
                }
                applied += 1;
            }
        }
    }
    Ok(applied)
}

fn open_append(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .create(true)
        .append(true)
        .open(path)?)
}

fn writer_loop(
    file: File,
    path: PathBuf,
    rx: Receiver<LogMessage>,
    compact_rx: Receiver<()>,
    snapshot: SnapshotFn,
) -> Result<()> {
    let mut out = BufWriter::with_capacity(WRITE_BUF_SIZE, file);
    let mut dirty = false;
    let mut shutdown = false;
    let mut last_flush = Instant::now();

    while !shutdown {
        let wait = FLUSH_INTERVAL
            .checked_sub(last_flush.elapsed())
            .unwrap_or(Duration::from_millis(1));

        match rx.recv_timeout(wait) {
            Ok(LogMessage::Record(r)) => write_record(&mut out, &path, &r, &mut dirty),
            Ok(LogMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => shutdown = true,
            Err(RecvTimeoutError::Timeout) => {}
        }

        if dirty && last_flush.elapsed() >= FLUSH_INTERVAL {
            match flush_and_sync(&mut out) {
                Ok(()) => dirty = false,
                Err(e) => error!(log = %path.display(), "error flushing log: {e}"),
            }
            last_flush = Instant::now();
        }

        if compact_rx.try_recv().is_ok() {
            shutdown |= run_compaction(&mut out, &path, &snapshot, &rx, &mut dirty);
            last_flush = Instant::now();
        }
    }

    // A compaction signalled just before shutdown still runs, so state
    // observed by the signaller is on disk when close returns.
    if compact_rx.try_recv().is_ok() {
        run_compaction(&mut out, &path, &snapshot, &rx, &mut dirty);
    }

    flush_and_sync(&mut out)?;
    debug!(log = %path.display(), "log writer stopped");
    Ok(())
}

fn write_record(out: &mut BufWriter<File>, path: &Path, r: &Record, dirty: &mut bool) {
    match frame::write_frame(out, r.action.wire(), &r.key, &r.value, r.ttl) {
        Ok(()) => *dirty = true,
        // The in-memory mutation already succeeded; this record is lost
        // from the log's perspective.
        Err(e) => error!(log = %path.display(), "error appending to log: {e}"),
    }
}

/// Returns true when a shutdown message was drained along the way.
fn run_compaction(
    out: &mut BufWriter<File>,
    path: &Path,
    snapshot: &SnapshotFn,
    rx: &Receiver<LogMessage>,
    dirty: &mut bool,
) -> bool {
    // Write out the backlog first. A mutator blocked on a full queue holds
    // the table read lock, and the snapshot below needs the write lock;
    // freeing queue capacity here is what lets those mutators finish.
    let mut shutdown = false;
    loop {
        match rx.try_recv() {
            Ok(LogMessage::Record(r)) => write_record(out, path, &r, dirty),
            Ok(LogMessage::Shutdown) => {
                shutdown = true;
                break;
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        }
    }

    let (entries, fence) = snapshot();

    // Everything queued up to here with a pre-fence epoch is covered by the
    // snapshot; later records must survive either outcome.
    let mut drained = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(LogMessage::Record(r)) => drained.push(r),
            Ok(LogMessage::Shutdown) => {
                shutdown = true;
                break;
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        }
    }

    match compact(out, path, &entries) {
        Ok(()) => {
            info!(log = %path.display(), "compacted log, {} live entries", entries.len());
            *dirty = false;
            for r in drained.iter().filter(|r| r.epoch > fence) {
                write_record(out, path, r, dirty);
            }
        }
        Err(e) => {
            error!(log = %path.display(), "compaction failed, keeping old log: {e}");
            let _ = fs::remove_file(tmp_path_for(path));
            // The old file is still live; append everything we drained in
            // the original order so no record is lost.
            for r in &drained {
                write_record(out, path, r, dirty);
            }
        }
    }
    shutdown
}

fn compact(out: &mut BufWriter<File>, path: &Path, entries: &[LiveEntry]) -> Result<()> {
    let tmp_path = tmp_path_for(path);

    // 1-3. stream one `set` frame per live entry into the sibling temp file
    {
        let tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut buf = BufWriter::with_capacity(COMPACT_BUF_SIZE, tmp);
        for e in entries {
            frame::write_frame(&mut buf, Action::Set.wire(), &e.key, &e.value, e.expiry)?;
        }
        buf.flush()?;
        buf.get_ref().sync_all()?;
    }

    // 4. finish the current live file
    flush_and_sync(out)?;

    // 5. atomic replacement; a crash leaves either the old or the new file
    fs::rename(&tmp_path, path)?;

    // 6. reopen in append mode; the previous handle closes on replace
    let file = open_append(path)?;
    *out = BufWriter::with_capacity(WRITE_BUF_SIZE, file);

    Ok(())
}

fn flush_and_sync(out: &mut BufWriter<File>) -> Result<()> {
    out.flush()?;
    out.get_ref().sync_all()?;
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{stem}.tmp.bin"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tmp_path_is_a_sibling() {
        let path = PathBuf::from("/data/MYDB.bin");
        assert_eq!(tmp_path_for(&path), PathBuf::from("/data/MYDB.tmp.bin"));
    }

    #[test]
    fn test_action_wire_names() {
        assert_eq!(Action::Set.wire(), b"set");
        assert_eq!(Action::Del.wire(), b"del");
        assert_eq!(Action::Incr.wire(), b"incr");
    }

    #[test]
    fn test_fence_partitions_epochs() {
        let (tx, rx) = std::sync::mpsc::sync_channel(8);
        let queue = LogQueue::new(tx);

        queue.enqueue(Action::Set, Bytes::from_static(b"a"), Bytes::new(), 0);
        let fence = queue.fence();
        queue.enqueue(Action::Set, Bytes::from_static(b"b"), Bytes::new(), 0);

        let first = match rx.try_recv().unwrap() {
            LogMessage::Record(r) => r,
            _ => panic!("expected record"),
        };
        let second = match rx.try_recv().unwrap() {
            LogMessage::Record(r) => r,
            _ => panic!("expected record"),
        };
        assert!(first.epoch <= fence, "pre-fence record is covered");
        assert!(second.epoch > fence, "post-fence record is carried");
    }
}
