//! Log compaction and its background scheduler
//!
//! Compaction rewrites the log keeping only the latest record of every live
//! key. It runs only when the stale share of the log reaches the configured
//! discard ratio; below that it reports `NothingToCompact`.
//!
//! ## Phases
//!
//! 1. Read lock: snapshot the index and the end of log.
//! 2. No lock: copy the snapshot's live records into `store.log.compact`.
//! 3. Write lock: copy records appended since the snapshot, fsync, rename
//!    over `store.log`, swap writer and index.
//!
//! Foreground reads and writes proceed during phase 2. A crash before the
//! rename leaves the old log authoritative; the leftover output is removed on
//! the next open.

use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver, Sender, TryRecvError};
use serde::Serialize;
use tracing::{debug, error, info};

use super::errors::{StoreError, StoreResult};
use super::reader::{read_record_at, LogReader};
use super::store::{apply_to_index, Engine, Index, Shared, StoreConfig};
use super::writer::LogWriter;

/// Outcome of one log rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CompactionReport {
    /// Log size before the rewrite
    pub bytes_before: u64,
    /// Log size after the rewrite
    pub bytes_after: u64,
    /// Live keys in the new log
    pub keys_retained: usize,
    /// Records appended by writers while the copy ran
    pub tail_records: usize,
}

impl CompactionReport {
    /// Bytes reclaimed by the rewrite.
    pub fn bytes_reclaimed(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

/// Runs one compaction cycle against the shared engine.
pub(crate) fn compact(shared: &Shared) -> StoreResult<CompactionReport> {
    let _cycle = shared.lock_compaction()?;
    let config = &shared.config;

    let (snapshot, old_file, snapshot_end) = {
        let guard = shared.read_engine()?;
        let engine = guard.as_ref().ok_or_else(StoreError::closed)?;
        let stats = engine.stats();
        if stats.total_bytes == 0 || stats.discard_ratio < config.discard_ratio {
            return Err(StoreError::nothing_to_compact(
                stats.discard_ratio,
                config.discard_ratio,
            ));
        }
        (
            Arc::clone(&engine.index),
            engine.writer.shared_file(),
            engine.writer.current_offset(),
        )
    };

    let compact_path = config.compact_path();
    let result = rewrite(shared, &snapshot, &old_file, snapshot_end, &compact_path);
    if result.is_err() && compact_path.exists() {
        let _ = fs::remove_file(&compact_path);
    }
    result
}

fn rewrite(
    shared: &Shared,
    snapshot: &Index,
    old_file: &File,
    snapshot_end: u64,
    compact_path: &Path,
) -> StoreResult<CompactionReport> {
    let config = &shared.config;
    let mut out = LogWriter::create_fresh(compact_path, false)?;
    let mut index = Index::new();
    let mut live_bytes = 0u64;

    for (key, ptr) in snapshot.iter() {
        let record = read_record_at(old_file, ptr.offset, ptr.len)?;
        let new_ptr = out.append(&record)?;
        live_bytes += new_ptr.len as u64;
        index.insert(key.clone(), new_ptr);
    }

    let mut guard = shared.write_engine()?;
    let engine = guard.as_mut().ok_or_else(StoreError::closed)?;
    let bytes_before = engine.writer.current_offset();

    let mut tail_records = 0usize;
    if bytes_before > snapshot_end {
        let mut tail = LogReader::open_range(engine.writer.path(), snapshot_end, bytes_before)?;
        while let Some((_, record)) = tail.read_next()? {
            let ptr = out.append(&record)?;
            apply_to_index(&mut index, &mut live_bytes, record.kind, record.key, ptr);
            tail_records += 1;
        }
        if let Some(offset) = tail.torn_tail() {
            return Err(StoreError::corruption_at_offset(
                offset,
                "incomplete record in log tail during compaction",
            ));
        }
    }

    out.sync()?;
    fs::rename(compact_path, config.log_path()).map_err(|e| {
        StoreError::io_error("Failed to replace log with compacted output", e)
    })?;

    let report = CompactionReport {
        bytes_before,
        bytes_after: out.current_offset(),
        keys_retained: index.len(),
        tail_records,
    };
    install(engine, out, index, live_bytes, config)?;
    Ok(report)
}

/// Points the engine at the renamed compacted log, then makes the rename
/// durable.
///
/// The old file is already unlinked, so the swap must not depend on the
/// directory fsync: an error there is returned with the engine already
/// writing to the new log.
fn install(
    engine: &mut Engine,
    mut out: LogWriter,
    index: Index,
    live_bytes: u64,
    config: &StoreConfig,
) -> StoreResult<()> {
    out.relocate(config.log_path());
    out.set_sync_writes(config.sync_writes);
    engine.writer = out;
    engine.index = Arc::new(index);
    engine.live_bytes = live_bytes;

    sync_dir(&config.data_dir).inspect_err(|e| {
        error!(error = %e, "compacted log installed but directory fsync failed");
    })
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> StoreResult<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| StoreError::io_error("Failed to fsync data directory", e))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> StoreResult<()> {
    Ok(())
}

/// Background thread running [`compact`] on a fixed interval.
///
/// Dropping the stop sender wakes the thread at once; it finishes any cycle
/// in progress and exits without starting another.
pub(crate) struct CompactionScheduler {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl CompactionScheduler {
    /// Spawns the scheduler thread.
    pub(crate) fn start(shared: Arc<Shared>) -> StoreResult<Self> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let interval = shared.config.compaction_interval;

        let handle = thread::Builder::new()
            .name("postkeeper-compaction".to_string())
            .spawn(move || run_loop(&shared, interval, stop_rx))
            .map_err(|e| StoreError::io_error("Failed to spawn compaction thread", e))?;

        debug!(interval_secs = interval.as_secs(), "compaction scheduler started");
        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Signals the thread to stop and waits for it.
    pub(crate) fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.stop_tx.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("compaction thread panicked");
            }
        }
    }
}

impl Drop for CompactionScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(shared: &Shared, interval: Duration, stop_rx: Receiver<()>) {
    let ticker = crossbeam_channel::tick(interval);
    loop {
        select! {
            recv(stop_rx) -> _ => break,
            recv(ticker) -> _ => {
                // Both may be ready at once; cancellation wins.
                if let Err(TryRecvError::Disconnected) = stop_rx.try_recv() {
                    break;
                }
                run_cycle(shared);
            }
        }
    }
    debug!("compaction scheduler stopped");
}

fn run_cycle(shared: &Shared) {
    let started = Instant::now();
    match compact(shared) {
        Ok(report) => info!(
            bytes_before = report.bytes_before,
            bytes_after = report.bytes_after,
            keys = report.keys_retained,
            tail_records = report.tail_records,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "log compaction complete"
        ),
        Err(e) if e.is_nothing_to_compact() => debug!(error = %e, "no log compaction occurred"),
        Err(e) => error!(error = %e, "log compaction failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{NamespacedStore, StoreConfig};
    use tempfile::TempDir;

    fn open_store(dir: &Path, ratio: f64) -> NamespacedStore {
        NamespacedStore::open(StoreConfig::new(dir).with_discard_ratio(ratio)).unwrap()
    }

    #[test]
    fn test_nothing_to_compact_below_ratio() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(temp_dir.path(), 0.5);
        store.set("posts", b"a", b"1").unwrap();
        store.set("posts", b"b", b"2").unwrap();

        let err = store.run_compaction().unwrap_err();
        assert!(err.is_nothing_to_compact());
    }

    #[test]
    fn test_empty_store_has_nothing_to_compact() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(temp_dir.path(), 0.1);
        assert!(store.run_compaction().unwrap_err().is_nothing_to_compact());
    }

    #[test]
    fn test_compaction_reclaims_overwrites_and_tombstones() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(temp_dir.path(), 0.5);
        for i in 0..10 {
            store.set("posts", b"hot", format!("v{}", i).as_bytes()).unwrap();
        }
        store.set("posts", b"gone", b"x").unwrap();
        store.delete("posts", b"gone").unwrap();
        store.set("index", b"posts", b"3").unwrap();

        let report = store.run_compaction().unwrap();
        assert!(report.bytes_reclaimed() > 0);
        assert_eq!(report.keys_retained, 2);

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_bytes, report.bytes_after);
        assert_eq!(stats.live_bytes, stats.total_bytes);
        assert_eq!(store.get("posts", b"hot").unwrap(), b"v9");
        assert!(!store.has("posts", b"gone").unwrap());
        assert_eq!(store.get("index", b"posts").unwrap(), b"3");
        assert!(!temp_dir.path().join(crate::storage::COMPACT_FILE).exists());
    }

    #[test]
    fn test_compacted_log_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = open_store(temp_dir.path(), 0.1);
            store.set("posts", b"a", b"old").unwrap();
            store.set("posts", b"a", b"new").unwrap();
            store.set("posts", b"b", b"kept").unwrap();
            store.run_compaction().unwrap();
            store.set("posts", b"c", b"after").unwrap();
            store.close().unwrap();
        }

        let store = open_store(temp_dir.path(), 0.1);
        assert_eq!(store.get("posts", b"a").unwrap(), b"new");
        assert_eq!(store.get("posts", b"b").unwrap(), b"kept");
        assert_eq!(store.get("posts", b"c").unwrap(), b"after");
    }

    #[test]
    fn test_snapshot_iterator_outlives_compaction() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(temp_dir.path(), 0.1);
        store.set("posts", b"a", b"1").unwrap();
        store.set("posts", b"a", b"2").unwrap();

        let entries = store.entries(Some("posts")).unwrap();
        store.run_compaction().unwrap();

        let collected: Vec<_> = entries.collect::<StoreResult<_>>().unwrap();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].1, b"2");
    }

    #[test]
    fn test_scheduler_runs_on_interval_and_stops_on_close() {
        let temp_dir = TempDir::new().unwrap();
        let config = StoreConfig::new(temp_dir.path())
            .with_discard_ratio(0.1)
            .with_compaction_interval(Duration::from_millis(20));
        let store = NamespacedStore::open(config).unwrap();
        for i in 0..20 {
            store.set("posts", b"k", format!("{}", i).as_bytes()).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.stats().unwrap().discard_ratio > 0.0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(store.stats().unwrap().discard_ratio, 0.0);
        assert_eq!(store.get("posts", b"k").unwrap(), b"19");

        let started = Instant::now();
        store.close().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[cfg(unix)]
    #[test]
    fn test_install_swaps_engine_even_if_dir_sync_fails() {
        use crate::storage::record::LogRecord;

        let temp_dir = TempDir::new().unwrap();
        let old = LogWriter::open(&temp_dir.path().join("old.log"), false).unwrap();
        let mut engine = Engine {
            writer: old,
            index: Arc::new(Index::new()),
            live_bytes: 0,
        };

        let mut out = LogWriter::open(&temp_dir.path().join("new.log"), false).unwrap();
        let ptr = out
            .append(&LogRecord::live(b"k".to_vec(), b"v".to_vec()))
            .unwrap();
        let mut index = Index::new();
        index.insert(b"k".to_vec(), ptr);

        // Opening a missing directory for fsync fails.
        let config = StoreConfig::new(temp_dir.path().join("missing"));
        let err = install(&mut engine, out, index, ptr.len as u64, &config).unwrap_err();
        assert_eq!(err.code(), crate::storage::StoreErrorCode::IoError);

        assert_eq!(engine.writer.path(), config.log_path().as_path());
        assert_eq!(engine.writer.current_offset(), ptr.len as u64);
        assert_eq!(engine.index.len(), 1);
        assert_eq!(engine.live_bytes, ptr.len as u64);
    }
}
