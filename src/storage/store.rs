//! Namespaced embedded key-value store
//!
//! A single append-only log holds every record. An in-memory ordered index
//! maps composite keys to the latest record pointer and is rebuilt on open.
//!
//! # Concurrency
//!
//! - The engine (log writer + index) sits behind one `RwLock`.
//! - `get`/`has` take the read lock for one positional read.
//! - `set`/`delete` take the write lock for one append.
//! - The index is an `Arc<BTreeMap>`: iterators hold a snapshot, writers
//!   copy-on-write when a snapshot is outstanding.
//! - Compaction copies live records without holding the engine lock and
//!   only takes the write lock to splice in the tail and swap files.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::compaction::{self, CompactionReport, CompactionScheduler};
use super::errors::{StoreError, StoreResult};
use super::key::{self, NamespaceKey};
use super::reader::{read_record_at, LogReader};
use super::record::{LogRecord, RecordKind};
use super::writer::{LogWriter, RecordPointer};

/// Log file name inside the data directory
pub const LOG_FILE: &str = "store.log";

/// Temporary compaction output, replaced atomically over [`LOG_FILE`]
pub const COMPACT_FILE: &str = "store.log.compact";

/// Default interval between compaction cycles
pub const DEFAULT_COMPACTION_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Default share of stale bytes that makes a rewrite worthwhile
pub const DEFAULT_DISCARD_RATIO: f64 = 0.5;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the log
    pub data_dir: PathBuf,
    /// fsync after every append
    pub sync_writes: bool,
    /// Interval between background compaction cycles
    pub compaction_interval: Duration,
    /// Minimum stale/total byte ratio before compaction rewrites the log
    pub discard_ratio: f64,
}

impl StoreConfig {
    /// Configuration with defaults for everything but the directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            sync_writes: true,
            compaction_interval: DEFAULT_COMPACTION_INTERVAL,
            discard_ratio: DEFAULT_DISCARD_RATIO,
        }
    }

    /// Sets fsync-per-write.
    pub fn with_sync_writes(mut self, sync_writes: bool) -> Self {
        self.sync_writes = sync_writes;
        self
    }

    /// Sets the background compaction interval.
    pub fn with_compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    /// Sets the compaction discard ratio threshold.
    pub fn with_discard_ratio(mut self, ratio: f64) -> Self {
        self.discard_ratio = ratio;
        self
    }

    /// Path of the live log.
    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join(LOG_FILE)
    }

    /// Path of the compaction output.
    pub fn compact_path(&self) -> PathBuf {
        self.data_dir.join(COMPACT_FILE)
    }
}

/// Point-in-time store statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StoreStats {
    /// Live keys across all namespaces
    pub keys: usize,
    /// Bytes held by the latest record of each live key
    pub live_bytes: u64,
    /// Total log size
    pub total_bytes: u64,
    /// Share of the log that compaction could reclaim
    pub discard_ratio: f64,
}

pub(crate) type Index = BTreeMap<Vec<u8>, RecordPointer>;

/// Log writer plus the index over it.
pub(crate) struct Engine {
    pub(crate) writer: LogWriter,
    pub(crate) index: Arc<Index>,
    pub(crate) live_bytes: u64,
}

impl Engine {
    pub(crate) fn stats(&self) -> StoreStats {
        let total_bytes = self.writer.current_offset();
        let discard_ratio = if total_bytes == 0 {
            0.0
        } else {
            (total_bytes - self.live_bytes) as f64 / total_bytes as f64
        };
        StoreStats {
            keys: self.index.len(),
            live_bytes: self.live_bytes,
            total_bytes,
            discard_ratio,
        }
    }

    fn append(&mut self, record: LogRecord) -> StoreResult<()> {
        let ptr = self.writer.append(&record)?;
        apply_to_index(
            Arc::make_mut(&mut self.index),
            &mut self.live_bytes,
            record.kind,
            record.key,
            ptr,
        );
        Ok(())
    }
}

/// Applies one record to an index, keeping the live byte count in step.
pub(crate) fn apply_to_index(
    index: &mut Index,
    live_bytes: &mut u64,
    kind: RecordKind,
    key: Vec<u8>,
    ptr: RecordPointer,
) {
    let previous = match kind {
        RecordKind::Live => {
            *live_bytes += ptr.len as u64;
            index.insert(key, ptr)
        }
        RecordKind::Tombstone => index.remove(&key),
    };
    if let Some(old) = previous {
        *live_bytes -= old.len as u64;
    }
}

/// State shared between the store handle and the compaction thread.
pub(crate) struct Shared {
    pub(crate) config: StoreConfig,
    engine: RwLock<Option<Engine>>,
    compaction_lock: Mutex<()>,
}

impl Shared {
    pub(crate) fn read_engine(&self) -> StoreResult<RwLockReadGuard<'_, Option<Engine>>> {
        self.engine
            .read()
            .map_err(|_| StoreError::lock_poisoned("engine"))
    }

    pub(crate) fn write_engine(&self) -> StoreResult<RwLockWriteGuard<'_, Option<Engine>>> {
        self.engine
            .write()
            .map_err(|_| StoreError::lock_poisoned("engine"))
    }

    pub(crate) fn lock_compaction(&self) -> StoreResult<MutexGuard<'_, ()>> {
        self.compaction_lock
            .lock()
            .map_err(|_| StoreError::lock_poisoned("compaction"))
    }
}

/// Persistent, ordered key-value store with namespaced keys.
///
/// Thread-safe: share it as `Arc<NamespacedStore>`. The handle owns the
/// background compaction thread; [`NamespacedStore::close`] stops it and
/// releases the log.
pub struct NamespacedStore {
    shared: Arc<Shared>,
    scheduler: Mutex<Option<CompactionScheduler>>,
}

impl NamespacedStore {
    /// Opens or creates a store and starts its compaction scheduler.
    ///
    /// The log is scanned to rebuild the index. A torn final record left by a
    /// crash is truncated; any other damage fails the open.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        let engine = Self::recover(&config)?;
        let stats = engine.stats();
        info!(
            data_dir = %config.data_dir.display(),
            keys = stats.keys,
            total_bytes = stats.total_bytes,
            "store opened"
        );

        let shared = Arc::new(Shared {
            config,
            engine: RwLock::new(Some(engine)),
            compaction_lock: Mutex::new(()),
        });
        let scheduler = CompactionScheduler::start(Arc::clone(&shared))?;

        Ok(Self {
            shared,
            scheduler: Mutex::new(Some(scheduler)),
        })
    }

    fn recover(config: &StoreConfig) -> StoreResult<Engine> {
        fs::create_dir_all(&config.data_dir).map_err(|e| {
            StoreError::write_failed(
                format!("Failed to create data directory: {}", config.data_dir.display()),
                e,
            )
        })?;

        let compact_path = config.compact_path();
        if compact_path.exists() {
            warn!(path = %compact_path.display(), "removing unfinished compaction output");
            fs::remove_file(&compact_path).map_err(|e| {
                StoreError::write_failed("Failed to remove unfinished compaction output", e)
            })?;
        }

        let log_path = config.log_path();
        let mut writer = LogWriter::open(&log_path, config.sync_writes)?;
        let (index, live_bytes, torn_tail) = build_index(&log_path)?;

        if let Some(offset) = torn_tail {
            warn!(
                offset,
                dropped_bytes = writer.current_offset() - offset,
                "truncating torn record at end of log"
            );
            writer.truncate_to(offset)?;
        }

        Ok(Engine {
            writer,
            index: Arc::new(index),
            live_bytes,
        })
    }

    /// Returns the store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    /// Returns the most recent value for `key` in `namespace`.
    pub fn get(&self, namespace: &str, key: &[u8]) -> StoreResult<Vec<u8>> {
        let composite = key::encode(namespace, key)?;
        let guard = self.shared.read_engine()?;
        let engine = guard.as_ref().ok_or_else(StoreError::closed)?;

        let ptr = engine
            .index
            .get(&composite)
            .copied()
            .ok_or_else(|| StoreError::not_found(namespace, key))?;

        let record = read_record_at(engine.writer.file(), ptr.offset, ptr.len)?;
        if record.key != composite || record.is_tombstone() {
            return Err(StoreError::corruption_at_offset(
                ptr.offset,
                "index points at a record for a different key",
            ));
        }
        Ok(record.value)
    }

    /// Associates `value` with `key` in `namespace`, replacing any prior value.
    pub fn set(&self, namespace: &str, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let composite = key::encode(namespace, key)?;
        check_record_size(namespace, key, composite.len(), value.len())?;
        let mut guard = self.shared.write_engine()?;
        let engine = guard.as_mut().ok_or_else(StoreError::closed)?;

        engine
            .append(LogRecord::live(composite, value.to_vec()))
            .inspect_err(|e| {
                debug!(
                    namespace,
                    key = %String::from_utf8_lossy(key),
                    error = %e,
                    "failed to set key"
                );
            })
    }

    /// Whether `key` exists in `namespace`.
    ///
    /// Absence is `Ok(false)`; only genuine read failures are errors.
    pub fn has(&self, namespace: &str, key: &[u8]) -> StoreResult<bool> {
        match self.get(namespace, key) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Removes `key` from `namespace`. Removing an absent key is a no-op.
    pub fn delete(&self, namespace: &str, key: &[u8]) -> StoreResult<()> {
        let composite = key::encode(namespace, key)?;
        let mut guard = self.shared.write_engine()?;
        let engine = guard.as_mut().ok_or_else(StoreError::closed)?;

        if !engine.index.contains_key(&composite) {
            return Ok(());
        }
        engine
            .append(LogRecord::tombstone(composite))
            .inspect_err(|e| {
                debug!(
                    namespace,
                    key = %String::from_utf8_lossy(key),
                    error = %e,
                    "failed to delete key"
                );
            })
    }

    /// Keys of `namespace` in key order, or all keys when `None`.
    ///
    /// The iterator walks a snapshot taken at call time.
    pub fn iterate_keys(&self, namespace: Option<&str>) -> StoreResult<Keys> {
        let prefix = match namespace {
            Some(ns) => NamespaceKey::namespace_prefix(ns)?,
            None => Vec::new(),
        };
        self.search_prefix(&prefix)
    }

    /// Keys whose composite encoding starts with `prefix`, in encoded order.
    pub fn search_prefix(&self, prefix: &[u8]) -> StoreResult<Keys> {
        let snapshot = self.snapshot()?;
        Ok(Keys {
            cursor: SnapshotCursor::new(snapshot.index, prefix.to_vec()),
        })
    }

    /// `(key, value)` pairs of `namespace`, or of every namespace.
    ///
    /// Values are read lazily from the log generation of the snapshot.
    pub fn entries(&self, namespace: Option<&str>) -> StoreResult<Entries> {
        let prefix = match namespace {
            Some(ns) => NamespaceKey::namespace_prefix(ns)?,
            None => Vec::new(),
        };
        let snapshot = self.snapshot()?;
        Ok(Entries {
            cursor: SnapshotCursor::new(snapshot.index, prefix),
            file: snapshot.file,
        })
    }

    fn snapshot(&self) -> StoreResult<Snapshot> {
        let guard = self.shared.read_engine()?;
        let engine = guard.as_ref().ok_or_else(StoreError::closed)?;
        Ok(Snapshot {
            index: Arc::clone(&engine.index),
            file: engine.writer.shared_file(),
        })
    }

    /// Current key count and log usage.
    pub fn stats(&self) -> StoreResult<StoreStats> {
        let guard = self.shared.read_engine()?;
        let engine = guard.as_ref().ok_or_else(StoreError::closed)?;
        Ok(engine.stats())
    }

    /// Runs one compaction cycle now.
    ///
    /// Returns a `NothingToCompact` error when the discard ratio is below
    /// the configured threshold.
    pub fn run_compaction(&self) -> StoreResult<CompactionReport> {
        compaction::compact(&self.shared)
    }

    /// Stops compaction, flushes the log and releases it.
    ///
    /// Every later call, including a second `close`, fails with `StoreClosed`.
    pub fn close(&self) -> StoreResult<()> {
        let scheduler = self
            .scheduler
            .lock()
            .map_err(|_| StoreError::lock_poisoned("scheduler"))?
            .take();
        if let Some(scheduler) = scheduler {
            scheduler.stop();
        }

        let _compaction = self.shared.lock_compaction()?;
        let mut guard = self.shared.write_engine()?;
        let engine = guard.take().ok_or_else(StoreError::closed)?;
        engine.writer.sync()?;
        info!(data_dir = %self.shared.config.data_dir.display(), "store closed");
        Ok(())
    }

    /// Whether `close` has completed.
    pub fn is_closed(&self) -> bool {
        self.shared
            .read_engine()
            .map(|guard| guard.is_none())
            .unwrap_or(true)
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }
}

impl Drop for NamespacedStore {
    fn drop(&mut self) {
        if !self.is_closed() {
            if let Err(e) = self.close() {
                warn!(error = %e, "store close on drop failed");
            }
        }
    }
}

struct Snapshot {
    index: Arc<Index>,
    file: Arc<File>,
}

/// Lazy walk over a prefix of an index snapshot.
struct SnapshotCursor {
    snapshot: Arc<Index>,
    prefix: Vec<u8>,
    last: Option<Vec<u8>>,
}

impl SnapshotCursor {
    fn new(snapshot: Arc<Index>, prefix: Vec<u8>) -> Self {
        Self {
            snapshot,
            prefix,
            last: None,
        }
    }

    fn next_entry(&mut self) -> Option<(Vec<u8>, RecordPointer)> {
        let lower = match &self.last {
            Some(last) => Bound::Excluded(last.as_slice()),
            None => Bound::Included(self.prefix.as_slice()),
        };
        let (key, ptr) = self
            .snapshot
            .range::<[u8], _>((lower, Bound::Unbounded))
            .next()
            .map(|(k, p)| (k.clone(), *p))?;

        if !key.starts_with(&self.prefix) {
            return None;
        }
        self.last = Some(key.clone());
        Some((key, ptr))
    }
}

/// Iterator over keys of an index snapshot, see [`NamespacedStore::iterate_keys`].
pub struct Keys {
    cursor: SnapshotCursor,
}

impl Iterator for Keys {
    type Item = NamespaceKey;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (composite, _) = self.cursor.next_entry()?;
            // Keys are validated when the index is built.
            if let Ok(key) = NamespaceKey::decode(&composite) {
                return Some(key);
            }
        }
    }
}

/// Iterator over `(key, value)` pairs, see [`NamespacedStore::entries`].
pub struct Entries {
    cursor: SnapshotCursor,
    file: Arc<File>,
}

impl Iterator for Entries {
    type Item = StoreResult<(NamespaceKey, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let (composite, ptr) = self.cursor.next_entry()?;
        let entry = NamespaceKey::decode(&composite).and_then(|key| {
            let record = read_record_at(&self.file, ptr.offset, ptr.len)?;
            Ok((key, record.value))
        });
        Some(entry)
    }
}

/// Rejects a value whose record would overflow the log's length framing.
fn check_record_size(
    namespace: &str,
    key: &[u8],
    composite_len: usize,
    value_len: usize,
) -> StoreResult<()> {
    if LogRecord::fits(composite_len, value_len) {
        Ok(())
    } else {
        Err(StoreError::value_too_large(namespace, key, value_len))
    }
}

/// Scans the log into an index. Returns the index, its live byte count and
/// the offset of a torn final record, if any.
fn build_index(log_path: &Path) -> StoreResult<(Index, u64, Option<u64>)> {
    let mut index = Index::new();
    let mut live_bytes = 0u64;

    let mut reader = LogReader::open(log_path)?;
    while let Some((offset, record)) = reader.read_next()? {
        NamespaceKey::decode(&record.key).map_err(|e| {
            StoreError::corruption_at_offset(offset, format!("undecodable key: {}", e))
        })?;
        let ptr = RecordPointer {
            offset,
            len: record.encoded_len() as u32,
        };
        apply_to_index(&mut index, &mut live_bytes, record.kind, record.key, ptr);
    }

    Ok((index, live_bytes, reader.torn_tail()))
}
