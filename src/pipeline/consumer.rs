//! Consumer: dedups queued records against the store and persists new ones

use std::ops::AddAssign;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

use super::cursor::CursorCommitter;
use super::{PipelineError, WorkUnit};
use crate::shutdown::ShutdownHandle;
use crate::storage::{NamespacedStore, StoreError};

/// Receiving end of the work queue, shared by every consumer.
pub type SharedQueue = Arc<Mutex<mpsc::Receiver<WorkUnit>>>;

/// Per-record results of resolving units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UnitOutcome {
    /// Units fully resolved
    pub units: u64,
    /// Records persisted for the first time
    pub written: u64,
    /// Records already present in the store
    pub duplicates: u64,
    /// Records that could not be serialized
    pub skipped: u64,
}

impl AddAssign for UnitOutcome {
    fn add_assign(&mut self, other: Self) {
        self.units += other.units;
        self.written += other.written;
        self.duplicates += other.duplicates;
        self.skipped += other.skipped;
    }
}

/// Pulls units off the queue until it is closed and drained.
pub struct Consumer {
    id: usize,
    store: Arc<NamespacedStore>,
    namespace: String,
    queue: SharedQueue,
    committer: Arc<CursorCommitter>,
    shutdown: ShutdownHandle,
}

impl Consumer {
    pub fn new(
        id: usize,
        store: Arc<NamespacedStore>,
        namespace: impl Into<String>,
        queue: SharedQueue,
        committer: Arc<CursorCommitter>,
        shutdown: ShutdownHandle,
    ) -> Self {
        Self {
            id,
            store,
            namespace: namespace.into(),
            queue,
            committer,
            shutdown,
        }
    }

    /// Runs until the producer closes the queue and it is empty.
    ///
    /// A store failure is fatal: the consumer requests shutdown so the
    /// producer stops, and returns the error.
    pub async fn run(self) -> Result<UnitOutcome, PipelineError> {
        let mut total = UnitOutcome::default();
        loop {
            let unit = {
                let mut queue = self.queue.lock().await;
                queue.recv().await
            };
            let Some(unit) = unit else {
                break;
            };

            match self.process(unit).await {
                Ok(outcome) => total += outcome,
                Err(e) => {
                    error!(consumer = self.id, error = %e, "consumer failed, stopping pipeline");
                    self.shutdown.request_shutdown();
                    return Err(e);
                }
            }
        }
        debug!(consumer = self.id, units = total.units, "consumer finished");
        Ok(total)
    }

    async fn process(&self, unit: WorkUnit) -> Result<UnitOutcome, PipelineError> {
        let store = Arc::clone(&self.store);
        let namespace = self.namespace.clone();
        let committer = Arc::clone(&self.committer);

        tokio::task::spawn_blocking(move || resolve_unit(&store, &namespace, &committer, unit))
            .await
            .map_err(|e| PipelineError::TaskFailed(format!("store task failed: {}", e)))?
    }
}

/// Dedups and stores one unit, then hands its cursor to the committer.
///
/// Each record is checked with `has` and written only if absent. A crash
/// between the check and the write leaves the record absent and the unit
/// uncommitted, so it is fetched and checked again on restart.
pub fn resolve_unit(
    store: &NamespacedStore,
    namespace: &str,
    committer: &CursorCommitter,
    unit: WorkUnit,
) -> Result<UnitOutcome, PipelineError> {
    let mut outcome = UnitOutcome {
        units: 1,
        ..UnitOutcome::default()
    };

    for record in &unit.records {
        let key = record.stored_key();
        let store_error = |error: StoreError| PipelineError::Store {
            namespace: namespace.to_string(),
            key: key.clone(),
            error,
        };

        if store.has(namespace, key.as_bytes()).map_err(store_error)? {
            debug!(namespace, record_id = %record.id, "record already stored");
            outcome.duplicates += 1;
            continue;
        }

        let value = match record.encode() {
            Ok(value) => value,
            Err(e) => {
                warn!(namespace, record_id = %record.id, error = %e, "skipping record");
                outcome.skipped += 1;
                continue;
            }
        };

        store
            .set(namespace, key.as_bytes(), &value)
            .map_err(store_error)?;
        outcome.written += 1;
    }

    committer.complete(unit.seq, unit.next)?;
    debug!(
        unit = unit.seq,
        cursor = %unit.next,
        written = outcome.written,
        duplicates = outcome.duplicates,
        "unit resolved"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Cursor, CursorStore, Record};
    use crate::storage::StoreConfig;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (Arc<NamespacedStore>, CursorStore, CursorCommitter) {
        let store = Arc::new(NamespacedStore::open(StoreConfig::new(dir.path())).unwrap());
        let cursors = CursorStore::new(Arc::clone(&store), "test");
        let committer = CursorCommitter::new(cursors.clone(), Cursor::START);
        (store, cursors, committer)
    }

    fn unit(seq: u64, ids: &[&str], next: u64) -> WorkUnit {
        WorkUnit {
            seq,
            cursor: Cursor::new(next.saturating_sub(ids.len() as u64)),
            records: ids.iter().map(|id| Record::new(*id)).collect(),
            next: Cursor::new(next),
        }
    }

    #[test]
    fn test_resolve_writes_then_dedups() {
        let dir = TempDir::new().unwrap();
        let (store, cursors, committer) = setup(&dir);

        let first = resolve_unit(&store, "posts", &committer, unit(0, &["p1", "p2"], 2)).unwrap();
        assert_eq!(first.written, 2);
        assert_eq!(cursors.load().unwrap(), Cursor::new(2));

        let second = resolve_unit(&store, "posts", &committer, unit(1, &["p1", "p3"], 4)).unwrap();
        assert_eq!(second.written, 1);
        assert_eq!(second.duplicates, 1);
        assert_eq!(cursors.load().unwrap(), Cursor::new(4));

        let stored: serde_json::Value =
            serde_json::from_slice(&store.get("posts", b"post_p3").unwrap()).unwrap();
        assert_eq!(stored, json!({"id": "post_p3"}));
    }

    #[test]
    fn test_unserializable_record_skipped() {
        let dir = TempDir::new().unwrap();
        let (store, cursors, committer) = setup(&dir);

        let outcome = resolve_unit(&store, "posts", &committer, unit(0, &["", "ok"], 2)).unwrap();
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.written, 1);
        assert!(store.has("posts", b"post_ok").unwrap());
        assert_eq!(cursors.load().unwrap(), Cursor::new(2));
    }

    #[test]
    fn test_store_failure_carries_key_and_blocks_cursor() {
        let dir = TempDir::new().unwrap();
        let (store, _cursors, committer) = setup(&dir);
        store.close().unwrap();

        let err = resolve_unit(&store, "posts", &committer, unit(0, &["p9"], 1)).unwrap_err();
        match err {
            PipelineError::Store {
                namespace, key, error,
            } => {
                assert_eq!(namespace, "posts");
                assert_eq!(key, "post_p9");
                assert!(error.is_closed());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(committer.committed(), Cursor::START);
    }
}
