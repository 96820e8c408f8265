//! Durable ingestion cursor
//!
//! The cursor for a source lives in the `index` namespace under the source
//! name, as a decimal string. It only moves forward, and only past units
//! whose records have all been resolved.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::debug;

use super::PipelineError;
use crate::storage::NamespacedStore;

/// Namespace holding per-source cursors
pub const CURSOR_NAMESPACE: &str = "index";

/// Progress position within a source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Cursor(u64);

impl Cursor {
    /// Position before anything has been ingested
    pub const START: Cursor = Cursor(0);

    /// Cursor at `position`
    pub fn new(position: u64) -> Self {
        Self(position)
    }

    /// Raw position
    pub fn value(&self) -> u64 {
        self.0
    }

    fn encode(&self) -> Vec<u8> {
        self.0.to_string().into_bytes()
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reads and writes the persisted cursor of one source.
#[derive(Clone)]
pub struct CursorStore {
    store: Arc<NamespacedStore>,
    source_name: String,
}

impl CursorStore {
    pub fn new(store: Arc<NamespacedStore>, source_name: impl Into<String>) -> Self {
        Self {
            store,
            source_name: source_name.into(),
        }
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// Loads the persisted cursor, or [`Cursor::START`] if none exists.
    pub fn load(&self) -> Result<Cursor, PipelineError> {
        let raw = match self
            .store
            .get(CURSOR_NAMESPACE, self.source_name.as_bytes())
        {
            Ok(raw) => raw,
            Err(e) if e.is_not_found() => return Ok(Cursor::START),
            Err(e) => return Err(self.store_error(e)),
        };

        std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Cursor)
            .ok_or_else(|| PipelineError::InvalidCursor {
                source_name: self.source_name.clone(),
                value: String::from_utf8_lossy(&raw).into_owned(),
            })
    }

    fn save(&self, cursor: Cursor) -> Result<(), PipelineError> {
        self.store
            .set(CURSOR_NAMESPACE, self.source_name.as_bytes(), &cursor.encode())
            .map_err(|e| self.store_error(e))
    }

    fn store_error(&self, error: crate::storage::StoreError) -> PipelineError {
        PipelineError::Store {
            namespace: CURSOR_NAMESPACE.to_string(),
            key: self.source_name.clone(),
            error,
        }
    }
}

struct CommitState {
    /// Sequence number of the next unit allowed to commit
    next_seq: u64,
    /// Finished units waiting on an earlier one
    pending: BTreeMap<u64, Cursor>,
    /// Last persisted cursor
    committed: Cursor,
}

/// Persists unit cursors in unit order.
///
/// Consumers finish units out of order. A cursor is written only once every
/// earlier unit has finished, so the persisted position never passes a unit
/// whose records are not yet stored.
pub struct CursorCommitter {
    cursors: CursorStore,
    state: Mutex<CommitState>,
}

impl CursorCommitter {
    /// Committer expecting unit 0 next, resuming from `committed`.
    pub fn new(cursors: CursorStore, committed: Cursor) -> Self {
        Self {
            cursors,
            state: Mutex::new(CommitState {
                next_seq: 0,
                pending: BTreeMap::new(),
                committed,
            }),
        }
    }

    /// Last persisted cursor.
    pub fn committed(&self) -> Cursor {
        match self.state.lock() {
            Ok(state) => state.committed,
            Err(poisoned) => poisoned.into_inner().committed,
        }
    }

    /// Marks unit `seq` done with follow-on cursor `next` and persists every
    /// cursor that is now contiguous.
    ///
    /// Returns the number of cursors written.
    pub fn complete(&self, seq: u64, next: Cursor) -> Result<usize, PipelineError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| PipelineError::TaskFailed("cursor commit lock poisoned".to_string()))?;

        state.pending.insert(seq, next);
        let mut written = 0;
        loop {
            let next_seq = state.next_seq;
            let cursor = match state.pending.get(&next_seq) {
                Some(cursor) => *cursor,
                None => break,
            };
            if cursor < state.committed {
                return Err(PipelineError::CursorRegression {
                    source_name: self.cursors.source_name().to_string(),
                    current: state.committed,
                    proposed: cursor,
                });
            }

            self.cursors.save(cursor)?;
            debug!(source = self.cursors.source_name(), unit = next_seq, %cursor, "cursor advanced");
            state.pending.remove(&next_seq);
            state.committed = cursor;
            state.next_seq += 1;
            written += 1;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreConfig;
    use tempfile::TempDir;

    fn cursor_store(dir: &TempDir) -> CursorStore {
        let store = NamespacedStore::open(StoreConfig::new(dir.path())).unwrap();
        CursorStore::new(Arc::new(store), "overemployed")
    }

    #[test]
    fn test_absent_cursor_is_start() {
        let dir = TempDir::new().unwrap();
        assert_eq!(cursor_store(&dir).load().unwrap(), Cursor::START);
    }

    #[test]
    fn test_cursor_stored_as_decimal() {
        let dir = TempDir::new().unwrap();
        let cursors = cursor_store(&dir);
        cursors.save(Cursor::new(42)).unwrap();

        assert_eq!(cursors.load().unwrap(), Cursor::new(42));
        let raw = cursors
            .store
            .get(CURSOR_NAMESPACE, b"overemployed")
            .unwrap();
        assert_eq!(raw, b"42");
    }

    #[test]
    fn test_garbage_cursor_rejected() {
        let dir = TempDir::new().unwrap();
        let cursors = cursor_store(&dir);
        cursors
            .store
            .set(CURSOR_NAMESPACE, b"overemployed", b"forty")
            .unwrap();
        assert!(matches!(
            cursors.load(),
            Err(PipelineError::InvalidCursor { .. })
        ));
    }

    #[test]
    fn test_out_of_order_completion_commits_in_order() {
        let dir = TempDir::new().unwrap();
        let cursors = cursor_store(&dir);
        let committer = CursorCommitter::new(cursors.clone(), Cursor::START);

        assert_eq!(committer.complete(1, Cursor::new(20)).unwrap(), 0);
        assert_eq!(committer.complete(2, Cursor::new(30)).unwrap(), 0);
        assert_eq!(cursors.load().unwrap(), Cursor::START);

        assert_eq!(committer.complete(0, Cursor::new(10)).unwrap(), 3);
        assert_eq!(cursors.load().unwrap(), Cursor::new(30));
        assert_eq!(committer.committed(), Cursor::new(30));
    }

    #[test]
    fn test_regression_rejected() {
        let dir = TempDir::new().unwrap();
        let cursors = cursor_store(&dir);
        let committer = CursorCommitter::new(cursors.clone(), Cursor::new(50));

        let err = committer.complete(0, Cursor::new(10)).unwrap_err();
        assert!(matches!(err, PipelineError::CursorRegression { .. }));
        assert_eq!(cursors.load().unwrap(), Cursor::START);
    }
}
