//! Dedup ingestion pipeline
//!
//! One producer fetches units of work from a [`RecordSource`] and pushes
//! them onto a bounded queue; a full queue suspends it. One or more
//! consumers pop units, store each record not already present, and advance
//! the source cursor once the whole unit is resolved.
//!
//! # Guarantees
//!
//! - A record is written only if `has` reported it absent
//! - The persisted cursor never passes a unit with unresolved records
//! - Refetching an uncommitted unit after a crash is harmless
//!
//! # Error policy
//!
//! | Failure | Effect |
//! |---------|--------|
//! | Source fetch | fatal, pipeline stops |
//! | Record serialization | record skipped, logged at WARN |
//! | Store `has` / `set` / cursor write | fatal, pipeline stops |

mod consumer;
mod cursor;
mod jsonl;
mod producer;
mod record;
mod source;

pub use consumer::{resolve_unit, Consumer, SharedQueue, UnitOutcome};
pub use cursor::{Cursor, CursorCommitter, CursorStore, CURSOR_NAMESPACE};
pub use jsonl::{JsonlSource, DEFAULT_BATCH_SIZE};
pub use producer::{Producer, ProducerReport};
pub use record::{Record, RecordError, STORED_KEY_PREFIX};
pub use source::{Fetch, RecordSource, SourceError};

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::shutdown::ShutdownHandle;
use crate::storage::{NamespacedStore, StoreError};

/// Default namespace for ingested records
pub const DEFAULT_NAMESPACE: &str = "overemployed";

/// Default bounded queue capacity, in units
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Pipeline failures.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The source failed to produce a unit
    #[error("fetch from {source_name} at cursor {cursor} failed: {error}")]
    SourceFetch {
        source_name: String,
        cursor: Cursor,
        #[source]
        error: SourceError,
    },

    /// A store operation failed for a specific key
    #[error("store operation on {namespace}/{key} failed: {error}")]
    Store {
        namespace: String,
        key: String,
        #[source]
        error: StoreError,
    },

    /// A cursor tried to move backwards
    #[error("cursor for {source_name} would move back from {current} to {proposed}")]
    CursorRegression {
        source_name: String,
        current: Cursor,
        proposed: Cursor,
    },

    /// The persisted cursor is not a decimal integer
    #[error("invalid cursor for {source_name}: {value:?}")]
    InvalidCursor { source_name: String, value: String },

    /// A pipeline task panicked or was cancelled
    #[error("pipeline task failed: {0}")]
    TaskFailed(String),
}

/// One fetched batch in flight between producer and consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkUnit {
    /// Position in fetch order, starting at 0 for each run
    pub seq: u64,
    /// Cursor the batch was fetched at
    pub cursor: Cursor,
    /// Records in source order
    pub records: Vec<Record>,
    /// Cursor to persist once every record is resolved
    pub next: Cursor,
}

/// Pipeline tuning.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Namespace records are stored in
    pub namespace: String,
    /// Bounded queue capacity, in units
    pub queue_capacity: usize,
    /// Number of consumer tasks
    pub consumers: usize,
    /// Wait between fetches
    pub request_delay: Duration,
    /// Stop after this many units
    pub max_units: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            consumers: 1,
            request_delay: Duration::ZERO,
            max_units: None,
        }
    }
}

impl PipelineConfig {
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_consumers(mut self, consumers: usize) -> Self {
        self.consumers = consumers;
        self
    }

    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    pub fn with_max_units(mut self, max_units: Option<u64>) -> Self {
        self.max_units = max_units;
        self
    }
}

/// Totals for one pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    /// Units the producer enqueued
    pub units_fetched: u64,
    /// Records in those units
    pub records_fetched: u64,
    /// Units fully resolved by consumers
    pub units_resolved: u64,
    /// Records written
    pub written: u64,
    /// Records already stored
    pub duplicates: u64,
    /// Records skipped as unserializable
    pub skipped: u64,
    /// Whether the source ran dry
    pub exhausted: bool,
    /// Last persisted cursor
    pub cursor: Cursor,
}

/// Bounded-queue producer/consumer pipeline over a shared store.
pub struct DedupIngestionPipeline<S> {
    store: Arc<NamespacedStore>,
    source: S,
    config: PipelineConfig,
}

impl<S: RecordSource + 'static> DedupIngestionPipeline<S> {
    pub fn new(store: Arc<NamespacedStore>, source: S, config: PipelineConfig) -> Self {
        Self {
            store,
            source,
            config,
        }
    }

    /// Loads the cursor and spawns the producer and consumers.
    pub async fn start(self, shutdown: ShutdownHandle) -> Result<RunningPipeline, PipelineError> {
        let Self {
            store,
            source,
            config,
        } = self;

        let cursors = CursorStore::new(Arc::clone(&store), source.name());
        let loader = cursors.clone();
        let start = tokio::task::spawn_blocking(move || loader.load())
            .await
            .map_err(|e| PipelineError::TaskFailed(format!("cursor load failed: {}", e)))??;

        let consumers = config.consumers.max(1);
        info!(
            source = source.name(),
            namespace = %config.namespace,
            cursor = %start,
            consumers,
            queue_capacity = config.queue_capacity,
            "pipeline starting"
        );

        let committer = Arc::new(CursorCommitter::new(cursors, start));
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let queue: SharedQueue = Arc::new(Mutex::new(rx));

        let producer = Producer::new(source, tx, shutdown.clone(), start)
            .with_request_delay(config.request_delay)
            .with_max_units(config.max_units);
        let producer = tokio::spawn(producer.run());

        let consumers = (0..consumers)
            .map(|id| {
                let consumer = Consumer::new(
                    id,
                    Arc::clone(&store),
                    config.namespace.clone(),
                    Arc::clone(&queue),
                    Arc::clone(&committer),
                    shutdown.clone(),
                );
                Some(tokio::spawn(consumer.run()))
            })
            .collect();

        Ok(RunningPipeline {
            producer: Some(producer),
            consumers,
            committer,
            report: PipelineReport {
                cursor: start,
                ..PipelineReport::default()
            },
            error: None,
        })
    }

    /// Runs the pipeline to completion.
    pub async fn run(self, shutdown: ShutdownHandle) -> Result<PipelineReport, PipelineError> {
        self.start(shutdown).await?.wait().await
    }
}

/// Handles to a started pipeline.
pub struct RunningPipeline {
    producer: Option<JoinHandle<Result<ProducerReport, PipelineError>>>,
    consumers: Vec<Option<JoinHandle<Result<UnitOutcome, PipelineError>>>>,
    committer: Arc<CursorCommitter>,
    report: PipelineReport,
    error: Option<PipelineError>,
}

impl RunningPipeline {
    /// Waits for the producer and every consumer to finish.
    ///
    /// Cancel-safe: tasks already joined stay accounted for, so the wait can
    /// be resumed, for example under a timeout. Returns the first error any
    /// task reported.
    pub async fn wait(&mut self) -> Result<PipelineReport, PipelineError> {
        if let Some(handle) = self.producer.as_mut() {
            let joined = flatten(handle.await);
            self.producer = None;
            match joined {
                Ok(produced) => {
                    self.report.units_fetched = produced.units;
                    self.report.records_fetched = produced.records;
                    self.report.exhausted = produced.exhausted;
                }
                Err(e) => {
                    error!(error = %e, "producer failed");
                    self.error.get_or_insert(e);
                }
            }
        }

        for slot in self.consumers.iter_mut() {
            let Some(handle) = slot.as_mut() else {
                continue;
            };
            let joined = flatten(handle.await);
            *slot = None;
            match joined {
                Ok(outcome) => {
                    self.report.units_resolved += outcome.units;
                    self.report.written += outcome.written;
                    self.report.duplicates += outcome.duplicates;
                    self.report.skipped += outcome.skipped;
                }
                Err(e) => {
                    self.error.get_or_insert(e);
                }
            }
        }

        self.report.cursor = self.committer.committed();
        match self.error.take() {
            Some(e) => Err(e),
            None => {
                info!(
                    units = self.report.units_resolved,
                    written = self.report.written,
                    duplicates = self.report.duplicates,
                    cursor = %self.report.cursor,
                    "pipeline finished"
                );
                Ok(self.report)
            }
        }
    }

    /// Aborts every task not yet joined.
    pub fn abort(&mut self) {
        if let Some(handle) = self.producer.take() {
            handle.abort();
        }
        for handle in self.consumers.iter_mut().filter_map(Option::take) {
            handle.abort();
        }
    }

    /// Whether every task has been joined.
    pub fn is_finished(&self) -> bool {
        self.producer.is_none() && self.consumers.iter().all(Option::is_none)
    }
}

fn flatten<T>(
    joined: Result<Result<T, PipelineError>, tokio::task::JoinError>,
) -> Result<T, PipelineError> {
    joined.map_err(|e| PipelineError::TaskFailed(e.to_string()))?
}
