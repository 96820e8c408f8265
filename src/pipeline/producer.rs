//! Producer: fetches units of work and feeds the bounded queue

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::cursor::Cursor;
use super::source::{Fetch, RecordSource};
use super::{PipelineError, WorkUnit};
use crate::shutdown::ShutdownHandle;

/// What the producer did before it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProducerReport {
    /// Units handed to the queue
    pub units: u64,
    /// Records in those units
    pub records: u64,
    /// Whether the source ran dry
    pub exhausted: bool,
}

/// Fetches from a source and enqueues each batch as one unit of work.
///
/// A full queue suspends the producer. Shutdown is checked before each
/// fetch and also interrupts a blocked enqueue or the request delay; an
/// interrupted unit is dropped and will be refetched from the persisted
/// cursor.
pub struct Producer<S> {
    source: S,
    queue: mpsc::Sender<WorkUnit>,
    shutdown: ShutdownHandle,
    start: Cursor,
    request_delay: Duration,
    max_units: Option<u64>,
}

impl<S: RecordSource> Producer<S> {
    pub fn new(
        source: S,
        queue: mpsc::Sender<WorkUnit>,
        shutdown: ShutdownHandle,
        start: Cursor,
    ) -> Self {
        Self {
            source,
            queue,
            shutdown,
            start,
            request_delay: Duration::ZERO,
            max_units: None,
        }
    }

    /// Wait between consecutive fetches.
    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    /// Stop after this many units.
    pub fn with_max_units(mut self, max_units: Option<u64>) -> Self {
        self.max_units = max_units;
        self
    }

    /// Runs until the source is exhausted, the unit limit is reached,
    /// shutdown is requested or every consumer has gone.
    ///
    /// Dropping the queue sender on return is what tells consumers the
    /// stream has ended.
    pub async fn run(mut self) -> Result<ProducerReport, PipelineError> {
        let mut report = ProducerReport::default();
        let mut cursor = self.start;
        let mut stop = self.shutdown.clone();

        loop {
            if self.shutdown.is_shutdown_requested() {
                info!(%cursor, "producer stopping on shutdown request");
                break;
            }
            if self.max_units.is_some_and(|max| report.units >= max) {
                info!(units = report.units, "producer reached unit limit");
                break;
            }
            if report.units > 0 && !self.request_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.request_delay) => {}
                    _ = stop.wait() => {
                        info!(%cursor, "producer stopping on shutdown request");
                        break;
                    }
                }
            }

            let fetched = self.source.fetch(cursor).await;
            let (records, next) = match fetched {
                Ok(Fetch::Batch { records, next }) => (records, next),
                Ok(Fetch::Exhausted) => {
                    info!(source = self.source.name(), %cursor, "source exhausted");
                    report.exhausted = true;
                    break;
                }
                Err(error) => {
                    return Err(PipelineError::SourceFetch {
                        source_name: self.source.name().to_string(),
                        cursor,
                        error,
                    })
                }
            };
            if next < cursor {
                return Err(PipelineError::CursorRegression {
                    source_name: self.source.name().to_string(),
                    current: cursor,
                    proposed: next,
                });
            }

            let count = records.len() as u64;
            let unit = WorkUnit {
                seq: report.units,
                cursor,
                records,
                next,
            };
            debug!(unit = unit.seq, %cursor, records = count, "enqueueing unit");

            tokio::select! {
                biased;
                sent = self.queue.send(unit) => {
                    if sent.is_err() {
                        warn!(%cursor, "queue closed by consumers, producer stopping");
                        break;
                    }
                }
                _ = stop.wait() => {
                    info!(%cursor, "shutdown while queue full, dropping pending unit");
                    break;
                }
            }

            report.units += 1;
            report.records += count;
            cursor = next;
        }

        Ok(report)
    }
}
