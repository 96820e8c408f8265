//! Record sources feeding the pipeline
//!
//! A source pages through an external feed by cursor. The pipeline persists
//! the cursor returned with each batch only after the batch is stored, so a
//! source must return the same records when asked for the same cursor again.

use async_trait::async_trait;
use thiserror::Error;

use super::cursor::Cursor;
use super::record::Record;

/// Result of one fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetch {
    /// Records at the cursor, and the cursor that follows them
    Batch { records: Vec<Record>, next: Cursor },
    /// Nothing left at or after the cursor
    Exhausted,
}

/// Source fetch failure. Always fatal to the pipeline.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Underlying I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An entry could not be parsed into a record
    #[error("malformed record at line {line}: {message}")]
    Malformed { line: u64, message: String },

    /// Remote source refused or failed the request
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// A paged feed of records.
#[async_trait]
pub trait RecordSource: Send {
    /// Name of the feed; the cursor is stored under it.
    fn name(&self) -> &str;

    /// Fetches the unit of work starting at `cursor`.
    async fn fetch(&mut self, cursor: Cursor) -> Result<Fetch, SourceError>;
}
