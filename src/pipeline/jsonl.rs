//! JSONL record source.
//!
//! Reads records from a file with one JSON object per line. The cursor is
//! the number of lines consumed, so a restart resumes at the first line of
//! the unit that was not yet committed.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

use super::cursor::Cursor;
use super::record::Record;
use super::source::{Fetch, RecordSource, SourceError};

/// Default number of records per unit of work
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// JSONL file record source.
pub struct JsonlSource {
    name: String,
    path: PathBuf,
    batch_size: usize,
    /// Open reader and the line it is positioned at
    reader: Option<(Lines<BufReader<File>>, u64)>,
}

impl JsonlSource {
    /// Create a source reading `path`, stored under cursor name `name`.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            reader: None,
        }
    }

    /// Sets the maximum records per fetch.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Input file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a reader positioned at `line`, or `None` if the file ends first.
    async fn reader_at(
        &mut self,
        line: u64,
    ) -> Result<Option<&mut Lines<BufReader<File>>>, SourceError> {
        let positioned = matches!(self.reader, Some((_, pos)) if pos == line);
        if !positioned {
            self.reader = None;
            let file = File::open(&self.path).await?;
            let mut lines = BufReader::new(file).lines();
            for _ in 0..line {
                if lines.next_line().await?.is_none() {
                    return Ok(None);
                }
            }
            self.reader = Some((lines, line));
        }
        Ok(self.reader.as_mut().map(|(lines, _)| lines))
    }
}

#[async_trait]
impl RecordSource for JsonlSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&mut self, cursor: Cursor) -> Result<Fetch, SourceError> {
        let start = cursor.value();
        let batch_size = self.batch_size;
        let lines = match self.reader_at(start).await? {
            Some(lines) => lines,
            None => return Ok(Fetch::Exhausted),
        };

        let mut records = Vec::with_capacity(batch_size);
        let mut consumed = 0u64;
        while records.len() < batch_size {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    self.reader = None;
                    return Err(e.into());
                }
            };
            consumed += 1;

            if line.trim().is_empty() {
                continue;
            }
            match parse_line(&line, start + consumed) {
                Ok(record) => records.push(record),
                Err(e) => {
                    self.reader = None;
                    return Err(e);
                }
            }
        }

        if consumed == 0 {
            return Ok(Fetch::Exhausted);
        }

        let next = start + consumed;
        if let Some((_, pos)) = self.reader.as_mut() {
            *pos = next;
        }
        Ok(Fetch::Batch {
            records,
            next: Cursor::new(next),
        })
    }
}

fn parse_line(line: &str, line_number: u64) -> Result<Record, SourceError> {
    let malformed = |message: String| SourceError::Malformed {
        line: line_number,
        message,
    };

    let value: Value = serde_json::from_str(line).map_err(|e| malformed(e.to_string()))?;
    let id = match value.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        Some(_) => return Err(malformed("id must be a string or number".to_string())),
        None => return Err(malformed("missing id".to_string())),
    };
    Ok(Record::with_payload(id, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_source(dir: &TempDir, lines: &[&str]) -> PathBuf {
        let path = dir.path().join("records.jsonl");
        fs::write(&path, lines.join("\n")).unwrap();
        path
    }

    fn ids(fetch: &Fetch) -> Vec<String> {
        match fetch {
            Fetch::Batch { records, .. } => records.iter().map(|r| r.id.clone()).collect(),
            Fetch::Exhausted => Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_pages_through_file() {
        let dir = TempDir::new().unwrap();
        let path = write_source(
            &dir,
            &[r#"{"id":"p1"}"#, r#"{"id":"p2"}"#, r#"{"id":3}"#],
        );
        let mut source = JsonlSource::new("posts", path).with_batch_size(2);

        let first = source.fetch(Cursor::START).await.unwrap();
        assert_eq!(ids(&first), vec!["p1", "p2"]);
        let Fetch::Batch { next, .. } = first else {
            panic!("expected batch")
        };
        assert_eq!(next, Cursor::new(2));

        let second = source.fetch(next).await.unwrap();
        assert_eq!(ids(&second), vec!["3"]);
        assert_eq!(source.fetch(Cursor::new(3)).await.unwrap(), Fetch::Exhausted);
    }

    #[tokio::test]
    async fn test_refetch_same_cursor_returns_same_records() {
        let dir = TempDir::new().unwrap();
        let path = write_source(&dir, &[r#"{"id":"a"}"#, r#"{"id":"b"}"#, r#"{"id":"c"}"#]);
        let mut source = JsonlSource::new("posts", path).with_batch_size(2);

        let first = source.fetch(Cursor::START).await.unwrap();
        let again = source.fetch(Cursor::START).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(ids(&source.fetch(Cursor::new(1)).await.unwrap()), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_blank_lines_skipped_but_counted() {
        let dir = TempDir::new().unwrap();
        let path = write_source(&dir, &[r#"{"id":"a"}"#, "", "  ", r#"{"id":"b"}"#]);
        let mut source = JsonlSource::new("posts", path).with_batch_size(10);

        match source.fetch(Cursor::START).await.unwrap() {
            Fetch::Batch { records, next } => {
                assert_eq!(records.len(), 2);
                assert_eq!(next, Cursor::new(4));
            }
            Fetch::Exhausted => panic!("expected batch"),
        }
    }

    #[tokio::test]
    async fn test_cursor_past_end_is_exhausted() {
        let dir = TempDir::new().unwrap();
        let path = write_source(&dir, &[r#"{"id":"a"}"#]);
        let mut source = JsonlSource::new("posts", path);
        assert_eq!(source.fetch(Cursor::new(10)).await.unwrap(), Fetch::Exhausted);
    }

    #[tokio::test]
    async fn test_malformed_line_is_error() {
        let dir = TempDir::new().unwrap();
        let path = write_source(&dir, &[r#"{"id":"a"}"#, "not json", r#"{"title":"x"}"#]);
        let mut source = JsonlSource::new("posts", path);

        let err = source.fetch(Cursor::START).await.unwrap_err();
        assert!(matches!(err, SourceError::Malformed { line: 2, .. }));

        let err = source.fetch(Cursor::new(2)).await.unwrap_err();
        assert!(matches!(err, SourceError::Malformed { line: 3, .. }));
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let mut source = JsonlSource::new("posts", dir.path().join("absent.jsonl"));
        assert!(matches!(
            source.fetch(Cursor::START).await,
            Err(SourceError::Io(_))
        ));
    }
}
