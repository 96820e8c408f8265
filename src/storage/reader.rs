//! Log reader with strict corruption detection
//!
//! Sequential scans rebuild the index on open and feed compaction.
//! Positional reads serve `get`.
//!
//! A damaged record that ends the file is a torn write from a crash: the scan
//! stops there and reports the offset so the caller can truncate. A damaged
//! record anywhere else is corruption and aborts the scan.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use super::errors::{StoreError, StoreResult};
use super::record::{LogRecord, MIN_RECORD_SIZE};

/// Sequential reader over an append-only log file.
pub struct LogReader {
    /// Buffered reader
    reader: BufReader<File>,
    /// Current byte offset
    current_offset: u64,
    /// Byte offset at which the scan stops
    end_offset: u64,
    /// Offset of a torn final record, once detected
    torn_tail: Option<u64>,
}

impl LogReader {
    /// Opens the log file for a full scan.
    pub fn open(log_path: &Path) -> StoreResult<Self> {
        let file = File::open(log_path).map_err(|e| {
            StoreError::read_failed(format!("Failed to open log: {}", log_path.display()), e)
        })?;

        let file_size = file
            .metadata()
            .map_err(|e| StoreError::read_failed("Failed to read log metadata", e))?
            .len();

        Ok(Self {
            reader: BufReader::new(file),
            current_offset: 0,
            end_offset: file_size,
            torn_tail: None,
        })
    }

    /// Opens the log and scans only the byte range `[start, end)`.
    pub fn open_range(log_path: &Path, start: u64, end: u64) -> StoreResult<Self> {
        let mut reader = Self::open(log_path)?;
        reader.end_offset = end.min(reader.end_offset);
        reader.reader.seek(SeekFrom::Start(start)).map_err(|e| {
            StoreError::read_failed(format!("Failed to seek to offset {}", start), e)
        })?;
        reader.current_offset = start;
        Ok(reader)
    }

    /// Offset of the torn final record, if the scan ended on one.
    pub fn torn_tail(&self) -> Option<u64> {
        self.torn_tail
    }

    /// Reads the next record and the offset it starts at.
    ///
    /// Returns `Ok(None)` at end of file or at a torn final record.
    pub fn read_next(&mut self) -> StoreResult<Option<(u64, LogRecord)>> {
        if self.current_offset >= self.end_offset || self.torn_tail.is_some() {
            return Ok(None);
        }

        let offset = self.current_offset;
        let remaining = self.end_offset - offset;

        if remaining < MIN_RECORD_SIZE as u64 {
            self.torn_tail = Some(offset);
            return Ok(None);
        }

        let mut len_buf = [0u8; 4];
        self.reader.read_exact(&mut len_buf).map_err(|e| {
            StoreError::corruption_at_offset(offset, format!("Failed to read record length: {}", e))
        })?;
        let record_length = LogRecord::declared_length(&len_buf) as u64;

        if record_length < MIN_RECORD_SIZE as u64 {
            return Err(StoreError::corruption_at_offset(
                offset,
                format!("Invalid record length: {}", record_length),
            ));
        }

        if record_length > remaining {
            self.torn_tail = Some(offset);
            return Ok(None);
        }

        let mut record_buf = vec![0u8; record_length as usize];
        record_buf[0..4].copy_from_slice(&len_buf);
        self.reader.read_exact(&mut record_buf[4..]).map_err(|e| {
            StoreError::corruption_at_offset(offset, format!("Failed to read record body: {}", e))
        })?;

        match LogRecord::deserialize(&record_buf) {
            Ok((record, consumed)) => {
                self.current_offset += consumed as u64;
                Ok(Some((offset, record)))
            }
            Err(_) if offset + record_length == self.end_offset => {
                self.torn_tail = Some(offset);
                Ok(None)
            }
            Err(e) => Err(StoreError::corruption_at_offset(offset, e.to_string())),
        }
    }

    #[cfg(test)]
    pub(crate) fn read_all(&mut self) -> StoreResult<Vec<(u64, LogRecord)>> {
        let mut records = Vec::new();
        while let Some(entry) = self.read_next()? {
            records.push(entry);
        }
        Ok(records)
    }
}

/// Reads and verifies the record of `len` bytes at `offset`.
pub fn read_record_at(file: &File, offset: u64, len: u32) -> StoreResult<LogRecord> {
    let mut buf = vec![0u8; len as usize];
    read_exact_at(file, &mut buf, offset).map_err(|e| {
        StoreError::read_failed(format!("Failed to read record at offset {}", offset), e)
    })?;

    let (record, _) = LogRecord::deserialize(&buf)
        .map_err(|e| StoreError::corruption_at_offset(offset, e.to_string()))?;
    Ok(record)
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
