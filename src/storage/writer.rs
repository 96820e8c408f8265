//! Append-only log writer
//!
//! The log has no in-place updates. A set or delete is one appended record;
//! latest record for a key wins. With `sync_writes` every append is fsynced
//! before it is acknowledged.
//!
//! A failed append is cut back off the file so the log always ends at the
//! last acknowledged record. If that cut fails too, the writer refuses every
//! later append.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::error;

use super::errors::{StoreError, StoreResult};
use super::record::LogRecord;

/// Location of a record inside the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPointer {
    /// Byte offset of the record start
    pub offset: u64,
    /// Total record length in bytes
    pub len: u32,
}

/// Append-only writer over a single log file.
pub struct LogWriter {
    /// Path to the log file
    log_path: PathBuf,
    /// Underlying file handle, shared with readers for positional reads
    file: Arc<File>,
    /// Current end of log
    current_offset: u64,
    /// fsync after each append
    sync_writes: bool,
    /// Set when a failed append could not be rolled back
    poisoned: bool,
}

impl LogWriter {
    /// Opens or creates the log file for appending.
    pub fn open(log_path: &Path, sync_writes: bool) -> StoreResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(log_path)
            .map_err(|e| {
                StoreError::write_failed(format!("Failed to open log: {}", log_path.display()), e)
            })?;

        let current_offset = file
            .metadata()
            .map_err(|e| StoreError::io_error("Failed to read log metadata", e))?
            .len();

        Ok(Self {
            log_path: log_path.to_path_buf(),
            file: Arc::new(file),
            current_offset,
            sync_writes,
            poisoned: false,
        })
    }

    /// Creates an empty log at `log_path`, replacing any leftover file.
    pub fn create_fresh(log_path: &Path, sync_writes: bool) -> StoreResult<Self> {
        match fs::remove_file(log_path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(StoreError::write_failed(
                    format!("Failed to remove stale log: {}", log_path.display()),
                    e,
                ))
            }
        }
        Self::open(log_path, sync_writes)
    }

    /// Returns the path to the log file.
    pub fn path(&self) -> &Path {
        &self.log_path
    }

    /// Returns the file handle for positional reads.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Returns a handle that stays readable after this log is replaced.
    pub fn shared_file(&self) -> Arc<File> {
        Arc::clone(&self.file)
    }

    /// Records that the file was renamed to `log_path`.
    pub fn relocate(&mut self, log_path: PathBuf) {
        self.log_path = log_path;
    }

    /// Enables or disables fsync after each append.
    pub fn set_sync_writes(&mut self, sync_writes: bool) {
        self.sync_writes = sync_writes;
    }

    /// Returns the current end of log.
    pub fn current_offset(&self) -> u64 {
        self.current_offset
    }

    /// Appends a record, returning where it landed.
    ///
    /// On error nothing of the record remains in the log.
    pub fn append(&mut self, record: &LogRecord) -> StoreResult<RecordPointer> {
        let offset = self.current_offset;
        if self.poisoned {
            return Err(StoreError::log_poisoned(offset));
        }

        let serialized = record.serialize();
        let len = u32::try_from(serialized.len())
            .map_err(|_| StoreError::value_too_large("", &record.key, record.value.len()))?;

        if let Err(e) = self.write_and_sync(&serialized) {
            self.rollback();
            return Err(e);
        }

        self.current_offset += serialized.len() as u64;
        Ok(RecordPointer { offset, len })
    }

    fn write_and_sync(&self, bytes: &[u8]) -> StoreResult<()> {
        (&*self.file).write_all(bytes).map_err(|e| {
            StoreError::write_failed(
                format!("Failed to append record at offset {}", self.current_offset),
                e,
            )
        })?;
        if self.sync_writes {
            self.sync()?;
        }
        Ok(())
    }

    /// Drops whatever a failed append left past the last acknowledged record.
    fn rollback(&mut self) {
        if let Err(e) = self.file.set_len(self.current_offset) {
            error!(
                offset = self.current_offset,
                error = %e,
                "log rollback failed, refusing further appends"
            );
            self.poisoned = true;
        }
    }

    /// Flushes file contents and metadata to disk.
    pub fn sync(&self) -> StoreResult<()> {
        self.file
            .sync_all()
            .map_err(|e| StoreError::write_failed("fsync failed on log", e))
    }

    /// Cuts the log back to `offset`, dropping a torn tail.
    pub fn truncate_to(&mut self, offset: u64) -> StoreResult<()> {
        self.file.set_len(offset).map_err(|e| {
            StoreError::write_failed(format!("Failed to truncate log to {}", offset), e)
        })?;
        self.sync()?;
        self.current_offset = offset;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::errors::StoreErrorCode;
    use crate::storage::reader::{read_record_at, LogReader};
    use tempfile::TempDir;

    #[test]
    fn test_append_tracks_offsets() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("store.log");
        let mut writer = LogWriter::open(&path, true).unwrap();
        assert_eq!(writer.current_offset(), 0);

        let first = writer
            .append(&LogRecord::live(b"k1".to_vec(), b"v1".to_vec()))
            .unwrap();
        let second = writer
            .append(&LogRecord::live(b"k2".to_vec(), b"v2".to_vec()))
            .unwrap();

        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, first.len as u64);
        assert_eq!(writer.current_offset(), (first.len + second.len) as u64);
    }

    #[test]
    fn test_positional_read_through_writer_handle() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("store.log");
        let mut writer = LogWriter::open(&path, false).unwrap();

        writer
            .append(&LogRecord::live(b"k1".to_vec(), b"first".to_vec()))
            .unwrap();
        let ptr = writer
            .append(&LogRecord::live(b"k1".to_vec(), b"second".to_vec()))
            .unwrap();

        let record = read_record_at(writer.file(), ptr.offset, ptr.len).unwrap();
        assert_eq!(record.value, b"second");
    }

    #[test]
    fn test_reopen_appends_at_end() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("store.log");
        {
            let mut writer = LogWriter::open(&path, true).unwrap();
            writer
                .append(&LogRecord::live(b"k1".to_vec(), b"v1".to_vec()))
                .unwrap();
        }

        let mut writer = LogWriter::open(&path, true).unwrap();
        assert!(writer.current_offset() > 0);
        writer.append(&LogRecord::tombstone(b"k1".to_vec())).unwrap();

        let records = LogReader::open(&path).unwrap().read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[1].1.is_tombstone());
    }

    #[test]
    fn test_create_fresh_discards_leftover() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("store.log.compact");
        fs::write(&path, b"partial garbage").unwrap();

        let writer = LogWriter::create_fresh(&path, false).unwrap();
        assert_eq!(writer.current_offset(), 0);
    }

    #[test]
    fn test_truncate_to() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("store.log");
        let mut writer = LogWriter::open(&path, true).unwrap();
        let ptr = writer
            .append(&LogRecord::live(b"k1".to_vec(), b"v1".to_vec()))
            .unwrap();
        writer
            .append(&LogRecord::live(b"k2".to_vec(), b"v2".to_vec()))
            .unwrap();

        writer.truncate_to(ptr.len as u64).unwrap();
        assert_eq!(writer.current_offset(), ptr.len as u64);
        assert_eq!(LogReader::open(&path).unwrap().read_all().unwrap().len(), 1);
    }

    #[test]
    fn test_rollback_drops_partial_append() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("store.log");
        let mut writer = LogWriter::open(&path, true).unwrap();
        let first = writer
            .append(&LogRecord::live(b"a".to_vec(), b"1".to_vec()))
            .unwrap();

        // What an interrupted write_all leaves behind.
        let partial = LogRecord::live(b"lost".to_vec(), b"xxxx".to_vec()).serialize();
        (&*writer.file).write_all(&partial[..7]).unwrap();
        writer.rollback();
        assert!(!writer.poisoned);

        let second = writer
            .append(&LogRecord::live(b"b".to_vec(), b"2".to_vec()))
            .unwrap();
        assert_eq!(second.offset, first.len as u64);
        let record = read_record_at(writer.file(), second.offset, second.len).unwrap();
        assert_eq!(record.value, b"2");

        let records = LogReader::open(&path).unwrap().read_all().unwrap();
        assert_eq!(records.len(), 2);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_append_without_rollback_poisons_writer() {
        // Writes to /dev/full fail with ENOSPC and it cannot be truncated.
        let path = Path::new("/dev/full");
        if !path.exists() {
            return;
        }
        let mut writer = LogWriter::open(path, false).unwrap();
        let record = LogRecord::live(b"k".to_vec(), b"v".to_vec());

        let err = writer.append(&record).unwrap_err();
        assert_eq!(err.code(), StoreErrorCode::WriteFailed);
        assert_eq!(writer.current_offset(), 0);

        let err = writer.append(&record).unwrap_err();
        assert_eq!(err.code(), StoreErrorCode::LogPoisoned);
        assert!(err.is_fatal());
    }
}
