//! Store error types
//!
//! Error codes:
//! - PK_STORE_NOT_FOUND (INFO severity) - key absent, a normal negative result
//! - PK_STORE_CLOSED (ERROR severity) - operation after `close()`
//! - PK_STORE_IO_ERROR (ERROR severity)
//! - PK_STORE_WRITE_FAILED (ERROR severity)
//! - PK_STORE_READ_FAILED (ERROR severity)
//! - PK_STORE_INVALID_KEY (ERROR severity)
//! - PK_STORE_VALUE_TOO_LARGE (ERROR severity)
//! - PK_STORE_NOTHING_TO_COMPACT (INFO severity)
//! - PK_STORE_LOCK_POISONED (FATAL severity)
//! - PK_STORE_LOG_POISONED (FATAL severity)
//! - PK_DATA_CORRUPTION (FATAL severity)

use std::fmt;
use std::io;

/// Severity levels for store errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Expected condition, absorbed by the caller
    Info,
    /// Operation fails, process continues
    Error,
    /// Store contents cannot be trusted
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Error => write!(f, "ERROR"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Store error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorCode {
    /// Key is absent
    NotFound,
    /// Store has been closed
    StoreClosed,
    /// Disk I/O failure
    IoError,
    /// Record append failed
    WriteFailed,
    /// Record read failed
    ReadFailed,
    /// Namespace or key cannot be encoded
    InvalidKey,
    /// Record would not fit the log's 32-bit framing
    ValueTooLarge,
    /// Compaction found too little garbage to be worth a rewrite
    NothingToCompact,
    /// A thread panicked while holding a store lock
    LockPoisoned,
    /// A failed append could not be rolled back; the log end is unknown
    LogPoisoned,
    /// Checksum or framing failure in the log
    DataCorruption,
}

impl StoreErrorCode {
    /// Returns the string code
    pub fn code(&self) -> &'static str {
        match self {
            StoreErrorCode::NotFound => "PK_STORE_NOT_FOUND",
            StoreErrorCode::StoreClosed => "PK_STORE_CLOSED",
            StoreErrorCode::IoError => "PK_STORE_IO_ERROR",
            StoreErrorCode::WriteFailed => "PK_STORE_WRITE_FAILED",
            StoreErrorCode::ReadFailed => "PK_STORE_READ_FAILED",
            StoreErrorCode::InvalidKey => "PK_STORE_INVALID_KEY",
            StoreErrorCode::ValueTooLarge => "PK_STORE_VALUE_TOO_LARGE",
            StoreErrorCode::NothingToCompact => "PK_STORE_NOTHING_TO_COMPACT",
            StoreErrorCode::LockPoisoned => "PK_STORE_LOCK_POISONED",
            StoreErrorCode::LogPoisoned => "PK_STORE_LOG_POISONED",
            StoreErrorCode::DataCorruption => "PK_DATA_CORRUPTION",
        }
    }

    /// Returns the severity level for this error
    pub fn severity(&self) -> Severity {
        match self {
            StoreErrorCode::NotFound => Severity::Info,
            StoreErrorCode::NothingToCompact => Severity::Info,
            StoreErrorCode::StoreClosed => Severity::Error,
            StoreErrorCode::IoError => Severity::Error,
            StoreErrorCode::WriteFailed => Severity::Error,
            StoreErrorCode::ReadFailed => Severity::Error,
            StoreErrorCode::InvalidKey => Severity::Error,
            StoreErrorCode::ValueTooLarge => Severity::Error,
            StoreErrorCode::LockPoisoned => Severity::Fatal,
            StoreErrorCode::LogPoisoned => Severity::Fatal,
            StoreErrorCode::DataCorruption => Severity::Fatal,
        }
    }
}

impl fmt::Display for StoreErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Store error with context
#[derive(Debug)]
pub struct StoreError {
    /// Error code
    code: StoreErrorCode,
    /// Human-readable message
    message: String,
    /// Optional details about the error context
    details: Option<String>,
    /// Underlying IO error if applicable
    source: Option<io::Error>,
}

impl StoreError {
    fn new(code: StoreErrorCode, message: impl Into<String>, source: Option<io::Error>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            source,
        }
    }

    /// Key absent from the given namespace
    pub fn not_found(namespace: &str, key: &[u8]) -> Self {
        Self::new(StoreErrorCode::NotFound, "key not found", None).with_details(format!(
            "namespace: {}, key: {}",
            namespace,
            String::from_utf8_lossy(key)
        ))
    }

    /// Operation attempted after `close()`
    pub fn closed() -> Self {
        Self::new(StoreErrorCode::StoreClosed, "store is closed", None)
    }

    /// Generic disk I/O failure
    pub fn io_error(message: impl Into<String>, source: io::Error) -> Self {
        Self::new(StoreErrorCode::IoError, message, Some(source))
    }

    /// Append or fsync failure
    pub fn write_failed(message: impl Into<String>, source: io::Error) -> Self {
        Self::new(StoreErrorCode::WriteFailed, message, Some(source))
    }

    /// Positional read failure
    pub fn read_failed(message: impl Into<String>, source: io::Error) -> Self {
        Self::new(StoreErrorCode::ReadFailed, message, Some(source))
    }

    /// Namespace or key rejected by the key encoder
    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::new(StoreErrorCode::InvalidKey, message, None)
    }

    /// Key plus value exceed the largest record the log can frame
    pub fn value_too_large(namespace: &str, key: &[u8], value_len: usize) -> Self {
        Self::new(StoreErrorCode::ValueTooLarge, "record too large for log", None).with_details(
            format!(
                "namespace: {}, key: {}, value_len: {}",
                namespace,
                String::from_utf8_lossy(key),
                value_len
            ),
        )
    }

    /// Discard ratio below the compaction threshold
    pub fn nothing_to_compact(discard_ratio: f64, threshold: f64) -> Self {
        Self::new(
            StoreErrorCode::NothingToCompact,
            "no log rewrite performed",
            None,
        )
        .with_details(format!(
            "discard_ratio: {:.3}, threshold: {:.3}",
            discard_ratio, threshold
        ))
    }

    /// Store lock poisoned by a panicking thread (FATAL)
    pub fn lock_poisoned(lock: &str) -> Self {
        Self::new(StoreErrorCode::LockPoisoned, format!("{} lock poisoned", lock), None)
    }

    /// Log writer refusing appends after a failed rollback (FATAL)
    pub fn log_poisoned(offset: u64) -> Self {
        Self::new(
            StoreErrorCode::LogPoisoned,
            "log end unknown after failed append rollback",
            None,
        )
        .with_details(format!("byte_offset: {}", offset))
    }

    /// Data corruption (FATAL)
    pub fn data_corruption(message: impl Into<String>) -> Self {
        Self::new(StoreErrorCode::DataCorruption, message, None)
    }

    /// Data corruption with byte offset context
    pub fn corruption_at_offset(offset: u64, reason: impl Into<String>) -> Self {
        Self::data_corruption(reason).with_details(format!("byte_offset: {}", offset))
    }

    fn with_details(mut self, details: String) -> Self {
        self.details = Some(details);
        self
    }

    /// Returns the error code
    pub fn code(&self) -> StoreErrorCode {
        self.code
    }

    /// Returns the severity level
    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    /// Returns the error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns additional error details
    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    /// Whether the key was simply absent
    pub fn is_not_found(&self) -> bool {
        self.code == StoreErrorCode::NotFound
    }

    /// Whether the store was already closed
    pub fn is_closed(&self) -> bool {
        self.code == StoreErrorCode::StoreClosed
    }

    /// Whether compaction declined to rewrite the log
    pub fn is_nothing_to_compact(&self) -> bool {
        self.code == StoreErrorCode::NothingToCompact
    }

    /// Returns whether this error means the store contents cannot be trusted
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.code.severity(),
            self.code.code(),
            self.message
        )?;
        if let Some(ref details) = self.details {
            write!(f, " ({})", details)?;
        }
        if let Some(ref source) = self.source {
            write!(f, ": {}", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_structural() {
        let err = StoreError::not_found("posts", b"post_1");
        assert!(err.is_not_found());
        assert!(!err.is_closed());
        assert_eq!(err.severity(), Severity::Info);
    }

    #[test]
    fn test_corruption_is_fatal() {
        let err = StoreError::data_corruption("checksum mismatch");
        assert!(err.is_fatal());
        assert_eq!(err.code().code(), "PK_DATA_CORRUPTION");
    }

    #[test]
    fn test_write_failed_not_fatal() {
        let err = StoreError::write_failed(
            "disk full",
            io::Error::new(io::ErrorKind::Other, "disk full"),
        );
        assert!(!err.is_fatal());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_display_contains_context() {
        let err = StoreError::corruption_at_offset(1024, "checksum mismatch");
        let display = err.to_string();
        assert!(display.contains("PK_DATA_CORRUPTION"));
        assert!(display.contains("FATAL"));
        assert!(display.contains("byte_offset: 1024"));

        let err = StoreError::not_found("posts", b"post_9");
        assert!(err.to_string().contains("namespace: posts, key: post_9"));
    }
}
