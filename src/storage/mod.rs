//! Embedded storage for postkeeper
//!
//! A namespaced key-value store over a single append-only log.
//!
//! # Design Principles
//!
//! - Append-only (no in-place updates)
//! - Checksum-verified on every read
//! - Latest record wins for the same key; tombstones remove
//! - Torn final record truncated on open, any other damage halts
//! - Background compaction reclaims overwritten and deleted records

mod checksum;
mod compaction;
mod errors;
mod key;
mod reader;
mod record;
mod store;
mod writer;

pub use checksum::compute_checksum;
pub use compaction::CompactionReport;
pub use errors::{Severity, StoreError, StoreErrorCode, StoreResult};
pub use key::NamespaceKey;
pub use store::{
    Entries, Keys, NamespacedStore, StoreConfig, StoreStats, COMPACT_FILE,
    DEFAULT_COMPACTION_INTERVAL, DEFAULT_DISCARD_RATIO, LOG_FILE,
};
