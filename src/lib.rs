//! postkeeper - deduplicating ingestion into an embedded namespaced store
//!
//! - [`storage`]: append-only namespaced key-value store with background
//!   compaction
//! - [`pipeline`]: bounded producer/consumer pipeline that stores each
//!   record once and tracks a durable source cursor
//! - [`shutdown`]: stop signalling and drain-then-close coordination
//! - [`cli`]: the `postkeeper` command line

pub mod cli;
pub mod pipeline;
pub mod shutdown;
pub mod storage;
