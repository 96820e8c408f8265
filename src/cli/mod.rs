//! CLI module for postkeeper
//!
//! Provides command-line interface for:
//! - ingest: Run the dedup ingestion pipeline
//! - stats: Store statistics and source cursor
//! - keys: List stored keys
//! - get: Read one value
//! - compact: Run one compaction cycle

mod args;
mod commands;
mod config;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{compact, get, ingest, keys, run, run_command, stats};
pub use config::Config;
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::write_response;

use tracing_subscriber::EnvFilter;

/// Installs the stderr log subscriber. `RUST_LOG` overrides the default
/// `info` level.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
