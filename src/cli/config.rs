//! Configuration file
//!
//! A single JSON object. Every field has a default; `source_path` is only
//! required by `ingest`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::{CliError, CliResult};
use crate::pipeline::{PipelineConfig, DEFAULT_BATCH_SIZE, DEFAULT_NAMESPACE, DEFAULT_QUEUE_CAPACITY};
use crate::shutdown::DEFAULT_DRAIN_TIMEOUT;
use crate::storage::{StoreConfig, DEFAULT_COMPACTION_INTERVAL, DEFAULT_DISCARD_RATIO};

/// Configuration file structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Store data directory
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Namespace ingested records are stored in
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Name the source cursor is stored under
    #[serde(default = "default_namespace")]
    pub source_name: String,

    /// JSONL input file
    #[serde(default)]
    pub source_path: Option<PathBuf>,

    /// Records per unit of work
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Bounded queue capacity, in units
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Consumer task count
    #[serde(default = "default_consumers")]
    pub consumers: usize,

    /// Seconds between background compaction cycles
    #[serde(default = "default_compaction_interval_secs")]
    pub compaction_interval_secs: u64,

    /// Stale share of the log that triggers a rewrite
    #[serde(default = "default_discard_ratio")]
    pub discard_ratio: f64,

    /// fsync every write
    #[serde(default = "default_sync_writes")]
    pub sync_writes: bool,

    /// Milliseconds to wait between fetches
    #[serde(default)]
    pub request_delay_ms: u64,

    /// Stop after this many units
    #[serde(default)]
    pub max_units: Option<u64>,

    /// Seconds consumers get to drain on shutdown
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data/store")
}
fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}
fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}
fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}
fn default_consumers() -> usize {
    1
}
fn default_compaction_interval_secs() -> u64 {
    DEFAULT_COMPACTION_INTERVAL.as_secs()
}
fn default_discard_ratio() -> f64 {
    DEFAULT_DISCARD_RATIO
}
fn default_sync_writes() -> bool {
    true
}
fn default_drain_timeout_secs() -> u64 {
    DEFAULT_DRAIN_TIMEOUT.as_secs()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            namespace: default_namespace(),
            source_name: default_namespace(),
            source_path: None,
            batch_size: default_batch_size(),
            queue_capacity: default_queue_capacity(),
            consumers: default_consumers(),
            compaction_interval_secs: default_compaction_interval_secs(),
            discard_ratio: default_discard_ratio(),
            sync_writes: default_sync_writes(),
            request_delay_ms: 0,
            max_units: None,
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> CliResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| CliError::config_error(format!("Failed to read config: {}", e)))?;
        Self::parse(&content)
    }

    /// Parse and validate configuration JSON
    pub fn parse(content: &str) -> CliResult<Self> {
        let config: Config = serde_json::from_str(content)
            .map_err(|e| CliError::config_error(format!("Invalid config JSON: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> CliResult<()> {
        if self.namespace.is_empty() {
            return Err(CliError::config_error("namespace must not be empty"));
        }
        if self.source_name.is_empty() {
            return Err(CliError::config_error("source_name must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(CliError::config_error("batch_size must be > 0"));
        }
        if self.queue_capacity == 0 {
            return Err(CliError::config_error("queue_capacity must be > 0"));
        }
        if self.consumers == 0 {
            return Err(CliError::config_error("consumers must be > 0"));
        }
        if self.compaction_interval_secs == 0 {
            return Err(CliError::config_error("compaction_interval_secs must be > 0"));
        }
        if !(self.discard_ratio > 0.0 && self.discard_ratio <= 1.0) {
            return Err(CliError::config_error(format!(
                "Invalid discard_ratio: {}. Must be in (0, 1].",
                self.discard_ratio
            )));
        }
        Ok(())
    }

    /// Input file, required by `ingest`
    pub fn require_source_path(&self) -> CliResult<&Path> {
        self.source_path
            .as_deref()
            .ok_or_else(|| CliError::config_error("source_path is required for ingest"))
    }

    /// Store settings
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new(&self.data_dir)
            .with_sync_writes(self.sync_writes)
            .with_compaction_interval(Duration::from_secs(self.compaction_interval_secs))
            .with_discard_ratio(self.discard_ratio)
    }

    /// Pipeline settings
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig::default()
            .with_namespace(self.namespace.clone())
            .with_queue_capacity(self.queue_capacity)
            .with_consumers(self.consumers)
            .with_request_delay(Duration::from_millis(self.request_delay_ms))
            .with_max_units(self.max_units)
    }

    /// Drain deadline for shutdown
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}
