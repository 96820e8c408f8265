//! CLI command implementations
//!
//! Each command loads the config, opens the store, does one thing, closes
//! the store and prints one JSON response.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

use super::args::Command;
use super::config::Config;
use super::errors::{CliError, CliResult};
use super::io::write_response;
use crate::pipeline::{CursorStore, DedupIngestionPipeline, JsonlSource, PipelineReport};
use crate::shutdown::{shutdown_signal, DrainOutcome, ShutdownCoordinator, ShutdownHandle};
use crate::storage::{NamespaceKey, NamespacedStore, StoreStats};

/// Parse arguments and run the command. Errors are returned for `main` to
/// report.
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Ingest { config } => ingest(&config),
        Command::Stats { config } => stats(&config),
        Command::Keys {
            config,
            namespace,
            prefix,
        } => keys(&config, namespace.as_deref(), prefix.as_deref()),
        Command::Get {
            config,
            namespace,
            key,
        } => get(&config, &namespace, &key),
        Command::Compact { config } => compact(&config),
    }
}

fn open_store(config: &Config) -> CliResult<Arc<NamespacedStore>> {
    Ok(Arc::new(NamespacedStore::open(config.store_config())?))
}

/// Runs `f` against the store, then closes it whether or not `f` failed.
fn with_store<T>(
    config: &Config,
    f: impl FnOnce(&Arc<NamespacedStore>) -> CliResult<T>,
) -> CliResult<T> {
    let store = open_store(config)?;
    let result = f(&store);
    let closed = store.close();
    let value = result?;
    closed?;
    Ok(value)
}

#[derive(Debug, Serialize)]
struct IngestSummary {
    drain: DrainOutcome,
    report: PipelineReport,
}

/// Ingest the configured JSONL source
///
/// Runs until the source is exhausted, `max_units` is reached, or SIGINT /
/// SIGTERM arrives, then drains through the shutdown coordinator.
pub fn ingest(config_path: &Path) -> CliResult<()> {
    let config = Config::load(config_path)?;
    let source_path = config.require_source_path()?.to_path_buf();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::io_error(format!("Failed to start runtime: {}", e)))?;

    let store = open_store(&config)?;
    let source = JsonlSource::new(config.source_name.clone(), source_path)
        .with_batch_size(config.batch_size);
    let pipeline =
        DedupIngestionPipeline::new(Arc::clone(&store), source, config.pipeline_config());
    let handle = ShutdownHandle::new();

    let outcome = runtime.block_on(async {
        let running = match pipeline.start(handle.clone()).await {
            Ok(running) => running,
            Err(e) => {
                let _ = store.close();
                return Err(CliError::from(e));
            }
        };

        let signals = handle.clone();
        let watcher = tokio::spawn(async move {
            let signal = shutdown_signal().await;
            info!(%signal, "stop signal received");
            signals.request_shutdown();
        });

        let outcome = ShutdownCoordinator::new(Arc::clone(&store), handle)
            .with_drain_timeout(config.drain_timeout())
            .run(running)
            .await;
        watcher.abort();
        Ok(outcome)
    })?;

    outcome.close?;
    let report = match outcome.pipeline {
        Some(result) => result?,
        None => {
            return Err(CliError::shutdown_forced(format!(
                "Drain did not finish within {}s; remaining tasks aborted",
                config.drain_timeout_secs
            )))
        }
    };

    write_response(&IngestSummary {
        drain: outcome.drain,
        report,
    })
}

#[derive(Debug, Serialize)]
struct StatsSummary {
    store: StoreStats,
    source_name: String,
    cursor: u64,
}

/// Print store statistics and the source cursor
pub fn stats(config_path: &Path) -> CliResult<()> {
    let config = Config::load(config_path)?;
    let summary = with_store(&config, |store| {
        let cursor = CursorStore::new(Arc::clone(store), config.source_name.clone()).load()?;
        Ok(StatsSummary {
            store: store.stats()?,
            source_name: config.source_name.clone(),
            cursor: cursor.value(),
        })
    })?;

    write_response(&summary)
}

/// List keys, optionally scoped to a namespace and key prefix
pub fn keys(config_path: &Path, namespace: Option<&str>, prefix: Option<&str>) -> CliResult<()> {
    let config = Config::load(config_path)?;
    let prefix = prefix.unwrap_or_default().as_bytes();

    let listed = with_store(&config, |store| {
        let keys: Vec<NamespaceKey> = match namespace {
            Some(ns) => store
                .search_prefix(&NamespaceKey::new(ns, prefix).encode()?)?
                .collect(),
            None => store
                .iterate_keys(None)?
                .filter(|k| k.key.starts_with(prefix))
                .collect(),
        };
        Ok(keys
            .iter()
            .map(|k| json!({"namespace": k.namespace, "key": k.key_lossy()}))
            .collect::<Vec<_>>())
    })?;

    write_response(&json!({"count": listed.len(), "keys": listed}))
}

/// Print one value; JSON values are embedded, anything else as a string
pub fn get(config_path: &Path, namespace: &str, key: &str) -> CliResult<()> {
    let config = Config::load(config_path)?;
    let raw = with_store(&config, |store| Ok(store.get(namespace, key.as_bytes())?))?;

    let value = serde_json::from_slice::<Value>(&raw)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&raw).into_owned()));
    write_response(&json!({"namespace": namespace, "key": key, "value": value}))
}

/// Run one compaction cycle
pub fn compact(config_path: &Path) -> CliResult<()> {
    let config = Config::load(config_path)?;
    let response = with_store(&config, |store| match store.run_compaction() {
        Ok(report) => Ok(json!({"compacted": true, "report": report})),
        Err(e) if e.is_nothing_to_compact() => Ok(json!({
            "compacted": false,
            "reason": e.details().unwrap_or_else(|| e.message()),
        })),
        Err(e) => Err(e.into()),
    })?;

    write_response(&response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::CliErrorCode;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_failed_command_returns_error_without_output() {
        let dir = TempDir::new().unwrap();
        let err = run_command(Command::Stats {
            config: dir.path().join("absent.json"),
        })
        .unwrap_err();

        assert_eq!(err.code(), &CliErrorCode::ConfigError);
        assert!(err.to_string().starts_with("PK_CLI_CONFIG_ERROR: "));
    }

    #[test]
    fn test_get_missing_key_is_store_error() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("postkeeper.json");
        let data_dir = dir.path().join("data");
        fs::write(
            &config_path,
            serde_json::to_string(&json!({ "data_dir": data_dir })).unwrap(),
        )
        .unwrap();

        let err = get(&config_path, "posts", "post_absent").unwrap_err();
        assert_eq!(err.code(), &CliErrorCode::StoreError);
        assert!(err.message().contains("key not found"));
    }
}
