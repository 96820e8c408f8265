//! Graceful shutdown
//!
//! - [`ShutdownHandle`] is the cooperative stop flag shared by the pipeline
//!   tasks. `request_shutdown` is synchronous and never fails.
//! - [`shutdown_signal`] resolves on SIGINT, or SIGTERM on Unix.
//! - [`ShutdownCoordinator`] drains the pipeline within a deadline and
//!   always closes the store afterwards.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::pipeline::{PipelineError, PipelineReport, RunningPipeline};
use crate::storage::{NamespacedStore, StoreError};

/// Default time allowed for consumers to drain the queue
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shutdown signal type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ShutdownSignal {
    /// Received SIGINT (Ctrl+C)
    SigInt,
    /// Received SIGTERM
    SigTerm,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SigInt => write!(f, "SIGINT (Ctrl+C)"),
            Self::SigTerm => write!(f, "SIGTERM"),
        }
    }
}

/// Handle for requesting and observing shutdown.
#[derive(Clone)]
pub struct ShutdownHandle {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl ShutdownHandle {
    /// Create a new shutdown handle
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Requests shutdown. Idempotent and safe to call from any thread.
    pub fn request_shutdown(&self) {
        self.sender.send_replace(true);
    }

    /// Whether shutdown has been requested
    pub fn is_shutdown_requested(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Waits until shutdown is requested.
    pub async fn wait(&mut self) {
        loop {
            if *self.receiver.borrow_and_update() {
                return;
            }
            // The sender lives as long as any handle, including this one.
            if self.receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Completes when the process receives SIGINT or SIGTERM.
///
/// If a handler cannot be installed the failure is logged and that signal
/// is never reported.
pub async fn shutdown_signal() -> ShutdownSignal {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        ShutdownSignal::SigInt
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
        ShutdownSignal::SigTerm
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<ShutdownSignal>();

    tokio::select! {
        signal = ctrl_c => signal,
        signal = terminate => signal,
    }
}

/// How the pipeline ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainOutcome {
    /// Every task finished on its own
    Clean,
    /// Tasks still running at the deadline were aborted
    Forced,
}

/// Result of a coordinated shutdown.
#[derive(Debug)]
pub struct ShutdownOutcome {
    /// Whether the drain completed or was cut off
    pub drain: DrainOutcome,
    /// Pipeline result; `None` when the drain was forced
    pub pipeline: Option<Result<PipelineReport, PipelineError>>,
    /// Result of closing the store
    pub close: Result<(), StoreError>,
}

impl ShutdownOutcome {
    /// Whether the pipeline drained and the store closed without error.
    pub fn is_clean(&self) -> bool {
        self.drain == DrainOutcome::Clean
            && matches!(self.pipeline, Some(Ok(_)))
            && self.close.is_ok()
    }
}

/// Stops the pipeline, waits for in-flight units, then releases the store.
pub struct ShutdownCoordinator {
    store: Arc<NamespacedStore>,
    handle: ShutdownHandle,
    drain_timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a coordinator over the store and the pipeline's shutdown handle
    pub fn new(store: Arc<NamespacedStore>, handle: ShutdownHandle) -> Self {
        Self {
            store,
            handle,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Sets how long consumers get to drain the queue.
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Runs until the pipeline finishes or shutdown is requested, then
    /// drains and closes the store.
    pub async fn run(self, mut pipeline: RunningPipeline) -> ShutdownOutcome {
        let mut stop = self.handle.clone();
        let finished = tokio::select! {
            result = pipeline.wait() => Some(result),
            _ = stop.wait() => None,
        };

        match finished {
            Some(result) => self.finish(DrainOutcome::Clean, Some(result)).await,
            None => {
                info!("shutdown requested, draining pipeline");
                self.shutdown(pipeline).await
            }
        }
    }

    /// Requests shutdown, waits for the pipeline up to the drain timeout,
    /// then closes the store.
    pub async fn shutdown(self, mut pipeline: RunningPipeline) -> ShutdownOutcome {
        self.handle.request_shutdown();

        match tokio::time::timeout(self.drain_timeout, pipeline.wait()).await {
            Ok(result) => self.finish(DrainOutcome::Clean, Some(result)).await,
            Err(_) => {
                warn!(
                    timeout_secs = self.drain_timeout.as_secs_f64(),
                    "drain timed out, aborting pipeline tasks"
                );
                pipeline.abort();
                self.finish(DrainOutcome::Forced, None).await
            }
        }
    }

    async fn finish(
        self,
        drain: DrainOutcome,
        pipeline: Option<Result<PipelineReport, PipelineError>>,
    ) -> ShutdownOutcome {
        // Close joins the compaction thread and fsyncs. Aborted consumers may
        // still be inside a blocking store call; close serializes behind it
        // on the engine lock.
        let store = Arc::clone(&self.store);
        let close = tokio::task::spawn_blocking(move || store.close())
            .await
            .unwrap_or_else(|e| {
                Err(StoreError::io_error(
                    "store close task failed",
                    io::Error::new(io::ErrorKind::Other, e.to_string()),
                ))
            });
        match &close {
            Ok(()) => info!(drain = ?drain, "shutdown complete"),
            Err(e) => error!(error = %e, "store close failed during shutdown"),
        }
        ShutdownOutcome {
            drain,
            pipeline,
            close,
        }
    }
}
