//! Prometheus metrics for projections.
//!
//! Components record through the `metrics` facade; nothing is exported
//! unless a recorder is installed. [`MetricsRecorder`] installs the Prometheus
//! recorder and describes every metric docfold emits:
//!
//! - Sequencer: runs started, rejected, queued, unmatched events, run latency
//! - Projectors: started, timed out
//! - Write coalescer: batches, batch sizes, failed and cancelled writes
//! - Runner: restarts, committed position
//!
//! # Example
//!
//! ```rust,no_run
//! use docfold_runtime::metrics::MetricsRecorder;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut recorder = MetricsRecorder::new();
//! recorder.install()?;
//!
//! if let Some(text) = recorder.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder for projection metrics.
///
/// Installs the recorder only; serving the rendered text over HTTP is left to
/// the embedding application.
#[derive(Default)]
pub struct MetricsRecorder {
    handle: Option<PrometheusHandle>,
}

impl MetricsRecorder {
    /// Create a recorder that is not installed yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Describe all metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns an error if the exporter cannot be built or installed.
    /// A recorder that is already installed is not an error.
    pub fn install(&mut self) -> Result<(), MetricsError> {
        describe_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                if message.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(message))
                }
            }
        }
    }

    /// The Prometheus handle, once installed.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus text format.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Describe every metric docfold records.
///
/// Called by [`MetricsRecorder::install`]; call it directly when installing a
/// different recorder.
pub fn describe_metrics() {
    describe_counter!(
        "projection.sequencer.runs_started",
        "Handler runs started for a document id"
    );
    describe_counter!(
        "projection.sequencer.runs_rejected",
        "Handler runs that ended with a reject"
    );
    describe_counter!(
        "projection.sequencer.queued",
        "Batches queued behind a busy document id"
    );
    describe_counter!(
        "projection.sequencer.unmatched_events",
        "Events no handler claimed"
    );
    describe_gauge!(
        "projection.sequencer.in_progress",
        "Document ids with a run in flight"
    );
    describe_histogram!(
        "projection.sequencer.run_duration_seconds",
        "Time from run start to projector answer"
    );

    describe_counter!("projection.projector.started", "Projector tasks started");
    describe_counter!(
        "projection.projector.timeouts",
        "Projector requests that hit their deadline"
    );

    describe_counter!(
        "projection.storage.batches",
        "Merged writes sent to document storage"
    );
    describe_histogram!(
        "projection.storage.batch_size",
        "Store calls folded into one merged write"
    );
    describe_counter!(
        "projection.storage.failed_batches",
        "Merged writes the backend failed"
    );
    describe_counter!(
        "projection.storage.cancelled_writes",
        "Store calls cancelled before reaching the backend"
    );

    describe_counter!(
        "projection.runner.restarts",
        "Projection restarts after a failed attempt"
    );
    describe_gauge!(
        "projection.runner.committed_position",
        "Last committed position per projection"
    );
}
