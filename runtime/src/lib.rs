//! # docfold runtime
//!
//! Execution machinery for docfold projections.
//!
//! ## Core Components
//!
//! - **Sequencer**: groups event batches by document id, runs at most one
//!   batch per id at a time and tracks group completion barriers
//! - **Write Coalescer**: merges concurrent document writes into batched
//!   backend calls under backpressure
//! - **Projectors**: one in-process task per document id that loads, folds
//!   and writes its document
//! - **Runner**: reads the source, feeds the sequencer, commits positions
//!   and restarts failed attempts
//!
//! ## Example
//!
//! ```ignore
//! use docfold_runtime::{ProjectionConfig, ProjectionRunner};
//!
//! let mut running = ProjectionRunner::new(projection, documents, positions)
//!     .with_config(ProjectionConfig::default())
//!     .start();
//!
//! running.wait_for_completion(Duration::from_secs(10)).await?;
//! ```

/// Projection and storage configuration
pub mod config;

/// Batched, coalesced document writes
pub mod coalescer;

/// Prometheus metrics for observability
pub mod metrics;

/// In-process per-document projectors
pub mod projector;

/// Restart policy with exponential backoff
pub mod retry;

/// Projection runner
pub mod runner;

/// Per-document-id sequencing with group barriers
pub mod sequencer;

pub use coalescer::BatchedDocumentStorage;
pub use config::{
    BatchedStorageConfig, EventBatchingStrategy, ProjectionConfig, StorageBatchingStrategy,
};
pub use projector::{DocumentProjector, InProcessProjectors, ProjectorHandle};
pub use retry::RestartPolicy;
pub use runner::{ProjectionRunner, RunningProjection};
pub use sequencer::{GroupId, PositionData, ScheduledTask, Sequencer, SequencerHandle, TaskId, TaskResult};
