//! Projection runner: source → sequencer → committed positions.
//!
//! The runner drives one [`Projection`] end to end:
//!
//! 1. Load the last committed position
//! 2. Read the source from there in chunks of `batch_size`
//! 3. Hand each chunk to the sequencer, in order
//! 4. Wait until every unit of the chunk finished and every group barrier
//!    covering it released
//! 5. Commit the chunk's highest position
//!
//! Up to `max_in_flight_batches` chunks are in flight at once, but positions
//! are committed strictly in stream order. A failed unit fails the attempt;
//! the runner then resets the sequencer and the projectors and starts over
//! from the last committed position, as the restart policy allows.
//!
//! # Example
//!
//! ```ignore
//! let mut running = ProjectionRunner::new(projection, documents, positions)
//!     .with_config(ProjectionConfig::default())
//!     .with_batched_storage(BatchedStorageConfig::default())
//!     .start();
//!
//! running.wait_for_completion(Duration::from_secs(5)).await?;
//! ```

use crate::coalescer::BatchedDocumentStorage;
use crate::config::{BatchedStorageConfig, ProjectionConfig};
use crate::projector::InProcessProjectors;
use crate::retry::restart_with_backoff;
use crate::sequencer::{GroupId, PositionData, ScheduledTask, Sequencer, SequencerHandle};
use docfold_core::cancel::CancellationToken;
use docfold_core::error::{ProjectionError, Result};
use docfold_core::event::{Position, ProjectedEvent, ProjectionId, highest_position};
use docfold_core::handler::{ProjectionSetup, RouteEvents};
use docfold_core::projection::Projection;
use docfold_core::projector::{KeepTrackOfProjectors, ProjectEventsResponse};
use docfold_core::storage::{DocumentStorage, PositionStorage};
use futures::{StreamExt, TryStreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Builder and entry point for running a projection.
pub struct ProjectionRunner<P: Projection> {
    projection: Arc<P>,
    document_storage: Arc<dyn DocumentStorage<P::Id, P::Document>>,
    position_storage: Arc<dyn PositionStorage>,
    batched_storage: Option<BatchedStorageConfig>,
    projectors: Option<Arc<dyn KeepTrackOfProjectors<P::Id, P::Event>>>,
    config: ProjectionConfig,
}

impl<P: Projection> ProjectionRunner<P> {
    /// Create a runner with default configuration.
    #[must_use]
    pub fn new(
        projection: P,
        document_storage: Arc<dyn DocumentStorage<P::Id, P::Document>>,
        position_storage: Arc<dyn PositionStorage>,
    ) -> Self {
        Self {
            projection: Arc::new(projection),
            document_storage,
            position_storage,
            batched_storage: None,
            projectors: None,
            config: ProjectionConfig::default(),
        }
    }

    /// Replace the configuration.
    #[must_use]
    pub fn with_config(mut self, config: ProjectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Route document writes through a [`BatchedDocumentStorage`].
    #[must_use]
    pub fn with_batched_storage(mut self, config: BatchedStorageConfig) -> Self {
        self.batched_storage = Some(config);
        self
    }

    /// Use an external projector registry instead of in-process projectors.
    #[must_use]
    pub fn with_projectors(mut self, projectors: Arc<dyn KeepTrackOfProjectors<P::Id, P::Event>>) -> Self {
        self.projectors = Some(projectors);
        self
    }

    /// Start the projection on the current tokio runtime.
    #[must_use]
    pub fn start(self) -> RunningProjection {
        let name = self.projection.name().to_string();
        let handler = Arc::new(self.projection.configure(ProjectionSetup::new()).build());

        let storage: Arc<dyn DocumentStorage<P::Id, P::Document>> = match self.batched_storage {
            Some(batching) => Arc::new(BatchedDocumentStorage::new(self.document_storage, batching)),
            None => self.document_storage,
        };

        let projectors: Arc<dyn KeepTrackOfProjectors<P::Id, P::Event>> = match self.projectors {
            Some(projectors) => projectors,
            None => Arc::new(InProcessProjectors::new(
                Arc::clone(&handler),
                storage,
                &self.config,
            )),
        };

        let router: Arc<dyn RouteEvents<P::Id, P::Event>> = handler;
        let sequencer = Sequencer::spawn(router, Arc::clone(&projectors), &self.config);

        let context = RunContext {
            name: name.clone(),
            projection: self.projection,
            positions: self.position_storage,
            sequencer,
            projectors,
            config: self.config,
        };

        let shutdown = CancellationToken::new();
        let stopped = shutdown.clone();

        let task = tokio::spawn(async move {
            let result = tokio::select! {
                result = context.supervise() => result,
                () = stopped.cancelled() => {
                    tracing::info!(projection = %context.name, "Projection stopped");
                    Ok(())
                }
            };

            context.sequencer.shutdown();
            context.projectors.reset();
            result
        });

        RunningProjection {
            name,
            task,
            outcome: None,
            shutdown,
        }
    }
}

struct RunContext<P: Projection> {
    name: String,
    projection: Arc<P>,
    positions: Arc<dyn PositionStorage>,
    sequencer: SequencerHandle<P::Id, P::Event>,
    projectors: Arc<dyn KeepTrackOfProjectors<P::Id, P::Event>>,
    config: ProjectionConfig,
}

impl<P: Projection> RunContext<P> {
    async fn supervise(&self) -> Result<()> {
        let result = match &self.config.restart {
            Some(policy) => {
                restart_with_backoff(
                    policy,
                    |attempt| self.run_once(attempt),
                    ProjectionError::is_transient,
                )
                .await
            }
            None => self.run_once(0).await,
        };

        match &result {
            Ok(()) => tracing::info!(projection = %self.name, "Projection completed"),
            Err(error) => tracing::error!(projection = %self.name, %error, "Projection failed"),
        }
        result
    }

    #[tracing::instrument(skip(self), fields(projection = %self.name))]
    async fn run_once(&self, attempt: usize) -> Result<()> {
        if attempt > 0 {
            self.sequencer.reset().await?;
            self.projectors.reset();
        }

        let start = self.positions.load_latest_position(&self.name).await?;
        tracing::info!(?start, "Starting projection");

        let batch_size = self.config.event_batching.batch_size.max(1);
        let max_in_flight = self.config.max_in_flight_batches.max(1);
        let sequencer = self.sequencer.clone();
        let positions = Arc::clone(&self.positions);
        let name = self.name.clone();

        self.projection
            .source()
            .start_from(start)
            .ready_chunks(batch_size)
            .map(|chunk| chunk.into_iter().collect::<Result<Vec<_>>>())
            .and_then(move |events| {
                let sequencer = sequencer.clone();
                async move {
                    let position = highest_position(&events);
                    let tasks = sequencer.start_projecting(events).await?;
                    Ok(wait_for_chunk(sequencer, tasks, position))
                }
            })
            .try_buffered(max_in_flight)
            .try_for_each(move |position| {
                let positions = Arc::clone(&positions);
                let name = name.clone();
                async move { commit(positions.as_ref(), &name, position).await }
            })
            .await
    }
}

async fn wait_for_chunk<Id, E>(
    sequencer: SequencerHandle<Id, E>,
    tasks: Vec<ScheduledTask>,
    position: Option<Position>,
) -> Result<Option<Position>>
where
    Id: ProjectionId,
    E: ProjectedEvent,
{
    let mut groups: Vec<GroupId> = Vec::new();
    let mut results = Vec::with_capacity(tasks.len());
    for task in tasks {
        if !groups.contains(&task.group_id) {
            groups.push(task.group_id);
        }
        results.push(task.result);
    }

    let responses = futures::future::join_all(results).await;

    let context = PositionData::new(position);
    for group in groups {
        sequencer.wait_for_group_to_finish(group, context).await?;
    }

    for response in responses {
        if let ProjectEventsResponse::Reject { error } = response {
            return Err(error);
        }
    }

    Ok(position)
}

async fn commit(positions: &dyn PositionStorage, name: &str, position: Option<Position>) -> Result<()> {
    let Some(position) = position else {
        return Ok(());
    };

    positions.store_latest_position(name, Some(position)).await?;
    tracing::debug!(projection = %name, position, "Position committed");

    #[allow(clippy::cast_precision_loss)]
    metrics::gauge!("projection.runner.committed_position", "projection" => name.to_string())
        .set(position as f64);
    Ok(())
}

/// Handle to a projection started with [`ProjectionRunner::start`].
#[derive(Debug)]
pub struct RunningProjection {
    name: String,
    task: JoinHandle<Result<()>>,
    outcome: Option<Result<()>>,
    shutdown: CancellationToken,
}

impl RunningProjection {
    /// Name of the running projection.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the projection finished (completed, failed or stopped).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.outcome.is_some() || self.task.is_finished()
    }

    /// Wait for a finite source to be fully projected.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Timeout`] if the projection is still running
    /// after `timeout`, or the error the projection failed with.
    pub async fn wait_for_completion(&mut self, timeout: Duration) -> Result<()> {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }

        let joined = tokio::time::timeout(timeout, &mut self.task)
            .await
            .map_err(|_| ProjectionError::Timeout(timeout))?;

        let outcome = joined.unwrap_or_else(|error| {
            Err(ProjectionError::Other(format!("Projection task failed: {error}")))
        });
        self.outcome = Some(outcome.clone());
        outcome
    }

    /// Stop the projection and wait for it to wind down.
    ///
    /// In-flight runs are cancelled; nothing after the last committed position
    /// is considered done.
    ///
    /// # Errors
    ///
    /// Returns the error the projection failed with before it was stopped.
    pub async fn stop(self) -> Result<()> {
        self.shutdown.cancel();

        if let Some(outcome) = self.outcome {
            return outcome;
        }

        self.task.await.unwrap_or_else(|error| {
            Err(ProjectionError::Other(format!("Projection task failed: {error}")))
        })
    }
}
