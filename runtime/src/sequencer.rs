//! Per-document-id sequencing with group completion barriers.
//!
//! The sequencer decides *when* a batch of events may be handed to the
//! projector of its document. It never applies events itself.
//!
//! # Architecture
//!
//! All state lives in one tokio task fed by an unbounded command channel.
//! Handler runs execute on their own tasks and report back as messages, so
//! the state is never touched concurrently:
//!
//! ```text
//!  start_projecting ──┐
//!  wait_for_group ────┤      ┌───────────────────────────┐
//!  reset ─────────────┼────► │ sequencer loop            │
//!                     │      │  in_progress: id → token  │
//!  IdFinished ────────┤      │  queues:  id → FIFO       │
//!  TaskFinished ──────┘      │  groups:  group → tasks   │
//!        ▲                   └─────────────┬─────────────┘
//!        │                                 │ spawn run
//!        │                                 ▼
//!        │                   ┌───────────────────────────┐
//!        └────────────────── │ run(id, events)           │
//!                            │  get_projector → project  │
//!                            └───────────────────────────┘
//! ```
//!
//! # Per-id lifecycle
//!
//! - **Idle** → first batch arrives → run starts, id is **Busy**
//! - **Busy** → more batches arrive → queued in arrival order
//! - run finishes with `Acknowledge` → next queued batch starts, or **Idle**
//! - run finishes with `Reject` → every queued batch fails with the same
//!   error, **Idle**
//!
//! # Groups
//!
//! Each call to [`SequencerHandle::start_projecting`] splits its units into
//! waves of at most `parallelism` document ids. Every wave is a group; its
//! barrier releases once every unit in it finished, successfully or not.
//! The runner commits a position only after the barriers covering it were
//! released.

use crate::config::ProjectionConfig;
use docfold_core::cancel::CancellationToken;
use docfold_core::error::{ProjectionError, Result};
use docfold_core::event::{
    DocumentId, EventWithPosition, Position, ProjectedEvent, ProjectionId, highest_position,
};
use docfold_core::handler::RouteEvents;
use docfold_core::projector::{KeepTrackOfProjectors, ProjectEventsResponse};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Identifies a wave of units submitted together.
pub type GroupId = Uuid;

/// Identifies one unit within a group.
pub type TaskId = Uuid;

/// Context handed back when a group barrier releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PositionData {
    /// Position that may be committed once the group finished
    pub position: Option<Position>,
}

impl PositionData {
    /// Context carrying `position`.
    #[must_use]
    pub const fn new(position: Option<Position>) -> Self {
        Self { position }
    }
}

/// Resolves to the response of one scheduled unit.
///
/// Resolves to `Reject(SequencerStopped)` if the sequencer went away before
/// answering.
#[derive(Debug)]
pub struct TaskResult {
    rx: oneshot::Receiver<ProjectEventsResponse>,
}

impl Future for TaskResult {
    type Output = ProjectEventsResponse;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| {
            result.unwrap_or_else(|_| ProjectEventsResponse::reject(ProjectionError::SequencerStopped))
        })
    }
}

/// One unit of work returned by [`SequencerHandle::start_projecting`].
#[derive(Debug)]
pub struct ScheduledTask {
    /// Group (wave) the unit belongs to
    pub group_id: GroupId,
    /// Unit id within the group
    pub task_id: TaskId,
    /// Response of the unit's run
    pub result: TaskResult,
}

enum Command<Id, E> {
    StartProjecting {
        events: Vec<EventWithPosition<E>>,
        reply: oneshot::Sender<Vec<ScheduledTask>>,
    },
    IdFinished {
        id: Id,
        response: ProjectEventsResponse,
        generation: u64,
    },
    TaskFinished {
        group_id: GroupId,
        task_id: TaskId,
    },
    WaitForGroup {
        group_id: GroupId,
        context: PositionData,
        reply: oneshot::Sender<PositionData>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Resolves a unit's result and reports the unit finished to its group.
///
/// Dropping a completion without resolving it rejects the caller with
/// `SequencerStopped`; the group is told either way, so barriers always
/// release.
struct Completion<Id, E> {
    group_id: GroupId,
    task_id: TaskId,
    reply: Option<oneshot::Sender<ProjectEventsResponse>>,
    commands: mpsc::UnboundedSender<Command<Id, E>>,
}

impl<Id, E> Completion<Id, E> {
    fn complete(mut self, response: ProjectEventsResponse) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(response);
        }
    }
}

impl<Id, E> Drop for Completion<Id, E> {
    fn drop(&mut self) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(ProjectEventsResponse::reject(ProjectionError::SequencerStopped));
        }
        let _ = self.commands.send(Command::TaskFinished {
            group_id: self.group_id,
            task_id: self.task_id,
        });
    }
}

struct Group {
    outstanding: HashSet<TaskId>,
    waiters: Vec<(PositionData, oneshot::Sender<PositionData>)>,
}

type Queued<Id, E> = (Vec<EventWithPosition<E>>, Completion<Id, E>);

/// Sequencer loop state.
///
/// Created with [`Sequencer::spawn`]; callers only ever hold a
/// [`SequencerHandle`].
pub struct Sequencer<Id, E> {
    router: Arc<dyn RouteEvents<Id, E>>,
    projectors: Arc<dyn KeepTrackOfProjectors<Id, E>>,
    projection_timeout: Duration,
    parallelism: usize,
    commands: mpsc::WeakUnboundedSender<Command<Id, E>>,
    in_progress: HashMap<Id, CancellationToken>,
    queues: HashMap<Id, VecDeque<Queued<Id, E>>>,
    groups: HashMap<GroupId, Group>,
    generation: u64,
}

impl<Id, E> Sequencer<Id, E>
where
    Id: ProjectionId,
    E: ProjectedEvent,
{
    /// Start the sequencer loop on the current tokio runtime.
    #[must_use]
    pub fn spawn(
        router: Arc<dyn RouteEvents<Id, E>>,
        projectors: Arc<dyn KeepTrackOfProjectors<Id, E>>,
        config: &ProjectionConfig,
    ) -> SequencerHandle<Id, E> {
        let (tx, rx) = mpsc::unbounded_channel();

        let sequencer = Self {
            router,
            projectors,
            projection_timeout: config.projection_timeout,
            parallelism: config.event_batching.parallelism.max(1),
            commands: tx.downgrade(),
            in_progress: HashMap::new(),
            queues: HashMap::new(),
            groups: HashMap::new(),
            generation: 0,
        };

        tokio::spawn(sequencer.run_loop(rx));

        SequencerHandle { commands: tx }
    }

    async fn run_loop(mut self, mut rx: mpsc::UnboundedReceiver<Command<Id, E>>) {
        tracing::debug!("Sequencer started");

        while let Some(command) = rx.recv().await {
            match command {
                Command::StartProjecting { events, reply } => {
                    let tasks = self.start_projecting(events);
                    let _ = reply.send(tasks);
                }
                Command::IdFinished {
                    id,
                    response,
                    generation,
                } => self.id_finished(id, response, generation),
                Command::TaskFinished { group_id, task_id } => {
                    self.task_finished(group_id, task_id);
                }
                Command::WaitForGroup {
                    group_id,
                    context,
                    reply,
                } => self.wait_for_group_to_finish(group_id, context, reply),
                Command::Reset { reply } => {
                    self.reset();
                    let _ = reply.send(());
                }
                Command::Shutdown => break,
            }

            #[allow(clippy::cast_precision_loss)]
            metrics::gauge!("projection.sequencer.in_progress").set(self.in_progress.len() as f64);
        }

        self.stop();
        tracing::debug!("Sequencer stopped");
    }

    fn start_projecting(&mut self, events: Vec<EventWithPosition<E>>) -> Vec<ScheduledTask> {
        let mut units: Vec<(DocumentId<Id>, Vec<EventWithPosition<E>>)> = Vec::new();
        let mut index: HashMap<DocumentId<Id>, usize> = HashMap::new();

        for source in events {
            for event in self.router.transform(&source.event) {
                let id = self.router.document_id_from(&event);
                let item = source.with_event(event);
                if let Some(&slot) = index.get(&id) {
                    units[slot].1.push(item);
                } else {
                    index.insert(id.clone(), units.len());
                    units.push((id, vec![item]));
                }
            }
        }

        let Some(commands) = self.commands.upgrade() else {
            return Vec::new();
        };

        let mut scheduled = Vec::with_capacity(units.len());
        let mut units = units.into_iter().peekable();

        while units.peek().is_some() {
            let group_id = Uuid::new_v4();
            let mut outstanding = HashSet::new();

            for (document_id, events) in units.by_ref().take(self.parallelism) {
                let task_id = Uuid::new_v4();
                let (tx, rx) = oneshot::channel();
                outstanding.insert(task_id);

                let completion = Completion {
                    group_id,
                    task_id,
                    reply: Some(tx),
                    commands: commands.clone(),
                };
                scheduled.push(ScheduledTask {
                    group_id,
                    task_id,
                    result: TaskResult { rx },
                });

                match document_id.into_id() {
                    None => {
                        let position = highest_position(&events).unwrap_or_default();
                        tracing::debug!(position, events = events.len(), "No handler claims events");
                        metrics::counter!("projection.sequencer.unmatched_events")
                            .increment(events.len() as u64);
                        completion.complete(ProjectEventsResponse::acknowledge(position));
                    }
                    Some(id) if self.in_progress.contains_key(&id) => {
                        tracing::debug!(?id, events = events.len(), "Document busy, queueing events");
                        metrics::counter!("projection.sequencer.queued").increment(1);
                        self.queues
                            .entry(id)
                            .or_default()
                            .push_back((events, completion));
                    }
                    Some(id) => self.start_run(id, events, completion),
                }
            }

            self.groups.insert(
                group_id,
                Group {
                    outstanding,
                    waiters: Vec::new(),
                },
            );
        }

        scheduled
    }

    fn start_run(&mut self, id: Id, events: Vec<EventWithPosition<E>>, completion: Completion<Id, E>) {
        let Some(commands) = self.commands.upgrade() else {
            completion.complete(ProjectEventsResponse::reject(ProjectionError::SequencerStopped));
            return;
        };

        let cancel = CancellationToken::new();
        self.in_progress.insert(id.clone(), cancel.clone());

        let projectors = Arc::clone(&self.projectors);
        let timeout = self.projection_timeout;
        let generation = self.generation;

        tracing::debug!(?id, events = events.len(), generation, "Starting run");
        metrics::counter!("projection.sequencer.runs_started").increment(1);

        tokio::spawn(async move {
            let started = Instant::now();
            let handle = tokio::spawn(run(projectors, id.clone(), events, timeout, cancel));

            let response = match handle.await {
                Ok(response) => response,
                Err(join_error) => {
                    let reason = if join_error.is_panic() {
                        "handler run panicked"
                    } else {
                        "handler run was aborted"
                    };
                    tracing::error!(?id, error = %join_error, "Run did not complete");
                    ProjectEventsResponse::reject(ProjectionError::rejected(&id, reason))
                }
            };

            metrics::histogram!("projection.sequencer.run_duration_seconds")
                .record(started.elapsed().as_secs_f64());

            completion.complete(response.clone());
            let _ = commands.send(Command::IdFinished {
                id,
                response,
                generation,
            });
        });
    }

    fn id_finished(&mut self, id: Id, response: ProjectEventsResponse, generation: u64) {
        if generation != self.generation {
            tracing::debug!(?id, generation, current = self.generation, "Ignoring run from before reset");
            return;
        }

        match response {
            ProjectEventsResponse::Reject { error } => {
                let queued = self.queues.remove(&id).unwrap_or_default();
                tracing::warn!(?id, %error, queued = queued.len(), "Run rejected, failing queued events");
                metrics::counter!("projection.sequencer.runs_rejected").increment(1);

                for (_, completion) in queued {
                    completion.complete(ProjectEventsResponse::reject(error.clone()));
                }
                self.in_progress.remove(&id);
            }
            ProjectEventsResponse::Acknowledge { .. } => {
                let next = self.queues.get_mut(&id).and_then(VecDeque::pop_front);
                if self.queues.get(&id).is_some_and(VecDeque::is_empty) {
                    self.queues.remove(&id);
                }

                match next {
                    Some((events, completion)) => self.start_run(id, events, completion),
                    None => {
                        self.in_progress.remove(&id);
                    }
                }
            }
        }
    }

    fn task_finished(&mut self, group_id: GroupId, task_id: TaskId) {
        let Some(group) = self.groups.get_mut(&group_id) else {
            return;
        };

        group.outstanding.remove(&task_id);
        if !group.outstanding.is_empty() {
            return;
        }

        if let Some(group) = self.groups.remove(&group_id) {
            tracing::debug!(%group_id, waiters = group.waiters.len(), "Group finished");
            for (context, reply) in group.waiters {
                let _ = reply.send(context);
            }
        }
    }

    fn wait_for_group_to_finish(
        &mut self,
        group_id: GroupId,
        context: PositionData,
        reply: oneshot::Sender<PositionData>,
    ) {
        match self.groups.get_mut(&group_id) {
            Some(group) => group.waiters.push((context, reply)),
            None => {
                let _ = reply.send(context);
            }
        }
    }

    fn reset(&mut self) {
        self.generation += 1;

        for cancel in self.in_progress.values() {
            cancel.cancel();
        }
        let cancelled = self.in_progress.len();
        self.in_progress.clear();

        let mut discarded = 0;
        for (_, queue) in self.queues.drain() {
            for (_, completion) in queue {
                discarded += 1;
                completion.complete(ProjectEventsResponse::reject(ProjectionError::Cancelled(
                    "Projection sequencer was reset".to_string(),
                )));
            }
        }

        tracing::info!(
            generation = self.generation,
            cancelled,
            discarded,
            "Sequencer reset"
        );
    }

    fn stop(&mut self) {
        for cancel in self.in_progress.values() {
            cancel.cancel();
        }
        self.in_progress.clear();

        for (_, queue) in self.queues.drain() {
            for (_, completion) in queue {
                completion.complete(ProjectEventsResponse::reject(ProjectionError::SequencerStopped));
            }
        }
        self.groups.clear();
    }
}

async fn run<Id, E>(
    projectors: Arc<dyn KeepTrackOfProjectors<Id, E>>,
    id: Id,
    events: Vec<EventWithPosition<E>>,
    timeout: Duration,
    cancel: CancellationToken,
) -> ProjectEventsResponse
where
    Id: ProjectionId,
    E: ProjectedEvent,
{
    let Some(last_position) = highest_position(&events) else {
        return ProjectEventsResponse::reject(ProjectionError::EventProcessing(
            "Cannot project an empty batch".to_string(),
        ));
    };

    let projected = async {
        let projector = match projectors.get_projector(&id).await {
            Ok(projector) => projector,
            Err(error) => {
                tracing::warn!(?id, %error, "No projector available");
                return ProjectEventsResponse::reject(error);
            }
        };
        projector.project_events(events, timeout, cancel.clone()).await
    };

    // The deadline covers the lookup too and does not rely on the proxy honouring it.
    let Ok(response) = tokio::time::timeout(timeout, projected).await else {
        cancel.cancel();
        tracing::warn!(?id, ?timeout, "Handler run timed out");
        return ProjectEventsResponse::reject(ProjectionError::Timeout(timeout));
    };

    match response {
        ProjectEventsResponse::Acknowledge { .. } => ProjectEventsResponse::acknowledge(last_position),
        reject @ ProjectEventsResponse::Reject { .. } => reject,
    }
}

/// Cloneable handle to a running sequencer.
pub struct SequencerHandle<Id, E> {
    commands: mpsc::UnboundedSender<Command<Id, E>>,
}

impl<Id, E> Clone for SequencerHandle<Id, E> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
        }
    }
}

impl<Id, E> std::fmt::Debug for SequencerHandle<Id, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequencerHandle")
            .field("running", &!self.commands.is_closed())
            .finish()
    }
}

impl<Id, E> SequencerHandle<Id, E>
where
    Id: ProjectionId,
    E: ProjectedEvent,
{
    /// Group `events` by document id and schedule them.
    ///
    /// Returns one [`ScheduledTask`] per (wave, document id) unit, in the
    /// order the units were first seen. Futures resolve as runs finish; the
    /// call itself does not wait for any run.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::SequencerStopped`] if the loop is gone.
    #[tracing::instrument(skip(self, events), fields(events = events.len()), name = "sequencer_start_projecting")]
    pub async fn start_projecting(&self, events: Vec<EventWithPosition<E>>) -> Result<Vec<ScheduledTask>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::StartProjecting { events, reply })?;
        rx.await.map_err(|_| ProjectionError::SequencerStopped)
    }

    /// Wait until every unit of `group_id` finished, then return `context`.
    ///
    /// Returns immediately for unknown or already finished groups.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::SequencerStopped`] if the loop is gone.
    pub async fn wait_for_group_to_finish(
        &self,
        group_id: GroupId,
        context: PositionData,
    ) -> Result<PositionData> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::WaitForGroup {
            group_id,
            context,
            reply,
        })?;
        rx.await.map_err(|_| ProjectionError::SequencerStopped)
    }

    /// Forget in-progress ids and discard queued batches.
    ///
    /// Queued callers receive a `Cancelled` reject. Runs already started keep
    /// going, but their completion no longer frees or advances their id.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::SequencerStopped`] if the loop is gone.
    pub async fn reset(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Reset { reply })?;
        rx.await.map_err(|_| ProjectionError::SequencerStopped)
    }

    /// Stop the loop. Pending callers observe `SequencerStopped`.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    /// Whether the loop still accepts commands.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    fn send(&self, command: Command<Id, E>) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| ProjectionError::SequencerStopped)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    fn completion(
        commands: &mpsc::UnboundedSender<Command<u32, u32>>,
    ) -> (Completion<u32, u32>, TaskResult) {
        let (tx, rx) = oneshot::channel();
        let completion = Completion {
            group_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            reply: Some(tx),
            commands: commands.clone(),
        };
        (completion, TaskResult { rx })
    }

    #[test]
    fn task_result_waits_for_completion() {
        let (commands, mut rx) = mpsc::unbounded_channel();
        let (completion, result) = completion(&commands);
        let mut result = task::spawn(result);

        assert_pending!(result.poll());

        completion.complete(ProjectEventsResponse::acknowledge(3));
        assert!(result.is_woken());
        assert_ready_eq!(result.poll(), ProjectEventsResponse::acknowledge(3));
        assert!(matches!(rx.try_recv().unwrap(), Command::TaskFinished { .. }));
    }

    #[test]
    fn dropped_completion_rejects_and_still_finishes_task() {
        let (commands, mut rx) = mpsc::unbounded_channel();
        let (completion, result) = completion(&commands);
        let mut result = task::spawn(result);

        drop(completion);

        assert_ready_eq!(
            result.poll(),
            ProjectEventsResponse::reject(ProjectionError::SequencerStopped)
        );
        assert!(matches!(rx.try_recv().unwrap(), Command::TaskFinished { .. }));
    }
}
