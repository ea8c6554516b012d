//! In-process projectors: one task per document id.
//!
//! Each [`DocumentProjector`] task owns the cached document for its id and
//! processes `project_events` requests one at a time from an mpsc mailbox.
//! Callers talk to it through a [`ProjectorHandle`], which wraps every
//! request in a deadline and turns every failure into a
//! [`ProjectEventsResponse::Reject`].
//!
//! # Document caching
//!
//! - The document is loaded on the first request
//! - It stays cached after every successful write
//! - A failed run drops the cache, so the next run reloads from storage
//! - A load that reports `requires_reload` is not cached
//!
//! # Writes
//!
//! | fold result            | stored before | write      |
//! |------------------------|---------------|------------|
//! | no handler ran         | any           | none       |
//! | `Some(document)`       | any           | upsert     |
//! | `None`                 | yes           | delete     |
//! | `None`                 | no            | none       |

use crate::config::ProjectionConfig;
use docfold_core::cancel::CancellationToken;
use docfold_core::error::{ProjectionError, Result};
use docfold_core::event::{
    EventWithPosition, ProjectedEvent, ProjectionDocument, ProjectionId, highest_position,
};
use docfold_core::handler::EventHandler;
use docfold_core::projector::{KeepTrackOfProjectors, ProjectEventsResponse, ProjectorProxy};
use docfold_core::storage::{DocumentStorage, DocumentToDelete, DocumentToStore};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const MAILBOX_CAPACITY: usize = 16;

enum ProjectorMessage<E> {
    Project {
        events: Vec<EventWithPosition<E>>,
        cancel: CancellationToken,
        reply: oneshot::Sender<ProjectEventsResponse>,
    },
    Stop,
}

/// Projector task state for one document id.
pub struct DocumentProjector<Id, D, E> {
    id: Id,
    handler: Arc<EventHandler<Id, D, E>>,
    storage: Arc<dyn DocumentStorage<Id, D>>,
    document: Option<D>,
    loaded: bool,
}

impl<Id, D, E> DocumentProjector<Id, D, E>
where
    Id: ProjectionId,
    D: ProjectionDocument,
    E: ProjectedEvent,
{
    /// Create a projector for `id`. Nothing is loaded until the first request.
    #[must_use]
    pub const fn new(
        id: Id,
        handler: Arc<EventHandler<Id, D, E>>,
        storage: Arc<dyn DocumentStorage<Id, D>>,
    ) -> Self {
        Self {
            id,
            handler,
            storage,
            document: None,
            loaded: false,
        }
    }

    /// Fold `events` into the document and write the result.
    ///
    /// Acknowledges with the highest position in `events`.
    pub async fn project(
        &mut self,
        events: Vec<EventWithPosition<E>>,
        cancel: &CancellationToken,
    ) -> ProjectEventsResponse {
        let Some(position) = highest_position(&events) else {
            return ProjectEventsResponse::reject(ProjectionError::EventProcessing(
                "Cannot project an empty batch".to_string(),
            ));
        };

        match self.apply(events, cancel).await {
            Ok(()) => ProjectEventsResponse::acknowledge(position),
            Err(error) => {
                self.document = None;
                self.loaded = false;

                tracing::warn!(id = ?self.id, %error, position, "Projection run failed");
                let error = match error {
                    ProjectionError::Storage(_)
                    | ProjectionError::Cancelled(_)
                    | ProjectionError::HandlerRejected { .. } => error,
                    other => ProjectionError::rejected(&self.id, other.to_string()),
                };
                ProjectEventsResponse::reject(error)
            }
        }
    }

    async fn apply(&mut self, events: Vec<EventWithPosition<E>>, cancel: &CancellationToken) -> Result<()> {
        if !self.loaded {
            let loaded = self.storage.load_document(&self.id, cancel).await?;
            self.document = loaded.document;
            self.loaded = !loaded.requires_reload;
        }

        let stored_before = self.document.is_some();
        let mut document = self.document.clone();
        let mut handled = false;

        for event in &events {
            if cancel.is_cancelled() {
                return Err(ProjectionError::Cancelled("Projection was cancelled".to_string()));
            }

            let (next, ran) = self
                .handler
                .handle(document, &event.event, event.position, cancel)
                .await?;
            document = next;
            handled |= ran;
        }

        if !handled {
            return Ok(());
        }

        match &document {
            Some(current) => {
                self.storage
                    .store(
                        vec![DocumentToStore::new(self.id.clone(), current.clone())],
                        Vec::new(),
                        cancel.clone(),
                    )
                    .await?;
            }
            None if stored_before => {
                self.storage
                    .store(Vec::new(), vec![DocumentToDelete::new(self.id.clone())], cancel.clone())
                    .await?;
            }
            None => {}
        }

        tracing::debug!(id = ?self.id, events = events.len(), deleted = document.is_none(), "Document written");
        self.document = document;
        self.loaded = true;
        Ok(())
    }

    async fn run(mut self, mut rx: mpsc::Receiver<ProjectorMessage<E>>, idle_timeout: Option<Duration>) {
        loop {
            let message = match idle_timeout {
                Some(idle) => {
                    let received = tokio::time::timeout(idle, rx.recv()).await;
                    if let Ok(message) = received {
                        message
                    } else {
                        tracing::debug!(id = ?self.id, "Projector idle, shutting down");
                        self.drain(&mut rx).await;
                        break;
                    }
                }
                None => rx.recv().await,
            };

            match message {
                Some(message) => {
                    if !self.serve(message).await {
                        break;
                    }
                }
                None => break,
            }
        }
    }

    /// Close the mailbox and serve requests that were accepted before it closed.
    async fn drain(&mut self, rx: &mut mpsc::Receiver<ProjectorMessage<E>>) {
        rx.close();
        while let Ok(message) = rx.try_recv() {
            if !self.serve(message).await {
                break;
            }
        }
    }

    async fn serve(&mut self, message: ProjectorMessage<E>) -> bool {
        match message {
            ProjectorMessage::Project {
                events,
                cancel,
                reply,
            } => {
                let response = self.project(events, &cancel).await;
                let _ = reply.send(response);
                true
            }
            ProjectorMessage::Stop => false,
        }
    }
}

type SpawnProjector<E> = Arc<dyn Fn() -> mpsc::Sender<ProjectorMessage<E>> + Send + Sync>;

fn spawn_projector<Id, D, E>(
    id: Id,
    handler: Arc<EventHandler<Id, D, E>>,
    storage: Arc<dyn DocumentStorage<Id, D>>,
    idle_timeout: Option<Duration>,
) -> mpsc::Sender<ProjectorMessage<E>>
where
    Id: ProjectionId,
    D: ProjectionDocument,
    E: ProjectedEvent,
{
    let (mailbox, rx) = mpsc::channel(MAILBOX_CAPACITY);
    tracing::debug!(?id, "Projector started");
    metrics::counter!("projection.projector.started").increment(1);

    let projector = DocumentProjector::new(id, handler, storage);
    tokio::spawn(projector.run(rx, idle_timeout));
    mailbox
}

/// Request/response proxy for a [`DocumentProjector`] task.
///
/// A task that exited after its idle timeout is started again by the next
/// request. After [`KeepTrackOfProjectors::reset`] the handle stays stopped.
pub struct ProjectorHandle<Id, E> {
    id: Id,
    mailbox: Mutex<mpsc::Sender<ProjectorMessage<E>>>,
    spawn: SpawnProjector<E>,
    stopped: AtomicBool,
    in_progress: Mutex<HashMap<u64, CancellationToken>>,
    next_request: AtomicU64,
}

impl<Id, E> ProjectorHandle<Id, E>
where
    Id: ProjectionId,
    E: ProjectedEvent,
{
    fn new(id: Id, spawn: SpawnProjector<E>) -> Self {
        let mailbox = spawn();
        Self {
            id,
            mailbox: Mutex::new(mailbox),
            spawn,
            stopped: AtomicBool::new(false),
            in_progress: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(0),
        }
    }

    /// Whether the projector task is not running.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
            || self
                .mailbox
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_closed()
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_all_in_progress();
        let _ = self
            .mailbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_send(ProjectorMessage::Stop);
    }

    /// The current mailbox, restarting the task if it went idle.
    fn mailbox(&self) -> Option<mpsc::Sender<ProjectorMessage<E>>> {
        if self.stopped.load(Ordering::SeqCst) {
            return None;
        }

        let mut mailbox = self.mailbox.lock().unwrap_or_else(PoisonError::into_inner);
        if mailbox.is_closed() {
            *mailbox = (self.spawn)();
        }
        Some(mailbox.clone())
    }

    async fn request(
        &self,
        events: Vec<EventWithPosition<E>>,
        cancel: CancellationToken,
    ) -> ProjectEventsResponse {
        let (reply, rx) = oneshot::channel();
        let mut message = ProjectorMessage::Project {
            events,
            cancel,
            reply,
        };

        // A closed mailbox here means the task idled out after we picked it up.
        let mut sent = false;
        for _ in 0..2 {
            let Some(mailbox) = self.mailbox() else {
                break;
            };
            match mailbox.send(message).await {
                Ok(()) => {
                    sent = true;
                    break;
                }
                Err(mpsc::error::SendError(returned)) => message = returned,
            }
        }

        if !sent {
            return ProjectEventsResponse::reject(ProjectionError::rejected(&self.id, "projector stopped"));
        }

        rx.await.unwrap_or_else(|_| {
            ProjectEventsResponse::reject(ProjectionError::rejected(
                &self.id,
                "projector stopped before answering",
            ))
        })
    }
}

impl<Id, E> ProjectorProxy<E> for ProjectorHandle<Id, E>
where
    Id: ProjectionId,
    E: ProjectedEvent,
{
    fn project_events(
        &self,
        events: Vec<EventWithPosition<E>>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, ProjectEventsResponse> {
        Box::pin(async move {
            let key = self.next_request.fetch_add(1, Ordering::Relaxed);
            self.in_progress
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(key, cancel.clone());

            let response =
                if let Ok(response) = tokio::time::timeout(timeout, self.request(events, cancel.clone())).await {
                    response
                } else {
                    cancel.cancel();
                    tracing::warn!(id = ?self.id, ?timeout, "Projector did not answer in time");
                    metrics::counter!("projection.projector.timeouts").increment(1);
                    ProjectEventsResponse::reject(ProjectionError::Timeout(timeout))
                };

            self.in_progress
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);

            response
        })
    }

    fn stop_all_in_progress(&self) {
        let tokens: Vec<CancellationToken> = self
            .in_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, token)| token)
            .collect();

        for token in tokens {
            token.cancel();
        }
    }
}

/// Registry that runs one [`DocumentProjector`] task per document id.
///
/// Projectors are started on first use. With an idle timeout configured,
/// quiet projectors exit and are started again on the next request.
pub struct InProcessProjectors<Id, D, E> {
    handler: Arc<EventHandler<Id, D, E>>,
    storage: Arc<dyn DocumentStorage<Id, D>>,
    idle_timeout: Option<Duration>,
    projectors: Mutex<HashMap<Id, Arc<ProjectorHandle<Id, E>>>>,
}

impl<Id, D, E> InProcessProjectors<Id, D, E>
where
    Id: ProjectionId,
    D: ProjectionDocument,
    E: ProjectedEvent,
{
    /// Create an empty registry.
    #[must_use]
    pub fn new(
        handler: Arc<EventHandler<Id, D, E>>,
        storage: Arc<dyn DocumentStorage<Id, D>>,
        config: &ProjectionConfig,
    ) -> Self {
        Self {
            handler,
            storage,
            idle_timeout: config.projector_idle_timeout,
            projectors: Mutex::new(HashMap::new()),
        }
    }

    /// Number of projectors currently registered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.projectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no projector is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn projector_for(&self, id: &Id) -> Arc<ProjectorHandle<Id, E>> {
        let mut projectors = self.projectors.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = projectors.get(id) {
            return Arc::clone(existing);
        }

        let spawn: SpawnProjector<E> = {
            let id = id.clone();
            let handler = Arc::clone(&self.handler);
            let storage = Arc::clone(&self.storage);
            let idle_timeout = self.idle_timeout;
            Arc::new(move || spawn_projector(id.clone(), Arc::clone(&handler), Arc::clone(&storage), idle_timeout))
        };

        let handle = Arc::new(ProjectorHandle::new(id.clone(), spawn));
        projectors.insert(id.clone(), Arc::clone(&handle));
        handle
    }
}

impl<Id, D, E> KeepTrackOfProjectors<Id, E> for InProcessProjectors<Id, D, E>
where
    Id: ProjectionId,
    D: ProjectionDocument,
    E: ProjectedEvent,
{
    fn get_projector<'a>(&'a self, id: &'a Id) -> BoxFuture<'a, Result<Arc<dyn ProjectorProxy<E>>>> {
        let projector: Arc<dyn ProjectorProxy<E>> = self.projector_for(id);
        Box::pin(std::future::ready(Ok(projector)))
    }

    fn reset(&self) {
        let projectors: Vec<_> = self
            .projectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();

        tracing::debug!(count = projectors.len(), "Stopping all projectors");
        for (_, projector) in projectors {
            projector.stop();
        }
    }
}
