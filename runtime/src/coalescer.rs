//! Write coalescing for document storage.
//!
//! Projectors for different document ids finish at nearly the same time and
//! each wants to write one or two documents. [`BatchedDocumentStorage`] sits
//! in front of the real backend, queues those writes, and issues one backend
//! call per batch instead of one per projector.
//!
//! ```text
//!  store() ─┐                                        ┌─► backend.store()
//!  store() ─┼─► bounded queue ─► assemble batch ─► merge ─┤
//!  store() ─┘    (backpressure)   (strategy)        └─► backend.store()
//!                                                  (≤ parallelism in flight)
//! ```
//!
//! # Guarantees
//!
//! - Every `store` call resolves exactly once
//! - All calls merged into one backend write share its outcome
//! - Calls cancelled before their batch was assembled fail with
//!   [`ProjectionError::Cancelled`] and never reach the backend
//! - A full queue suspends callers instead of dropping writes

use crate::config::{BatchedStorageConfig, StorageBatchingStrategy};
use docfold_core::cancel::CancellationToken;
use docfold_core::error::{ProjectionError, Result};
use docfold_core::event::{ProjectionDocument, ProjectionId};
use docfold_core::storage::{DocumentStorage, DocumentToDelete, DocumentToStore, LoadedDocument};
use futures::StreamExt;
use futures::stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// A write waiting to be flushed, possibly merged from many callers.
struct PendingWrite<Id, D> {
    to_upsert: Vec<DocumentToStore<Id, D>>,
    to_delete: Vec<DocumentToDelete<Id>>,
    completions: Vec<oneshot::Sender<Result<()>>>,
}

impl<Id, D> PendingWrite<Id, D> {
    const fn empty() -> Self {
        Self {
            to_upsert: Vec::new(),
            to_delete: Vec::new(),
            completions: Vec::new(),
        }
    }

    fn merge_with(mut self, other: Self) -> Self {
        self.to_upsert.extend(other.to_upsert);
        self.to_delete.extend(other.to_delete);
        self.completions.extend(other.completions);
        self
    }

    fn has_documents(&self) -> bool {
        !self.to_upsert.is_empty() || !self.to_delete.is_empty()
    }

    fn resolve(self, result: &Result<()>) {
        complete_all(self.completions, result);
    }
}

fn complete_all(completions: Vec<oneshot::Sender<Result<()>>>, result: &Result<()>) {
    for completion in completions {
        let _ = completion.send(result.clone());
    }
}

struct Admission<Id, D> {
    write: PendingWrite<Id, D>,
    cancel: CancellationToken,
}

/// Decorates a [`DocumentStorage`] with batched, coalesced writes.
///
/// Loads pass straight through to the inner storage.
pub struct BatchedDocumentStorage<Id, D> {
    inner: Arc<dyn DocumentStorage<Id, D>>,
    queue: mpsc::Sender<Admission<Id, D>>,
    closed: CancellationToken,
}

impl<Id, D> BatchedDocumentStorage<Id, D>
where
    Id: ProjectionId,
    D: ProjectionDocument,
{
    /// Wrap `inner` and start the batching task on the current runtime.
    #[must_use]
    pub fn new(inner: Arc<dyn DocumentStorage<Id, D>>, config: BatchedStorageConfig) -> Self {
        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));
        let closed = CancellationToken::new();

        tokio::spawn(run_batches(
            Arc::clone(&inner),
            rx,
            config,
            closed.clone(),
        ));

        Self {
            inner,
            queue,
            closed,
        }
    }

    /// Stop accepting writes.
    ///
    /// Writes not yet assembled into a batch fail with
    /// [`ProjectionError::QueueClosed`]; batches already executing finish.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Admit a write without waiting for queue capacity.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::QueueSaturated`] if the queue is full,
    /// [`ProjectionError::QueueClosed`] if it no longer accepts writes, or the
    /// outcome of the merged backend write.
    pub async fn try_store(
        &self,
        to_upsert: Vec<DocumentToStore<Id, D>>,
        to_delete: Vec<DocumentToDelete<Id>>,
        cancel: CancellationToken,
    ) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(ProjectionError::QueueClosed);
        }

        let (admission, rx) = admit(to_upsert, to_delete, cancel);
        self.queue.try_send(admission).map_err(|error| match error {
            mpsc::error::TrySendError::Full(_) => ProjectionError::QueueSaturated,
            mpsc::error::TrySendError::Closed(_) => ProjectionError::QueueClosed,
        })?;

        rx.await.map_err(|_| ProjectionError::QueueClosed)?
    }
}

fn admit<Id, D>(
    to_upsert: Vec<DocumentToStore<Id, D>>,
    to_delete: Vec<DocumentToDelete<Id>>,
    cancel: CancellationToken,
) -> (Admission<Id, D>, oneshot::Receiver<Result<()>>) {
    let (tx, rx) = oneshot::channel();
    let admission = Admission {
        write: PendingWrite {
            to_upsert,
            to_delete,
            completions: vec![tx],
        },
        cancel,
    };
    (admission, rx)
}

impl<Id, D> DocumentStorage<Id, D> for BatchedDocumentStorage<Id, D>
where
    Id: ProjectionId,
    D: ProjectionDocument,
{
    fn load_document<'a>(
        &'a self,
        id: &'a Id,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<LoadedDocument<D>>> + Send + 'a>> {
        self.inner.load_document(id, cancel)
    }

    fn store(
        &self,
        to_upsert: Vec<DocumentToStore<Id, D>>,
        to_delete: Vec<DocumentToDelete<Id>>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.closed.is_cancelled() {
                return Err(ProjectionError::QueueClosed);
            }

            let (admission, rx) = admit(to_upsert, to_delete, cancel);
            self.queue
                .send(admission)
                .await
                .map_err(|_| ProjectionError::QueueClosed)?;

            rx.await.map_err(|_| ProjectionError::QueueClosed)?
        })
    }
}

async fn run_batches<Id, D>(
    inner: Arc<dyn DocumentStorage<Id, D>>,
    rx: mpsc::Receiver<Admission<Id, D>>,
    config: BatchedStorageConfig,
    closed: CancellationToken,
) where
    Id: ProjectionId,
    D: ProjectionDocument,
{
    let strategy = config.strategy;

    let batches = stream::unfold((rx, closed), move |(mut rx, closed)| async move {
        let batch = next_batch(&mut rx, strategy, &closed).await?;
        Some((batch, (rx, closed)))
    });

    batches
        .for_each_concurrent(config.parallelism.max(1), |batch| {
            let inner = Arc::clone(&inner);
            async move { flush(inner.as_ref(), batch).await }
        })
        .await;

    tracing::debug!("Write coalescer stopped");
}

async fn next_batch<Id, D>(
    rx: &mut mpsc::Receiver<Admission<Id, D>>,
    strategy: StorageBatchingStrategy,
    closed: &CancellationToken,
) -> Option<Vec<Admission<Id, D>>> {
    let first = tokio::select! {
        biased;
        () = closed.cancelled() => None,
        admission = rx.recv() => admission,
    }?;

    let max_items = strategy.max_items();
    let mut batch = Vec::with_capacity(max_items.min(64));
    batch.push(first);

    match strategy {
        StorageBatchingStrategy::BatchSize(_) => {
            while batch.len() < max_items {
                match rx.try_recv() {
                    Ok(admission) => batch.push(admission),
                    Err(_) => break,
                }
            }
        }
        StorageBatchingStrategy::BatchWithin { max_wait, .. } => {
            let deadline = Instant::now() + max_wait;
            while batch.len() < max_items {
                match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(admission)) => batch.push(admission),
                    Ok(None) | Err(_) => break,
                }
            }
        }
    }

    Some(batch)
}

async fn flush<Id, D>(inner: &dyn DocumentStorage<Id, D>, batch: Vec<Admission<Id, D>>)
where
    Id: ProjectionId,
    D: ProjectionDocument,
{
    let admissions = batch.len();
    let (cancelled, live): (Vec<_>, Vec<_>) = batch
        .into_iter()
        .partition(|admission| admission.cancel.is_cancelled());

    if !cancelled.is_empty() {
        tracing::debug!(cancelled = cancelled.len(), "Dropping cancelled writes");
        metrics::counter!("projection.storage.cancelled_writes").increment(cancelled.len() as u64);
        merge(cancelled).resolve(&Err(ProjectionError::Cancelled(
            "Write was cancelled".to_string(),
        )));
    }

    let write = merge(live);
    if write.completions.is_empty() {
        return;
    }
    if !write.has_documents() {
        write.resolve(&Ok(()));
        return;
    }

    let PendingWrite {
        to_upsert,
        to_delete,
        completions,
    } = write;

    tracing::debug!(
        admissions,
        upserts = to_upsert.len(),
        deletes = to_delete.len(),
        "Flushing merged write"
    );
    metrics::counter!("projection.storage.batches").increment(1);
    #[allow(clippy::cast_precision_loss)]
    metrics::histogram!("projection.storage.batch_size").record(completions.len() as f64);

    let result = inner.store(to_upsert, to_delete, CancellationToken::new()).await;
    if let Err(error) = &result {
        tracing::warn!(%error, writers = completions.len(), "Merged write failed");
        metrics::counter!("projection.storage.failed_batches").increment(1);
    }

    complete_all(completions, &result);
}

fn merge<Id, D>(admissions: Vec<Admission<Id, D>>) -> PendingWrite<Id, D> {
    admissions
        .into_iter()
        .fold(PendingWrite::empty(), |merged, admission| {
            merged.merge_with(admission.write)
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn merge_preserves_order_and_completions() {
        let (a, _rx_a) = admit(
            vec![DocumentToStore::new(1_u32, "one".to_string())],
            Vec::new(),
            CancellationToken::new(),
        );
        let (b, _rx_b) = admit(
            vec![DocumentToStore::new(2_u32, "two".to_string())],
            vec![DocumentToDelete::new(3_u32)],
            CancellationToken::new(),
        );

        let merged = merge(vec![a, b]);

        let ids: Vec<u32> = merged.to_upsert.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(merged.to_delete.len(), 1);
        assert_eq!(merged.completions.len(), 2);
        assert!(merged.has_documents());
    }

    #[tokio::test]
    async fn resolve_reaches_every_constituent() {
        let (a, rx_a) = admit::<u32, String>(Vec::new(), Vec::new(), CancellationToken::new());
        let (b, rx_b) = admit::<u32, String>(Vec::new(), Vec::new(), CancellationToken::new());

        merge(vec![a, b]).resolve(&Err(ProjectionError::Storage("down".to_string())));

        assert_eq!(rx_a.await.unwrap(), Err(ProjectionError::Storage("down".to_string())));
        assert_eq!(rx_b.await.unwrap(), Err(ProjectionError::Storage("down".to_string())));
    }

    #[tokio::test]
    async fn batch_size_takes_only_what_is_queued() {
        let (tx, mut rx) = mpsc::channel(8);
        for _ in 0..3 {
            let (admission, _) = admit::<u32, String>(Vec::new(), Vec::new(), CancellationToken::new());
            tx.send(admission).await.unwrap();
        }

        let batch = next_batch(&mut rx, StorageBatchingStrategy::BatchSize(2), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);

        let batch = next_batch(&mut rx, StorageBatchingStrategy::BatchSize(2), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn closed_queue_ends_batching() {
        let (_tx, mut rx) = mpsc::channel::<Admission<u32, String>>(8);
        let closed = CancellationToken::new();
        closed.cancel();

        assert!(
            next_batch(&mut rx, StorageBatchingStrategy::default(), &closed)
                .await
                .is_none()
        );
    }
}
