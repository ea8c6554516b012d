//! In-memory document and position storage.
//!
//! - [`InMemoryDocumentStorage`]: documents serialized to JSON, like a real
//!   backend would, so tests catch documents that do not round-trip
//! - [`InMemoryPositionStorage`]: committed positions per projection
//!
//! Both support failure injection and record what they were asked to do.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only follows a panicking test

use docfold_core::cancel::CancellationToken;
use docfold_core::error::{ProjectionError, Result};
use docfold_core::event::Position;
use docfold_core::storage::{
    DocumentStorage, DocumentToDelete, DocumentToStore, LoadedDocument, PositionStorage,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// One call to [`DocumentStorage::store`], as seen by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCall<Id> {
    /// Ids upserted by the call, in order
    pub upserted: Vec<Id>,
    /// Ids deleted by the call, in order
    pub deleted: Vec<Id>,
}

/// In-memory document storage.
///
/// # Example
///
/// ```
/// use docfold_core::cancel::CancellationToken;
/// use docfold_core::storage::{DocumentStorage, DocumentToStore};
/// use docfold_testing::InMemoryDocumentStorage;
///
/// # async fn example() -> docfold_core::Result<()> {
/// let storage = InMemoryDocumentStorage::<String, Vec<u32>>::new();
///
/// storage
///     .store(
///         vec![DocumentToStore::new("a".to_string(), vec![1, 2])],
///         Vec::new(),
///         CancellationToken::new(),
///     )
///     .await?;
///
/// assert_eq!(storage.document(&"a".to_string()), Some(vec![1, 2]));
/// assert_eq!(storage.store_calls().len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryDocumentStorage<Id, D> {
    documents: Arc<RwLock<HashMap<Id, serde_json::Value>>>,
    calls: Arc<RwLock<Vec<StoreCall<Id>>>>,
    loads: Arc<AtomicUsize>,
    failing_stores: Arc<AtomicUsize>,
    failing_loads: Arc<AtomicUsize>,
    store_delay: Arc<RwLock<Option<Duration>>>,
    _document: std::marker::PhantomData<fn() -> D>,
}

impl<Id, D> InMemoryDocumentStorage<Id, D>
where
    Id: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    D: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Create an empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            documents: Arc::new(RwLock::new(HashMap::new())),
            calls: Arc::new(RwLock::new(Vec::new())),
            loads: Arc::new(AtomicUsize::new(0)),
            failing_stores: Arc::new(AtomicUsize::new(0)),
            failing_loads: Arc::new(AtomicUsize::new(0)),
            store_delay: Arc::new(RwLock::new(None)),
            _document: std::marker::PhantomData,
        }
    }

    /// Seed a document without recording a store call.
    pub fn insert(&self, id: Id, document: &D) {
        let value = serde_json::to_value(document).unwrap();
        self.documents.write().unwrap().insert(id, value);
    }

    /// Current document for `id`.
    #[must_use]
    pub fn document(&self, id: &Id) -> Option<D> {
        self.documents
            .read()
            .unwrap()
            .get(id)
            .map(|value| serde_json::from_value(value.clone()).unwrap())
    }

    /// Number of stored documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.read().unwrap().len()
    }

    /// Whether no document is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.read().unwrap().is_empty()
    }

    /// Every store call received so far, including failed ones.
    #[must_use]
    pub fn store_calls(&self) -> Vec<StoreCall<Id>> {
        self.calls.read().unwrap().clone()
    }

    /// Number of load calls received so far.
    #[must_use]
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Fail the next `count` store calls with a storage error.
    pub fn fail_next_stores(&self, count: usize) {
        self.failing_stores.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` load calls with a storage error.
    pub fn fail_next_loads(&self, count: usize) {
        self.failing_loads.store(count, Ordering::SeqCst);
    }

    /// Delay every store call, to let concurrent writes pile up.
    pub fn set_store_delay(&self, delay: Option<Duration>) {
        *self.store_delay.write().unwrap() = delay;
    }

    fn load_now(&self, id: &Id) -> Result<LoadedDocument<D>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failing_loads) {
            return Err(ProjectionError::Storage(format!("Injected load failure for {id:?}")));
        }

        let documents = self.documents.read().unwrap();
        match documents.get(id) {
            Some(value) => {
                let document = serde_json::from_value(value.clone())
                    .map_err(|e| ProjectionError::Storage(format!("Corrupt document {id:?}: {e}")))?;
                Ok(LoadedDocument::found(document))
            }
            None => Ok(LoadedDocument::missing()),
        }
    }

    fn store_now(
        &self,
        to_upsert: Vec<DocumentToStore<Id, D>>,
        to_delete: Vec<DocumentToDelete<Id>>,
    ) -> Result<()> {
        self.calls.write().unwrap().push(StoreCall {
            upserted: to_upsert.iter().map(|item| item.id.clone()).collect(),
            deleted: to_delete.iter().map(|item| item.id.clone()).collect(),
        });

        if take_failure(&self.failing_stores) {
            tracing::debug!(upserts = to_upsert.len(), deletes = to_delete.len(), "Injecting store failure");
            return Err(ProjectionError::Storage("Injected store failure".to_string()));
        }

        let mut serialized = Vec::with_capacity(to_upsert.len());
        for item in &to_upsert {
            let value = serde_json::to_value(&item.document)
                .map_err(|e| ProjectionError::Storage(format!("Cannot serialize {:?}: {e}", item.id)))?;
            serialized.push((item.id.clone(), value));
        }

        {
            let mut documents = self.documents.write().unwrap();
            for (id, value) in serialized {
                documents.insert(id, value);
            }
            for item in &to_delete {
                documents.remove(&item.id);
            }
        }

        for item in to_upsert {
            item.ack.ack();
        }
        for item in to_delete {
            item.ack.ack();
        }
        Ok(())
    }
}

impl<Id, D> Default for InMemoryDocumentStorage<Id, D>
where
    Id: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    D: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<Id, D> DocumentStorage<Id, D> for InMemoryDocumentStorage<Id, D>
where
    Id: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    D: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn load_document<'a>(
        &'a self,
        id: &'a Id,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<LoadedDocument<D>>> + Send + 'a>> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(ProjectionError::Cancelled("Load was cancelled".to_string()));
            }
            self.load_now(id)
        })
    }

    fn store(
        &self,
        to_upsert: Vec<DocumentToStore<Id, D>>,
        to_delete: Vec<DocumentToDelete<Id>>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let delay = *self.store_delay.read().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if cancel.is_cancelled() {
                return Err(ProjectionError::Cancelled("Write was cancelled".to_string()));
            }
            self.store_now(to_upsert, to_delete)
        })
    }
}

/// In-memory position storage.
///
/// Committed positions never move backwards: storing a lower position than
/// the current one keeps the current one.
#[derive(Clone, Debug, Default)]
pub struct InMemoryPositionStorage {
    positions: Arc<RwLock<HashMap<String, Position>>>,
    history: Arc<RwLock<Vec<(String, Option<Position>)>>>,
    failing_stores: Arc<AtomicUsize>,
}

impl InMemoryPositionStorage {
    /// Create an empty position storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a committed position.
    pub fn set(&self, projection_name: &str, position: Position) {
        self.positions
            .write()
            .unwrap()
            .insert(projection_name.to_string(), position);
    }

    /// Committed position for `projection_name`.
    #[must_use]
    pub fn position(&self, projection_name: &str) -> Option<Position> {
        self.positions.read().unwrap().get(projection_name).copied()
    }

    /// Every position commit requested so far, in order.
    #[must_use]
    pub fn commits(&self) -> Vec<(String, Option<Position>)> {
        self.history.read().unwrap().clone()
    }

    /// Fail the next `count` store calls with a checkpoint error.
    pub fn fail_next_stores(&self, count: usize) {
        self.failing_stores.store(count, Ordering::SeqCst);
    }
}

impl PositionStorage for InMemoryPositionStorage {
    fn load_latest_position(
        &self,
        projection_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Position>>> + Send + '_>> {
        let position = self.position(projection_name);
        Box::pin(async move { Ok(position) })
    }

    fn store_latest_position(
        &self,
        projection_name: &str,
        position: Option<Position>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Position>>> + Send + '_>> {
        let projection_name = projection_name.to_string();
        Box::pin(async move {
            self.history
                .write()
                .unwrap()
                .push((projection_name.clone(), position));

            if take_failure(&self.failing_stores) {
                tracing::debug!(projection = %projection_name, ?position, "Injecting checkpoint failure");
                return Err(ProjectionError::Checkpoint(format!(
                    "Injected checkpoint failure for {projection_name}"
                )));
            }

            let mut positions = self.positions.write().unwrap();
            if let Some(position) = position {
                let current = positions.entry(projection_name.clone()).or_insert(position);
                *current = (*current).max(position);
            }
            Ok(positions.get(&projection_name).copied())
        })
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| remaining.checked_sub(1))
        .is_ok()
}
