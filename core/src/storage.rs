//! Storage backends for documents and positions.
//!
//! # CQRS Separation
//!
//! Document storage holds the read models; position storage remembers how far
//! through the event stream a projection got. They are usually different
//! tables (or databases) and are updated at different times: documents as
//! soon as a projector finishes a run, positions only once every run that
//! precedes the position has finished.
//!
//! # Dyn Compatibility
//!
//! These traits use explicit `Pin<Box<dyn Future>>` returns instead of
//! `impl Future` so they can be used as `Arc<dyn DocumentStorage<_, _>>`.
//! The write coalescer wraps one storage in another, and projectors receive
//! whichever storage the projection was configured with.

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::event::Position;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::oneshot;

/// Per-document acknowledgement handed to the backend.
///
/// Consumed on use, so a backend can acknowledge each document at most once.
#[derive(Debug, Default)]
pub struct WriteAck {
    tx: Option<oneshot::Sender<()>>,
}

impl WriteAck {
    /// An acknowledgement nobody listens to.
    #[must_use]
    pub const fn none() -> Self {
        Self { tx: None }
    }

    /// An acknowledgement plus the receiver that observes it.
    #[must_use]
    pub fn channel() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Acknowledge the document as written.
    pub fn ack(self) {
        if let Some(tx) = self.tx {
            let _ = tx.send(());
        }
    }
}

/// A document to insert or replace.
#[derive(Debug)]
pub struct DocumentToStore<Id, D> {
    /// Document id
    pub id: Id,
    /// New document value
    pub document: D,
    /// Fired by the backend once this document is durable
    pub ack: WriteAck,
}

impl<Id, D> DocumentToStore<Id, D> {
    /// A document to upsert without an acknowledgement listener.
    #[must_use]
    pub const fn new(id: Id, document: D) -> Self {
        Self {
            id,
            document,
            ack: WriteAck::none(),
        }
    }

    /// Attach an acknowledgement.
    #[must_use]
    pub fn with_ack(mut self, ack: WriteAck) -> Self {
        self.ack = ack;
        self
    }
}

/// A document to delete.
#[derive(Debug)]
pub struct DocumentToDelete<Id> {
    /// Document id
    pub id: Id,
    /// Fired by the backend once the deletion is durable
    pub ack: WriteAck,
}

impl<Id> DocumentToDelete<Id> {
    /// A deletion without an acknowledgement listener.
    #[must_use]
    pub const fn new(id: Id) -> Self {
        Self {
            id,
            ack: WriteAck::none(),
        }
    }

    /// Attach an acknowledgement.
    #[must_use]
    pub fn with_ack(mut self, ack: WriteAck) -> Self {
        self.ack = ack;
        self
    }
}

/// Result of loading a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedDocument<D> {
    /// The stored document, if any
    pub document: Option<D>,
    /// The caller must not cache this result and should load again next time
    pub requires_reload: bool,
}

impl<D> LoadedDocument<D> {
    /// A document that was found.
    #[must_use]
    pub const fn found(document: D) -> Self {
        Self {
            document: Some(document),
            requires_reload: false,
        }
    }

    /// No document stored under the id.
    #[must_use]
    pub const fn missing() -> Self {
        Self {
            document: None,
            requires_reload: true,
        }
    }
}

/// Storage backend for projected documents.
pub trait DocumentStorage<Id, D>: Send + Sync {
    /// Load the current document for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`](crate::error::ProjectionError::Storage)
    /// if the backend fails.
    fn load_document<'a>(
        &'a self,
        id: &'a Id,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<LoadedDocument<D>>> + Send + 'a>>;

    /// Upsert and delete documents in one call.
    ///
    /// Implementations fire each item's [`WriteAck`] once the item is durable.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`](crate::error::ProjectionError::Storage)
    /// if the write fails, or
    /// [`ProjectionError::Cancelled`](crate::error::ProjectionError::Cancelled)
    /// if `cancel` fired before the write was issued.
    fn store(
        &self,
        to_upsert: Vec<DocumentToStore<Id, D>>,
        to_delete: Vec<DocumentToDelete<Id>>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Storage for the last committed position of each projection.
///
/// # Example
///
/// ```ignore
/// let position = positions.load_latest_position("order_summary").await?;
/// let source = projection.source().start_from(position);
/// ```
pub trait PositionStorage: Send + Sync {
    /// Load the last committed position.
    ///
    /// `None` means the projection never committed and starts from the
    /// beginning of the stream.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Checkpoint`](crate::error::ProjectionError::Checkpoint)
    /// if the backend fails.
    fn load_latest_position(
        &self,
        projection_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Position>>> + Send + '_>>;

    /// Commit a position and return the position now stored.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Checkpoint`](crate::error::ProjectionError::Checkpoint)
    /// if the backend fails.
    fn store_latest_position(
        &self,
        projection_name: &str,
        position: Option<Position>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Position>>> + Send + '_>>;
}
