//! Error types shared by every docfold component.
//!
//! A single [`ProjectionError`] travels through the sequencer, the projectors
//! and the write coalescer. It is `Clone` because one rejected run fans out to
//! every caller queued behind the same document id, and one failed merged write
//! fails every admission that was folded into it.

use std::time::Duration;
use thiserror::Error;

/// Error type for projection operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProjectionError {
    /// Document storage backend failed.
    ///
    /// Treated as transient: the surrounding runner restarts from the last
    /// committed position.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A handler run for one document id failed.
    #[error("Handler rejected events for document {id}: {reason}")]
    HandlerRejected {
        /// Display form of the document id
        id: String,
        /// Why the run failed
        reason: String,
    },

    /// Event processing error outside a specific handler (empty batches,
    /// malformed source data, ...).
    #[error("Event processing error: {0}")]
    EventProcessing(String),

    /// The operation was cancelled before it reached the backend.
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// The write admission queue dropped the request because it was full.
    #[error("Failed to enqueue documents batch write, the queue buffer was full")]
    QueueSaturated,

    /// The write admission queue no longer accepts requests.
    #[error("Failed to enqueue documents batch write, the queue was closed")]
    QueueClosed,

    /// A projector did not answer within its deadline.
    #[error("Projector did not respond within {0:?}")]
    Timeout(Duration),

    /// Position storage failed.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// The sequencer loop has stopped and no longer answers.
    #[error("Projection sequencer is not running")]
    SequencerStopped,

    /// Generic error
    #[error("Projection error: {0}")]
    Other(String),
}

impl ProjectionError {
    /// Build a [`ProjectionError::HandlerRejected`] for the given id.
    #[must_use]
    pub fn rejected(id: &impl std::fmt::Debug, reason: impl Into<String>) -> Self {
        Self::HandlerRejected {
            id: format!("{id:?}"),
            reason: reason.into(),
        }
    }

    /// Whether this error signals cooperative cancellation.
    ///
    /// Cancellation carries no retry semantics.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Whether a restart of the projection may succeed where this failed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Storage(_)
                | Self::Checkpoint(_)
                | Self::Timeout(_)
                | Self::QueueSaturated
                | Self::HandlerRejected { .. }
        )
    }
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;
