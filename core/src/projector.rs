//! Per-document projectors, as seen from the sequencer.
//!
//! A projector owns one document id: it loads the document, folds events into
//! it and writes the result. The sequencer never touches projectors directly;
//! it asks a [`KeepTrackOfProjectors`] registry for a [`ProjectorProxy`] and
//! sends it events. The proxy may reach an in-process task or a worker on
//! another node.

use crate::cancel::CancellationToken;
use crate::error::{ProjectionError, Result};
use crate::event::{EventWithPosition, Position};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of projecting a batch of events for one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectEventsResponse {
    /// Every event up to `position` is reflected in stored documents.
    Acknowledge {
        /// Highest position covered by the run
        position: Position,
    },

    /// The run failed and nothing after the last acknowledgement is durable.
    Reject {
        /// Why the run failed
        error: ProjectionError,
    },
}

impl ProjectEventsResponse {
    /// Acknowledge up to `position`.
    #[must_use]
    pub const fn acknowledge(position: Position) -> Self {
        Self::Acknowledge { position }
    }

    /// Reject with `error`.
    #[must_use]
    pub const fn reject(error: ProjectionError) -> Self {
        Self::Reject { error }
    }

    /// Whether the run succeeded.
    #[must_use]
    pub const fn is_acknowledged(&self) -> bool {
        matches!(self, Self::Acknowledge { .. })
    }

    /// The acknowledged position, if any.
    #[must_use]
    pub const fn position(&self) -> Option<Position> {
        match self {
            Self::Acknowledge { position } => Some(*position),
            Self::Reject { .. } => None,
        }
    }

    /// Convert into a `Result`.
    ///
    /// # Errors
    ///
    /// Returns the rejection error for [`ProjectEventsResponse::Reject`].
    pub fn into_result(self) -> Result<Position> {
        match self {
            Self::Acknowledge { position } => Ok(position),
            Self::Reject { error } => Err(error),
        }
    }
}

/// Handle to the projector of one document id.
pub trait ProjectorProxy<E>: Send + Sync {
    /// Project `events` and wait at most `timeout` for the answer.
    ///
    /// Failures never surface as `Err`; they come back as
    /// [`ProjectEventsResponse::Reject`].
    fn project_events(
        &self,
        events: Vec<EventWithPosition<E>>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, ProjectEventsResponse>;

    /// Cancel every run this projector is currently executing.
    fn stop_all_in_progress(&self);
}

/// Registry that hands out projectors by document id.
pub trait KeepTrackOfProjectors<Id, E>: Send + Sync {
    /// Get (or start) the projector for `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if no projector can be reached for `id`.
    fn get_projector<'a>(&'a self, id: &'a Id) -> BoxFuture<'a, Result<Arc<dyn ProjectorProxy<E>>>>;

    /// Stop and forget every projector.
    fn reset(&self);
}
