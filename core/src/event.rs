//! Events, positions and document ids.
//!
//! # Dispatch tags
//!
//! Handlers are not found by walking a type hierarchy at runtime. Every event
//! declares, up front, the tags it answers to, most specific first. A variant
//! tag usually comes first, followed by any capability tags shared by several
//! variants:
//!
//! ```
//! use docfold_core::event::ProjectedEvent;
//!
//! #[derive(Clone, Debug)]
//! enum OrderEvent {
//!     Placed { order_id: String },
//!     Shipped { order_id: String },
//! }
//!
//! impl ProjectedEvent for OrderEvent {
//!     fn dispatch_tags(&self) -> &'static [&'static str] {
//!         match self {
//!             Self::Placed { .. } => &["OrderPlaced", "OrderEvent"],
//!             Self::Shipped { .. } => &["OrderShipped", "OrderEvent"],
//!         }
//!     }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::hash::Hash;

/// Monotonically increasing cursor over the event stream.
pub type Position = u64;

/// An event that can be routed to projection handlers.
///
/// Events must be `Clone + Send + Sync + 'static` so they can be grouped,
/// queued and moved onto projector tasks.
pub trait ProjectedEvent: Clone + Debug + Send + Sync + 'static {
    /// Tags this event answers to, in dispatch priority order.
    ///
    /// The order is a contract: transformers, id extractors and handlers are
    /// all consulted in exactly this order.
    fn dispatch_tags(&self) -> &'static [&'static str];
}

/// Bounds required of a document id.
pub trait ProjectionId: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> ProjectionId for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// Bounds required of a projected document.
pub trait ProjectionDocument: Clone + Debug + Send + Sync + 'static {}

impl<T> ProjectionDocument for T where T: Clone + Debug + Send + Sync + 'static {}

/// An event paired with its position in the source stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventWithPosition<E> {
    /// The event payload
    pub event: E,
    /// Source position of the event
    pub position: Position,
}

impl<E> EventWithPosition<E> {
    /// Pair an event with its position.
    #[must_use]
    pub const fn new(event: E, position: Position) -> Self {
        Self { event, position }
    }

    /// Replace the payload, keeping the position.
    #[must_use]
    pub fn with_event<T>(&self, event: T) -> EventWithPosition<T> {
        EventWithPosition {
            event,
            position: self.position,
        }
    }
}

/// Highest position in a batch, `None` for an empty batch.
#[must_use]
pub fn highest_position<E>(events: &[EventWithPosition<E>]) -> Option<Position> {
    events.iter().map(|e| e.position).max()
}

/// The document id an event routes to.
///
/// An unusable id means no registered handler claims the event, so nothing
/// needs to be projected for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentId<Id> {
    id: Option<Id>,
}

impl<Id> DocumentId<Id> {
    /// An id that routes to a document.
    #[must_use]
    pub const fn usable(id: Id) -> Self {
        Self { id: Some(id) }
    }

    /// No handler claims the event.
    #[must_use]
    pub const fn unusable() -> Self {
        Self { id: None }
    }

    /// Whether a handler claims the event.
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        self.id.is_some()
    }

    /// The extracted id, if usable.
    #[must_use]
    pub const fn id(&self) -> Option<&Id> {
        self.id.as_ref()
    }

    /// Consume into the extracted id.
    #[must_use]
    pub fn into_id(self) -> Option<Id> {
        self.id
    }
}
