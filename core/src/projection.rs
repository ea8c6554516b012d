//! Projections: read models folded from an ordered event stream.
//!
//! # Overview
//!
//! Projections are the **query side of CQRS**. A projection names itself,
//! describes how events map onto documents, and knows where to read events
//! from:
//!
//! - **Position Source**: restartable stream of events with positions
//! - **Handler setup**: dispatch tags → id extraction, filters, mutations
//! - **Name**: key for position storage
//!
//! ## Data flow
//!
//! ```text
//! ┌─────────────────┐     ┌───────────┐     ┌─────────────┐     ┌──────────┐
//! │ Position Source │ ──► │ Sequencer │ ──► │ Projector   │ ──► │ Document │
//! └─────────────────┘     └─────┬─────┘     │ (one per id)│     │ Storage  │
//!                               │           └─────────────┘     └──────────┘
//!                               │ group barrier released
//!                               ▼
//!                        ┌──────────────────┐
//!                        │ Position Storage │
//!                        └──────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! struct OrderSummaryProjection {
//!     source: InMemoryPositionSource<OrderEvent>,
//! }
//!
//! impl Projection for OrderSummaryProjection {
//!     type Id = String;
//!     type Document = OrderSummary;
//!     type Event = OrderEvent;
//!
//!     fn name(&self) -> &str {
//!         "order_summary"
//!     }
//!
//!     fn configure(&self, setup: ProjectionSetup<String, OrderSummary, OrderEvent>)
//!         -> ProjectionSetup<String, OrderSummary, OrderEvent>
//!     {
//!         setup.on("OrderPlaced", |e| e.order_id(), |e, doc, _| Some(OrderSummary::apply(doc, e)))
//!     }
//!
//!     fn source(&self) -> &dyn PositionSource<OrderEvent> {
//!         &self.source
//!     }
//! }
//! ```

use crate::error::Result;
use crate::event::{EventWithPosition, Position, ProjectedEvent, ProjectionDocument, ProjectionId};
use crate::handler::ProjectionSetup;
use futures::stream::BoxStream;

/// Stream of events read from a position source.
pub type EventStream<E> = BoxStream<'static, Result<EventWithPosition<E>>>;

/// Lazy, restartable source of events.
///
/// Positions are strictly increasing within one stream.
pub trait PositionSource<E>: Send + Sync {
    /// Start reading after `position`, or from the beginning for `None`.
    ///
    /// Events at or before `position` were already committed and must not be
    /// yielded again.
    fn start_from(&self, position: Option<Position>) -> EventStream<E>;
}

/// A projection builds and maintains documents from events.
///
/// # Philosophy
///
/// - **Eventually Consistent**: documents lag behind events
/// - **At-least-once**: after a restart, events since the last committed
///   position are applied again, so mutations should be idempotent
/// - **Ordered per document**: events for one id are applied in stream order
pub trait Projection: Send + Sync + 'static {
    /// Document id type
    type Id: ProjectionId;

    /// Document type
    type Document: ProjectionDocument;

    /// Event type read from the source
    type Event: ProjectedEvent;

    /// Unique projection name, used as the position storage key.
    fn name(&self) -> &str;

    /// Register handlers and transformers.
    fn configure(
        &self,
        setup: ProjectionSetup<Self::Id, Self::Document, Self::Event>,
    ) -> ProjectionSetup<Self::Id, Self::Document, Self::Event>;

    /// Where events are read from.
    fn source(&self) -> &dyn PositionSource<Self::Event>;
}
