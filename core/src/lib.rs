//! # docfold core
//!
//! Core traits and types for projecting ordered event streams into documents.
//!
//! This crate holds everything the runtime and the backends agree on, and no
//! execution machinery of its own:
//!
//! - **Events**: [`EventWithPosition`](event::EventWithPosition), dispatch tags
//!   and [`DocumentId`](event::DocumentId)
//! - **Handlers**: the [`ProjectionSetup`](handler::ProjectionSetup) registry
//!   and the frozen [`EventHandler`](handler::EventHandler)
//! - **Storage**: document and position storage traits
//! - **Projectors**: the proxy/registry seam the sequencer talks through
//! - **Projections**: the [`Projection`](projection::Projection) trait and
//!   position sources
//! - **Errors**: [`ProjectionError`](error::ProjectionError)
//!
//! ## Guarantees
//!
//! - Events for the same document are applied in stream order
//! - At most one run per document id at any time
//! - Positions are committed only after every earlier run finished
//! - Processing is at-least-once; document mutations should be idempotent

pub mod cancel;
pub mod error;
pub mod event;
pub mod handler;
pub mod projection;
pub mod projector;
pub mod storage;

// Re-export commonly used types
pub use cancel::CancellationToken;
pub use error::{ProjectionError, Result};
pub use event::{DocumentId, EventWithPosition, Position, ProjectedEvent};
pub use handler::{EventHandler, ProjectionFilter, ProjectionSetup, RouteEvents};
pub use projection::{EventStream, PositionSource, Projection};
pub use projector::{KeepTrackOfProjectors, ProjectEventsResponse, ProjectorProxy};
pub use smallvec::{SmallVec, smallvec};
pub use storage::{
    DocumentStorage, DocumentToDelete, DocumentToStore, LoadedDocument, PositionStorage, WriteAck,
};
