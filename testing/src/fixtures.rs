//! A small event model and projection shared by docfold's own tests.
//!
//! Documents are lists of values per string id, which makes ordering easy
//! to assert: the document is exactly the values applied, in order.

use crate::source::InMemoryPositionSource;
use docfold_core::event::ProjectedEvent;
use docfold_core::handler::{ProjectionFilter, ProjectionSetup, TransformedEvents};
use docfold_core::projection::{PositionSource, Projection};
use serde::{Deserialize, Serialize};

/// Events of the fixture model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListEvent {
    /// Append `value` to list `id`
    Appended {
        /// Document id
        id: String,
        /// Value to append
        value: String,
    },
    /// Delete list `id`
    Cleared {
        /// Document id
        id: String,
    },
    /// Expands into its parts before routing
    Batch {
        /// Events carried by the batch
        parts: Vec<ListEvent>,
    },
    /// Not handled by the fixture projection
    Unrelated,
}

impl ListEvent {
    /// An `Appended` event.
    #[must_use]
    pub fn appended(id: &str, value: &str) -> Self {
        Self::Appended {
            id: id.to_string(),
            value: value.to_string(),
        }
    }

    /// A `Cleared` event.
    #[must_use]
    pub fn cleared(id: &str) -> Self {
        Self::Cleared { id: id.to_string() }
    }

    /// Document id the event targets, if any.
    #[must_use]
    pub fn list_id(&self) -> Option<String> {
        match self {
            Self::Appended { id, .. } | Self::Cleared { id } => Some(id.clone()),
            Self::Batch { .. } | Self::Unrelated => None,
        }
    }
}

impl ProjectedEvent for ListEvent {
    fn dispatch_tags(&self) -> &'static [&'static str] {
        match self {
            Self::Appended { .. } => &["Appended", "ListEvent"],
            Self::Cleared { .. } => &["Cleared", "ListEvent"],
            Self::Batch { .. } => &["Batch"],
            Self::Unrelated => &["Unrelated"],
        }
    }
}

/// Fixture document.
pub type ListDocument = Vec<String>;

/// Register the fixture handlers on `setup`.
///
/// - `Appended` pushes its value
/// - `Cleared` deletes an existing list
/// - `Batch` is split into its parts
#[must_use]
pub fn list_handlers(
    setup: ProjectionSetup<String, ListDocument, ListEvent>,
) -> ProjectionSetup<String, ListDocument, ListEvent> {
    setup
        .on("Appended", ListEvent::list_id, |event, document, _| {
            let mut values = document.unwrap_or_default();
            if let ListEvent::Appended { value, .. } = event {
                values.push(value.clone());
            }
            Some(values)
        })
        .on("Cleared", ListEvent::list_id, |_, _, _| None)
        .filter("Cleared", ProjectionFilter::new().document_exists())
        .transform_using("Batch", |event| match event {
            ListEvent::Batch { parts } => parts.iter().cloned().collect(),
            _ => TransformedEvents::new(),
        })
}

/// Fixture projection over an in-memory source.
#[derive(Clone, Debug)]
pub struct ListProjection {
    name: String,
    source: InMemoryPositionSource<ListEvent>,
}

impl ListProjection {
    /// Projection called `name` reading from `source`.
    #[must_use]
    pub fn new(name: &str, source: InMemoryPositionSource<ListEvent>) -> Self {
        Self {
            name: name.to_string(),
            source,
        }
    }
}

impl Projection for ListProjection {
    type Id = String;
    type Document = ListDocument;
    type Event = ListEvent;

    fn name(&self) -> &str {
        &self.name
    }

    fn configure(
        &self,
        setup: ProjectionSetup<String, ListDocument, ListEvent>,
    ) -> ProjectionSetup<String, ListDocument, ListEvent> {
        list_handlers(setup)
    }

    fn source(&self) -> &dyn PositionSource<ListEvent> {
        &self.source
    }
}
