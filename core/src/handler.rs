//! Handler registry: event classification and routing.
//!
//! A projection describes, per dispatch tag, how to find the document an event
//! belongs to and how the event changes that document. The description is
//! built with [`ProjectionSetup`] and frozen into an [`EventHandler`]:
//!
//! ```
//! use docfold_core::event::ProjectedEvent;
//! use docfold_core::handler::{ProjectionFilter, ProjectionSetup};
//!
//! #[derive(Clone, Debug)]
//! enum CartEvent {
//!     ItemAdded { cart: u32, sku: String },
//!     CartCleared { cart: u32 },
//! }
//!
//! impl ProjectedEvent for CartEvent {
//!     fn dispatch_tags(&self) -> &'static [&'static str] {
//!         match self {
//!             Self::ItemAdded { .. } => &["ItemAdded"],
//!             Self::CartCleared { .. } => &["CartCleared"],
//!         }
//!     }
//! }
//!
//! let handler = ProjectionSetup::<u32, Vec<String>, CartEvent>::new()
//!     .on(
//!         "ItemAdded",
//!         |e| match e {
//!             CartEvent::ItemAdded { cart, .. } => Some(*cart),
//!             _ => None,
//!         },
//!         |e, doc, _position| {
//!             let mut items = doc.unwrap_or_default();
//!             if let CartEvent::ItemAdded { sku, .. } = e {
//!                 items.push(sku.clone());
//!             }
//!             Some(items)
//!         },
//!     )
//!     .on(
//!         "CartCleared",
//!         |e| match e {
//!             CartEvent::CartCleared { cart } => Some(*cart),
//!             _ => None,
//!         },
//!         |_e, _doc, _position| None,
//!     )
//!     .filter("CartCleared", ProjectionFilter::new().document_exists())
//!     .build();
//!
//! let id = handler.document_id_from(&CartEvent::CartCleared { cart: 7 });
//! assert_eq!(id.id(), Some(&7));
//! ```

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::event::{DocumentId, Position, ProjectedEvent, ProjectionDocument, ProjectionId};
use futures::future::BoxFuture;
use smallvec::{SmallVec, smallvec};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Output of an event transformer.
pub type TransformedEvents<E> = SmallVec<[E; 1]>;

type IdExtractor<Id, E> = Arc<dyn Fn(&E) -> Option<Id> + Send + Sync>;

type Mutation<D, E> = Arc<
    dyn Fn(E, Option<D>, Position, CancellationToken) -> BoxFuture<'static, Result<Option<D>>>
        + Send
        + Sync,
>;

type Transformer<E> = Arc<dyn Fn(&E) -> TransformedEvents<E> + Send + Sync>;

type EventPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

type DocumentPredicate<D> = Arc<dyn Fn(Option<&D>) -> bool + Send + Sync>;

/// Routing capability consumed by the sequencer.
///
/// The sequencer only needs to split and classify events; applying them is
/// the projector's job.
pub trait RouteEvents<Id, E>: Send + Sync {
    /// Expand an event into the events that should actually be projected.
    fn transform(&self, event: &E) -> TransformedEvents<E>;

    /// Find the document an event belongs to.
    fn document_id_from(&self, event: &E) -> DocumentId<Id>;
}

/// Predicates deciding whether a handler applies.
///
/// Event predicates gate id extraction: an event failing them is not claimed
/// by the handler. Document predicates are evaluated against the current
/// document right before the mutation; a failing document predicate stops
/// handling of that event altogether.
pub struct ProjectionFilter<D, E> {
    event: Vec<EventPredicate<E>>,
    document: Vec<DocumentPredicate<D>>,
}

impl<D, E> ProjectionFilter<D, E> {
    /// A filter that accepts everything.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            event: Vec::new(),
            document: Vec::new(),
        }
    }

    /// Only claim events matching `predicate`.
    #[must_use]
    pub fn with_event(mut self, predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.event.push(Arc::new(predicate));
        self
    }

    /// Only apply when the current document matches `predicate`.
    #[must_use]
    pub fn with_document(
        mut self,
        predicate: impl Fn(Option<&D>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.document.push(Arc::new(predicate));
        self
    }

    /// Only apply to documents that already exist.
    #[must_use]
    pub fn document_exists(self) -> Self {
        self.with_document(|doc| doc.is_some())
    }

    /// Only apply when the document does not exist yet.
    #[must_use]
    pub fn document_missing(self) -> Self {
        self.with_document(|doc| doc.is_none())
    }

    /// Evaluate the event predicates.
    #[must_use]
    pub fn filter_event(&self, event: &E) -> bool {
        self.event.iter().all(|predicate| predicate(event))
    }

    /// Evaluate the document predicates.
    #[must_use]
    pub fn filter_document(&self, document: Option<&D>) -> bool {
        self.document.iter().all(|predicate| predicate(document))
    }
}

impl<D, E> Default for ProjectionFilter<D, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D, E> Clone for ProjectionFilter<D, E> {
    fn clone(&self) -> Self {
        Self {
            event: self.event.clone(),
            document: self.document.clone(),
        }
    }
}

impl<D, E> std::fmt::Debug for ProjectionFilter<D, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionFilter")
            .field("event_predicates", &self.event.len())
            .field("document_predicates", &self.document.len())
            .finish()
    }
}

struct Handler<Id, D, E> {
    get_id: IdExtractor<Id, E>,
    mutate: Mutation<D, E>,
    filter: ProjectionFilter<D, E>,
}

impl<Id, D, E> Clone for Handler<Id, D, E> {
    fn clone(&self) -> Self {
        Self {
            get_id: Arc::clone(&self.get_id),
            mutate: Arc::clone(&self.mutate),
            filter: self.filter.clone(),
        }
    }
}

/// Builder for a projection's handlers and transformers.
///
/// Registering a tag twice replaces the earlier registration.
pub struct ProjectionSetup<Id, D, E> {
    handlers: HashMap<&'static str, Handler<Id, D, E>>,
    filters: HashMap<&'static str, ProjectionFilter<D, E>>,
    transformers: HashMap<&'static str, Transformer<E>>,
}

impl<Id, D, E> ProjectionSetup<Id, D, E>
where
    Id: ProjectionId,
    D: ProjectionDocument,
    E: ProjectedEvent,
{
    /// An empty setup.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            filters: HashMap::new(),
            transformers: HashMap::new(),
        }
    }

    /// Register a synchronous mutation for `tag`.
    ///
    /// `get_id` returns `None` for events it cannot extract an id from; such
    /// events are not claimed by this handler. Returning `None` from `mutate`
    /// deletes the document.
    #[must_use]
    pub fn on<G, F>(self, tag: &'static str, get_id: G, mutate: F) -> Self
    where
        G: Fn(&E) -> Option<Id> + Send + Sync + 'static,
        F: Fn(&E, Option<D>, Position) -> Option<D> + Send + Sync + 'static,
    {
        let mutation: Mutation<D, E> = Arc::new(
            move |event: E,
                  document: Option<D>,
                  position: Position,
                  _cancel: CancellationToken|
                  -> BoxFuture<'static, Result<Option<D>>> {
                let result = mutate(&event, document, position);
                Box::pin(async move { Ok(result) })
            },
        );

        self.register(tag, Arc::new(get_id), mutation)
    }

    /// Register an asynchronous, fallible mutation for `tag`.
    #[must_use]
    pub fn on_async<G, F, Fut>(self, tag: &'static str, get_id: G, mutate: F) -> Self
    where
        G: Fn(&E) -> Option<Id> + Send + Sync + 'static,
        F: Fn(E, Option<D>, Position, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<D>>> + Send + 'static,
    {
        let mutation: Mutation<D, E> = Arc::new(
            move |event: E,
                  document: Option<D>,
                  position: Position,
                  cancel: CancellationToken|
                  -> BoxFuture<'static, Result<Option<D>>> {
                Box::pin(mutate(event, document, position, cancel))
            },
        );

        self.register(tag, Arc::new(get_id), mutation)
    }

    /// Attach a filter to the handler registered for `tag`.
    #[must_use]
    pub fn filter(mut self, tag: &'static str, filter: ProjectionFilter<D, E>) -> Self {
        self.filters.insert(tag, filter);
        self
    }

    /// Split events carrying `tag` into zero or more events before routing.
    #[must_use]
    pub fn transform_using<F>(mut self, tag: &'static str, transform: F) -> Self
    where
        F: Fn(&E) -> TransformedEvents<E> + Send + Sync + 'static,
    {
        self.transformers.insert(tag, Arc::new(transform));
        self
    }

    /// Freeze the setup.
    #[must_use]
    pub fn build(self) -> EventHandler<Id, D, E> {
        let mut handlers = self.handlers;
        for (tag, filter) in self.filters {
            if let Some(handler) = handlers.get_mut(tag) {
                handler.filter = filter;
            } else {
                tracing::warn!(tag, "Filter registered for a tag without a handler");
            }
        }

        EventHandler {
            handlers,
            transformers: self.transformers,
        }
    }

    fn register(
        mut self,
        tag: &'static str,
        get_id: IdExtractor<Id, E>,
        mutate: Mutation<D, E>,
    ) -> Self {
        let previous = self.handlers.insert(
            tag,
            Handler {
                get_id,
                mutate,
                filter: ProjectionFilter::new(),
            },
        );
        if previous.is_some() {
            tracing::debug!(tag, "Replacing previously registered handler");
        }
        self
    }
}

impl<Id, D, E> Default for ProjectionSetup<Id, D, E>
where
    Id: ProjectionId,
    D: ProjectionDocument,
    E: ProjectedEvent,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Frozen handler registry.
///
/// Every operation walks the event's dispatch tags in declared order.
pub struct EventHandler<Id, D, E> {
    handlers: HashMap<&'static str, Handler<Id, D, E>>,
    transformers: HashMap<&'static str, Transformer<E>>,
}

impl<Id, D, E> EventHandler<Id, D, E>
where
    Id: ProjectionId,
    D: ProjectionDocument,
    E: ProjectedEvent,
{
    /// Expand an event through every matching transformer.
    ///
    /// Outputs of all matching transformers are concatenated in tag order.
    /// An event no transformer matches is returned unchanged.
    #[must_use]
    pub fn transform(&self, event: &E) -> TransformedEvents<E> {
        let mut results = TransformedEvents::new();
        let mut transformed = false;

        for tag in event.dispatch_tags() {
            if let Some(transform) = self.transformers.get(tag) {
                results.extend(transform(event));
                transformed = true;
            }
        }

        if transformed {
            results
        } else {
            smallvec![event.clone()]
        }
    }

    /// Find the document an event belongs to.
    ///
    /// Collects ids from every matching handler whose event filter passes.
    /// The first id in tag order wins; later ids that disagree are logged and
    /// ignored.
    #[must_use]
    pub fn document_id_from(&self, event: &E) -> DocumentId<Id> {
        let mut chosen: Option<Id> = None;

        for tag in event.dispatch_tags() {
            let Some(handler) = self.handlers.get(tag) else {
                continue;
            };
            if !handler.filter.filter_event(event) {
                continue;
            }
            let Some(id) = (handler.get_id)(event) else {
                continue;
            };

            match &chosen {
                None => chosen = Some(id),
                Some(first) if *first != id => {
                    tracing::warn!(
                        tag,
                        chosen = ?first,
                        ignored = ?id,
                        "Handlers disagree on document id, keeping the first match"
                    );
                }
                Some(_) => {}
            }
        }

        chosen.map_or_else(DocumentId::unusable, DocumentId::usable)
    }

    /// Apply an event to a document.
    ///
    /// Matching handlers run in tag order, each receiving the document the
    /// previous one returned. Event filters only take part in routing, so
    /// they are not consulted here. A handler whose document filter rejects the
    /// current document stops handling; the returned flag reports whether any
    /// mutation ran before that point.
    ///
    /// # Errors
    ///
    /// Propagates the first error returned by a mutation.
    pub async fn handle(
        &self,
        mut document: Option<D>,
        event: &E,
        position: Position,
        cancel: &CancellationToken,
    ) -> Result<(Option<D>, bool)> {
        let mut handled = false;

        for tag in event.dispatch_tags() {
            let Some(handler) = self.handlers.get(tag) else {
                continue;
            };
            if !handler.filter.filter_document(document.as_ref()) {
                return Ok((document, handled));
            }

            document = (handler.mutate)(event.clone(), document, position, cancel.clone()).await?;
            handled = true;
        }

        Ok((document, handled))
    }

    /// Whether any handler is registered for `tag`.
    #[must_use]
    pub fn handles(&self, tag: &str) -> bool {
        self.handlers.contains_key(tag)
    }
}

impl<Id, D, E> RouteEvents<Id, E> for EventHandler<Id, D, E>
where
    Id: ProjectionId,
    D: ProjectionDocument,
    E: ProjectedEvent,
{
    fn transform(&self, event: &E) -> TransformedEvents<E> {
        Self::transform(self, event)
    }

    fn document_id_from(&self, event: &E) -> DocumentId<Id> {
        Self::document_id_from(self, event)
    }
}
