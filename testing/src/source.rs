//! In-memory position source.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use docfold_core::error::ProjectionError;
use docfold_core::event::{EventWithPosition, Position};
use docfold_core::projection::{EventStream, PositionSource};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Restartable in-memory event source.
///
/// Events are read in insertion order; positions must be strictly
/// increasing. Every call to [`PositionSource::start_from`] is recorded, so
/// tests can check where a restarted projection resumed.
///
/// # Example
///
/// ```
/// use docfold_core::projection::PositionSource;
/// use docfold_testing::InMemoryPositionSource;
/// use futures::StreamExt;
///
/// # async fn example() {
/// let source = InMemoryPositionSource::from_events(["a", "b", "c"]);
///
/// let after_first: Vec<_> = source.start_from(Some(1)).collect().await;
/// assert_eq!(after_first.len(), 2);
/// assert_eq!(source.starts(), vec![Some(1)]);
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryPositionSource<E> {
    events: Arc<RwLock<Vec<EventWithPosition<E>>>>,
    starts: Arc<RwLock<Vec<Option<Position>>>>,
    delay: Option<Duration>,
    fail_at: Arc<RwLock<Option<Position>>>,
}

impl<E> InMemoryPositionSource<E>
where
    E: Clone + Send + Sync + 'static,
{
    /// A source over `events`.
    #[must_use]
    pub fn new(events: Vec<EventWithPosition<E>>) -> Self {
        Self {
            events: Arc::new(RwLock::new(events)),
            starts: Arc::new(RwLock::new(Vec::new())),
            delay: None,
            fail_at: Arc::new(RwLock::new(None)),
        }
    }

    /// A source over `events`, numbered from position 1.
    #[must_use]
    pub fn from_events(events: impl IntoIterator<Item = E>) -> Self {
        Self::new(
            events
                .into_iter()
                .zip(1..)
                .map(|(event, position)| EventWithPosition::new(event, position))
                .collect(),
        )
    }

    /// Sleep before yielding each event.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Append an event after the current last position.
    pub fn push(&self, event: E) -> Position {
        let mut events = self.events.write().unwrap();
        let position = events.last().map_or(1, |last| last.position + 1);
        events.push(EventWithPosition::new(event, position));
        position
    }

    /// Yield an error instead of the event at `position`, once.
    pub fn fail_once_at(&self, position: Position) {
        *self.fail_at.write().unwrap() = Some(position);
    }

    /// Positions the source was started from, in order.
    #[must_use]
    pub fn starts(&self) -> Vec<Option<Position>> {
        self.starts.read().unwrap().clone()
    }
}

impl<E> PositionSource<E> for InMemoryPositionSource<E>
where
    E: Clone + Send + Sync + 'static,
{
    fn start_from(&self, position: Option<Position>) -> EventStream<E> {
        self.starts.write().unwrap().push(position);

        let events: Vec<EventWithPosition<E>> = self
            .events
            .read()
            .unwrap()
            .iter()
            .filter(|event| position.is_none_or(|after| event.position > after))
            .cloned()
            .collect();
        let delay = self.delay;
        let fail_at = Arc::clone(&self.fail_at);

        Box::pin(async_stream::stream! {
            for event in events {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }

                let fail = {
                    let mut fail_at = fail_at.write().unwrap();
                    if *fail_at == Some(event.position) {
                        *fail_at = None;
                        true
                    } else {
                        false
                    }
                };

                if fail {
                    yield Err(ProjectionError::EventProcessing(format!(
                        "Injected source failure at position {}",
                        event.position
                    )));
                    return;
                }

                yield Ok(event);
            }
        })
    }
}
