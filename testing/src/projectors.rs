//! Scripted projectors for exercising the sequencer in isolation.
//!
//! [`ScriptedProjectors`] implements the projector registry without touching
//! storage. Per document id it can delay, fail or panic, and it records which
//! events were applied in which order and how many runs overlapped.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use docfold_core::cancel::CancellationToken;
use docfold_core::error::{ProjectionError, Result};
use docfold_core::event::{EventWithPosition, Position, highest_position};
use docfold_core::projector::{KeepTrackOfProjectors, ProjectEventsResponse, ProjectorProxy};
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

struct Script<Id, E> {
    delays: RwLock<HashMap<Id, Duration>>,
    default_delay: RwLock<Duration>,
    failures: RwLock<HashMap<Id, usize>>,
    panics: RwLock<HashSet<Id>>,
    unavailable: RwLock<HashSet<Id>>,
    applied: RwLock<Vec<(Id, EventWithPosition<E>)>>,
    recording: AtomicBool,
    active: RwLock<HashMap<Id, usize>>,
    max_active: RwLock<HashMap<Id, usize>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    calls: AtomicUsize,
    resets: AtomicUsize,
    in_progress: RwLock<Vec<CancellationToken>>,
}

/// Projector registry driven by a script instead of real handlers.
///
/// # Example
///
/// ```
/// use docfold_testing::ScriptedProjectors;
/// use std::time::Duration;
///
/// let projectors = ScriptedProjectors::<String, u32>::new();
/// projectors.delay("slow".to_string(), Duration::from_millis(200));
/// projectors.fail_next("broken".to_string(), 1);
/// ```
pub struct ScriptedProjectors<Id, E> {
    script: Arc<Script<Id, E>>,
}

impl<Id, E> Clone for ScriptedProjectors<Id, E> {
    fn clone(&self) -> Self {
        Self {
            script: Arc::clone(&self.script),
        }
    }
}

impl<Id, E> ScriptedProjectors<Id, E>
where
    Id: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// A registry whose projectors acknowledge immediately.
    #[must_use]
    pub fn new() -> Self {
        Self {
            script: Arc::new(Script {
                delays: RwLock::new(HashMap::new()),
                default_delay: RwLock::new(Duration::ZERO),
                failures: RwLock::new(HashMap::new()),
                panics: RwLock::new(HashSet::new()),
                unavailable: RwLock::new(HashSet::new()),
                applied: RwLock::new(Vec::new()),
                recording: AtomicBool::new(true),
                active: RwLock::new(HashMap::new()),
                max_active: RwLock::new(HashMap::new()),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                resets: AtomicUsize::new(0),
                in_progress: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Delay every run for `id`.
    pub fn delay(&self, id: Id, delay: Duration) {
        self.script.delays.write().unwrap().insert(id, delay);
    }

    /// Delay runs for ids without their own delay.
    pub fn default_delay(&self, delay: Duration) {
        *self.script.default_delay.write().unwrap() = delay;
    }

    /// Reject the next `count` runs for `id`.
    pub fn fail_next(&self, id: Id, count: usize) {
        self.script.failures.write().unwrap().insert(id, count);
    }

    /// Panic inside every run for `id`.
    pub fn panic_on(&self, id: Id) {
        self.script.panics.write().unwrap().insert(id);
    }

    /// Make `get_projector` fail for `id`.
    pub fn make_unavailable(&self, id: Id) {
        self.script.unavailable.write().unwrap().insert(id);
    }

    /// Stop recording applied events, for long-running benchmarks.
    pub fn stop_recording(&self) {
        self.script.recording.store(false, Ordering::SeqCst);
    }

    /// Every applied event with its document id, in application order.
    #[must_use]
    pub fn applied(&self) -> Vec<(Id, EventWithPosition<E>)> {
        self.script.applied.read().unwrap().clone()
    }

    /// Events applied for `id`, in application order.
    #[must_use]
    pub fn applied_for(&self, id: &Id) -> Vec<E> {
        self.script
            .applied
            .read()
            .unwrap()
            .iter()
            .filter(|(applied, _)| applied == id)
            .map(|(_, event)| event.event.clone())
            .collect()
    }

    /// Positions applied for `id`, in application order.
    #[must_use]
    pub fn positions_for(&self, id: &Id) -> Vec<Position> {
        self.script
            .applied
            .read()
            .unwrap()
            .iter()
            .filter(|(applied, _)| applied == id)
            .map(|(_, event)| event.position)
            .collect()
    }

    /// Most runs ever overlapping for `id`.
    #[must_use]
    pub fn max_concurrent_for(&self, id: &Id) -> usize {
        self.script
            .max_active
            .read()
            .unwrap()
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    /// Most runs ever overlapping across all ids.
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.script.max_running.load(Ordering::SeqCst)
    }

    /// Number of `project_events` calls received.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.script.calls.load(Ordering::SeqCst)
    }

    /// Number of times the registry was reset.
    #[must_use]
    pub fn resets(&self) -> usize {
        self.script.resets.load(Ordering::SeqCst)
    }
}

impl<Id, E> Default for ScriptedProjectors<Id, E>
where
    Id: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<Id, E> Script<Id, E>
where
    Id: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn enter(&self, id: &Id) {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);

        let mut active = self.active.write().unwrap();
        let count = active.entry(id.clone()).or_insert(0);
        *count += 1;
        let mut max_active = self.max_active.write().unwrap();
        let max = max_active.entry(id.clone()).or_insert(0);
        *max = (*max).max(*count);
    }

    fn leave(&self, id: &Id) {
        self.running.fetch_sub(1, Ordering::SeqCst);
        if let Some(count) = self.active.write().unwrap().get_mut(id) {
            *count = count.saturating_sub(1);
        }
    }

    fn delay_for(&self, id: &Id) -> Duration {
        self.delays
            .read()
            .unwrap()
            .get(id)
            .copied()
            .unwrap_or_else(|| *self.default_delay.read().unwrap())
    }

    fn take_failure(&self, id: &Id) -> bool {
        let mut failures = self.failures.write().unwrap();
        match failures.get_mut(id) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    #[allow(clippy::panic)]
    async fn run(
        &self,
        id: &Id,
        events: Vec<EventWithPosition<E>>,
        cancel: &CancellationToken,
    ) -> ProjectEventsResponse {
        let delay = self.delay_for(id);
        if !delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => {}
            }
        }

        if self.panics.read().unwrap().contains(id) {
            panic!("scripted panic for {id:?}");
        }
        if cancel.is_cancelled() {
            return ProjectEventsResponse::reject(ProjectionError::Cancelled(
                "Projection was cancelled".to_string(),
            ));
        }
        if self.take_failure(id) {
            tracing::debug!(?id, "Scripted projector failure");
            return ProjectEventsResponse::reject(ProjectionError::rejected(id, "scripted failure"));
        }

        let Some(position) = highest_position(&events) else {
            return ProjectEventsResponse::reject(ProjectionError::EventProcessing(
                "Cannot project an empty batch".to_string(),
            ));
        };

        if !self.recording.load(Ordering::SeqCst) {
            return ProjectEventsResponse::acknowledge(position);
        }

        let mut applied = self.applied.write().unwrap();
        for event in events {
            applied.push((id.clone(), event));
        }
        ProjectEventsResponse::acknowledge(position)
    }
}

struct ScriptedProjector<Id, E> {
    id: Id,
    script: Arc<Script<Id, E>>,
}

impl<Id, E> ProjectorProxy<E> for ScriptedProjector<Id, E>
where
    Id: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn project_events(
        &self,
        events: Vec<EventWithPosition<E>>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, ProjectEventsResponse> {
        Box::pin(async move {
            self.script.calls.fetch_add(1, Ordering::SeqCst);
            self.script.in_progress.write().unwrap().push(cancel.clone());
            self.script.enter(&self.id);

            let response = tokio::time::timeout(timeout, self.script.run(&self.id, events, &cancel))
                .await
                .unwrap_or_else(|_| {
                    cancel.cancel();
                    ProjectEventsResponse::reject(ProjectionError::Timeout(timeout))
                });

            self.script.leave(&self.id);
            response
        })
    }

    fn stop_all_in_progress(&self) {
        for token in self.script.in_progress.write().unwrap().drain(..) {
            token.cancel();
        }
    }
}

impl<Id, E> KeepTrackOfProjectors<Id, E> for ScriptedProjectors<Id, E>
where
    Id: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn get_projector<'a>(&'a self, id: &'a Id) -> BoxFuture<'a, Result<Arc<dyn ProjectorProxy<E>>>> {
        let result: Result<Arc<dyn ProjectorProxy<E>>> = if self.script.unavailable.read().unwrap().contains(id) {
            Err(ProjectionError::rejected(id, "projector unavailable"))
        } else {
            Ok(Arc::new(ScriptedProjector {
                id: id.clone(),
                script: Arc::clone(&self.script),
            }))
        };
        Box::pin(std::future::ready(result))
    }

    fn reset(&self) {
        self.script.resets.fetch_add(1, Ordering::SeqCst);
        for token in self.script.in_progress.write().unwrap().drain(..) {
            token.cancel();
        }
    }
}
