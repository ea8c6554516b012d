//! Integration tests for the per-document sequencer.
//!
//! Projectors are scripted, so these tests only observe scheduling: which
//! batches run, in which order, how many overlap, and when group barriers
//! release.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use docfold_core::cancel::CancellationToken;
use docfold_core::error::ProjectionError;
use docfold_core::event::EventWithPosition;
use docfold_core::handler::{ProjectionSetup, RouteEvents};
use docfold_core::projector::{KeepTrackOfProjectors, ProjectEventsResponse, ProjectorProxy};
use docfold_runtime::{
    EventBatchingStrategy, GroupId, PositionData, ProjectionConfig, Sequencer, SequencerHandle,
};
use docfold_testing::{ListEvent, ScriptedProjectors, list_handlers};
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

type Projectors = ScriptedProjectors<String, ListEvent>;

fn sequencer(projectors: &Projectors, parallelism: usize) -> SequencerHandle<String, ListEvent> {
    let router: Arc<dyn RouteEvents<String, ListEvent>> =
        Arc::new(list_handlers(ProjectionSetup::new()).build());
    let config = ProjectionConfig::default()
        .with_event_batching(EventBatchingStrategy::new(100, parallelism))
        .with_projection_timeout(Duration::from_secs(5));

    Sequencer::spawn(router, Arc::new(projectors.clone()), &config)
}

fn append(id: &str, value: &str, position: u64) -> EventWithPosition<ListEvent> {
    EventWithPosition::new(ListEvent::appended(id, value), position)
}

#[tokio::test]
async fn test_different_ids_do_not_wait_for_each_other() {
    let projectors = Projectors::new();
    projectors.delay("slow".to_string(), Duration::from_millis(500));
    let sequencer = sequencer(&projectors, 10);

    let mut tasks = sequencer
        .start_projecting(vec![append("slow", "1", 1), append("fast", "2", 2)])
        .await
        .unwrap();
    assert_eq!(tasks.len(), 2);

    let slow = tasks.remove(0);
    let fast = tasks.remove(0);

    let fast_response = tokio::time::timeout(Duration::from_millis(250), fast.result)
        .await
        .expect("fast id should not wait for the slow one");
    assert_eq!(fast_response, ProjectEventsResponse::acknowledge(2));
    assert!(projectors.applied_for(&"slow".to_string()).is_empty());

    assert_eq!(slow.result.await, ProjectEventsResponse::acknowledge(1));
    assert_eq!(projectors.max_concurrent(), 2);
}

#[tokio::test]
async fn test_same_id_runs_one_batch_at_a_time_in_order() {
    let projectors = Projectors::new();
    projectors.delay("a".to_string(), Duration::from_millis(50));
    let sequencer = sequencer(&projectors, 10);

    let first = sequencer.start_projecting(vec![append("a", "1", 1)]).await.unwrap();
    let second = sequencer.start_projecting(vec![append("a", "2", 2)]).await.unwrap();
    let third = sequencer.start_projecting(vec![append("a", "3", 3)]).await.unwrap();

    let responses = futures::future::join_all(
        [first, second, third]
            .into_iter()
            .flatten()
            .map(|task| task.result),
    )
    .await;

    assert_eq!(
        responses,
        vec![
            ProjectEventsResponse::acknowledge(1),
            ProjectEventsResponse::acknowledge(2),
            ProjectEventsResponse::acknowledge(3),
        ]
    );
    assert_eq!(projectors.positions_for(&"a".to_string()), vec![1, 2, 3]);
    assert_eq!(projectors.max_concurrent_for(&"a".to_string()), 1);
}

#[tokio::test]
async fn test_events_for_one_id_are_grouped_into_one_run() {
    let projectors = Projectors::new();
    let sequencer = sequencer(&projectors, 10);

    let tasks = sequencer
        .start_projecting(vec![
            append("a", "1", 1),
            append("b", "2", 2),
            append("a", "3", 3),
        ])
        .await
        .unwrap();

    assert_eq!(tasks.len(), 2);
    let responses = futures::future::join_all(tasks.into_iter().map(|task| task.result)).await;
    assert_eq!(responses[0], ProjectEventsResponse::acknowledge(3));
    assert_eq!(responses[1], ProjectEventsResponse::acknowledge(2));

    assert_eq!(projectors.calls(), 2);
    assert_eq!(projectors.positions_for(&"a".to_string()), vec![1, 3]);
}

#[tokio::test]
async fn test_unmatched_events_are_acknowledged_without_a_run() {
    let projectors = Projectors::new();
    let sequencer = sequencer(&projectors, 10);

    let tasks = sequencer
        .start_projecting(vec![
            EventWithPosition::new(ListEvent::Unrelated, 4),
            EventWithPosition::new(ListEvent::Unrelated, 9),
        ])
        .await
        .unwrap();

    assert_eq!(tasks.len(), 1);
    let task = tasks.into_iter().next().unwrap();
    let group = task.group_id;
    assert_eq!(task.result.await, ProjectEventsResponse::acknowledge(9));

    let context = PositionData::new(Some(9));
    assert_eq!(sequencer.wait_for_group_to_finish(group, context).await.unwrap(), context);
    assert_eq!(projectors.calls(), 0);
}

#[tokio::test]
async fn test_transformed_events_route_to_their_own_documents() {
    let projectors = Projectors::new();
    let sequencer = sequencer(&projectors, 10);

    let batch = ListEvent::Batch {
        parts: vec![ListEvent::appended("a", "x"), ListEvent::appended("b", "y")],
    };
    let tasks = sequencer
        .start_projecting(vec![EventWithPosition::new(batch, 7)])
        .await
        .unwrap();

    assert_eq!(tasks.len(), 2);
    for task in tasks {
        assert_eq!(task.result.await, ProjectEventsResponse::acknowledge(7));
    }
    assert_eq!(projectors.applied_for(&"a".to_string()), vec![ListEvent::appended("a", "x")]);
    assert_eq!(projectors.applied_for(&"b".to_string()), vec![ListEvent::appended("b", "y")]);
}

#[tokio::test]
async fn test_parallelism_splits_units_into_groups() {
    let projectors = Projectors::new();
    let sequencer = sequencer(&projectors, 2);

    let tasks = sequencer
        .start_projecting(vec![
            append("a", "1", 1),
            append("b", "2", 2),
            append("c", "3", 3),
            append("d", "4", 4),
            append("e", "5", 5),
        ])
        .await
        .unwrap();

    assert_eq!(tasks.len(), 5);
    let groups: HashSet<_> = tasks.iter().map(|task| task.group_id).collect();
    assert_eq!(groups.len(), 3);
    assert_eq!(tasks[0].group_id, tasks[1].group_id);
    assert_eq!(tasks[2].group_id, tasks[3].group_id);
    assert_ne!(tasks[1].group_id, tasks[2].group_id);
}

#[tokio::test]
async fn test_group_barrier_waits_for_every_unit() {
    let projectors = Projectors::new();
    projectors.delay("slow".to_string(), Duration::from_millis(150));
    let sequencer = sequencer(&projectors, 10);

    let tasks = sequencer
        .start_projecting(vec![append("slow", "1", 1), append("fast", "2", 2)])
        .await
        .unwrap();
    let group = tasks[0].group_id;

    let context = PositionData::new(Some(2));
    let released = sequencer.wait_for_group_to_finish(group, context).await.unwrap();

    assert_eq!(released, context);
    assert_eq!(projectors.positions_for(&"slow".to_string()), vec![1]);
    assert_eq!(projectors.positions_for(&"fast".to_string()), vec![2]);
}

#[tokio::test]
async fn test_waiting_for_finished_group_returns_immediately() {
    let projectors = Projectors::new();
    let sequencer = sequencer(&projectors, 10);

    let tasks = sequencer.start_projecting(vec![append("a", "1", 1)]).await.unwrap();
    let group = tasks[0].group_id;
    for task in tasks {
        task.result.await;
    }

    let context = PositionData::new(Some(1));
    let released = tokio::time::timeout(
        Duration::from_millis(100),
        sequencer.wait_for_group_to_finish(group, context),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(released, context);

    let unknown = PositionData::new(Some(42));
    assert_eq!(
        sequencer
            .wait_for_group_to_finish(GroupId::nil(), unknown)
            .await
            .unwrap(),
        unknown
    );
}

#[tokio::test]
async fn test_rejection_fails_events_queued_behind_it() {
    let projectors = Projectors::new();
    projectors.delay("a".to_string(), Duration::from_millis(100));
    projectors.fail_next("a".to_string(), 1);
    let sequencer = sequencer(&projectors, 10);

    let first = sequencer.start_projecting(vec![append("a", "1", 1)]).await.unwrap();
    let second = sequencer
        .start_projecting(vec![append("a", "2", 2), append("b", "3", 3)])
        .await
        .unwrap();

    let first_response = first.into_iter().next().unwrap().result.await;
    let mut second = second.into_iter();
    let queued_response = second.next().unwrap().result.await;
    let other_response = second.next().unwrap().result.await;

    let expected = ProjectionError::rejected(&"a".to_string(), "scripted failure");
    assert_eq!(first_response, ProjectEventsResponse::reject(expected.clone()));
    assert_eq!(queued_response, ProjectEventsResponse::reject(expected));
    assert_eq!(other_response, ProjectEventsResponse::acknowledge(3));

    assert!(projectors.positions_for(&"a".to_string()).is_empty());
    assert_eq!(projectors.calls(), 2);
}

#[tokio::test]
async fn test_id_is_usable_again_after_rejection() {
    let projectors = Projectors::new();
    projectors.fail_next("a".to_string(), 1);
    let sequencer = sequencer(&projectors, 10);

    let failed = sequencer.start_projecting(vec![append("a", "1", 1)]).await.unwrap();
    assert!(!failed.into_iter().next().unwrap().result.await.is_acknowledged());

    let retried = sequencer.start_projecting(vec![append("a", "1", 1)]).await.unwrap();
    assert_eq!(
        retried.into_iter().next().unwrap().result.await,
        ProjectEventsResponse::acknowledge(1)
    );
}

#[tokio::test]
async fn test_panicking_run_is_rejected_and_releases_its_group() {
    let projectors = Projectors::new();
    projectors.panic_on("boom".to_string());
    let sequencer = sequencer(&projectors, 10);

    let tasks = sequencer
        .start_projecting(vec![append("boom", "1", 1), append("fine", "2", 2)])
        .await
        .unwrap();
    let group = tasks[0].group_id;

    let responses = futures::future::join_all(tasks.into_iter().map(|task| task.result)).await;
    assert_eq!(
        responses[0],
        ProjectEventsResponse::reject(ProjectionError::rejected(&"boom".to_string(), "handler run panicked"))
    );
    assert!(responses[1].is_acknowledged());

    let context = PositionData::new(Some(2));
    let released = tokio::time::timeout(
        Duration::from_secs(1),
        sequencer.wait_for_group_to_finish(group, context),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(released, context);
}

#[tokio::test]
async fn test_unavailable_projector_rejects_the_unit() {
    let projectors = Projectors::new();
    projectors.make_unavailable("gone".to_string());
    let sequencer = sequencer(&projectors, 10);

    let tasks = sequencer.start_projecting(vec![append("gone", "1", 1)]).await.unwrap();
    let response = tasks.into_iter().next().unwrap().result.await;

    assert_eq!(
        response,
        ProjectEventsResponse::reject(ProjectionError::rejected(&"gone".to_string(), "projector unavailable"))
    );
    assert_eq!(projectors.calls(), 0);
}

#[tokio::test]
async fn test_slow_projector_times_out() {
    let projectors = Projectors::new();
    projectors.delay("a".to_string(), Duration::from_secs(5));

    let router: Arc<dyn RouteEvents<String, ListEvent>> =
        Arc::new(list_handlers(ProjectionSetup::new()).build());
    let config = ProjectionConfig::default().with_projection_timeout(Duration::from_millis(50));
    let sequencer = Sequencer::spawn(router, Arc::new(projectors.clone()), &config);

    let tasks = sequencer.start_projecting(vec![append("a", "1", 1)]).await.unwrap();
    let response = tasks.into_iter().next().unwrap().result.await;

    assert_eq!(
        response,
        ProjectEventsResponse::reject(ProjectionError::Timeout(Duration::from_millis(50)))
    );
}

/// Projectors that never answer and ignore the deadline they are given.
struct HangingProjectors {
    hang_on_lookup: bool,
}

struct HangingProjector;

impl ProjectorProxy<ListEvent> for HangingProjector {
    fn project_events(
        &self,
        _events: Vec<EventWithPosition<ListEvent>>,
        _timeout: Duration,
        _cancel: CancellationToken,
    ) -> BoxFuture<'_, ProjectEventsResponse> {
        Box::pin(futures::future::pending())
    }

    fn stop_all_in_progress(&self) {}
}

impl KeepTrackOfProjectors<String, ListEvent> for HangingProjectors {
    fn get_projector<'a>(
        &'a self,
        _id: &'a String,
    ) -> BoxFuture<'a, docfold_core::Result<Arc<dyn ProjectorProxy<ListEvent>>>> {
        if self.hang_on_lookup {
            Box::pin(futures::future::pending())
        } else {
            let projector: Arc<dyn ProjectorProxy<ListEvent>> = Arc::new(HangingProjector);
            Box::pin(async move { Ok(projector) })
        }
    }

    fn reset(&self) {}
}

#[tokio::test]
async fn test_deadline_applies_when_projectors_ignore_it() {
    let timeout = Duration::from_millis(50);

    for hang_on_lookup in [false, true] {
        let router: Arc<dyn RouteEvents<String, ListEvent>> =
            Arc::new(list_handlers(ProjectionSetup::new()).build());
        let config = ProjectionConfig::default().with_projection_timeout(timeout);
        let sequencer = Sequencer::spawn(router, Arc::new(HangingProjectors { hang_on_lookup }), &config);

        let task = sequencer
            .start_projecting(vec![append("a", "1", 1)])
            .await
            .unwrap()
            .into_iter()
            .next()
            .unwrap();
        let group = task.group_id;

        let response = tokio::time::timeout(Duration::from_secs(1), task.result)
            .await
            .expect("run should hit its deadline");
        assert_eq!(response, ProjectEventsResponse::reject(ProjectionError::Timeout(timeout)));

        let context = PositionData::new(Some(1));
        let released = tokio::time::timeout(
            Duration::from_secs(1),
            sequencer.wait_for_group_to_finish(group, context),
        )
        .await
        .expect("group should release after the timeout");
        assert_eq!(released.unwrap(), context);

        sequencer.shutdown();
    }
}

#[tokio::test]
async fn test_reset_discards_queued_and_in_flight_work() {
    let projectors = Projectors::new();
    projectors.delay("a".to_string(), Duration::from_millis(300));
    let sequencer = sequencer(&projectors, 10);

    let in_flight = sequencer.start_projecting(vec![append("a", "1", 1)]).await.unwrap();
    let queued = sequencer.start_projecting(vec![append("a", "2", 2)]).await.unwrap();

    sequencer.reset().await.unwrap();

    let queued_response = queued.into_iter().next().unwrap().result.await;
    assert!(matches!(
        queued_response,
        ProjectEventsResponse::Reject {
            error: ProjectionError::Cancelled(_)
        }
    ));

    let in_flight_response = in_flight.into_iter().next().unwrap().result.await;
    assert!(matches!(
        in_flight_response,
        ProjectEventsResponse::Reject {
            error: ProjectionError::Cancelled(_)
        }
    ));

    projectors.delay("a".to_string(), Duration::ZERO);
    let after = sequencer.start_projecting(vec![append("a", "3", 3)]).await.unwrap();
    assert_eq!(
        after.into_iter().next().unwrap().result.await,
        ProjectEventsResponse::acknowledge(3)
    );

    assert_eq!(projectors.positions_for(&"a".to_string()), vec![3]);
}

#[tokio::test]
async fn test_shutdown_stops_accepting_work() {
    let projectors = Projectors::new();
    let sequencer = sequencer(&projectors, 10);
    assert!(sequencer.is_running());

    sequencer.shutdown();

    let result = sequencer.start_projecting(vec![append("a", "1", 1)]).await;
    assert_eq!(result.unwrap_err(), ProjectionError::SequencerStopped);
    assert_eq!(projectors.calls(), 0);
}

#[tokio::test]
async fn test_shutdown_rejects_queued_callers() {
    let projectors = Projectors::new();
    projectors.delay("a".to_string(), Duration::from_millis(200));
    let sequencer = sequencer(&projectors, 10);

    let _in_flight = sequencer.start_projecting(vec![append("a", "1", 1)]).await.unwrap();
    let queued = sequencer.start_projecting(vec![append("a", "2", 2)]).await.unwrap();

    sequencer.shutdown();

    let response = queued.into_iter().next().unwrap().result.await;
    assert_eq!(
        response,
        ProjectEventsResponse::reject(ProjectionError::SequencerStopped)
    );
}
