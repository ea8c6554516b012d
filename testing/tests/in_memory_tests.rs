//! Tests for the in-memory backends and the fixture projection.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use docfold_core::cancel::CancellationToken;
use docfold_core::error::ProjectionError;
use docfold_core::event::EventWithPosition;
use docfold_core::handler::ProjectionSetup;
use docfold_core::projection::PositionSource;
use docfold_core::storage::{DocumentStorage, DocumentToDelete, DocumentToStore, PositionStorage};
use docfold_testing::{
    InMemoryDocumentStorage, InMemoryPositionSource, InMemoryPositionStorage, ListEvent, StoreCall,
    list_handlers,
};
use futures::StreamExt;

#[tokio::test]
async fn test_document_storage_upserts_and_deletes() {
    let storage = InMemoryDocumentStorage::<String, Vec<u32>>::new();
    storage.insert("gone".to_string(), &vec![1]);

    storage
        .store(
            vec![DocumentToStore::new("kept".to_string(), vec![1, 2])],
            vec![DocumentToDelete::new("gone".to_string())],
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(storage.document(&"kept".to_string()), Some(vec![1, 2]));
    assert_eq!(storage.document(&"gone".to_string()), None);
    assert_eq!(
        storage.store_calls(),
        vec![StoreCall {
            upserted: vec!["kept".to_string()],
            deleted: vec!["gone".to_string()],
        }]
    );
}

#[tokio::test]
async fn test_document_storage_injected_failures() {
    let storage = InMemoryDocumentStorage::<String, Vec<u32>>::new();
    storage.fail_next_stores(1);
    storage.fail_next_loads(1);

    let id = "a".to_string();
    let cancel = CancellationToken::new();

    assert!(matches!(
        storage.load_document(&id, &cancel).await,
        Err(ProjectionError::Storage(_))
    ));
    assert_eq!(storage.load_document(&id, &cancel).await.unwrap().document, None);

    let failed = storage
        .store(vec![DocumentToStore::new(id.clone(), vec![1])], Vec::new(), cancel.clone())
        .await;
    assert!(matches!(failed, Err(ProjectionError::Storage(_))));
    assert!(storage.is_empty());

    storage
        .store(vec![DocumentToStore::new(id.clone(), vec![1])], Vec::new(), cancel)
        .await
        .unwrap();
    assert_eq!(storage.len(), 1);
    assert_eq!(storage.load_count(), 2);
}

#[tokio::test]
async fn test_document_storage_refuses_cancelled_writes() {
    let storage = InMemoryDocumentStorage::<String, Vec<u32>>::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = storage
        .store(vec![DocumentToStore::new("a".to_string(), vec![1])], Vec::new(), cancel)
        .await;

    assert!(result.unwrap_err().is_cancellation());
    assert!(storage.store_calls().is_empty());
}

#[tokio::test]
async fn test_position_storage_never_moves_backwards() {
    let positions = InMemoryPositionStorage::new();

    assert_eq!(positions.load_latest_position("p").await.unwrap(), None);
    assert_eq!(positions.store_latest_position("p", Some(5)).await.unwrap(), Some(5));
    assert_eq!(positions.store_latest_position("p", Some(3)).await.unwrap(), Some(5));
    assert_eq!(positions.load_latest_position("p").await.unwrap(), Some(5));
    assert_eq!(positions.load_latest_position("other").await.unwrap(), None);

    positions.fail_next_stores(1);
    assert!(matches!(
        positions.store_latest_position("p", Some(9)).await,
        Err(ProjectionError::Checkpoint(_))
    ));
    assert_eq!(positions.position("p"), Some(5));
    assert_eq!(positions.commits().len(), 3);
}

#[tokio::test]
async fn test_position_source_resumes_after_position() {
    let source = InMemoryPositionSource::from_events(["a", "b", "c"]);
    let pushed = source.push("d");
    assert_eq!(pushed, 4);

    let all: Vec<_> = source.start_from(None).collect().await;
    assert_eq!(all.len(), 4);

    let rest: Vec<&str> = source
        .start_from(Some(2))
        .map(|event| event.unwrap().event)
        .collect()
        .await;
    assert_eq!(rest, vec!["c", "d"]);
    assert_eq!(source.starts(), vec![None, Some(2)]);
}

#[tokio::test]
async fn test_position_source_fails_once() {
    let source = InMemoryPositionSource::from_events([1, 2, 3]);
    source.fail_once_at(2);

    let first: Vec<_> = source.start_from(None).collect().await;
    assert_eq!(first.len(), 2);
    assert!(first[0].is_ok());
    assert!(matches!(first[1], Err(ProjectionError::EventProcessing(_))));

    let second: Vec<_> = source.start_from(Some(1)).collect().await;
    assert_eq!(
        second.into_iter().map(Result::unwrap).collect::<Vec<_>>(),
        vec![EventWithPosition::new(2, 2), EventWithPosition::new(3, 3)]
    );
}

#[tokio::test]
async fn test_fixture_handlers_fold_and_route() {
    let handler = list_handlers(ProjectionSetup::new()).build();
    let cancel = CancellationToken::new();

    let appended = ListEvent::appended("a", "1");
    assert_eq!(handler.document_id_from(&appended).id(), Some(&"a".to_string()));
    assert!(!handler.document_id_from(&ListEvent::Unrelated).is_usable());

    let (document, handled) = handler.handle(None, &appended, 1, &cancel).await.unwrap();
    assert!(handled);
    assert_eq!(document, Some(vec!["1".to_string()]));

    let (cleared, handled) = handler
        .handle(document, &ListEvent::cleared("a"), 2, &cancel)
        .await
        .unwrap();
    assert!(handled);
    assert_eq!(cleared, None);

    let (missing, handled) = handler
        .handle(None, &ListEvent::cleared("a"), 3, &cancel)
        .await
        .unwrap();
    assert!(!handled);
    assert_eq!(missing, None);

    let batch = ListEvent::Batch {
        parts: vec![ListEvent::appended("a", "x"), ListEvent::cleared("b")],
    };
    assert_eq!(handler.transform(&batch).len(), 2);
}
