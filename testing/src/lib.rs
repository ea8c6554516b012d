//! # docfold testing
//!
//! Testing utilities for docfold projections.
//!
//! This crate provides:
//! - In-memory document and position storage with failure injection
//! - A restartable in-memory position source
//! - Scripted projectors for driving the sequencer without storage
//! - A small fixture event model and projection
//! - Tracing setup for tests
//!
//! ## Example
//!
//! ```ignore
//! use docfold_testing::{InMemoryDocumentStorage, InMemoryPositionSource, ListEvent, ListProjection};
//!
//! #[tokio::test]
//! async fn projects_lists() {
//!     let source = InMemoryPositionSource::from_events([ListEvent::appended("a", "1")]);
//!     let documents = Arc::new(InMemoryDocumentStorage::new());
//!
//!     let mut running = ProjectionRunner::new(
//!         ListProjection::new("lists", source),
//!         documents.clone(),
//!         Arc::new(InMemoryPositionStorage::new()),
//!     )
//!     .start();
//!
//!     running.wait_for_completion(Duration::from_secs(1)).await.unwrap();
//!     assert_eq!(documents.document(&"a".to_string()), Some(vec!["1".to_string()]));
//! }
//! ```

/// Fixture event model and projection
pub mod fixtures;

/// Scripted projector registry
pub mod projectors;

/// In-memory position source
pub mod source;

/// In-memory document and position storage
pub mod storage;

pub use fixtures::{ListDocument, ListEvent, ListProjection, list_handlers};
pub use projectors::ScriptedProjectors;
pub use source::InMemoryPositionSource;
pub use storage::{InMemoryDocumentStorage, InMemoryPositionStorage, StoreCall};

/// Install a fmt subscriber that writes through the test harness.
///
/// Honors `RUST_LOG`, defaulting to `warn`. Safe to call from every test;
/// only the first call installs the subscriber.
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
