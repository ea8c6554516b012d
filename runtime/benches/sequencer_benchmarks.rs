//! Sequencer and write coalescer benchmarks
//!
//! - Routing: transform + document id extraction per event
//! - Sequencing: one chunk of events across many document ids, end to end
//!   through scripted projectors
//! - Coalescing: concurrent single-document writes merged into batches
//!
//! Run with: `cargo bench`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use docfold_core::cancel::CancellationToken;
use docfold_core::event::EventWithPosition;
use docfold_core::handler::{ProjectionSetup, RouteEvents};
use docfold_core::storage::{DocumentStorage, DocumentToStore};
use docfold_runtime::{
    BatchedDocumentStorage, BatchedStorageConfig, EventBatchingStrategy, ProjectionConfig, Sequencer,
};
use docfold_testing::{InMemoryDocumentStorage, ListEvent, ScriptedProjectors, list_handlers};
use std::sync::Arc;

fn events(count: u64, ids: u64) -> Vec<EventWithPosition<ListEvent>> {
    (1..=count)
        .map(|position| {
            let id = format!("doc-{}", position % ids);
            EventWithPosition::new(ListEvent::appended(&id, "v"), position)
        })
        .collect()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime")
}

/// Benchmark routing of single events
fn benchmark_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing");
    group.throughput(Throughput::Elements(1));

    let handler = list_handlers(ProjectionSetup::new()).build();
    let appended = ListEvent::appended("doc-1", "v");
    let batch = ListEvent::Batch {
        parts: vec![ListEvent::appended("doc-1", "v"), ListEvent::appended("doc-2", "v")],
    };

    group.bench_function("document_id", |b| {
        b.iter(|| handler.document_id_from(black_box(&appended)));
    });

    group.bench_function("transform_batch", |b| {
        b.iter(|| handler.transform(black_box(&batch)));
    });

    group.finish();
}

/// Benchmark a full chunk through the sequencer
fn benchmark_sequencing(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequencing");
    let runtime = runtime();

    for ids in [1u64, 10, 100] {
        let chunk = events(1_000, ids);
        group.throughput(Throughput::Elements(chunk.len() as u64));

        let _guard = runtime.enter();
        let router: Arc<dyn RouteEvents<String, ListEvent>> =
            Arc::new(list_handlers(ProjectionSetup::new()).build());
        let projectors = ScriptedProjectors::<String, ListEvent>::new();
        projectors.stop_recording();
        let config = ProjectionConfig::default().with_event_batching(EventBatchingStrategy::new(1_000, 16));
        let sequencer = Sequencer::spawn(router, Arc::new(projectors), &config);

        group.bench_with_input(BenchmarkId::new("chunk_1000", ids), &chunk, |b, chunk| {
            b.to_async(&runtime).iter(|| async {
                let tasks = sequencer
                    .start_projecting(chunk.clone())
                    .await
                    .expect("Sequencer stopped");
                for task in tasks {
                    black_box(task.result.await);
                }
            });
        });

        sequencer.shutdown();
    }

    group.finish();
}

/// Benchmark concurrent writes through the coalescer
fn benchmark_coalescing(c: &mut Criterion) {
    let mut group = c.benchmark_group("coalescing");
    let runtime = runtime();

    for writers in [10usize, 100] {
        group.throughput(Throughput::Elements(writers as u64));

        let _guard = runtime.enter();
        let inner = Arc::new(InMemoryDocumentStorage::<String, Vec<String>>::new());
        let storage = Arc::new(BatchedDocumentStorage::new(
            inner,
            BatchedStorageConfig::default().with_parallelism(4),
        ));

        group.bench_with_input(BenchmarkId::new("writers", writers), &writers, |b, &writers| {
            b.to_async(&runtime).iter(|| async {
                let writes = (0..writers).map(|n| {
                    storage.store(
                        vec![DocumentToStore::new(format!("doc-{n}"), vec!["v".to_string()])],
                        Vec::new(),
                        CancellationToken::new(),
                    )
                });
                for result in futures::future::join_all(writes).await {
                    result.expect("Write failed");
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_routing,
    benchmark_sequencing,
    benchmark_coalescing,
);
criterion_main!(benches);
