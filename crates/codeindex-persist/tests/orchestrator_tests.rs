mod common;

use codeindex_persist::{ExportFormat, PersistenceOrchestrator};
use codeindex_core::{BatchOptions, MemoryProbe, PersistenceError, Settings};
use common::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.batching.retry_attempts = 2;
    settings.batching.retry_delay_ms = 1;
    settings.batching.processing_timeout_ms = 5_000;
    settings.pool.acquire_timeout_ms = 1_000;
    settings.metrics.enabled = false;
    settings
}

struct Fixture {
    orchestrator: PersistenceOrchestrator,
    graph: Arc<FakeGraph>,
    vector: Arc<FakeVector>,
    sessions: Arc<FakeSessionFactory>,
}

fn fixture_with(settings: Settings, graph: FakeGraph, vector: FakeVector) -> Fixture {
    let graph = Arc::new(graph);
    let vector = Arc::new(vector);
    let sessions = Arc::new(FakeSessionFactory::new());
    let memory: Arc<dyn MemoryProbe> = Arc::new(FixedMemory { percent: 60.0 });
    let orchestrator = PersistenceOrchestrator::new(
        settings,
        graph.clone(),
        vector.clone(),
        sessions.clone(),
        memory,
    );
    Fixture {
        orchestrator,
        graph,
        vector,
        sessions,
    }
}

fn fixture() -> Fixture {
    fixture_with(test_settings(), FakeGraph::new(), FakeVector::new())
}

#[tokio::test]
async fn end_to_end_splits_250_chunks_into_three_executions() {
    let fx = fixture();
    let chunks = chunks_without_embeddings("src/big.rs", 250);
    let options = BatchOptions {
        create_relationships: false,
        ..BatchOptions::default()
    };

    let result = fx.orchestrator.store_chunks(&chunks, &options).await.unwrap();

    assert!(result.success);
    assert_eq!(result.total_chunks, 250);
    assert_eq!(result.nodes_created, 250);
    assert_eq!(result.errors.len(), 0);

    // 250 node primitives at the default batch size of 100: 100, 100, 50.
    let mut sizes = fx.graph.insert_batch_sizes.lock().clone();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![50, 100, 100]);

    // The whole call is one timed metrics record.
    let stats = fx.orchestrator.get_stats(None);
    assert_eq!(stats.operation_count, 1);
}

#[tokio::test]
async fn store_creates_nodes_vectors_and_relationships() {
    let fx = fixture();
    let chunks = vec![chunk("src/lib.rs", 1), chunk("src/lib.rs", 30)];

    let result = fx
        .orchestrator
        .store_chunks(&chunks, &BatchOptions::default())
        .await
        .unwrap();

    assert!(result.success);
    // Two chunk nodes plus the file node.
    assert_eq!(result.nodes_created, 3);
    assert_eq!(result.vectors_created, 2);
    // Two contains edges and one follows edge.
    assert_eq!(result.relationships_created, 3);
    assert_eq!(fx.vector.points.len(), 2);
}

#[tokio::test]
async fn store_parsed_files_flattens_chunks() {
    let fx = fixture();
    let files = vec![codeindex_core::ParsedFile {
        path: "src/a.rs".to_string(),
        language: codeindex_core::Language::Rust,
        content_hash: "abc123".to_string(),
        chunks: vec![chunk("src/a.rs", 1), chunk("src/a.rs", 40)],
    }];

    let result = fx
        .orchestrator
        .store_parsed_files(&files, &BatchOptions::default())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.total_chunks, 2);
    assert_eq!(result.vectors_created, 2);
}

#[tokio::test]
async fn partial_failure_keeps_sibling_chunks_and_reports_errors() {
    let fx = fixture();
    let chunks = chunks_without_embeddings("src/mixed.rs", 30);
    // Middle chunk of three (items 10..20 at batch size 10) is poisoned.
    fx.graph.poison(chunks[15].id);

    let options = BatchOptions {
        create_relationships: false,
        batch_size: Some(10),
        ..BatchOptions::default()
    };
    let result = fx.orchestrator.store_chunks(&chunks, &options).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.nodes_created, 20);
    assert!(!result.errors.is_empty());

    // The failure is also visible as an alert.
    assert!(!fx.orchestrator.get_recent_alerts(10).is_empty());
}

#[tokio::test]
async fn update_diff_is_idempotent() {
    let fx = fixture();
    let chunks = vec![chunk("src/up.rs", 1), chunk("src/up.rs", 20), chunk("src/up.rs", 40)];
    let options = BatchOptions {
        create_relationships: false,
        ..BatchOptions::default()
    };

    let first = fx.orchestrator.update_chunks(&chunks, &options).await.unwrap();
    assert!(first.success);
    assert_eq!(first.nodes_created, 3);
    assert_eq!(first.nodes_updated, 0);
    assert_eq!(first.vectors_created, 3);
    assert_eq!(first.vectors_updated, 0);

    // Second pass finds everything, so every item routes to update.
    let second = fx.orchestrator.update_chunks(&chunks, &options).await.unwrap();
    assert!(second.success);
    assert_eq!(second.nodes_created, 0);
    assert_eq!(second.nodes_updated, 3);
    assert_eq!(second.vectors_created, 0);
    assert_eq!(second.vectors_updated, 3);
}

#[tokio::test]
async fn admission_check_rejects_before_any_io() {
    let graph = Arc::new(FakeGraph::new());
    let vector = Arc::new(FakeVector::new());
    let sessions = Arc::new(FakeSessionFactory::new());
    let orchestrator = PersistenceOrchestrator::new(
        test_settings(),
        graph.clone(),
        vector.clone(),
        sessions.clone(),
        Arc::new(FixedMemory { percent: 92.0 }),
    );

    let err = orchestrator
        .store_chunks(&[chunk("src/x.rs", 1)], &BatchOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, PersistenceError::InsufficientResources(_)));
    assert!(graph.nodes.is_empty());
    assert_eq!(sessions.created.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn delete_by_files_removes_nodes_and_vectors() {
    let fx = fixture();
    let keep = chunk("src/keep.rs", 1);
    let drop_a = chunk("src/gone.rs", 1);
    let drop_b = chunk("src/gone.rs", 30);
    let all = vec![keep.clone(), drop_a, drop_b];
    let options = BatchOptions {
        create_relationships: false,
        ..BatchOptions::default()
    };
    fx.orchestrator.store_chunks(&all, &options).await.unwrap();

    let ok = fx
        .orchestrator
        .delete_nodes_by_files(&["src/gone.rs".to_string()])
        .await
        .unwrap();

    assert!(ok);
    assert_eq!(fx.graph.nodes.len(), 1);
    assert!(fx.graph.nodes.contains_key(&keep.id));
    assert_eq!(fx.vector.points.len(), 1);
}

#[tokio::test]
async fn delete_by_unknown_file_is_a_successful_noop() {
    let fx = fixture();
    let ok = fx
        .orchestrator
        .delete_nodes_by_files(&["src/never_indexed.rs".to_string()])
        .await
        .unwrap();
    assert!(ok);
}

#[tokio::test]
async fn clear_graph_uses_fast_path_when_available() {
    let fx = fixture();
    fx.orchestrator
        .store_chunks(&[chunk("src/a.rs", 1)], &BatchOptions::default())
        .await
        .unwrap();

    assert!(fx.orchestrator.clear_graph().await.unwrap());
    assert!(fx.graph.dropped.load(Ordering::SeqCst));
    assert!(fx.graph.nodes.is_empty());
}

#[tokio::test]
async fn clear_graph_falls_back_to_batched_sweep() {
    let fx = fixture_with(test_settings(), FakeGraph::without_space_drop(), FakeVector::new());
    let chunks: Vec<_> = (0..25).map(|i| chunk("src/sweep.rs", i * 10)).collect();
    fx.orchestrator
        .store_chunks(&chunks, &BatchOptions::default())
        .await
        .unwrap();
    assert!(!fx.graph.nodes.is_empty());

    assert!(fx.orchestrator.clear_graph().await.unwrap());
    assert!(fx.graph.nodes.is_empty());
    assert!(fx.graph.edges.lock().is_empty());
    assert!(!fx.graph.dropped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn clear_collection_recreates_or_sweeps() {
    let fx = fixture();
    fx.orchestrator
        .store_chunks(&[chunk("src/v.rs", 1)], &BatchOptions::default())
        .await
        .unwrap();
    assert!(fx.orchestrator.clear_collection().await.unwrap());
    assert!(fx.vector.points.is_empty());
    assert!(fx.vector.recreated.load(Ordering::SeqCst));

    let sweep = fixture_with(test_settings(), FakeGraph::new(), FakeVector::without_drop());
    sweep
        .orchestrator
        .store_chunks(&[chunk("src/w.rs", 1)], &BatchOptions::default())
        .await
        .unwrap();
    assert!(sweep.orchestrator.clear_collection().await.unwrap());
    assert!(sweep.vector.points.is_empty());
}

#[tokio::test]
async fn metrics_surface_through_the_orchestrator() {
    let fx = fixture();
    fx.orchestrator
        .store_chunks(&[chunk("src/m.rs", 1)], &BatchOptions::default())
        .await
        .unwrap();

    let stats = fx.orchestrator.get_stats(None);
    assert_eq!(stats.operation_count, 1);
    assert!(stats.mean_throughput > 0.0);

    let json = fx.orchestrator.export_metrics(ExportFormat::Json).unwrap();
    assert!(json.contains("\"processed\""));
    let csv = fx.orchestrator.export_metrics(ExportFormat::Csv).unwrap();
    assert!(csv.starts_with("id,kind"));
}

#[tokio::test]
async fn shutdown_reports_pool_failures_as_chunk_errors() {
    let fx = fixture();
    fx.orchestrator.shutdown().await;

    let result = fx
        .orchestrator
        .store_chunks(&[chunk("src/s.rs", 1)], &BatchOptions::default())
        .await
        .unwrap();
    assert!(!result.success);
    assert!(result.errors.iter().any(|e| e.contains("session unavailable")));
    // No session means no channel to the backend, so nothing was written.
    assert!(fx.graph.nodes.is_empty());
    assert!(fx.vector.points.is_empty());
}

#[tokio::test]
async fn update_lookups_run_over_a_pooled_session() {
    let fx = fixture();
    fx.orchestrator.shutdown().await;

    // The existence lookup needs a session just like the writes do.
    let err = fx
        .orchestrator
        .update_chunks(&[chunk("src/u.rs", 1)], &BatchOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PersistenceError::Connection(_)));
}

#[tokio::test]
async fn batch_size_override_respects_configured_maximum() {
    let mut settings = test_settings();
    settings.batching.default_batch_size = 40;
    settings.batching.max_batch_size = 50;
    let fx = fixture_with(settings, FakeGraph::new(), FakeVector::new());

    let chunks = chunks_without_embeddings("src/huge.rs", 120);
    let options = BatchOptions {
        create_relationships: false,
        batch_size: Some(500),
        ..BatchOptions::default()
    };
    let result = fx.orchestrator.store_chunks(&chunks, &options).await.unwrap();

    assert!(result.success);
    assert_eq!(result.nodes_created, 120);
    let sizes = fx.graph.insert_batch_sizes.lock().clone();
    assert_eq!(sizes.iter().sum::<usize>(), 120);
    assert!(sizes.iter().all(|s| *s <= 50));
}

#[tokio::test]
async fn sessions_are_reused_across_chunks() {
    let fx = fixture();
    let chunks = chunks_without_embeddings("src/reuse.rs", 40);
    let options = BatchOptions {
        create_relationships: false,
        batch_size: Some(10),
        ..BatchOptions::default()
    };
    fx.orchestrator.store_chunks(&chunks, &options).await.unwrap();

    // Four chunks with at most four concurrent executions never need more
    // sessions than the concurrency limit.
    assert!(fx.sessions.created.load(Ordering::SeqCst) <= 4);
    let stats = fx.orchestrator.pool_stats();
    assert_eq!(stats.acquired, stats.released);
}
