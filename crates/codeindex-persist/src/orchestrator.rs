use crate::metrics::{CleanupHandle, ExportFormat, MetricsCollector, ProgressDelta};
use crate::plan;
use crate::pool::{PoolStats, ResourcePool};
use crate::retry::RetryOrchestrator;
use crate::sizer::BatchSizer;
use codeindex_core::{
    AccessMode, AggregateStats, Alert, AlertCategory, BackendSession, BatchKind, BatchOptions,
    ChunkId, CodeChunk, EdgePayload, GraphBackend, MemoryProbe, NodeId, NodePayload, ParsedFile,
    PersistenceError, PersistenceResult, Result, SessionFactory, Settings, Severity, VectorBackend,
    VectorPoint, WritePrimitive,
};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default)]
struct ChunkCounts {
    nodes_created: u64,
    nodes_updated: u64,
    nodes_deleted: u64,
    vectors_created: u64,
    vectors_updated: u64,
    vectors_deleted: u64,
    relationships_created: u64,
}

impl ChunkCounts {
    fn merge(&mut self, other: ChunkCounts) {
        self.nodes_created += other.nodes_created;
        self.nodes_updated += other.nodes_updated;
        self.nodes_deleted += other.nodes_deleted;
        self.vectors_created += other.vectors_created;
        self.vectors_updated += other.vectors_updated;
        self.vectors_deleted += other.vectors_deleted;
        self.relationships_created += other.relationships_created;
    }
}

struct ChunkOutcome {
    counts: ChunkCounts,
    error: Option<String>,
    timed_out: bool,
}

/// Top-level coordinator: turns chunk batches into backend write plans,
/// sizes them adaptively, executes them through the retry layer with pooled
/// sessions, and aggregates partial results. A failed chunk never aborts
/// its siblings; callers inspect `success` and `errors`.
pub struct PersistenceOrchestrator {
    settings: Settings,
    graph: Arc<dyn GraphBackend>,
    vector: Arc<dyn VectorBackend>,
    pool: Arc<ResourcePool>,
    sizer: Arc<BatchSizer>,
    retry: RetryOrchestrator,
    metrics: Arc<MetricsCollector>,
    memory: Arc<dyn MemoryProbe>,
    cleanup: Mutex<Option<CleanupHandle>>,
}

impl PersistenceOrchestrator {
    pub fn new(
        settings: Settings,
        graph: Arc<dyn GraphBackend>,
        vector: Arc<dyn VectorBackend>,
        sessions: Arc<dyn SessionFactory>,
        memory: Arc<dyn MemoryProbe>,
    ) -> Self {
        let sizer = Arc::new(BatchSizer::new(settings.batching.clone()));
        let pool = Arc::new(ResourcePool::new(sessions, settings.pool.clone()));
        let metrics = Arc::new(MetricsCollector::new(
            settings.metrics.clone(),
            Arc::clone(&memory),
        ));
        let cleanup = if settings.metrics.enabled {
            Some(metrics.spawn_cleanup())
        } else {
            None
        };

        Self {
            retry: RetryOrchestrator::new(Arc::clone(&sizer)),
            settings,
            graph,
            vector,
            pool,
            sizer,
            metrics,
            memory,
            cleanup: Mutex::new(cleanup),
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn sizer(&self) -> &Arc<BatchSizer> {
        &self.sizer
    }

    /// Admission control: reject work on memory pressure before any session
    /// is taken or any network I/O happens.
    fn admit(&self) -> Result<()> {
        let used = self.memory.used_percent();
        let threshold = self.settings.batching.memory_threshold_percent;
        if used > threshold {
            return Err(PersistenceError::InsufficientResources(format!(
                "memory at {:.1}% exceeds {:.1}% admission threshold",
                used, threshold
            )));
        }
        Ok(())
    }

    pub async fn store_chunks(
        &self,
        chunks: &[CodeChunk],
        options: &BatchOptions,
    ) -> Result<PersistenceResult> {
        self.admit()?;
        let primitives = plan::plan_store(chunks, options);
        Ok(self
            .execute_plan(BatchKind::Index, chunks.len(), primitives, options.batch_size)
            .await)
    }

    pub async fn store_parsed_files(
        &self,
        files: &[ParsedFile],
        options: &BatchOptions,
    ) -> Result<PersistenceResult> {
        self.admit()?;
        let total: usize = files.iter().map(|f| f.chunks.len()).sum();
        let primitives = plan::plan_store_files(files, options);
        Ok(self
            .execute_plan(BatchKind::File, total, primitives, options.batch_size)
            .await)
    }

    /// Incremental write: a real existence lookup against both backends
    /// partitions the input into updates and creates.
    pub async fn update_chunks(
        &self,
        chunks: &[CodeChunk],
        options: &BatchOptions,
    ) -> Result<PersistenceResult> {
        self.admit()?;
        let ids: Vec<ChunkId> = chunks.iter().map(|c| c.id).collect();

        let session = self.pool.acquire(AccessMode::Read).await?;
        let backend = Arc::clone(session.session());
        let lookups = async {
            let nodes = self.graph.existing_nodes(backend.as_ref(), &ids).await?;
            let points = self.vector.existing_points(backend.as_ref(), &ids).await?;
            Ok::<_, PersistenceError>((nodes, points))
        }
        .await;
        self.pool.release(session).await;
        let (nodes, points) = lookups?;

        let existing_nodes: HashSet<NodeId> = nodes.into_iter().collect();
        let existing_points: HashSet<ChunkId> = points.into_iter().collect();
        let primitives = plan::plan_update(chunks, &existing_nodes, &existing_points, options);
        Ok(self
            .execute_plan(BatchKind::Index, chunks.len(), primitives, options.batch_size)
            .await)
    }

    /// Deletes every node and vector point belonging to the given files,
    /// resolving ids through the graph backend's reverse lookup.
    pub async fn delete_nodes_by_files(&self, paths: &[String]) -> Result<bool> {
        self.admit()?;
        let session = self.pool.acquire(AccessMode::Read).await?;
        let looked_up = self
            .graph
            .node_ids_for_files(session.session().as_ref(), paths)
            .await;
        self.pool.release(session).await;

        let ids = looked_up?;
        if ids.is_empty() {
            return Ok(true);
        }
        let primitives = plan::plan_delete(&ids);
        let result = self
            .execute_plan(BatchKind::Graph, ids.len(), primitives, None)
            .await;
        Ok(result.success)
    }

    /// Clears the graph space. The fast path drops the whole space; when the
    /// backend cannot do that, falls back to an edge sweep followed by a
    /// batched node delete through the normal chunking discipline. Either
    /// way the outcome is verified against the node count.
    pub async fn clear_graph(&self) -> Result<bool> {
        self.admit()?;
        let session = self.pool.acquire(AccessMode::Write).await?;
        let backend = Arc::clone(session.session());
        let sweep_ids = match self.graph.drop_space(backend.as_ref()).await {
            Ok(()) => {
                info!(space = %self.settings.graph.space, "dropped graph space");
                None
            }
            Err(e) => {
                warn!(error = %e, "space drop failed, falling back to batched sweep");
                let swept = async {
                    self.graph.delete_all_edges(backend.as_ref()).await?;
                    self.graph.all_node_ids(backend.as_ref()).await
                }
                .await;
                Some(swept)
            }
        };
        self.pool.release(session).await;

        if let Some(swept) = sweep_ids {
            let ids = swept?;
            if !ids.is_empty() {
                let primitives = plan::plan_delete_nodes(&ids);
                let result = self
                    .execute_plan(BatchKind::Graph, ids.len(), primitives, None)
                    .await;
                if !result.success {
                    return Ok(false);
                }
            }
        }
        self.graph_is_empty().await
    }

    /// Clears the vector collection: drop-and-recreate, or a batched point
    /// sweep when the backend refuses the drop. Verified against the point
    /// count.
    pub async fn clear_collection(&self) -> Result<bool> {
        self.admit()?;
        let session = self.pool.acquire(AccessMode::Write).await?;
        let backend = Arc::clone(session.session());
        let prepared = match self.vector.drop_collection(backend.as_ref()).await {
            Ok(()) => {
                let recreated = async {
                    if !self.vector.collection_exists(backend.as_ref()).await? {
                        self.vector
                            .create_collection(backend.as_ref(), self.settings.vector.dimension)
                            .await?;
                        info!(
                            collection = %self.settings.vector.collection,
                            "recreated vector collection"
                        );
                    }
                    Ok::<Option<Vec<ChunkId>>, PersistenceError>(None)
                }
                .await;
                recreated
            }
            Err(e) => {
                warn!(error = %e, "collection drop failed, falling back to batched sweep");
                self.vector.all_point_ids(backend.as_ref()).await.map(Some)
            }
        };
        self.pool.release(session).await;

        if let Some(ids) = prepared? {
            if !ids.is_empty() {
                let primitives = plan::plan_delete_vectors(&ids);
                let result = self
                    .execute_plan(BatchKind::Vector, ids.len(), primitives, None)
                    .await;
                if !result.success {
                    return Ok(false);
                }
            }
        }
        self.collection_is_empty().await
    }

    async fn graph_is_empty(&self) -> Result<bool> {
        let session = self.pool.acquire(AccessMode::Read).await?;
        let count = self.graph.count_nodes(session.session().as_ref()).await;
        self.pool.release(session).await;
        Ok(count? == 0)
    }

    async fn collection_is_empty(&self) -> Result<bool> {
        let session = self.pool.acquire(AccessMode::Read).await?;
        let count = self.vector.count_points(session.session().as_ref()).await;
        self.pool.release(session).await;
        Ok(count? == 0)
    }

    pub fn get_stats(&self, lookback: Option<std::time::Duration>) -> AggregateStats {
        self.metrics.stats(lookback)
    }

    pub fn get_recent_alerts(&self, limit: usize) -> Vec<Alert> {
        self.metrics.recent_alerts(limit)
    }

    pub fn export_metrics(&self, format: ExportFormat) -> Result<String> {
        self.metrics.export(format)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.monitor().snapshot()
    }

    /// Stops the retention task and closes the pool. Idempotent.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.cleanup.lock().take() {
            handle.stop();
        }
        self.pool.close().await;
    }

    async fn execute_plan(
        &self,
        kind: BatchKind,
        total_items: usize,
        primitives: Vec<WritePrimitive>,
        batch_override: Option<usize>,
    ) -> PersistenceResult {
        let started = Instant::now();
        let op_id = Uuid::new_v4();
        let total_primitives = primitives.len();

        // An explicit override bypasses the sizer but never the hard bounds.
        let hard_max = self
            .settings
            .batching
            .max_batch_size
            .min(total_primitives.max(1));
        let size = match batch_override {
            Some(requested) => requested.clamp(1, hard_max),
            None => self
                .sizer
                .next_batch_size(total_primitives, Some(self.memory.used_percent())),
        };
        self.metrics.start(op_id, kind, size);

        let chunks = plan::chunk_primitives(primitives, size);
        let outcomes: Vec<ChunkOutcome> = stream::iter(chunks.into_iter().enumerate())
            .map(|(index, chunk)| self.run_chunk(op_id, kind, index, chunk))
            .buffer_unordered(self.settings.batching.max_concurrent_operations)
            .collect()
            .await;

        let mut counts = ChunkCounts::default();
        let mut errors = Vec::new();
        let mut timed_out = false;
        for outcome in outcomes {
            counts.merge(outcome.counts);
            timed_out |= outcome.timed_out;
            if let Some(error) = outcome.error {
                errors.push(error);
            }
        }
        if timed_out {
            self.metrics.mark_timeout(op_id);
        }

        let success = errors.is_empty();
        self.metrics.end(op_id, success);

        let mut result = PersistenceResult::empty(total_items);
        result.success = success;
        result.nodes_created = counts.nodes_created;
        result.nodes_updated = counts.nodes_updated;
        result.nodes_deleted = counts.nodes_deleted;
        result.vectors_created = counts.vectors_created;
        result.vectors_updated = counts.vectors_updated;
        result.vectors_deleted = counts.vectors_deleted;
        result.relationships_created = counts.relationships_created;
        result.processing_time = started.elapsed();
        result.errors = errors;
        result
    }

    async fn run_chunk(
        &self,
        op_id: Uuid,
        kind: BatchKind,
        index: usize,
        chunk: Vec<WritePrimitive>,
    ) -> ChunkOutcome {
        let chunk_len = chunk.len() as u64;

        let session = match self.pool.acquire(AccessMode::Write).await {
            Ok(session) => session,
            Err(e) => {
                let message = format!("chunk {}: session unavailable: {}", index, e);
                self.fail_chunk(op_id, chunk_len, 0, &message);
                return ChunkOutcome {
                    counts: ChunkCounts::default(),
                    error: Some(message),
                    timed_out: false,
                };
            }
        };

        let label = format!("{}-chunk-{}", kind, index);
        let retries = AtomicU64::new(0);
        let result = self
            .retry
            .execute(
                &label,
                chunk.len(),
                self.settings.batching.retry_attempts,
                self.settings.batching.processing_timeout(),
                |attempt| {
                    retries.fetch_max(attempt as u64, Ordering::Relaxed);
                    let chunk = chunk.clone();
                    let backend = Arc::clone(session.session());
                    async move { self.apply_chunk(backend.as_ref(), &chunk).await }
                },
            )
            .await;
        self.pool.release(session).await;

        let retry_count = retries.load(Ordering::Relaxed);
        match result {
            Ok(counts) => {
                self.metrics.update(
                    op_id,
                    ProgressDelta {
                        processed: chunk_len,
                        success: chunk_len,
                        error: 0,
                        retry: retry_count,
                    },
                );
                ChunkOutcome {
                    counts,
                    error: None,
                    timed_out: false,
                }
            }
            Err(e) => {
                let timed_out = matches!(e, PersistenceError::OperationTimeout(_));
                let message = format!("chunk {}: {}", index, e);
                self.fail_chunk(op_id, chunk_len, retry_count, &message);
                ChunkOutcome {
                    counts: ChunkCounts::default(),
                    error: Some(message),
                    timed_out,
                }
            }
        }
    }

    fn fail_chunk(&self, op_id: Uuid, chunk_len: u64, retry_count: u64, message: &str) {
        self.metrics.update(
            op_id,
            ProgressDelta {
                processed: chunk_len,
                success: 0,
                error: chunk_len,
                retry: retry_count,
            },
        );
        self.metrics.record_alert(Alert::new(
            AlertCategory::Error,
            Severity::High,
            message,
            Some(op_id),
        ));
    }

    /// Executes one chunk against the backends over the chunk's pooled
    /// session, grouped by primitive type so each backend sees one batched
    /// call per type. Any backend error fails the whole chunk attempt; the
    /// retry layer decides what happens next.
    async fn apply_chunk(
        &self,
        session: &dyn BackendSession,
        primitives: &[WritePrimitive],
    ) -> Result<ChunkCounts> {
        let mut node_inserts: Vec<NodePayload> = Vec::new();
        let mut node_updates: Vec<NodePayload> = Vec::new();
        let mut node_deletes: Vec<NodeId> = Vec::new();
        let mut edge_inserts: Vec<EdgePayload> = Vec::new();
        let mut new_points: Vec<VectorPoint> = Vec::new();
        let mut updated_points: Vec<VectorPoint> = Vec::new();
        let mut point_deletes: Vec<ChunkId> = Vec::new();

        for primitive in primitives {
            match primitive {
                WritePrimitive::NodeInsert(node) => node_inserts.push(node.clone()),
                WritePrimitive::NodeUpdate(node) => node_updates.push(node.clone()),
                WritePrimitive::NodeDelete(id) => node_deletes.push(*id),
                WritePrimitive::EdgeInsert(edge) => edge_inserts.push(edge.clone()),
                WritePrimitive::VectorUpsert { point, existing } => {
                    if *existing {
                        updated_points.push(point.clone());
                    } else {
                        new_points.push(point.clone());
                    }
                }
                WritePrimitive::VectorDelete(id) => point_deletes.push(*id),
            }
        }

        let mut counts = ChunkCounts::default();
        if !node_inserts.is_empty() {
            counts.nodes_created += self.graph.insert_nodes(session, &node_inserts).await?;
        }
        if !node_updates.is_empty() {
            counts.nodes_updated += self.graph.update_nodes(session, &node_updates).await?;
        }
        if !node_deletes.is_empty() {
            counts.nodes_deleted += self.graph.delete_nodes(session, &node_deletes).await?;
        }
        if !edge_inserts.is_empty() {
            counts.relationships_created +=
                self.graph.insert_edges(session, &edge_inserts).await?;
        }
        if !new_points.is_empty() {
            counts.vectors_created += self.vector.upsert_points(session, &new_points).await?;
        }
        if !updated_points.is_empty() {
            counts.vectors_updated += self.vector.upsert_points(session, &updated_points).await?;
        }
        if !point_deletes.is_empty() {
            counts.vectors_deleted += self.vector.delete_points(session, &point_deletes).await?;
        }
        Ok(counts)
    }
}
