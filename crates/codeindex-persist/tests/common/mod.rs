use async_trait::async_trait;
use codeindex_core::{
    AccessMode, BackendSession, ChunkId, CodeChunk, EdgePayload, GraphBackend, Language,
    MemoryProbe, NodeId, NodePayload, PersistenceError, Result, SessionFactory, VectorBackend,
    VectorPoint,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub fn chunk(path: &str, start: usize) -> CodeChunk {
    CodeChunk {
        id: Uuid::new_v4(),
        file_path: path.to_string(),
        symbol_name: Some(format!("sym_{}", start)),
        content: format!("fn f_{}() {{}}", start),
        start_line: start,
        end_line: start + 5,
        language: Language::Rust,
        embedding: Some(vec![0.5; 8]),
    }
}

pub fn chunks_without_embeddings(path: &str, count: usize) -> Vec<CodeChunk> {
    (0..count)
        .map(|i| CodeChunk {
            embedding: None,
            ..chunk(path, i * 10)
        })
        .collect()
}

/// Memory probe pinned to a fixed utilization level.
pub struct FixedMemory {
    pub percent: f64,
}

impl MemoryProbe for FixedMemory {
    fn used_percent(&self) -> f64 {
        self.percent
    }
    fn used_bytes(&self) -> u64 {
        (self.percent / 100.0 * self.total_bytes() as f64) as u64
    }
    fn total_bytes(&self) -> u64 {
        8 << 30
    }
}

pub struct FakeSession {
    healthy: Arc<AtomicBool>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl BackendSession for FakeSession {
    async fn ping(&self) -> Result<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PersistenceError::Connection("probe failed".into()))
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeSessionFactory {
    pub created: AtomicUsize,
    pub closed: Arc<AtomicUsize>,
    pub healthy: Arc<AtomicBool>,
}

impl FakeSessionFactory {
    pub fn new() -> Self {
        Self {
            created: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
            healthy: Arc::new(AtomicBool::new(true)),
        }
    }
}

#[async_trait]
impl SessionFactory for FakeSessionFactory {
    async fn create_session(&self, _mode: AccessMode) -> Result<Arc<dyn BackendSession>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeSession {
            healthy: Arc::clone(&self.healthy),
            closed: Arc::clone(&self.closed),
        }))
    }
}

/// In-memory graph backend. Batches containing a poisoned id fail wholesale,
/// which is how a backend write rejection looks to the engine.
pub struct FakeGraph {
    pub nodes: DashMap<NodeId, NodePayload>,
    pub edges: Mutex<Vec<EdgePayload>>,
    pub insert_batch_sizes: Mutex<Vec<usize>>,
    pub poisoned: Mutex<HashSet<NodeId>>,
    pub drop_space_supported: bool,
    pub dropped: AtomicBool,
}

impl FakeGraph {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            edges: Mutex::new(Vec::new()),
            insert_batch_sizes: Mutex::new(Vec::new()),
            poisoned: Mutex::new(HashSet::new()),
            drop_space_supported: true,
            dropped: AtomicBool::new(false),
        }
    }

    pub fn without_space_drop() -> Self {
        Self {
            drop_space_supported: false,
            ..Self::new()
        }
    }

    pub fn poison(&self, id: NodeId) {
        self.poisoned.lock().insert(id);
    }

    fn check_poison(&self, nodes: &[NodePayload]) -> Result<()> {
        let poisoned = self.poisoned.lock();
        if nodes.iter().any(|n| poisoned.contains(&n.id)) {
            return Err(PersistenceError::BackendWrite(
                "rejected batch with poisoned node".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl GraphBackend for FakeGraph {
    async fn insert_nodes(
        &self,
        _session: &dyn BackendSession,
        nodes: &[NodePayload],
    ) -> Result<u64> {
        self.insert_batch_sizes.lock().push(nodes.len());
        self.check_poison(nodes)?;
        for node in nodes {
            self.nodes.insert(node.id, node.clone());
        }
        Ok(nodes.len() as u64)
    }

    async fn update_nodes(
        &self,
        _session: &dyn BackendSession,
        nodes: &[NodePayload],
    ) -> Result<u64> {
        self.check_poison(nodes)?;
        for node in nodes {
            self.nodes.insert(node.id, node.clone());
        }
        Ok(nodes.len() as u64)
    }

    async fn delete_nodes(&self, _session: &dyn BackendSession, ids: &[NodeId]) -> Result<u64> {
        let mut deleted = 0;
        for id in ids {
            if self.nodes.remove(id).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn insert_edges(
        &self,
        _session: &dyn BackendSession,
        edges: &[EdgePayload],
    ) -> Result<u64> {
        self.edges.lock().extend_from_slice(edges);
        Ok(edges.len() as u64)
    }

    async fn existing_nodes(
        &self,
        _session: &dyn BackendSession,
        ids: &[NodeId],
    ) -> Result<Vec<NodeId>> {
        Ok(ids
            .iter()
            .filter(|id| self.nodes.contains_key(id))
            .copied()
            .collect())
    }

    async fn node_ids_for_files(
        &self,
        _session: &dyn BackendSession,
        paths: &[String],
    ) -> Result<Vec<NodeId>> {
        let wanted: HashSet<&str> = paths.iter().map(String::as_str).collect();
        Ok(self
            .nodes
            .iter()
            .filter(|entry| {
                ["file_path", "path"].iter().any(|key| {
                    entry
                        .value()
                        .properties
                        .get(*key)
                        .and_then(|v| v.as_str())
                        .is_some_and(|p| wanted.contains(p))
                })
            })
            .map(|entry| *entry.key())
            .collect())
    }

    async fn drop_space(&self, _session: &dyn BackendSession) -> Result<()> {
        if !self.drop_space_supported {
            return Err(PersistenceError::BackendWrite(
                "backend lacks namespace-level drop".into(),
            ));
        }
        self.nodes.clear();
        self.edges.lock().clear();
        self.dropped.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_all_edges(&self, _session: &dyn BackendSession) -> Result<u64> {
        let mut edges = self.edges.lock();
        let count = edges.len() as u64;
        edges.clear();
        Ok(count)
    }

    async fn all_node_ids(&self, _session: &dyn BackendSession) -> Result<Vec<NodeId>> {
        Ok(self.nodes.iter().map(|entry| *entry.key()).collect())
    }

    async fn count_nodes(&self, _session: &dyn BackendSession) -> Result<u64> {
        Ok(self.nodes.len() as u64)
    }
}

pub struct FakeVector {
    pub points: DashMap<ChunkId, VectorPoint>,
    pub drop_supported: bool,
    pub exists: AtomicBool,
    pub recreated: AtomicBool,
}

impl FakeVector {
    pub fn new() -> Self {
        Self {
            points: DashMap::new(),
            drop_supported: true,
            exists: AtomicBool::new(true),
            recreated: AtomicBool::new(false),
        }
    }

    pub fn without_drop() -> Self {
        Self {
            drop_supported: false,
            ..Self::new()
        }
    }
}

#[async_trait]
impl VectorBackend for FakeVector {
    async fn upsert_points(
        &self,
        _session: &dyn BackendSession,
        points: &[VectorPoint],
    ) -> Result<u64> {
        for point in points {
            self.points.insert(point.id, point.clone());
        }
        Ok(points.len() as u64)
    }

    async fn delete_points(&self, _session: &dyn BackendSession, ids: &[ChunkId]) -> Result<u64> {
        let mut deleted = 0;
        for id in ids {
            if self.points.remove(id).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn existing_points(
        &self,
        _session: &dyn BackendSession,
        ids: &[ChunkId],
    ) -> Result<Vec<ChunkId>> {
        Ok(ids
            .iter()
            .filter(|id| self.points.contains_key(id))
            .copied()
            .collect())
    }

    async fn collection_exists(&self, _session: &dyn BackendSession) -> Result<bool> {
        Ok(self.exists.load(Ordering::SeqCst))
    }

    async fn create_collection(
        &self,
        _session: &dyn BackendSession,
        _dimension: usize,
    ) -> Result<()> {
        self.exists.store(true, Ordering::SeqCst);
        self.recreated.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn drop_collection(&self, _session: &dyn BackendSession) -> Result<()> {
        if !self.drop_supported {
            return Err(PersistenceError::BackendWrite(
                "backend lacks collection drop".into(),
            ));
        }
        self.points.clear();
        self.exists.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn all_point_ids(&self, _session: &dyn BackendSession) -> Result<Vec<ChunkId>> {
        Ok(self.points.iter().map(|entry| *entry.key()).collect())
    }

    async fn count_points(&self, _session: &dyn BackendSession) -> Result<u64> {
        Ok(self.points.len() as u64)
    }
}
