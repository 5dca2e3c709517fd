use crate::{ChunkId, EdgePayload, NodeId, NodePayload, Result, VectorPoint};
use async_trait::async_trait;
use std::sync::Arc;

/// Capability interface over the external graph database client. The query
/// dialect (Cypher vs. nGQL) is an implementation detail chosen once at
/// client construction; the engine never branches on it per call. Every
/// operation executes over a session borrowed from the resource pool, so
/// writes and lookups share the same connection discipline.
#[async_trait]
pub trait GraphBackend: Send + Sync {
    async fn insert_nodes(
        &self,
        session: &dyn BackendSession,
        nodes: &[NodePayload],
    ) -> Result<u64>;
    async fn update_nodes(
        &self,
        session: &dyn BackendSession,
        nodes: &[NodePayload],
    ) -> Result<u64>;
    async fn delete_nodes(&self, session: &dyn BackendSession, ids: &[NodeId]) -> Result<u64>;
    async fn insert_edges(
        &self,
        session: &dyn BackendSession,
        edges: &[EdgePayload],
    ) -> Result<u64>;

    /// Existence lookup driving the incremental create/update diff.
    async fn existing_nodes(
        &self,
        session: &dyn BackendSession,
        ids: &[NodeId],
    ) -> Result<Vec<NodeId>>;

    /// Reverse lookup used when deleting by file path.
    async fn node_ids_for_files(
        &self,
        session: &dyn BackendSession,
        paths: &[String],
    ) -> Result<Vec<NodeId>>;

    /// Fast destructive clear; backends without namespace-level drop return
    /// an error and the orchestrator falls back to a batched sweep.
    async fn drop_space(&self, session: &dyn BackendSession) -> Result<()>;
    async fn delete_all_edges(&self, session: &dyn BackendSession) -> Result<u64>;
    async fn all_node_ids(&self, session: &dyn BackendSession) -> Result<Vec<NodeId>>;

    async fn count_nodes(&self, session: &dyn BackendSession) -> Result<u64>;
}

/// Capability interface over the external vector database client, bound to
/// one collection at construction.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    async fn upsert_points(
        &self,
        session: &dyn BackendSession,
        points: &[VectorPoint],
    ) -> Result<u64>;
    async fn delete_points(&self, session: &dyn BackendSession, ids: &[ChunkId]) -> Result<u64>;
    async fn existing_points(
        &self,
        session: &dyn BackendSession,
        ids: &[ChunkId],
    ) -> Result<Vec<ChunkId>>;

    async fn collection_exists(&self, session: &dyn BackendSession) -> Result<bool>;
    async fn create_collection(
        &self,
        session: &dyn BackendSession,
        dimension: usize,
    ) -> Result<()>;
    async fn drop_collection(&self, session: &dyn BackendSession) -> Result<()>;
    async fn all_point_ids(&self, session: &dyn BackendSession) -> Result<Vec<ChunkId>>;

    async fn count_points(&self, session: &dyn BackendSession) -> Result<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// A live backend connection context lent out by the resource pool and
/// passed into every backend call made on its holder's behalf.
#[async_trait]
pub trait BackendSession: Send + Sync {
    /// Lightweight health probe run on release; failing sessions are
    /// discarded instead of returned to the idle set.
    async fn ping(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create_session(&self, mode: AccessMode) -> Result<Arc<dyn BackendSession>>;
}

/// Source of current memory pressure readings. Production code uses the
/// sysinfo-backed monitor; tests substitute a fixed probe.
pub trait MemoryProbe: Send + Sync {
    fn used_percent(&self) -> f64;
    fn used_bytes(&self) -> u64;
    fn total_bytes(&self) -> u64;
}
