use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

pub type ChunkId = Uuid;
pub type NodeId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    Rust,
    TypeScript,
    JavaScript,
    Python,
    Go,
    Java,
    Cpp,
    Other(String),
}

/// One semantically coherent slice of a source file, as produced by the
/// upstream parser. The optional embedding is attached by the embedding
/// pipeline before the chunk reaches the persistence engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeChunk {
    pub id: ChunkId,
    pub file_path: String,
    pub symbol_name: Option<String>,
    pub content: String,
    pub start_line: usize,
    pub end_line: usize,
    pub language: Language,
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedFile {
    pub path: String,
    pub language: Language,
    pub content_hash: String,
    pub chunks: Vec<CodeChunk>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchKind {
    Index,
    Vector,
    Graph,
    File,
}

impl fmt::Display for BatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchKind::Index => "index",
            BatchKind::Vector => "vector",
            BatchKind::Graph => "graph",
            BatchKind::File => "file",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for BatchKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "index" => Ok(BatchKind::Index),
            "vector" => Ok(BatchKind::Vector),
            "graph" => Ok(BatchKind::Graph),
            "file" => Ok(BatchKind::File),
            other => Err(format!("unknown batch kind: {}", other)),
        }
    }
}

/// Caller-supplied options for one top-level batch operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOptions {
    pub project_id: Option<String>,
    pub create_relationships: bool,
    /// When set, bypasses the adaptive sizer (still clamped to the total).
    pub batch_size: Option<usize>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            project_id: None,
            create_relationships: true,
            batch_size: None,
        }
    }
}

/// Aggregated outcome of one top-level persistence call. Immutable once
/// returned; per-chunk failures land in `errors` rather than aborting
/// sibling chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceResult {
    pub success: bool,
    pub nodes_created: u64,
    pub nodes_updated: u64,
    pub nodes_deleted: u64,
    pub vectors_created: u64,
    pub vectors_updated: u64,
    pub vectors_deleted: u64,
    pub relationships_created: u64,
    pub total_chunks: usize,
    pub processing_time: Duration,
    pub errors: Vec<String>,
}

impl PersistenceResult {
    pub fn empty(total_chunks: usize) -> Self {
        Self {
            success: true,
            nodes_created: 0,
            nodes_updated: 0,
            nodes_deleted: 0,
            vectors_created: 0,
            vectors_updated: 0,
            vectors_deleted: 0,
            relationships_created: 0,
            total_chunks,
            processing_time: Duration::ZERO,
            errors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertCategory {
    Performance,
    Memory,
    Error,
    Timeout,
}

impl fmt::Display for AlertCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertCategory::Performance => "performance",
            AlertCategory::Memory => "memory",
            AlertCategory::Error => "error",
            AlertCategory::Timeout => "timeout",
        };
        write!(f, "{}", s)
    }
}

/// Threshold-crossing notification raised by the metrics collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub category: AlertCategory,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub operation_id: Option<Uuid>,
}

impl Alert {
    pub fn new(
        category: AlertCategory,
        severity: Severity,
        message: impl Into<String>,
        operation_id: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            category,
            severity,
            message: message.into(),
            timestamp: Utc::now(),
            operation_id,
        }
    }
}

/// Statistics derived from the bounded metrics history over a time range.
/// An empty selection yields all-zero stats, never a division error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateStats {
    pub operation_count: usize,
    pub mean_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub mean_throughput: f64,
    pub mean_error_rate: f64,
    pub memory_efficiency: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePayload {
    pub id: NodeId,
    pub label: String,
    pub properties: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgePayload {
    pub src: NodeId,
    pub dst: NodeId,
    pub edge_type: String,
    pub properties: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorPoint {
    pub id: ChunkId,
    pub vector: Vec<f32>,
    pub payload: HashMap<String, serde_json::Value>,
}

/// One backend-specific write, produced by the planner and executed in
/// sized chunks. Vector upserts carry the existence verdict from the
/// incremental diff so created and updated points are counted apart.
#[derive(Debug, Clone)]
pub enum WritePrimitive {
    NodeInsert(NodePayload),
    NodeUpdate(NodePayload),
    NodeDelete(NodeId),
    EdgeInsert(EdgePayload),
    VectorUpsert { point: VectorPoint, existing: bool },
    VectorDelete(ChunkId),
}
