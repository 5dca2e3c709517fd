use codeindex_core::{
    BatchOptions, ChunkId, CodeChunk, EdgePayload, NodeId, NodePayload, ParsedFile, VectorPoint,
    WritePrimitive,
};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

const FILE_LABEL: &str = "File";
const CHUNK_LABEL: &str = "CodeChunk";
const CONTAINS_EDGE: &str = "contains";
const FOLLOWS_EDGE: &str = "follows";

/// Deterministic node id for a file path, so repeated indexing runs address
/// the same file vertex.
pub fn file_node_id(path: &str) -> NodeId {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, path.as_bytes())
}

fn chunk_node(chunk: &CodeChunk, project_id: Option<&str>) -> NodePayload {
    let mut properties = HashMap::new();
    properties.insert("file_path".to_string(), json!(chunk.file_path));
    properties.insert("start_line".to_string(), json!(chunk.start_line));
    properties.insert("end_line".to_string(), json!(chunk.end_line));
    properties.insert("language".to_string(), json!(chunk.language));
    if let Some(symbol) = &chunk.symbol_name {
        properties.insert("symbol".to_string(), json!(symbol));
    }
    if let Some(project) = project_id {
        properties.insert("project".to_string(), json!(project));
    }
    NodePayload {
        id: chunk.id,
        label: CHUNK_LABEL.to_string(),
        properties,
    }
}

fn file_node(path: &str, project_id: Option<&str>) -> NodePayload {
    let mut properties = HashMap::new();
    properties.insert("path".to_string(), json!(path));
    if let Some(project) = project_id {
        properties.insert("project".to_string(), json!(project));
    }
    NodePayload {
        id: file_node_id(path),
        label: FILE_LABEL.to_string(),
        properties,
    }
}

fn vector_point(chunk: &CodeChunk, embedding: Vec<f32>) -> VectorPoint {
    let mut payload = HashMap::new();
    payload.insert("file_path".to_string(), json!(chunk.file_path));
    payload.insert("content".to_string(), json!(chunk.content));
    if let Some(symbol) = &chunk.symbol_name {
        payload.insert("symbol".to_string(), json!(symbol));
    }
    VectorPoint {
        id: chunk.id,
        vector: embedding,
        payload,
    }
}

/// Containment and ordering edges for the chunks of one file: the file
/// vertex contains every chunk, consecutive chunks are linked in source
/// order.
fn relationship_edges(path: &str, chunks: &[&CodeChunk]) -> Vec<EdgePayload> {
    let file_id = file_node_id(path);
    let mut edges = Vec::with_capacity(chunks.len() * 2);
    for chunk in chunks {
        edges.push(EdgePayload {
            src: file_id,
            dst: chunk.id,
            edge_type: CONTAINS_EDGE.to_string(),
            properties: HashMap::new(),
        });
    }
    for pair in chunks.windows(2) {
        edges.push(EdgePayload {
            src: pair[0].id,
            dst: pair[1].id,
            edge_type: FOLLOWS_EDGE.to_string(),
            properties: HashMap::new(),
        });
    }
    edges
}

fn by_file<'a>(chunks: &'a [CodeChunk]) -> Vec<(&'a str, Vec<&'a CodeChunk>)> {
    let mut order: Vec<&str> = Vec::new();
    let mut groups: HashMap<&str, Vec<&CodeChunk>> = HashMap::new();
    for chunk in chunks {
        let entry = groups.entry(chunk.file_path.as_str()).or_insert_with(|| {
            order.push(chunk.file_path.as_str());
            Vec::new()
        });
        entry.push(chunk);
    }
    order
        .into_iter()
        .map(|path| {
            let mut group = groups.remove(path).unwrap_or_default();
            group.sort_by_key(|c| c.start_line);
            (path, group)
        })
        .collect()
}

/// Plan for a plain store: every chunk is a node insert plus a vector
/// upsert when it carries an embedding.
pub fn plan_store(chunks: &[CodeChunk], options: &BatchOptions) -> Vec<WritePrimitive> {
    let project = options.project_id.as_deref();
    let mut primitives = Vec::with_capacity(chunks.len() * 2);

    if options.create_relationships {
        for (path, group) in by_file(chunks) {
            primitives.push(WritePrimitive::NodeInsert(file_node(path, project)));
            for chunk in &group {
                primitives.push(WritePrimitive::NodeInsert(chunk_node(chunk, project)));
                if let Some(embedding) = &chunk.embedding {
                    primitives.push(WritePrimitive::VectorUpsert {
                        point: vector_point(chunk, embedding.clone()),
                        existing: false,
                    });
                }
            }
            for edge in relationship_edges(path, &group) {
                primitives.push(WritePrimitive::EdgeInsert(edge));
            }
        }
    } else {
        for chunk in chunks {
            primitives.push(WritePrimitive::NodeInsert(chunk_node(chunk, project)));
            if let Some(embedding) = &chunk.embedding {
                primitives.push(WritePrimitive::VectorUpsert {
                    point: vector_point(chunk, embedding.clone()),
                    existing: false,
                });
            }
        }
    }
    primitives
}

pub fn plan_store_files(files: &[ParsedFile], options: &BatchOptions) -> Vec<WritePrimitive> {
    let chunks: Vec<CodeChunk> = files.iter().flat_map(|f| f.chunks.clone()).collect();
    plan_store(&chunks, options)
}

/// Incremental diff: chunks whose ids the backend already knows become
/// updates, the rest become creates. Vector points are partitioned with
/// their own existence set since the two stores can drift.
pub fn plan_update(
    chunks: &[CodeChunk],
    existing_nodes: &HashSet<NodeId>,
    existing_points: &HashSet<ChunkId>,
    options: &BatchOptions,
) -> Vec<WritePrimitive> {
    let project = options.project_id.as_deref();
    let mut primitives = Vec::with_capacity(chunks.len() * 2);

    for chunk in chunks {
        let node = chunk_node(chunk, project);
        if existing_nodes.contains(&chunk.id) {
            primitives.push(WritePrimitive::NodeUpdate(node));
        } else {
            primitives.push(WritePrimitive::NodeInsert(node));
        }
        if let Some(embedding) = &chunk.embedding {
            primitives.push(WritePrimitive::VectorUpsert {
                point: vector_point(chunk, embedding.clone()),
                existing: existing_points.contains(&chunk.id),
            });
        }
    }
    primitives
}

/// Deletes for both stores; vector points share chunk ids with graph nodes.
pub fn plan_delete(ids: &[NodeId]) -> Vec<WritePrimitive> {
    let mut primitives = Vec::with_capacity(ids.len() * 2);
    for id in ids {
        primitives.push(WritePrimitive::NodeDelete(*id));
        primitives.push(WritePrimitive::VectorDelete(*id));
    }
    primitives
}

pub fn plan_delete_nodes(ids: &[NodeId]) -> Vec<WritePrimitive> {
    ids.iter().map(|id| WritePrimitive::NodeDelete(*id)).collect()
}

pub fn plan_delete_vectors(ids: &[ChunkId]) -> Vec<WritePrimitive> {
    ids.iter().map(|id| WritePrimitive::VectorDelete(*id)).collect()
}

/// Splits the primitive list into execution chunks of at most `size`.
pub fn chunk_primitives(primitives: Vec<WritePrimitive>, size: usize) -> Vec<Vec<WritePrimitive>> {
    if size == 0 {
        return if primitives.is_empty() {
            Vec::new()
        } else {
            vec![primitives]
        };
    }
    let mut chunks = Vec::with_capacity(primitives.len().div_ceil(size));
    let mut current = Vec::with_capacity(size);
    for primitive in primitives {
        current.push(primitive);
        if current.len() == size {
            chunks.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
