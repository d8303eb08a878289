//! HNSW vector store
//!
//! Approximate nearest-neighbor index over cosine distance, mapping opaque
//! integer keys to (embedding, text, metadata) triples. Keys are
//! monotonically increasing and never reused within a store's lifetime, so
//! deleted entries can never be resurrected by a later insert.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use hnsw_rs::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

/// Maximum HNSW layer count
const MAX_LAYER: usize = 16;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Duplicate chunk id: {0}")]
    DuplicateId(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Index snapshot error: {0}")]
    Snapshot(String),

    #[error("Missing snapshot file: {0}")]
    MissingSnapshot(PathBuf),
}

/// Vector store configuration. Fixed at construction; changing the
/// dimension requires a new store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    /// Embedding dimension
    pub dimension: usize,
    /// Maximum capacity
    pub max_elements: usize,
    /// HNSW connectivity (M)
    pub connectivity: usize,
    /// Construction-time search depth
    pub expansion_add: usize,
    /// Query-time search depth
    pub expansion_search: usize,
    /// Ceiling applied to caller-supplied similarity thresholds. Dense
    /// sentence embeddings rarely score natural-language queries above
    /// ~0.3-0.5, so the effective filter is `min(threshold, threshold_cap)`
    /// to keep an over-aggressive caller threshold from discarding every
    /// result.
    pub threshold_cap: f32,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            dimension: 384,
            max_elements: 100_000,
            connectivity: 16,
            expansion_add: 128,
            expansion_search: 64,
            threshold_cap: 0.15,
        }
    }
}

/// Stored unit: one embedded chunk with its text and metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Search hit, produced fresh per query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub text: String,
    /// Cosine similarity in [0, 1], higher is more similar
    pub similarity: f32,
    pub metadata: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct PersistedChunk {
    key: usize,
    id: String,
    text: String,
    embedding: Vec<f32>,
    metadata: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct Sidecar {
    next_key: usize,
    chunks: Vec<PersistedChunk>,
}

struct StoreInner {
    index: Hnsw<'static, f32, DistCosine>,
    chunks: HashMap<usize, DocumentChunk>,
    id_to_key: HashMap<String, usize>,
    next_key: usize,
    /// Keys removed from the side maps but still present in the graph;
    /// searches over-fetch by this amount to compensate.
    tombstones: usize,
}

/// HNSW-backed vector store with snapshot persistence.
///
/// All mutating operations and searches are guarded by a single mutex.
pub struct VectorStore {
    config: VectorStoreConfig,
    inner: Mutex<StoreInner>,
}

impl VectorStore {
    pub fn new(config: VectorStoreConfig) -> Self {
        let index = new_index(&config);
        tracing::info!(
            dimension = config.dimension,
            max_elements = config.max_elements,
            connectivity = config.connectivity,
            "created vector store"
        );
        Self {
            config,
            inner: Mutex::new(StoreInner {
                index,
                chunks: HashMap::new(),
                id_to_key: HashMap::new(),
                next_key: 0,
                tombstones: 0,
            }),
        }
    }

    pub fn config(&self) -> &VectorStoreConfig {
        &self.config
    }

    /// Insert one chunk. Rejects dimension mismatches and duplicate ids
    /// without modifying the store.
    pub fn add_chunk(&self, chunk: DocumentChunk) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        Self::insert_locked(&self.config, &mut inner, chunk)
    }

    /// Insert several chunks, skipping rejected ones. Returns how many were
    /// actually added.
    pub fn add_chunks_batch(&self, chunks: Vec<DocumentChunk>) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let mut added = 0;
        for chunk in chunks {
            match Self::insert_locked(&self.config, &mut inner, chunk) {
                Ok(()) => added += 1,
                Err(e) => tracing::warn!("skipping chunk in batch: {e}"),
            }
        }
        added
    }

    fn insert_locked(
        config: &VectorStoreConfig,
        inner: &mut StoreInner,
        chunk: DocumentChunk,
    ) -> Result<(), StoreError> {
        if chunk.embedding.len() != config.dimension {
            return Err(StoreError::InvalidDimension {
                expected: config.dimension,
                actual: chunk.embedding.len(),
            });
        }

        if inner.id_to_key.contains_key(&chunk.id) {
            return Err(StoreError::DuplicateId(chunk.id));
        }

        let key = inner.next_key;
        inner.next_key += 1;

        inner.index.insert((&chunk.embedding, key));
        inner.id_to_key.insert(chunk.id.clone(), key);
        inner.chunks.insert(key, chunk);

        Ok(())
    }

    /// Ranked similarity search. Results below
    /// `min(threshold, threshold_cap)` are filtered out.
    pub fn search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<SearchResult>, StoreError> {
        let inner = self.inner.lock().unwrap();

        if query_embedding.len() != self.config.dimension {
            return Err(StoreError::InvalidDimension {
                expected: self.config.dimension,
                actual: query_embedding.len(),
            });
        }

        if inner.chunks.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let effective_threshold = threshold.min(self.config.threshold_cap);

        // Over-fetch by the tombstone count so removed-but-still-indexed
        // points cannot crowd out live results.
        let knbn = top_k + inner.tombstones;
        let ef = self.config.expansion_search.max(knbn);
        let neighbours = inner.index.search(query_embedding, knbn, ef);

        let mut results = Vec::with_capacity(top_k);
        for neighbour in neighbours {
            if results.len() >= top_k {
                break;
            }

            let similarity = 1.0 - neighbour.distance;
            if similarity < effective_threshold {
                tracing::debug!(
                    similarity,
                    effective_threshold,
                    "dropping match below threshold"
                );
                continue;
            }

            let Some(chunk) = inner.chunks.get(&neighbour.d_id) else {
                // Tombstoned key still present in the graph
                continue;
            };

            results.push(SearchResult {
                chunk_id: chunk.id.clone(),
                text: chunk.text.clone(),
                similarity,
                metadata: chunk.metadata.clone(),
            });
        }

        Ok(results)
    }

    /// Remove a chunk by id. Returns `false` when the id is unknown.
    pub fn remove_chunk(&self, chunk_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();

        let Some(key) = inner.id_to_key.remove(chunk_id) else {
            return false;
        };
        inner.chunks.remove(&key);
        inner.tombstones += 1;
        true
    }

    /// Drop everything, including the key counter
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.index = new_index(&self.config);
        inner.chunks.clear();
        inner.id_to_key.clear();
        inner.next_key = 0;
        inner.tombstones = 0;
        tracing::info!("cleared vector store");
    }

    /// Number of live chunks
    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn get_statistics(&self) -> serde_json::Value {
        let inner = self.inner.lock().unwrap();
        json!({
            "num_chunks": inner.chunks.len(),
            "next_key": inner.next_key,
            "dimension": self.config.dimension,
            "max_elements": self.config.max_elements,
            "connectivity": self.config.connectivity,
        })
    }

    /// Persist the index: a native HNSW snapshot plus a
    /// `<path>.metadata.json` sidecar carrying the chunk map and the
    /// next-key counter.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let inner = self.inner.lock().unwrap();

        let (dir, basename) = split_snapshot_path(path)?;
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(&dir)?;
        }

        inner
            .index
            .file_dump(&dir, &basename)
            .map_err(|e| StoreError::Snapshot(e.to_string()))?;

        let sidecar = Sidecar {
            next_key: inner.next_key,
            chunks: inner
                .chunks
                .iter()
                .map(|(&key, chunk)| PersistedChunk {
                    key,
                    id: chunk.id.clone(),
                    text: chunk.text.clone(),
                    embedding: chunk.embedding.clone(),
                    metadata: chunk.metadata.clone(),
                })
                .collect(),
        };

        let sidecar_json = serde_json::to_string(&sidecar)?;
        fs::write(sidecar_path(path), sidecar_json)?;

        tracing::info!(path = %path.display(), chunks = inner.chunks.len(), "saved vector store");
        Ok(())
    }

    /// Reload a persisted index. Both the snapshot and its sidecar must be
    /// present; the graph is reconstituted from the sidecar under the
    /// persisted keys, so key allocation resumes without collision risk and
    /// tombstoned points are compacted away.
    pub fn load(&self, path: &Path) -> Result<(), StoreError> {
        let (dir, basename) = split_snapshot_path(path)?;
        let graph_file = dir.join(format!("{basename}.hnsw.graph"));
        if !graph_file.exists() {
            return Err(StoreError::MissingSnapshot(graph_file));
        }

        let sidecar_file = sidecar_path(path);
        if !sidecar_file.exists() {
            return Err(StoreError::MissingSnapshot(sidecar_file));
        }

        let sidecar: Sidecar = serde_json::from_str(&fs::read_to_string(&sidecar_file)?)?;

        let index = new_index(&self.config);
        let mut chunks = HashMap::with_capacity(sidecar.chunks.len());
        let mut id_to_key = HashMap::with_capacity(sidecar.chunks.len());

        for persisted in sidecar.chunks {
            if persisted.embedding.len() != self.config.dimension {
                return Err(StoreError::InvalidDimension {
                    expected: self.config.dimension,
                    actual: persisted.embedding.len(),
                });
            }

            index.insert((&persisted.embedding, persisted.key));
            id_to_key.insert(persisted.id.clone(), persisted.key);
            chunks.insert(
                persisted.key,
                DocumentChunk {
                    id: persisted.id,
                    text: persisted.text,
                    embedding: persisted.embedding,
                    metadata: persisted.metadata,
                },
            );
        }

        let mut inner = self.inner.lock().unwrap();
        inner.index = index;
        inner.chunks = chunks;
        inner.id_to_key = id_to_key;
        inner.next_key = sidecar.next_key;
        inner.tombstones = 0;

        tracing::info!(
            path = %path.display(),
            next_key = inner.next_key,
            chunks = inner.chunks.len(),
            "loaded vector store"
        );
        Ok(())
    }
}

fn new_index(config: &VectorStoreConfig) -> Hnsw<'static, f32, DistCosine> {
    Hnsw::new(
        config.connectivity,
        config.max_elements,
        MAX_LAYER,
        config.expansion_add,
        DistCosine,
    )
}

fn split_snapshot_path(path: &Path) -> Result<(PathBuf, String), StoreError> {
    let basename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| StoreError::Snapshot(format!("invalid snapshot path: {}", path.display())))?;
    let dir = path.parent().unwrap_or(Path::new("")).to_path_buf();
    Ok((dir, basename))
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".metadata.json");
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dimension: usize) -> VectorStoreConfig {
        VectorStoreConfig {
            dimension,
            max_elements: 1000,
            ..VectorStoreConfig::default()
        }
    }

    fn unit_vec(dimension: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dimension];
        v[hot % dimension] = 1.0;
        v
    }

    fn chunk(id: &str, embedding: Vec<f32>) -> DocumentChunk {
        DocumentChunk {
            id: id.to_string(),
            text: format!("text for {id}"),
            embedding,
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn insert_then_search_returns_self_as_top_hit() {
        let store = VectorStore::new(test_config(8));
        let embedding = unit_vec(8, 0);
        store.add_chunk(chunk("a", embedding.clone())).unwrap();
        store.add_chunk(chunk("b", unit_vec(8, 1))).unwrap();

        let results = store.search(&embedding, 2, 0.0).unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].chunk_id, "a");
        assert!((results[0].similarity - 1.0).abs() < 1e-4);
    }

    #[test]
    fn rejects_dimension_mismatch() {
        let store = VectorStore::new(test_config(8));
        let err = store.add_chunk(chunk("a", vec![1.0; 4])).unwrap_err();
        assert!(matches!(err, StoreError::InvalidDimension { expected: 8, actual: 4 }));
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn rejects_duplicate_id_without_changing_size() {
        let store = VectorStore::new(test_config(8));
        store.add_chunk(chunk("a", unit_vec(8, 0))).unwrap();
        let err = store.add_chunk(chunk("a", unit_vec(8, 1))).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateId(_)));
        assert_eq!(store.size(), 1);
    }

    #[test]
    fn batch_insert_skips_bad_entries() {
        let store = VectorStore::new(test_config(8));
        let added = store.add_chunks_batch(vec![
            chunk("a", unit_vec(8, 0)),
            chunk("bad", vec![0.0; 3]),
            chunk("a", unit_vec(8, 1)),
            chunk("b", unit_vec(8, 2)),
        ]);
        assert_eq!(added, 2);
        assert_eq!(store.size(), 2);
    }

    #[test]
    fn remove_unknown_id_is_noop() {
        let store = VectorStore::new(test_config(8));
        assert!(!store.remove_chunk("missing"));
    }

    #[test]
    fn removed_chunks_disappear_from_search() {
        let store = VectorStore::new(test_config(8));
        let embedding = unit_vec(8, 0);
        store.add_chunk(chunk("a", embedding.clone())).unwrap();
        store.add_chunk(chunk("b", unit_vec(8, 1))).unwrap();

        assert!(store.remove_chunk("a"));
        assert_eq!(store.size(), 1);

        let results = store.search(&embedding, 2, 0.0).unwrap();
        assert!(results.iter().all(|r| r.chunk_id != "a"));
    }

    #[test]
    fn caller_threshold_is_capped() {
        let store = VectorStore::new(test_config(8));
        let mut near = unit_vec(8, 0);
        near[1] = 0.8; // similarity to the axis vector well below 0.9
        store.add_chunk(chunk("a", near)).unwrap();

        // An aggressive 0.9 threshold would discard the hit; the cap keeps it.
        let results = store.search(&unit_vec(8, 0), 1, 0.9).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn clear_resets_key_counter() {
        let store = VectorStore::new(test_config(8));
        store.add_chunk(chunk("a", unit_vec(8, 0))).unwrap();
        store.clear();
        assert_eq!(store.size(), 0);
        assert_eq!(store.get_statistics()["next_key"], 0);
    }

    #[test]
    fn empty_store_search_is_empty() {
        let store = VectorStore::new(test_config(8));
        assert!(store.search(&unit_vec(8, 0), 5, 0.0).unwrap().is_empty());
    }
}
