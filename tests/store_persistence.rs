//! Vector store persistence tests
//!
//! Cover the snapshot + sidecar round trip and the key-allocation
//! guarantees that survive it.

use std::fs;

use ragmill::store::{DocumentChunk, StoreError, VectorStore, VectorStoreConfig};
use tempfile::TempDir;

const DIMENSION: usize = 16;

fn store() -> VectorStore {
    VectorStore::new(VectorStoreConfig {
        dimension: DIMENSION,
        max_elements: 1000,
        ..VectorStoreConfig::default()
    })
}

fn axis_chunk(id: &str, axis: usize) -> DocumentChunk {
    let mut embedding = vec![0.0f32; DIMENSION];
    embedding[axis % DIMENSION] = 1.0;
    DocumentChunk {
        id: id.to_string(),
        text: format!("text for {id}"),
        embedding,
        metadata: serde_json::json!({ "axis": axis }),
    }
}

#[test]
fn save_load_round_trip_preserves_contents_and_results() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("index");

    let original = store();
    for i in 0..8 {
        original.add_chunk(axis_chunk(&format!("chunk_{i}"), i)).unwrap();
    }

    let query = {
        let mut q = vec![0.0f32; DIMENSION];
        q[3] = 1.0;
        q
    };
    let before = original.search(&query, 3, 0.0).unwrap();

    original.save(&path).unwrap();

    let reloaded = store();
    reloaded.load(&path).unwrap();

    assert_eq!(reloaded.size(), original.size());

    let after = reloaded.search(&query, 3, 0.0).unwrap();
    assert_eq!(before.len(), after.len());
    assert_eq!(before[0].chunk_id, after[0].chunk_id);
    assert!((before[0].similarity - after[0].similarity).abs() < 1e-5);
    assert_eq!(after[0].metadata["axis"], 3);
}

#[test]
fn sidecar_records_next_key_and_live_chunks_only() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("index");

    let original = store();
    original.add_chunk(axis_chunk("a", 0)).unwrap();
    original.add_chunk(axis_chunk("b", 1)).unwrap();
    assert!(original.remove_chunk("b"));
    original.save(&path).unwrap();

    let sidecar_path = dir.path().join("index.metadata.json");
    let sidecar: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&sidecar_path).unwrap()).unwrap();

    // Two keys were handed out even though only one chunk survives
    assert_eq!(sidecar["next_key"], 2);
    let chunks = sidecar["chunks"].as_array().unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0]["id"], "a");
    assert_eq!(chunks[0]["key"], 0);
}

#[test]
fn keys_are_never_reused_across_save_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("index");

    let original = store();
    original.add_chunk(axis_chunk("a", 0)).unwrap();
    original.add_chunk(axis_chunk("b", 1)).unwrap();
    assert!(original.remove_chunk("b")); // key 1 retired forever
    original.save(&path).unwrap();

    let reloaded = store();
    reloaded.load(&path).unwrap();
    reloaded.add_chunk(axis_chunk("c", 2)).unwrap();

    let second = dir.path().join("index2");
    reloaded.save(&second).unwrap();

    let sidecar: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(dir.path().join("index2.metadata.json")).unwrap(),
    )
    .unwrap();

    let mut keys: Vec<u64> = sidecar["chunks"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["key"].as_u64().unwrap())
        .collect();
    keys.sort_unstable();

    // The re-inserted chunk took key 2, not the retired key 1
    assert_eq!(keys, vec![0, 2]);
    assert_eq!(sidecar["next_key"], 3);
}

#[test]
fn load_requires_both_snapshot_files() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("index");

    let original = store();
    original.add_chunk(axis_chunk("a", 0)).unwrap();
    original.save(&path).unwrap();

    // Remove the sidecar: the pair is no longer consistent
    fs::remove_file(dir.path().join("index.metadata.json")).unwrap();

    let reloaded = store();
    let err = reloaded.load(&path).unwrap_err();
    assert!(matches!(err, StoreError::MissingSnapshot(_)));

    // Missing graph snapshot is rejected the same way
    let err = reloaded.load(&dir.path().join("never-saved")).unwrap_err();
    assert!(matches!(err, StoreError::MissingSnapshot(_)));
}

#[test]
fn duplicate_ids_are_rejected_after_reload() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("index");

    let original = store();
    original.add_chunk(axis_chunk("a", 0)).unwrap();
    original.save(&path).unwrap();

    let reloaded = store();
    reloaded.load(&path).unwrap();

    let err = reloaded.add_chunk(axis_chunk("a", 5)).unwrap_err();
    assert!(matches!(err, StoreError::DuplicateId(_)));
    assert_eq!(reloaded.size(), 1);
}
