//! Vector store abstraction: chunk vectors plus metadata behind a single
//! capability trait, with in-memory and SQLite implementations selected once
//! at construction.

pub mod memory;
pub mod sqlite;

use crate::chunker::Chunk;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// One stored unit: the chunk (metadata + content) and its vector.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredId {
    pub chunk_id: String,
    pub score: f32,
}

#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub language: Option<String>,
    pub path_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreStats {
    pub total_chunks: usize,
    pub total_files: usize,
    pub languages: Vec<String>,
}

/// Storage contract for the index manager and retriever.
///
/// Guarantees: `upsert` replaces an existing id atomically; deletes are
/// idempotent (missing ids are no-ops); after a mutating call returns,
/// queries on the same instance observe the effect. `query` scores are
/// cosine similarity mapped to [0,1], ordered descending with ties broken
/// by higher `index_version` then ascending `chunk_id`.
pub trait VectorStore: Send + Sync {
    fn upsert(&self, entries: Vec<IndexEntry>) -> Result<(), StoreError>;

    fn delete_by_ids(&self, ids: &[String]) -> Result<(), StoreError>;

    fn delete_by_file(&self, file_path: &str) -> Result<(), StoreError>;

    fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&QueryFilter>,
    ) -> Result<Vec<ScoredId>, StoreError>;

    /// Resolve a stored chunk (with content) by id.
    fn get(&self, chunk_id: &str) -> Result<Option<Chunk>, StoreError>;

    fn stats(&self) -> Result<StoreStats, StoreError>;
}

/// Cosine similarity mapped onto [0,1], matching sqlite-vec's
/// `1 - distance/2` convention so both backends score identically.
pub(crate) fn cosine_score(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    let cos = (dot / (na * nb)).clamp(-1.0, 1.0);
    1.0 - (1.0 - cos) / 2.0
}
