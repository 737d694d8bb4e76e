//! Top-k retrieval over the vector store: embed the query, over-fetch,
//! apply the similarity threshold, resolve chunk content.

use crate::embedder::{Embedder, EmbedderError};
use crate::chunker::Chunk;
use crate::store::{QueryFilter, StoreError, VectorStore};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Fetch multiplier applied before thresholding so a strict threshold can
/// still fill k results.
const OVERFETCH_FACTOR: usize = 4;

#[derive(Error, Debug)]
pub enum RetrieveError {
    #[error("failed to embed query: {0}")]
    Embedding(#[from] EmbedderError),

    #[error("vector store unavailable: {0}")]
    QueryUnavailable(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub chunk: Chunk,
    /// Cosine similarity mapped to [0,1].
    pub score: f32,
}

#[derive(Debug, Clone, Default)]
pub struct RetrieveOptions {
    pub k: usize,
    /// Results scoring below this are dropped; an empty result set is a
    /// valid answer, not an error.
    pub similarity_threshold: f32,
    pub language: Option<String>,
    pub path_prefix: Option<String>,
}

pub struct Retriever {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
}

impl Retriever {
    pub fn new(store: Arc<dyn VectorStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    pub fn retrieve(
        &self,
        query: &str,
        options: &RetrieveOptions,
    ) -> Result<Vec<RetrievalResult>, RetrieveError> {
        if options.k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let vector = self.embedder.embed(query)?;
        let filter = QueryFilter {
            language: options.language.clone(),
            path_prefix: options.path_prefix.clone(),
        };
        let scored = self.store.query(
            &vector,
            options.k.saturating_mul(OVERFETCH_FACTOR),
            Some(&filter),
        )?;

        let mut results = Vec::with_capacity(options.k);
        for hit in scored {
            if hit.score < options.similarity_threshold {
                // Store results are ordered by score, nothing below passes.
                break;
            }
            // Deletes can race the query; skip ids that no longer resolve.
            if let Some(chunk) = self.store.get(&hit.chunk_id)? {
                results.push(RetrievalResult {
                    chunk,
                    score: hit.score,
                });
            }
            if results.len() == options.k {
                break;
            }
        }
        debug!(
            query_len = query.len(),
            hits = results.len(),
            "retrieval complete"
        );
        Ok(results)
    }
}
