//! Text embedding boundary.
//!
//! The index manager only talks to the [`Embedder`] trait; implementations
//! must be `Send + Sync` for concurrent use behind `Arc`.

pub mod mock;
pub mod remote;

use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug, Clone)]
pub enum EmbedderError {
    #[error("inference failed: {0}")]
    InferenceFailed(String),

    #[error("embedding service unreachable: {0}")]
    Unreachable(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

pub trait Embedder: Send + Sync {
    /// Embed one text into a fixed-dimension vector. Deterministic for a
    /// fixed model version.
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError>;

    /// Embed a batch of texts, order-preserving. All-or-nothing; callers
    /// needing per-item results go through [`embed_many`].
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError>;

    fn dimensions(&self) -> usize;
}

/// Batch-embed with per-item degradation: one result per input, in input
/// order. A failed batch falls back to individual calls, each retried up to
/// `max_retries` additional times before being recorded as failed.
pub fn embed_many(
    embedder: &dyn Embedder,
    texts: &[&str],
    max_retries: usize,
) -> Vec<Result<Vec<f32>, EmbedderError>> {
    match embedder.embed_batch(texts) {
        Ok(vectors) if vectors.len() == texts.len() => vectors.into_iter().map(Ok).collect(),
        Ok(vectors) => {
            warn!(
                expected = texts.len(),
                actual = vectors.len(),
                "batch embedding returned wrong arity, retrying per item"
            );
            texts
                .iter()
                .map(|t| embed_with_retry(embedder, t, max_retries))
                .collect()
        }
        Err(e) => {
            warn!("batch embedding failed ({e}), retrying per item");
            texts
                .iter()
                .map(|t| embed_with_retry(embedder, t, max_retries))
                .collect()
        }
    }
}

fn embed_with_retry(
    embedder: &dyn Embedder,
    text: &str,
    max_retries: usize,
) -> Result<Vec<f32>, EmbedderError> {
    let mut last_err = None;
    for _attempt in 0..=max_retries {
        match embedder.embed(text) {
            Ok(v) => return Ok(v),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| EmbedderError::InferenceFailed("no attempts made".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails `embed_batch` always and `embed` for texts containing "bad".
    struct FlakyEmbedder {
        calls: AtomicUsize,
    }

    impl Embedder for FlakyEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if text.contains("bad") {
                Err(EmbedderError::InferenceFailed("poisoned input".into()))
            } else {
                Ok(vec![1.0; 4])
            }
        }

        fn embed_batch(&self, _texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError> {
            Err(EmbedderError::Unreachable("batch endpoint down".into()))
        }

        fn dimensions(&self) -> usize {
            4
        }
    }

    #[test]
    fn test_embed_many_partial_failure() {
        let embedder = FlakyEmbedder {
            calls: AtomicUsize::new(0),
        };
        let results = embed_many(&embedder, &["ok one", "bad item", "ok two"], 2);

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_err(), "poisoned item stays failed");
        assert!(results[2].is_ok());
        // Failed item was attempted 1 + 2 retries = 3 times.
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_embed_many_happy_batch() {
        let embedder = mock::MockEmbedder::default();
        let results = embed_many(&embedder, &["a", "b"], 0);
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(results[0].as_ref().unwrap().len(), 384);
    }
}
