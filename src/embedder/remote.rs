//! HTTP embedding adapter for an Ollama-style `/api/embeddings` endpoint.

use super::{Embedder, EmbedderError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

pub struct RemoteEmbedder {
    client: reqwest::blocking::Client,
    base_url: String,
    model: String,
    dimensions: usize,
}

impl RemoteEmbedder {
    pub fn new(base_url: &str, model: &str, dimensions: usize) -> Result<Self, EmbedderError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| EmbedderError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            dimensions,
        })
    }
}

impl Embedder for RemoteEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        let response = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&EmbeddingRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .map_err(|e| EmbedderError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EmbedderError::InferenceFailed(format!(
                "embedding endpoint returned {}",
                response.status()
            )));
        }

        let body: EmbeddingResponse = response
            .json()
            .map_err(|e| EmbedderError::InferenceFailed(e.to_string()))?;

        if body.embedding.len() != self.dimensions {
            return Err(EmbedderError::DimensionMismatch {
                expected: self.dimensions,
                actual: body.embedding.len(),
            });
        }
        Ok(body.embedding)
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
