//! Retrieval-augmented generation: assemble retrieved chunks into a
//! prompt and hand it to a text-completion backend.

use crate::retriever::{RetrievalResult, RetrieveError, RetrieveOptions, Retriever};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("llm backend unreachable: {0}")]
    Unreachable(String),

    #[error("llm backend returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("llm response malformed: {0}")]
    InvalidResponse(String),
}

/// Text-completion boundary. The backend is a black box: prompt in,
/// completion out.
pub trait LlmClient: Send + Sync {
    fn complete(&self, prompt: &str) -> Result<String, LlmError>;

    fn model(&self) -> &str;
}

#[derive(Error, Debug)]
pub enum RagError {
    #[error(transparent)]
    Retrieve(#[from] RetrieveError),

    /// Generation failed after retrieval succeeded; the context that was
    /// assembled is attached so callers can still show it.
    #[error("generation failed: {source}")]
    Generation {
        source: LlmError,
        retrieved_context: Vec<RetrievalResult>,
    },
}

#[derive(Debug, Clone)]
pub struct RagAnswer {
    pub answer: String,
    pub model: String,
    pub retrieved_context: Vec<RetrievalResult>,
}

#[derive(Debug, Clone)]
pub struct AskOptions {
    pub language: Option<String>,
    pub max_context_chunks: usize,
    pub similarity_threshold: f32,
}

impl Default for AskOptions {
    fn default() -> Self {
        Self {
            language: None,
            max_context_chunks: 5,
            similarity_threshold: 0.3,
        }
    }
}

pub struct RagEngine {
    retriever: Retriever,
    llm: Box<dyn LlmClient>,
}

impl RagEngine {
    pub fn new(retriever: Retriever, llm: Box<dyn LlmClient>) -> Self {
        Self { retriever, llm }
    }

    /// Retrieve context for `question` and generate a grounded answer. An
    /// empty retrieval still produces an answer, just without context.
    pub fn answer(&self, question: &str, options: &AskOptions) -> Result<RagAnswer, RagError> {
        let retrieved = self.retriever.retrieve(
            &search_query(question, options.language.as_deref()),
            &RetrieveOptions {
                k: options.max_context_chunks,
                similarity_threshold: options.similarity_threshold,
                language: options.language.clone(),
                path_prefix: None,
            },
        )?;
        debug!(chunks = retrieved.len(), "assembling prompt");

        let prompt = build_prompt(question, &retrieved);
        let answer = match self.llm.complete(&prompt) {
            Ok(answer) => answer,
            Err(source) => {
                return Err(RagError::Generation {
                    source,
                    retrieved_context: retrieved,
                });
            }
        };

        info!(
            model = self.llm.model(),
            context_chunks = retrieved.len(),
            "generated answer"
        );
        Ok(RagAnswer {
            answer,
            model: self.llm.model().to_string(),
            retrieved_context: retrieved,
        })
    }
}

/// The retrieval query biases toward the requested language without
/// changing the question shown to the model.
fn search_query(question: &str, language: Option<&str>) -> String {
    match language {
        Some(lang) => format!("{question} {lang} code"),
        None => question.to_string(),
    }
}

/// Deterministic prompt: identical question and chunk set always yield the
/// identical prompt string.
fn build_prompt(question: &str, context: &[RetrievalResult]) -> String {
    let mut prompt = String::new();

    if !context.is_empty() {
        prompt.push_str("[CODE CONTEXT]\n");
        for (i, result) in context.iter().enumerate() {
            let chunk = &result.chunk;
            let _ = writeln!(
                prompt,
                "Context {}:\nFile: {} (lines {}-{})\nLanguage: {} | Type: {}\n```\n{}\n```\n",
                i + 1,
                chunk.file_path,
                chunk.line_start,
                chunk.line_end,
                chunk.language,
                chunk.kind.as_str(),
                chunk.content.trim_end(),
            );
        }
    }

    let _ = write!(prompt, "[USER QUESTION]\n{question}\n\n[ANSWER]");
    prompt
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Ollama `/api/generate` client.
pub struct OllamaClient {
    client: reqwest::blocking::Client,
    base_url: String,
    model: String,
    temperature: f32,
}

impl OllamaClient {
    pub fn new(base_url: &str, model: &str, temperature: f32) -> Result<Self, LlmError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| LlmError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            temperature,
        })
    }
}

impl LlmClient for OllamaClient {
    fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&GenerateRequest {
                model: &self.model,
                prompt,
                stream: false,
                options: GenerateOptions {
                    temperature: self.temperature,
                },
            })
            .send()
            .map_err(|e| LlmError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let body: GenerateResponse = response
            .json()
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        Ok(body.response)
    }

    fn model(&self) -> &str {
        &self.model
    }
}
