/// Configuration: loading, validating, and default values.
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// ── Default value functions ──────────────────────────────────────────

fn default_watch_paths() -> Vec<String> {
    vec!["./".to_string()]
}

fn default_db_path() -> String {
    "./index.db".to_string()
}

fn default_state_path() -> String {
    "./index_state.json".to_string()
}

fn default_store() -> String {
    "sqlite".to_string()
}

fn default_max_chunk_chars() -> usize {
    2000
}

fn default_search_top_k() -> usize {
    5
}

fn default_similarity_threshold() -> f32 {
    0.3
}

fn default_debounce_ms() -> u64 {
    300
}

fn default_max_concurrency() -> usize {
    4
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_base_ms() -> u64 {
    2000
}

fn default_queue_capacity() -> usize {
    256
}

fn default_embed_retries() -> usize {
    2
}

fn default_embedding_model() -> String {
    "mock".to_string()
}

fn default_dimensions() -> usize {
    384
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_llm_model() -> String {
    "codellama:7b".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

// ── Config structs ───────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Directories to index and watch.
    #[serde(default = "default_watch_paths")]
    pub watch_paths: Vec<String>,

    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_state_path")]
    pub state_path: String,

    /// `"sqlite"` or `"memory"`.
    #[serde(default = "default_store")]
    pub store: String,

    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,

    #[serde(default = "default_search_top_k")]
    pub search_top_k: usize,

    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_embed_retries")]
    pub embed_retries: usize,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub llm: LlmConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ModelConfig {
    /// `"mock"` for the deterministic hash embedder, anything else is sent
    /// as the model name to the Ollama embeddings endpoint.
    #[serde(default = "default_embedding_model")]
    pub name: String,

    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    #[serde(default = "default_ollama_url")]
    pub base_url: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default = "default_ollama_url")]
    pub base_url: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

// ── Default impls ────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        Self {
            watch_paths: default_watch_paths(),
            db_path: default_db_path(),
            state_path: default_state_path(),
            store: default_store(),
            max_chunk_chars: default_max_chunk_chars(),
            search_top_k: default_search_top_k(),
            similarity_threshold: default_similarity_threshold(),
            debounce_ms: default_debounce_ms(),
            max_concurrency: default_max_concurrency(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            queue_capacity: default_queue_capacity(),
            embed_retries: default_embed_retries(),
            model: ModelConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_embedding_model(),
            dimensions: default_dimensions(),
            base_url: default_ollama_url(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_llm_model(),
            base_url: default_ollama_url(),
            temperature: default_temperature(),
        }
    }
}

// ── Config implementation ────────────────────────────────────────────

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// If `config_path` is empty, defaults to `"coderag.json"`.
    /// If the file does not exist, returns a default config and generates a
    /// template at the default path.
    pub fn load(config_path: &str) -> Result<Self> {
        let path = if config_path.is_empty() {
            "coderag.json"
        } else {
            config_path
        };

        if !Path::new(path).exists() {
            info!("{path} not found, using defaults");
            let cfg = Self::default();

            if path == "coderag.json" {
                match cfg.save(path) {
                    Ok(()) => info!("Generated config template: {path}"),
                    Err(e) => warn!("Failed to generate config template: {e}"),
                }
            }

            return Ok(cfg);
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;

        let cfg: Config = match serde_json::from_str(&data) {
            Ok(c) => c,
            Err(e) => {
                warn!("Invalid JSON in {path}: {e}");
                warn!("Using default configuration");
                return Ok(Self::default());
            }
        };

        info!("Loaded configuration from {path}");
        Ok(cfg)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &str) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("failed to marshal config")?;
        std::fs::write(path, data).with_context(|| format!("failed to write config: {path}"))?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.watch_paths.is_empty(),
            "at least one watch path must be specified"
        );
        anyhow::ensure!(
            self.max_chunk_chars > 0,
            "max_chunk_chars must be positive"
        );
        anyhow::ensure!(self.search_top_k > 0, "search_top_k must be positive");
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.similarity_threshold),
            "similarity_threshold must be within [0, 1]"
        );
        anyhow::ensure!(
            self.store == "sqlite" || self.store == "memory",
            "store must be \"sqlite\" or \"memory\""
        );
        anyhow::ensure!(
            self.model.dimensions > 0,
            "model.dimensions must be positive"
        );
        anyhow::ensure!(
            self.queue_capacity > 0,
            "queue_capacity must be positive"
        );
        anyhow::ensure!(
            self.max_concurrency > 0,
            "max_concurrency must be positive"
        );
        Ok(())
    }
}
