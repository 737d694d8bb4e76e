//! # coderag — incremental code index + retrieval-augmented answers
//!
//! Indexes a local source repository into a vector store, keeps the index
//! consistent while files change, and serves top-k retrieval feeding a
//! text-generation backend.
//!
//! ## Architecture
//!
//! - **[`config`]** — JSON configuration: loading, validation, defaults
//! - **[`chunker`]** — Tree-sitter structural splitting with window fallback
//! - **[`embedder`]** — Embedding boundary (deterministic mock + Ollama HTTP)
//! - **[`store`]** — Vector store trait over SQLite (sqlite-vec) or memory
//! - **[`index`]** — Index manager, change watcher, debounced event loop
//! - **[`retriever`]** — Top-k similarity search with threshold and filters
//! - **[`rag`]** — Prompt assembly and the LLM completion boundary

pub mod chunker;
pub mod config;
pub mod embedder;
pub mod index;
pub mod rag;
pub mod retriever;
pub mod store;
