use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coderag::chunker::{Chunker, ChunkerConfig};
use coderag::config::Config;
use coderag::embedder::Embedder;
use coderag::embedder::mock::MockEmbedder;
use coderag::embedder::remote::RemoteEmbedder;
use coderag::index::{
    ChangeWatcher, EventLoopConfig, IndexManager, ManagerOptions, event_queue, run_event_loop,
};
use coderag::rag::{AskOptions, OllamaClient, RagEngine};
use coderag::retriever::Retriever;
use coderag::store::VectorStore;
use coderag::store::memory::MemoryStore;
use coderag::store::sqlite::SqliteStore;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "coderag", version, about = "Incremental code index with RAG answers")]
struct Cli {
    /// Path to the JSON config file (defaults to ./coderag.json).
    #[arg(short, long, default_value = "")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Index a directory once and exit.
    Index {
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Only index the top level of the directory.
        #[arg(long)]
        no_recursive: bool,

        /// Glob patterns overriding the default extension filter.
        #[arg(long = "pattern")]
        patterns: Vec<String>,
    },
    /// Index the configured paths, then watch them for changes.
    Watch,
    /// Ask a question grounded in the indexed code.
    Ask {
        question: String,

        /// Bias retrieval toward one language (e.g. "rust").
        #[arg(short, long)]
        language: Option<String>,

        /// How many chunks of context to retrieve.
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },
    /// Print index statistics.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    config.validate()?;

    match cli.command {
        Command::Index {
            path,
            no_recursive,
            patterns,
        } => {
            let manager = build_manager(&config)?;
            let globs = build_globs(&patterns)?;
            let report = manager
                .index_directory(&path, !no_recursive, globs.as_ref())
                .await?;
            println!(
                "Indexed {} files ({} chunks)",
                report.indexed_files, report.total_chunks
            );
            for failed in &report.failed_files {
                println!("  failed: {failed}");
            }
        }
        Command::Watch => watch(&config).await?,
        Command::Ask {
            question,
            language,
            top_k,
        } => {
            let store = build_store(&config)?;
            let embedder = build_embedder(&config)?;
            let llm = OllamaClient::new(
                &config.llm.base_url,
                &config.llm.model,
                config.llm.temperature,
            )?;
            let engine = RagEngine::new(Retriever::new(store, embedder), Box::new(llm));
            let options = AskOptions {
                language,
                max_context_chunks: top_k.unwrap_or(config.search_top_k),
                similarity_threshold: config.similarity_threshold,
            };
            // Blocking HTTP client, keep it off the async runtime.
            let answer =
                tokio::task::spawn_blocking(move || engine.answer(&question, &options)).await??;

            println!("{}", answer.answer);
            if !answer.retrieved_context.is_empty() {
                println!("\nSources:");
                for result in &answer.retrieved_context {
                    println!(
                        "  {} (lines {}-{}, score {:.3})",
                        result.chunk.file_path,
                        result.chunk.line_start,
                        result.chunk.line_end,
                        result.score
                    );
                }
            }
        }
        Command::Stats => {
            let manager = build_manager(&config)?;
            let stats = manager.stats()?;
            println!("Tracked files:  {}", stats.tracked_files);
            println!("Stored chunks:  {}", stats.store.total_chunks);
            println!("Stored files:   {}", stats.store.total_files);
            println!("Languages:      {}", stats.store.languages.join(", "));
            if !stats.failed_files.is_empty() {
                println!("Failed files:");
                for (path, reason) in &stats.failed_files {
                    println!("  {path}: {reason}");
                }
            }
        }
    }

    Ok(())
}

async fn watch(config: &Config) -> Result<()> {
    let manager = build_manager(config)?;

    let (sink, rx) = event_queue(config.queue_capacity);
    let mut watcher = ChangeWatcher::new(sink.clone()).context("failed to create file watcher")?;
    for path in &config.watch_paths {
        watcher
            .watch(Path::new(path))
            .with_context(|| format!("failed to watch {path}"))?;
    }

    for path in &config.watch_paths {
        let report = manager.index_directory(Path::new(path), true, None).await?;
        info!(
            path = %path,
            indexed = report.indexed_files,
            chunks = report.total_chunks,
            "initial index complete"
        );
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                cancel.cancel();
            }
        });
    }

    let rescan_roots: Vec<PathBuf> = config.watch_paths.iter().map(PathBuf::from).collect();
    run_event_loop(
        manager,
        rx,
        sink,
        rescan_roots,
        EventLoopConfig {
            debounce: Duration::from_millis(config.debounce_ms),
            max_concurrency: config.max_concurrency,
            max_retries: config.max_retries,
            retry_base: Duration::from_millis(config.retry_base_ms),
        },
        cancel,
    )
    .await;

    Ok(())
}

fn build_store(config: &Config) -> Result<Arc<dyn VectorStore>> {
    Ok(match config.store.as_str() {
        "memory" => Arc::new(MemoryStore::new()),
        _ => Arc::new(
            SqliteStore::open(&config.db_path, config.model.dimensions)
                .context("failed to open vector database")?,
        ),
    })
}

fn build_embedder(config: &Config) -> Result<Arc<dyn Embedder>> {
    Ok(if config.model.name == "mock" {
        Arc::new(MockEmbedder::new(config.model.dimensions))
    } else {
        Arc::new(RemoteEmbedder::new(
            &config.model.base_url,
            &config.model.name,
            config.model.dimensions,
        )?)
    })
}

fn build_manager(config: &Config) -> Result<Arc<IndexManager>> {
    let chunker = Chunker::new(ChunkerConfig {
        max_chunk_chars: config.max_chunk_chars,
    })
    .map_err(|e| anyhow::anyhow!("failed to compile language queries: {e}"))?;

    let manager = IndexManager::new(
        build_store(config)?,
        build_embedder(config)?,
        chunker,
        ManagerOptions {
            state_path: Some(PathBuf::from(&config.state_path)),
            embed_retries: config.embed_retries,
            max_concurrency: config.max_concurrency,
        },
    )?;
    Ok(Arc::new(manager))
}

fn build_globs(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid pattern: {pattern}"))?);
    }
    Ok(Some(builder.build()?))
}
