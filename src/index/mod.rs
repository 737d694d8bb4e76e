//! Index lifecycle: per-file records, incremental (re)indexing, and the
//! durable state file that survives restarts.
//!
//! The manager owns the only write path into the vector store. Concurrent
//! change events for different files proceed in parallel; events for the
//! same file serialize on a per-path lock so a slow reindex can never
//! interleave with a delete for the same path.

pub mod events;
pub mod watcher;

pub use events::{ChangeEvent, ChangeKind, EventLoopConfig, EventSink, event_queue, run_event_loop};
pub use watcher::ChangeWatcher;

use crate::chunker::{Chunk, Chunker};
use crate::embedder::{Embedder, EmbedderError, embed_many};
use crate::store::{IndexEntry, StoreError, StoreStats, VectorStore};
use chrono::{DateTime, Utc};
use globset::GlobSet;
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("embedding failed for every chunk of {path}: {source}")]
    Embedding { path: String, source: EmbedderError },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to persist index state: {0}")]
    State(std::io::Error),

    #[error("internal task error: {0}")]
    Task(String),
}

/// Per-file bookkeeping, persisted across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_path: String,
    /// blake3 of the full file content at last successful index.
    pub last_seen_hash: String,
    pub chunk_ids: Vec<String>,
    pub last_indexed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct IndexReport {
    pub indexed_files: usize,
    pub total_chunks: usize,
    pub failed_files: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct IndexStats {
    pub store: StoreStats,
    pub tracked_files: usize,
    pub failed_files: HashMap<String, String>,
    pub reindex_passes: u64,
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Where to persist the file-record map; `None` keeps state in memory only.
    pub state_path: Option<PathBuf>,
    /// Extra per-chunk attempts when batch embedding degrades to singles.
    pub embed_retries: usize,
    /// Parallelism for bulk directory indexing.
    pub max_concurrency: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            state_path: None,
            embed_retries: 2,
            max_concurrency: 4,
        }
    }
}

#[derive(Serialize, Deserialize, Default)]
struct StateFile {
    next_version: u64,
    records: HashMap<String, FileRecord>,
}

pub struct IndexManager {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    chunker: Chunker,
    options: ManagerOptions,
    records: RwLock<HashMap<String, FileRecord>>,
    failed: RwLock<HashMap<String, String>>,
    path_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Monotonic version stamped onto every freshly embedded chunk.
    next_version: AtomicU64,
    reindex_passes: AtomicU64,
}

impl IndexManager {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        chunker: Chunker,
        options: ManagerOptions,
    ) -> Result<Self, IndexError> {
        let mut state = match &options.state_path {
            Some(path) => load_state(path)?,
            None => StateFile::default(),
        };
        // Records without backing chunks would suppress reindexing forever,
        // so a state file paired with an empty store starts over.
        if !state.records.is_empty() && store.stats()?.total_chunks == 0 {
            warn!(
                tracked_files = state.records.len(),
                "store is empty but state is not, discarding stale records"
            );
            state.records.clear();
        }
        info!(
            tracked_files = state.records.len(),
            "index manager starting"
        );
        Ok(Self {
            store,
            embedder,
            chunker,
            options,
            next_version: AtomicU64::new(state.next_version),
            records: RwLock::new(state.records),
            failed: RwLock::new(HashMap::new()),
            path_locks: Mutex::new(HashMap::new()),
            reindex_passes: AtomicU64::new(0),
        })
    }

    /// Apply one change event end to end. Idempotent: duplicate
    /// notifications for unchanged content are skipped by hash, deletes of
    /// untracked paths are no-ops.
    pub async fn apply_event(&self, path: &Path, kind: ChangeKind) -> Result<(), IndexError> {
        let key = normalize_path(path);
        let mut stale_locks: Vec<String> = Vec::new();

        let result = match kind {
            ChangeKind::Deleted => {
                let lock = self.path_lock(&key).await;
                let _guard = lock.lock().await;
                stale_locks.push(key.clone());
                self.remove_file(&key)
            }
            ChangeKind::Created | ChangeKind::Modified => {
                let lock = self.path_lock(&key).await;
                let _guard = lock.lock().await;
                self.index_file(path, &key).await
            }
            ChangeKind::Renamed { from } => {
                let old_key = normalize_path(&from);
                if old_key == key {
                    let lock = self.path_lock(&key).await;
                    let _guard = lock.lock().await;
                    self.index_file(path, &key).await
                } else {
                    // Both locks in sorted-key order, so crossing renames
                    // (a -> b racing b -> a) cannot deadlock.
                    let (first, second) = if old_key < key {
                        (old_key.as_str(), key.as_str())
                    } else {
                        (key.as_str(), old_key.as_str())
                    };
                    let first_lock = self.path_lock(first).await;
                    let _first_guard = first_lock.lock().await;
                    let second_lock = self.path_lock(second).await;
                    let _second_guard = second_lock.lock().await;
                    stale_locks.push(old_key.clone());
                    match self.remove_file(&old_key) {
                        Ok(()) => self.index_file(path, &key).await,
                        Err(e) => Err(e),
                    }
                }
            }
        };

        for stale in stale_locks {
            self.release_path_lock(&stale).await;
        }
        result
    }

    /// Walk `root` and index every matching file. `patterns` (glob set over
    /// the normalized path) overrides the default extension filter. Failures
    /// are collected per file rather than aborting the walk.
    pub async fn index_directory(
        self: &Arc<Self>,
        root: &Path,
        recursive: bool,
        patterns: Option<&GlobSet>,
    ) -> Result<IndexReport, IndexError> {
        let mut walker = WalkBuilder::new(root);
        walker.hidden(false);
        if !recursive {
            walker.max_depth(Some(1));
        }

        let mut files: Vec<PathBuf> = Vec::new();
        for entry in walker.build() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("walk error under {}: {e}", root.display());
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let path = entry.path();
            let selected = match patterns {
                Some(globs) => globs.is_match(normalize_path(path)),
                None => crate::chunker::languages::is_indexable(path),
            };
            if selected {
                files.push(path.to_path_buf());
            }
        }
        files.sort();

        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrency.max(1)));
        let mut tasks: JoinSet<(PathBuf, Result<(), IndexError>)> = JoinSet::new();
        for path in files {
            let manager = self.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (path, Ok(()));
                };
                let result = manager.apply_event(&path, ChangeKind::Created).await;
                (path, result)
            });
        }

        let mut report = IndexReport::default();
        while let Some(joined) = tasks.join_next().await {
            let (path, result) = joined.map_err(|e| IndexError::Task(e.to_string()))?;
            match result {
                Ok(()) => {
                    report.indexed_files += 1;
                    let key = normalize_path(&path);
                    if let Some(record) = self.file_record(&key) {
                        report.total_chunks += record.chunk_ids.len();
                    }
                }
                Err(e) => {
                    let key = normalize_path(&path);
                    warn!(path = %key, "bulk index failed: {e}");
                    self.mark_failed(&path, &e.to_string());
                    report.failed_files.push(key);
                }
            }
        }
        report.failed_files.sort();
        info!(
            indexed = report.indexed_files,
            chunks = report.total_chunks,
            failed = report.failed_files.len(),
            "bulk index complete"
        );
        Ok(report)
    }

    pub fn file_record(&self, path: &str) -> Option<FileRecord> {
        self.records
            .read()
            .ok()
            .and_then(|map| map.get(path).cloned())
    }

    pub fn stats(&self) -> Result<IndexStats, IndexError> {
        let store = self.store.stats()?;
        let tracked_files = self.records.read().map(|m| m.len()).unwrap_or(0);
        let failed_files = self.failed.read().map(|m| m.clone()).unwrap_or_default();
        Ok(IndexStats {
            store,
            tracked_files,
            failed_files,
            reindex_passes: self.reindex_passes.load(Ordering::SeqCst),
        })
    }

    /// Record a path as terminally failed after retries are exhausted. The
    /// previous consistent index state for the path stays queryable.
    pub fn mark_failed(&self, path: &Path, reason: &str) {
        let key = normalize_path(path);
        warn!(path = %key, "marking file as failed: {reason}");
        if let Ok(mut failed) = self.failed.write() {
            failed.insert(key, reason.to_string());
        }
    }

    async fn path_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.path_locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop a path's lock entry once no task holds it, so the lock map does
    /// not grow with every file ever deleted over a long watch session.
    async fn release_path_lock(&self, key: &str) {
        let mut locks = self.path_locks.lock().await;
        if let Some(entry) = locks.get(key) {
            if Arc::strong_count(entry) == 1 {
                locks.remove(key);
            }
        }
    }

    #[cfg(test)]
    async fn path_lock_count(&self) -> usize {
        self.path_locks.lock().await.len()
    }

    /// Reindex one file: read, hash-skip, chunk, embed, then swap the new
    /// chunk set in before deleting the stale one so the file never
    /// disappears from query results mid-update.
    async fn index_file(&self, path: &Path, key: &str) -> Result<(), IndexError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            // Deleted between notification and processing; the delete event
            // will follow.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %key, "file vanished before indexing, skipping");
                return Ok(());
            }
            Err(e) => {
                return Err(IndexError::Io {
                    path: key.to_string(),
                    source: e,
                });
            }
        };
        let file_hash = blake3::hash(&bytes).to_hex().to_string();

        if let Some(record) = self.file_record(key) {
            // A pending failure disables the hash skip, otherwise chunks that
            // missed embedding would never be retried until the file changed.
            let retry_pending = self
                .failed
                .read()
                .map(|m| m.contains_key(key))
                .unwrap_or(false);
            if record.last_seen_hash == file_hash && !retry_pending {
                debug!(path = %key, "content unchanged, skipping reindex");
                return Ok(());
            }
        }

        let content = String::from_utf8_lossy(&bytes).into_owned();
        let language = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(crate::chunker::languages::language_for_extension)
            .unwrap_or("text");

        let mut chunks = self.chunker.chunk(key, &content, language);
        for chunk in &mut chunks {
            chunk.index_version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        }

        let old_ids: Vec<String> = self
            .file_record(key)
            .map(|r| r.chunk_ids)
            .unwrap_or_default();

        if chunks.is_empty() {
            // Emptied or whitespace-only file: nothing to store, drop the
            // previous chunks.
            self.store.delete_by_ids(&old_ids)?;
            self.replace_record(
                key,
                FileRecord {
                    file_path: key.to_string(),
                    last_seen_hash: file_hash,
                    chunk_ids: Vec::new(),
                    last_indexed_at: Utc::now(),
                },
            )?;
            self.reindex_passes.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }

        let entries = self.embed_chunks(key, chunks).await?;
        let new_ids: Vec<String> = entries.iter().map(|e| e.chunk.id.clone()).collect();
        let chunk_count = entries.len();

        // New set first, then retire what the new set no longer covers.
        self.store.upsert(entries)?;
        let keep: HashSet<&String> = new_ids.iter().collect();
        let stale: Vec<String> = old_ids.into_iter().filter(|id| !keep.contains(id)).collect();
        self.store.delete_by_ids(&stale)?;

        self.replace_record(
            key,
            FileRecord {
                file_path: key.to_string(),
                last_seen_hash: file_hash,
                chunk_ids: new_ids,
                last_indexed_at: Utc::now(),
            },
        )?;
        self.reindex_passes.fetch_add(1, Ordering::SeqCst);
        debug!(path = %key, chunks = chunk_count, "reindexed");
        Ok(())
    }

    /// Embed off the async runtime. Per-chunk failures degrade gracefully:
    /// chunks that embedded are kept, the file is flagged partial. Only a
    /// total embedding failure is an error (and thus retryable upstream).
    async fn embed_chunks(
        &self,
        key: &str,
        chunks: Vec<Chunk>,
    ) -> Result<Vec<IndexEntry>, IndexError> {
        let embedder = self.embedder.clone();
        let retries = self.options.embed_retries;
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let results = tokio::task::spawn_blocking(move || {
            let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
            embed_many(embedder.as_ref(), &refs, retries)
        })
        .await
        .map_err(|e| IndexError::Task(e.to_string()))?;

        let total = chunks.len();
        let mut entries = Vec::with_capacity(total);
        let mut first_error: Option<EmbedderError> = None;
        for (chunk, result) in chunks.into_iter().zip(results) {
            match result {
                Ok(vector) => entries.push(IndexEntry { chunk, vector }),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if entries.is_empty() {
            if let Some(source) = first_error {
                return Err(IndexError::Embedding {
                    path: key.to_string(),
                    source,
                });
            }
        }
        if entries.len() < total {
            let failed = total - entries.len();
            warn!(path = %key, failed, total, "partial embedding, keeping succeeded chunks");
            if let Ok(mut map) = self.failed.write() {
                map.insert(
                    key.to_string(),
                    format!("{failed} of {total} chunks failed embedding"),
                );
            }
        } else if let Ok(mut map) = self.failed.write() {
            map.remove(key);
        }
        Ok(entries)
    }

    fn remove_file(&self, key: &str) -> Result<(), IndexError> {
        let ids = self.file_record(key).map(|r| r.chunk_ids);
        let Some(ids) = ids else {
            debug!(path = %key, "delete for untracked file, ignoring");
            return Ok(());
        };
        self.store.delete_by_ids(&ids)?;
        if let Ok(mut records) = self.records.write() {
            records.remove(key);
        }
        if let Ok(mut failed) = self.failed.write() {
            failed.remove(key);
        }
        self.persist()?;
        debug!(path = %key, chunks = ids.len(), "removed from index");
        Ok(())
    }

    fn replace_record(&self, key: &str, record: FileRecord) -> Result<(), IndexError> {
        if let Ok(mut records) = self.records.write() {
            records.insert(key.to_string(), record);
        }
        self.persist()
    }

    /// Write the state file via temp-and-rename so a crash mid-write leaves
    /// the previous state intact.
    fn persist(&self) -> Result<(), IndexError> {
        let Some(path) = &self.options.state_path else {
            return Ok(());
        };
        let state = StateFile {
            next_version: self.next_version.load(Ordering::SeqCst),
            records: self
                .records
                .read()
                .map(|m| m.clone())
                .unwrap_or_default(),
        };
        let json = serde_json::to_string_pretty(&state)
            .map_err(|e| IndexError::State(std::io::Error::other(e)))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(IndexError::State)?;
        std::fs::rename(&tmp, path).map_err(IndexError::State)?;
        Ok(())
    }
}

fn load_state(path: &Path) -> Result<StateFile, IndexError> {
    match std::fs::read_to_string(path) {
        Ok(json) => match serde_json::from_str(&json) {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    "state file unreadable ({e}), starting with empty index state"
                );
                Ok(StateFile::default())
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StateFile::default()),
        Err(e) => Err(IndexError::State(e)),
    }
}

/// Canonical record key: forward slashes on every platform.
pub fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
