/// End-to-end pipeline tests:
///   walk → chunk → embed → store → change events → retrieve → answer
use coderag::chunker::{ChunkKind, Chunker, ChunkerConfig};
use coderag::embedder::Embedder;
use coderag::embedder::mock::MockEmbedder;
use coderag::index::{
    ChangeEvent, ChangeKind, EventLoopConfig, IndexManager, ManagerOptions, event_queue,
    normalize_path, run_event_loop,
};
use coderag::rag::{AskOptions, LlmClient, LlmError, RagEngine};
use coderag::retriever::{RetrieveOptions, Retriever};
use coderag::store::memory::MemoryStore;
use coderag::store::sqlite::SqliteStore;
use coderag::store::{VectorStore, QueryFilter};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

const FILE_A: &str = "fn alpha_entry() -> u32 {\n    42\n}\n";
const FILE_B: &str = "fn beta_first_marker() {}\n\nfn beta_second_marker() {\n    beta_first_marker();\n}\n";

struct Pipeline {
    manager: Arc<IndexManager>,
    store: Arc<MemoryStore>,
    embedder: Arc<MockEmbedder>,
}

fn pipeline() -> Pipeline {
    let store = Arc::new(MemoryStore::new());
    let embedder = Arc::new(MockEmbedder::new(64));
    let chunker = Chunker::new(ChunkerConfig::default()).unwrap();
    let manager = Arc::new(
        IndexManager::new(
            store.clone(),
            embedder.clone(),
            chunker,
            ManagerOptions::default(),
        )
        .unwrap(),
    );
    Pipeline {
        manager,
        store,
        embedder,
    }
}

/// Three files: one function, two functions, and binary-like content that
/// only the window fallback can handle.
fn write_repo(root: &Path) {
    fs::write(root.join("a.rs"), FILE_A).unwrap();
    fs::write(root.join("b.rs"), FILE_B).unwrap();

    let mut garbage = Vec::with_capacity(6000);
    for i in 0..6000u32 {
        garbage.push(if i % 97 == 0 { b'\n' } else { 0xF7 });
    }
    fs::write(root.join("c.py"), garbage).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_initial_index_covers_all_files() {
    let dir = tempdir().unwrap();
    write_repo(dir.path());
    let p = pipeline();

    let report = p
        .manager
        .index_directory(dir.path(), true, None)
        .await
        .unwrap();

    assert_eq!(report.indexed_files, 3);
    assert!(report.failed_files.is_empty());

    let a = p
        .manager
        .file_record(&normalize_path(&dir.path().join("a.rs")))
        .unwrap();
    let b = p
        .manager
        .file_record(&normalize_path(&dir.path().join("b.rs")))
        .unwrap();
    let c = p
        .manager
        .file_record(&normalize_path(&dir.path().join("c.py")))
        .unwrap();

    assert_eq!(a.chunk_ids.len(), 1);
    assert_eq!(b.chunk_ids.len(), 2);
    assert!(c.chunk_ids.len() >= 2, "binary-like file should window-chunk");
    for id in &c.chunk_ids {
        let chunk = p.store.get(id).unwrap().unwrap();
        assert_eq!(chunk.kind, ChunkKind::Window);
    }
    assert_eq!(
        report.total_chunks,
        a.chunk_ids.len() + b.chunk_ids.len() + c.chunk_ids.len()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_modify_one_file_leaves_others_untouched() {
    let dir = tempdir().unwrap();
    write_repo(dir.path());
    let p = pipeline();
    p.manager
        .index_directory(dir.path(), true, None)
        .await
        .unwrap();

    let a_path = dir.path().join("a.rs");
    let old_a = p.manager.file_record(&normalize_path(&a_path)).unwrap();
    let b_before = p
        .manager
        .file_record(&normalize_path(&dir.path().join("b.rs")))
        .unwrap();
    let c_before = p
        .manager
        .file_record(&normalize_path(&dir.path().join("c.py")))
        .unwrap();

    fs::write(&a_path, "fn alpha_entry() -> u32 {\n    43\n}\n").unwrap();
    p.manager
        .apply_event(&a_path, ChangeKind::Modified)
        .await
        .unwrap();

    let new_a = p.manager.file_record(&normalize_path(&a_path)).unwrap();
    assert_ne!(new_a.chunk_ids, old_a.chunk_ids);
    for old_id in &old_a.chunk_ids {
        assert!(p.store.get(old_id).unwrap().is_none(), "stale chunk kept");
    }
    for new_id in &new_a.chunk_ids {
        assert!(p.store.get(new_id).unwrap().is_some());
    }

    // Untouched files keep their exact chunk sets.
    assert_eq!(
        p.manager
            .file_record(&normalize_path(&dir.path().join("b.rs")))
            .unwrap()
            .chunk_ids,
        b_before.chunk_ids
    );
    assert_eq!(
        p.manager
            .file_record(&normalize_path(&dir.path().join("c.py")))
            .unwrap()
            .chunk_ids,
        c_before.chunk_ids
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_delete_removes_exactly_that_file() {
    let dir = tempdir().unwrap();
    write_repo(dir.path());
    let p = pipeline();
    p.manager
        .index_directory(dir.path(), true, None)
        .await
        .unwrap();

    let b_path = dir.path().join("b.rs");
    let b_chunks = p
        .manager
        .file_record(&normalize_path(&b_path))
        .unwrap()
        .chunk_ids
        .len();
    let total_before = p.manager.stats().unwrap().store.total_chunks;

    fs::remove_file(&b_path).unwrap();
    p.manager
        .apply_event(&b_path, ChangeKind::Deleted)
        .await
        .unwrap();

    let stats = p.manager.stats().unwrap();
    assert_eq!(stats.store.total_chunks, total_before - b_chunks);
    assert!(p.manager.file_record(&normalize_path(&b_path)).is_none());

    // Content unique to the deleted file is no longer retrievable.
    let retriever = Retriever::new(p.store.clone(), p.embedder.clone());
    let results = retriever
        .retrieve(
            FILE_B,
            &RetrieveOptions {
                k: 5,
                similarity_threshold: 0.0,
                ..RetrieveOptions::default()
            },
        )
        .unwrap();
    assert!(
        results
            .iter()
            .all(|r| !r.chunk.content.contains("beta_first_marker"))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_strict_threshold_yields_empty_not_error() {
    let dir = tempdir().unwrap();
    write_repo(dir.path());
    let p = pipeline();
    p.manager
        .index_directory(dir.path(), true, None)
        .await
        .unwrap();

    let retriever = Retriever::new(p.store.clone(), p.embedder.clone());
    let results = retriever
        .retrieve(
            "how do I configure the frobnicator daemon",
            &RetrieveOptions {
                k: 5,
                similarity_threshold: 0.9,
                ..RetrieveOptions::default()
            },
        )
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reindex_unchanged_repo_mutates_nothing() {
    let dir = tempdir().unwrap();
    write_repo(dir.path());
    let p = pipeline();
    p.manager
        .index_directory(dir.path(), true, None)
        .await
        .unwrap();
    let passes = p.manager.stats().unwrap().reindex_passes;
    let chunks = p.manager.stats().unwrap().store.total_chunks;

    let report = p
        .manager
        .index_directory(dir.path(), true, None)
        .await
        .unwrap();

    assert_eq!(report.indexed_files, 3);
    assert_eq!(p.manager.stats().unwrap().reindex_passes, passes);
    assert_eq!(p.manager.stats().unwrap().store.total_chunks, chunks);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_debounce_coalesces_rapid_events() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("hot.rs");
    fs::write(&path, "fn v0() {}\n").unwrap();
    let p = pipeline();

    let (sink, rx) = event_queue(64);
    let cancel = CancellationToken::new();
    let event_loop = tokio::spawn(run_event_loop(
        p.manager.clone(),
        rx,
        sink.clone(),
        Vec::new(),
        EventLoopConfig {
            debounce: Duration::from_millis(100),
            ..EventLoopConfig::default()
        },
        cancel.clone(),
    ));

    for i in 1..=5 {
        fs::write(&path, format!("fn v{i}() {{}}\n")).unwrap();
        sink.push(ChangeEvent::now(path.clone(), ChangeKind::Modified));
    }

    tokio::time::sleep(Duration::from_millis(600)).await;
    cancel.cancel();
    event_loop.await.unwrap();

    // One effective pass, over the final content.
    assert_eq!(p.manager.stats().unwrap().reindex_passes, 1);
    let record = p.manager.file_record(&normalize_path(&path)).unwrap();
    let chunk = p.store.get(&record.chunk_ids[0]).unwrap().unwrap();
    assert!(chunk.content.contains("fn v5"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_saturation_rescan_covers_all_roots() {
    let root_a = tempdir().unwrap();
    let root_b = tempdir().unwrap();
    fs::write(root_a.path().join("a.rs"), FILE_A).unwrap();
    fs::write(root_b.path().join("b.rs"), FILE_B).unwrap();
    let p = pipeline();

    // Capacity one: the second push overflows the queue and flags a rescan.
    let (sink, rx) = event_queue(1);
    sink.push(ChangeEvent::now(
        root_a.path().join("ghost.rs"),
        ChangeKind::Modified,
    ));
    sink.push(ChangeEvent::now(
        root_b.path().join("ghost.rs"),
        ChangeKind::Modified,
    ));

    let cancel = CancellationToken::new();
    let event_loop = tokio::spawn(run_event_loop(
        p.manager.clone(),
        rx,
        sink.clone(),
        vec![root_a.path().to_path_buf(), root_b.path().to_path_buf()],
        EventLoopConfig {
            debounce: Duration::from_millis(50),
            ..EventLoopConfig::default()
        },
        cancel.clone(),
    ));

    tokio::time::sleep(Duration::from_millis(800)).await;
    cancel.cancel();
    event_loop.await.unwrap();

    // Every configured root gets rescanned, not just the first.
    let a_key = normalize_path(&root_a.path().join("a.rs"));
    let b_key = normalize_path(&root_b.path().join("b.rs"));
    assert!(p.manager.file_record(&a_key).is_some());
    assert!(p.manager.file_record(&b_key).is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_query_filters_by_language_end_to_end() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("a.rs"), FILE_A).unwrap();
    fs::write(
        dir.path().join("util.py"),
        "def helper():\n    return 42\n",
    )
    .unwrap();
    let p = pipeline();
    p.manager
        .index_directory(dir.path(), true, None)
        .await
        .unwrap();

    let vector = p.embedder.embed("anything").unwrap();
    let hits = p
        .store
        .query(
            &vector,
            10,
            Some(&QueryFilter {
                language: Some("python".to_string()),
                path_prefix: None,
            }),
        )
        .unwrap();
    assert!(!hits.is_empty());
    for hit in hits {
        let chunk = p.store.get(&hit.chunk_id).unwrap().unwrap();
        assert_eq!(chunk.language, "python");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sqlite_backend_round_trip() {
    let dir = tempdir().unwrap();
    write_repo(dir.path());

    let store = Arc::new(SqliteStore::open_in_memory(64).unwrap());
    let embedder = Arc::new(MockEmbedder::new(64));
    let chunker = Chunker::new(ChunkerConfig::default()).unwrap();
    let manager = Arc::new(
        IndexManager::new(
            store.clone(),
            embedder.clone(),
            chunker,
            ManagerOptions::default(),
        )
        .unwrap(),
    );

    let report = manager.index_directory(dir.path(), true, None).await.unwrap();
    assert_eq!(report.indexed_files, 3);

    let retriever = Retriever::new(store.clone(), embedder);
    let results = retriever
        .retrieve(
            "fn alpha_entry() -> u32 {\n    42\n}",
            &RetrieveOptions {
                k: 3,
                similarity_threshold: 0.0,
                ..RetrieveOptions::default()
            },
        )
        .unwrap();
    assert!(!results.is_empty());
    assert!(results[0].chunk.content.contains("alpha_entry"));
}

struct EchoLlm;

impl LlmClient for EchoLlm {
    fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        Ok(format!("prompt was {} chars", prompt.len()))
    }

    fn model(&self) -> &str {
        "echo"
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ask_over_indexed_repo() {
    let dir = tempdir().unwrap();
    write_repo(dir.path());
    let p = pipeline();
    p.manager
        .index_directory(dir.path(), true, None)
        .await
        .unwrap();

    let engine = RagEngine::new(
        Retriever::new(p.store.clone(), p.embedder.clone()),
        Box::new(EchoLlm),
    );
    let answer = tokio::task::spawn_blocking(move || {
        engine.answer(
            "fn alpha_entry() -> u32 {\n    42\n}",
            &AskOptions {
                similarity_threshold: 0.0,
                ..AskOptions::default()
            },
        )
    })
    .await
    .unwrap()
    .unwrap();

    assert!(answer.answer.starts_with("prompt was"));
    assert!(!answer.retrieved_context.is_empty());
    assert_eq!(answer.model, "echo");
}
