//! Persistent store on SQLite + sqlite-vec: chunk metadata in a regular
//! table, vectors in a vec0 virtual table joined by rowid.

use super::{IndexEntry, QueryFilter, ScoredId, StoreError, StoreStats, VectorStore};
use crate::chunker::{Chunk, ChunkKind};
use rusqlite::{Connection, OptionalExtension, params};
use rusqlite::types::Value;
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, Once};
use tracing::info;

static INIT_VEC: Once = Once::new();

/// Register the sqlite-vec extension. Safe to call multiple times.
fn init_sqlite_vec() {
    INIT_VEC.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

fn schema_sql(dimensions: usize) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chunk_id TEXT NOT NULL UNIQUE,
    file_path TEXT NOT NULL,
    line_start INTEGER NOT NULL,
    line_end INTEGER NOT NULL,
    language TEXT NOT NULL,
    chunk_kind TEXT NOT NULL,
    content TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    index_version INTEGER NOT NULL,
    indexed_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_chunks_chunk_id ON chunks(chunk_id);
CREATE INDEX IF NOT EXISTS idx_chunks_file ON chunks(file_path);
CREATE INDEX IF NOT EXISTS idx_chunks_language ON chunks(language);

CREATE VIRTUAL TABLE IF NOT EXISTS vec_chunks USING vec0(
    embedding FLOAT[{dimensions}]
);
"#
    )
}

/// Serialize a float32 vector into little-endian bytes for the vec0 table.
pub fn serialize_vector(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the store at `path` with the given vector dimension.
    pub fn open<P: AsRef<Path>>(path: P, dimensions: usize) -> Result<Self, StoreError> {
        let path = path.as_ref();
        info!("opening vector store: {}", path.display());
        init_sqlite_vec();
        let conn = Connection::open(path)?;
        Self::init(conn, dimensions)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory(dimensions: usize) -> Result<Self, StoreError> {
        init_sqlite_vec();
        let conn = Connection::open_in_memory()?;
        Self::init(conn, dimensions)
    }

    fn init(conn: Connection, dimensions: usize) -> Result<Self, StoreError> {
        let vec_version: String = conn.query_row("SELECT vec_version()", [], |row| row.get(0))?;
        info!("sqlite-vec version: {vec_version}");
        conn.execute_batch(&schema_sql(dimensions))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("connection lock poisoned".into()))
    }
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chunk> {
    let kind: String = row.get(5)?;
    Ok(Chunk {
        id: row.get(0)?,
        file_path: row.get(1)?,
        line_start: row.get::<_, i64>(2)? as usize,
        line_end: row.get::<_, i64>(3)? as usize,
        language: row.get(4)?,
        kind: ChunkKind::parse(&kind).unwrap_or(ChunkKind::Window),
        content: row.get(6)?,
        content_hash: row.get(7)?,
        index_version: row.get::<_, i64>(8)? as u64,
    })
}

const CHUNK_COLUMNS: &str =
    "chunk_id, file_path, line_start, line_end, language, chunk_kind, content, content_hash, index_version";

impl VectorStore for SqliteStore {
    fn upsert(&self, entries: Vec<IndexEntry>) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        for entry in &entries {
            let chunk = &entry.chunk;

            // Replace any previous row for this id: vec0 rows do not cascade.
            let old_rowid: Option<i64> = tx
                .query_row(
                    "SELECT id FROM chunks WHERE chunk_id = ?",
                    params![chunk.id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(rowid) = old_rowid {
                tx.execute("DELETE FROM vec_chunks WHERE rowid = ?", params![rowid])?;
                tx.execute("DELETE FROM chunks WHERE id = ?", params![rowid])?;
            }

            tx.execute(
                &format!("INSERT INTO chunks ({CHUNK_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"),
                params![
                    chunk.id,
                    chunk.file_path,
                    chunk.line_start as i64,
                    chunk.line_end as i64,
                    chunk.language,
                    chunk.kind.as_str(),
                    chunk.content,
                    chunk.content_hash,
                    chunk.index_version as i64,
                ],
            )?;
            let rowid = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO vec_chunks (rowid, embedding) VALUES (?, ?)",
                params![rowid, serialize_vector(&entry.vector)],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn delete_by_ids(&self, ids: &[String]) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for chunk_id in ids {
            let rowid: Option<i64> = tx
                .query_row(
                    "SELECT id FROM chunks WHERE chunk_id = ?",
                    params![chunk_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(rowid) = rowid {
                tx.execute("DELETE FROM vec_chunks WHERE rowid = ?", params![rowid])?;
                tx.execute("DELETE FROM chunks WHERE id = ?", params![rowid])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn delete_by_file(&self, file_path: &str) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM vec_chunks WHERE rowid IN (SELECT id FROM chunks WHERE file_path = ?)",
            params![file_path],
        )?;
        tx.execute("DELETE FROM chunks WHERE file_path = ?", params![file_path])?;
        tx.commit()?;
        Ok(())
    }

    fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&QueryFilter>,
    ) -> Result<Vec<ScoredId>, StoreError> {
        let conn = self.conn()?;

        let mut sql = String::from(
            r#"
            SELECT c.chunk_id,
                   vec_distance_cosine(v.embedding, ?) AS distance
            FROM vec_chunks v
            JOIN chunks c ON v.rowid = c.id
            "#,
        );

        let mut where_clauses = Vec::new();
        let mut sql_params: Vec<Value> = vec![Value::Blob(serialize_vector(vector))];

        if let Some(f) = filter {
            if let Some(lang) = &f.language {
                where_clauses.push("c.language = ?");
                sql_params.push(Value::Text(lang.clone()));
            }
            if let Some(prefix) = &f.path_prefix {
                where_clauses.push("c.file_path LIKE ?");
                sql_params.push(Value::Text(format!("{prefix}%")));
            }
        }

        if !where_clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clauses.join(" AND "));
        }

        sql.push_str(" ORDER BY distance ASC, c.index_version DESC, c.chunk_id ASC LIMIT ?");
        sql_params.push(Value::Integer(k as i64));

        let param_refs: Vec<&dyn rusqlite::ToSql> =
            sql_params.iter().map(|p| p as &dyn rusqlite::ToSql).collect();

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            let distance: f64 = row.get(1)?;
            Ok(ScoredId {
                chunk_id: row.get(0)?,
                score: (1.0 - distance / 2.0) as f32,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    fn get(&self, chunk_id: &str) -> Result<Option<Chunk>, StoreError> {
        let conn = self.conn()?;
        let chunk = conn
            .query_row(
                &format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE chunk_id = ?"),
                params![chunk_id],
                row_to_chunk,
            )
            .optional()?;
        Ok(chunk)
    }

    fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.conn()?;
        let total_chunks: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get(0))?;
        let total_files: i64 =
            conn.query_row("SELECT COUNT(DISTINCT file_path) FROM chunks", [], |r| {
                r.get(0)
            })?;

        let mut stmt = conn.prepare("SELECT DISTINCT language FROM chunks ORDER BY language")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut languages = Vec::new();
        for row in rows {
            languages.push(row?);
        }

        Ok(StoreStats {
            total_chunks: total_chunks as usize,
            total_files: total_files as usize,
            languages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, file: &str, lang: &str, version: u64, vector: Vec<f32>) -> IndexEntry {
        IndexEntry {
            chunk: Chunk {
                id: id.to_string(),
                file_path: file.to_string(),
                line_start: 1,
                line_end: 3,
                language: lang.to_string(),
                kind: ChunkKind::Function,
                content: format!("fn {id}() {{}}"),
                content_hash: format!("hash-{id}"),
                index_version: version,
            },
            vector,
        }
    }

    fn unit(dir: usize, dims: usize) -> Vec<f32> {
        let mut v = vec![0.0; dims];
        v[dir] = 1.0;
        v
    }

    #[test]
    fn test_schema_init() {
        let store = SqliteStore::open_in_memory(4).unwrap();
        assert_eq!(store.stats().unwrap(), StoreStats::default());
    }

    #[test]
    fn test_upsert_query_roundtrip() {
        let store = SqliteStore::open_in_memory(4).unwrap();
        store
            .upsert(vec![
                entry("c1", "a.rs", "rust", 1, unit(0, 4)),
                entry("c2", "b.py", "python", 1, unit(1, 4)),
            ])
            .unwrap();

        let hits = store.query(&unit(0, 4), 2, None).unwrap();
        assert_eq!(hits[0].chunk_id, "c1");
        assert!(hits[0].score > 0.99);
        assert!(hits[1].score < hits[0].score);

        let chunk = store.get("c1").unwrap().expect("c1 should exist");
        assert_eq!(chunk.file_path, "a.rs");
        assert_eq!(chunk.kind, ChunkKind::Function);
        assert_eq!(chunk.index_version, 1);
    }

    #[test]
    fn test_upsert_replaces_same_id() {
        let store = SqliteStore::open_in_memory(4).unwrap();
        store
            .upsert(vec![entry("c1", "a.rs", "rust", 1, unit(0, 4))])
            .unwrap();
        store
            .upsert(vec![entry("c1", "a.rs", "rust", 2, unit(1, 4))])
            .unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_chunks, 1);
        assert_eq!(store.get("c1").unwrap().unwrap().index_version, 2);

        let hits = store.query(&unit(1, 4), 1, None).unwrap();
        assert!(hits[0].score > 0.99);
    }

    #[test]
    fn test_delete_by_ids_idempotent() {
        let store = SqliteStore::open_in_memory(4).unwrap();
        store
            .upsert(vec![entry("c1", "a.rs", "rust", 1, unit(0, 4))])
            .unwrap();

        let ids = vec!["c1".to_string(), "missing".to_string()];
        store.delete_by_ids(&ids).unwrap();
        store.delete_by_ids(&ids).unwrap();
        assert_eq!(store.stats().unwrap().total_chunks, 0);
        assert!(store.get("c1").unwrap().is_none());
    }

    #[test]
    fn test_delete_by_file() {
        let store = SqliteStore::open_in_memory(4).unwrap();
        store
            .upsert(vec![
                entry("c1", "a.rs", "rust", 1, unit(0, 4)),
                entry("c2", "a.rs", "rust", 1, unit(1, 4)),
                entry("c3", "b.py", "python", 1, unit(2, 4)),
            ])
            .unwrap();

        store.delete_by_file("a.rs").unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.total_chunks, 1);
        assert_eq!(stats.languages, vec!["python"]);
    }

    #[test]
    fn test_query_filters() {
        let store = SqliteStore::open_in_memory(4).unwrap();
        store
            .upsert(vec![
                entry("c1", "src/a.rs", "rust", 1, unit(0, 4)),
                entry("c2", "lib/b.py", "python", 1, unit(0, 4)),
            ])
            .unwrap();

        let by_lang = QueryFilter {
            language: Some("rust".into()),
            path_prefix: None,
        };
        let hits = store.query(&unit(0, 4), 10, Some(&by_lang)).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "c1");

        let by_path = QueryFilter {
            language: None,
            path_prefix: Some("lib/".into()),
        };
        let hits = store.query(&unit(0, 4), 10, Some(&by_path)).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "c2");
    }

    #[test]
    fn test_tie_break_version_then_id() {
        let store = SqliteStore::open_in_memory(4).unwrap();
        store
            .upsert(vec![
                entry("cb", "a.rs", "rust", 1, unit(0, 4)),
                entry("ca", "a.rs", "rust", 1, unit(0, 4)),
                entry("cz", "a.rs", "rust", 7, unit(0, 4)),
            ])
            .unwrap();

        let hits = store.query(&unit(0, 4), 3, None).unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["cz", "ca", "cb"]);
    }

    #[test]
    fn test_serialize_vector() {
        let bytes = serialize_vector(&[1.0, 2.0, -3.5]);
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[0..4], &[0x00, 0x00, 0x80, 0x3f]);
        assert_eq!(&bytes[4..8], &[0x00, 0x00, 0x00, 0x40]);
        assert_eq!(&bytes[8..12], &[0x00, 0x00, 0x60, 0xc0]);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.db");

        {
            let store = SqliteStore::open(&path, 4).unwrap();
            store
                .upsert(vec![entry("c1", "a.rs", "rust", 1, unit(0, 4))])
                .unwrap();
        }

        let store = SqliteStore::open(&path, 4).unwrap();
        assert_eq!(store.stats().unwrap().total_chunks, 1);
        assert_eq!(store.get("c1").unwrap().unwrap().content, "fn c1() {}");
    }
}
