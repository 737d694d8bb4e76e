//! In-process reference store: brute-force cosine over a guarded map.
//! Exact rather than approximate, which keeps tests reproducible.

use super::{IndexEntry, QueryFilter, ScoredId, StoreError, StoreStats, VectorStore, cosine_score};
use crate::chunker::Chunk;
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<HashMap<String, (Chunk, Vec<f32>)>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, (Chunk, Vec<f32>)>>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Backend("store lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, (Chunk, Vec<f32>)>>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Backend("store lock poisoned".into()))
    }
}

impl VectorStore for MemoryStore {
    fn upsert(&self, entries: Vec<IndexEntry>) -> Result<(), StoreError> {
        let mut map = self.write()?;
        for entry in entries {
            map.insert(entry.chunk.id.clone(), (entry.chunk, entry.vector));
        }
        Ok(())
    }

    fn delete_by_ids(&self, ids: &[String]) -> Result<(), StoreError> {
        let mut map = self.write()?;
        for id in ids {
            map.remove(id);
        }
        Ok(())
    }

    fn delete_by_file(&self, file_path: &str) -> Result<(), StoreError> {
        let mut map = self.write()?;
        map.retain(|_, (chunk, _)| chunk.file_path != file_path);
        Ok(())
    }

    fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&QueryFilter>,
    ) -> Result<Vec<ScoredId>, StoreError> {
        let map = self.read()?;

        let mut scored: Vec<(f32, u64, &String)> = map
            .iter()
            .filter(|(_, (chunk, _))| matches_filter(chunk, filter))
            .map(|(id, (chunk, v))| (cosine_score(vector, v), chunk.index_version, id))
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.1.cmp(&a.1))
                .then(a.2.cmp(b.2))
        });
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(score, _, id)| ScoredId {
                chunk_id: id.clone(),
                score,
            })
            .collect())
    }

    fn get(&self, chunk_id: &str) -> Result<Option<Chunk>, StoreError> {
        Ok(self.read()?.get(chunk_id).map(|(chunk, _)| chunk.clone()))
    }

    fn stats(&self) -> Result<StoreStats, StoreError> {
        let map = self.read()?;
        let files: BTreeSet<&str> = map.values().map(|(c, _)| c.file_path.as_str()).collect();
        let languages: BTreeSet<&str> = map.values().map(|(c, _)| c.language.as_str()).collect();
        Ok(StoreStats {
            total_chunks: map.len(),
            total_files: files.len(),
            languages: languages.into_iter().map(String::from).collect(),
        })
    }
}

fn matches_filter(chunk: &Chunk, filter: Option<&QueryFilter>) -> bool {
    let Some(f) = filter else { return true };
    if let Some(lang) = &f.language {
        if &chunk.language != lang {
            return false;
        }
    }
    if let Some(prefix) = &f.path_prefix {
        if !chunk.file_path.starts_with(prefix.as_str()) {
            return false;
        }
    }
    true
}
