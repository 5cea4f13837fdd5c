use super::{check_dimension, rank, IndexHit, VectorIndex};
use crate::domain::error::{AppError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

struct Entry {
    record_id: String,
    embedding: Vec<f32>,
    payload: Value,
}

#[derive(Default)]
struct Entries {
    items: Vec<Entry>,
    positions: HashMap<String, usize>,
}

/// In-process index; contents are lost with the process.
pub struct MemoryIndex {
    dimension: usize,
    entries: RwLock<Entries>,
}

impl MemoryIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            entries: RwLock::new(Entries::default()),
        }
    }

    fn poisoned() -> AppError {
        AppError::IndexUnavailable("memory index lock poisoned".to_string())
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(&self, record_id: &str, embedding: Vec<f32>, payload: Value) -> Result<()> {
        check_dimension(self.dimension, embedding.len(), "Embedding")?;
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        match entries.positions.get(record_id).copied() {
            Some(pos) => {
                let entry = &mut entries.items[pos];
                entry.embedding = embedding;
                entry.payload = payload;
            }
            None => {
                let pos = entries.items.len();
                entries.items.push(Entry {
                    record_id: record_id.to_string(),
                    embedding,
                    payload,
                });
                entries.positions.insert(record_id.to_string(), pos);
            }
        }
        Ok(())
    }

    async fn search(&self, query_embedding: &[f32], top_k: usize) -> Result<Vec<IndexHit>> {
        check_dimension(self.dimension, query_embedding.len(), "Query embedding")?;
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(rank(
            query_embedding,
            entries
                .items
                .iter()
                .map(|e| (e.record_id.as_str(), e.embedding.as_slice(), &e.payload)),
            top_k,
        ))
    }

    async fn get(&self, record_id: &str) -> Result<Option<Value>> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(entries
            .positions
            .get(record_id)
            .map(|&pos| entries.items[pos].payload.clone()))
    }

    async fn remove(&self, record_id: &str) -> Result<bool> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        let Some(pos) = entries.positions.remove(record_id) else {
            return Ok(false);
        };
        entries.items.remove(pos);
        for value in entries.positions.values_mut() {
            if *value > pos {
                *value -= 1;
            }
        }
        Ok(true)
    }

    async fn ids(&self) -> Result<Vec<String>> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(entries.items.iter().map(|e| e.record_id.clone()).collect())
    }

    async fn len(&self) -> Result<usize> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(entries.items.len())
    }

    async fn ping(&self) -> Result<()> {
        self.entries.read().map(|_| ()).map_err(|_| Self::poisoned())
    }
}
