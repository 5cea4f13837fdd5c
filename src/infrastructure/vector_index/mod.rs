//! Fixed-dimension similarity index over schema records.
//!
//! The index is a black box to the pipeline: ids, embeddings and an opaque JSON payload go in,
//! `(id, score, payload)` triples come out ordered by cosine similarity. Ties keep the order in
//! which ids were first inserted.

pub mod memory;
pub mod sqlite;

use crate::domain::error::{AppError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub record_id: String,
    /// Raw cosine similarity in [-1, 1].
    pub score: f32,
    pub payload: Value,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn dimension(&self) -> usize;

    /// Inserts or replaces. A replaced id keeps its original insertion position.
    async fn upsert(&self, record_id: &str, embedding: Vec<f32>, payload: Value) -> Result<()>;

    async fn search(&self, query_embedding: &[f32], top_k: usize) -> Result<Vec<IndexHit>>;

    async fn get(&self, record_id: &str) -> Result<Option<Value>>;

    /// Returns whether the id was present.
    async fn remove(&self, record_id: &str) -> Result<bool>;

    /// All ids in insertion order.
    async fn ids(&self) -> Result<Vec<String>>;

    async fn len(&self) -> Result<usize>;

    async fn ping(&self) -> Result<()>;
}

/// Where the index lives, as named by its url: `memory://` or `sqlite://<path>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexLocation {
    Memory,
    Sqlite(PathBuf),
}

impl IndexLocation {
    /// Touches nothing, so a bad url is reported before any backend is contacted.
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        if url == "memory://" || url == "memory" {
            return Ok(Self::Memory);
        }
        if let Some(path) = url.strip_prefix("sqlite://") {
            if path.is_empty() {
                return Err(AppError::ConfigurationError(
                    "sqlite:// vector index needs a file path".to_string(),
                ));
            }
            return Ok(Self::Sqlite(PathBuf::from(path)));
        }
        Err(AppError::ConfigurationError(format!(
            "Unsupported vector index url '{}' (expected memory:// or sqlite://<path>)",
            url
        )))
    }

    pub async fn open(&self, dimension: usize) -> Result<Arc<dyn VectorIndex>> {
        if dimension == 0 {
            return Err(AppError::ConfigurationError(
                "Embedding dimension must be positive".to_string(),
            ));
        }
        match self {
            Self::Memory => Ok(Arc::new(memory::MemoryIndex::new(dimension))),
            Self::Sqlite(path) => Ok(Arc::new(sqlite::SqliteIndex::open(path, dimension).await?)),
        }
    }
}

pub(crate) fn check_dimension(expected: usize, actual: usize, what: &str) -> Result<()> {
    if expected != actual {
        return Err(AppError::ConfigurationError(format!(
            "{} has dimension {} but the index expects {}",
            what, actual, expected
        )));
    }
    Ok(())
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot_product / (norm_a * norm_b)
    }
}

/// Scores `(id, embedding, payload)` candidates given in insertion order and keeps the best
/// `top_k`. The sort is stable so equal scores stay in insertion order.
pub(crate) fn rank<'a, I>(query: &[f32], candidates: I, top_k: usize) -> Vec<IndexHit>
where
    I: IntoIterator<Item = (&'a str, &'a [f32], &'a Value)>,
{
    let mut hits: Vec<IndexHit> = candidates
        .into_iter()
        .map(|(id, embedding, payload)| IndexHit {
            record_id: id.to_string(),
            score: cosine_similarity(query, embedding),
            payload: payload.clone(),
        })
        .collect();

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    hits.truncate(top_k);
    hits
}

pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

pub fn bytes_to_embedding(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(AppError::Internal(
            "Invalid embedding bytes length".to_string(),
        ));
    }

    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}
