use super::{bytes_to_embedding, check_dimension, embedding_to_bytes, rank, IndexHit, VectorIndex};
use crate::domain::error::{AppError, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

const INDEX_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS index_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS index_entries (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id TEXT NOT NULL UNIQUE,
    embedding BLOB NOT NULL,
    payload TEXT NOT NULL,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
);
";

/// Index persisted in a SQLite file. Embeddings are little-endian `f32` blobs; similarity is
/// computed in process after loading the candidate rows.
pub struct SqliteIndex {
    pool: SqlitePool,
    dimension: usize,
}

fn unavailable(what: &str, e: sqlx::Error) -> AppError {
    AppError::IndexUnavailable(format!("{}: {}", what, e))
}

impl SqliteIndex {
    pub async fn open(path: &Path, dimension: usize) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let path_str = path.to_str().ok_or_else(|| {
            AppError::ConfigurationError("Vector index path is not valid UTF-8".to_string())
        })?;
        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite://{}",
            path_str.replace('\\', "/")
        ))
        .map_err(|e| AppError::ConfigurationError(format!("Invalid index path: {}", e)))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| unavailable("Failed to open vector index", e))?;

        sqlx::raw_sql(INDEX_SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| unavailable("Failed to create index schema", e))?;

        let index = Self { pool, dimension };
        index.ensure_dimension().await?;
        info!(
            "Opened vector index at {} (dimension {})",
            path.display(),
            dimension
        );
        Ok(index)
    }

    /// The first open records the dimension; later opens must agree with it.
    async fn ensure_dimension(&self) -> Result<()> {
        let stored: Option<String> =
            sqlx::query_scalar("SELECT value FROM index_meta WHERE key = 'dimension'")
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| unavailable("Failed to read index metadata", e))?;

        match stored {
            Some(value) => {
                let stored_dim: usize = value.parse().map_err(|_| {
                    AppError::ConfigurationError(format!(
                        "Corrupt index dimension metadata '{}'",
                        value
                    ))
                })?;
                check_dimension(stored_dim, self.dimension, "Configured embedding")
            }
            None => {
                sqlx::query("INSERT INTO index_meta (key, value) VALUES ('dimension', ?)")
                    .bind(self.dimension.to_string())
                    .execute(&self.pool)
                    .await
                    .map_err(|e| unavailable("Failed to write index metadata", e))?;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(&self, record_id: &str, embedding: Vec<f32>, payload: Value) -> Result<()> {
        check_dimension(self.dimension, embedding.len(), "Embedding")?;
        let payload_text = serde_json::to_string(&payload)
            .map_err(|e| AppError::ParseError(format!("Failed to serialize payload: {}", e)))?;

        // ON CONFLICT keeps `seq`, so a replaced record keeps its insertion position.
        sqlx::query(
            "INSERT INTO index_entries (record_id, embedding, payload)
             VALUES (?, ?, ?)
             ON CONFLICT(record_id) DO UPDATE SET
                embedding = excluded.embedding,
                payload = excluded.payload,
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(record_id)
        .bind(embedding_to_bytes(&embedding))
        .bind(payload_text)
        .execute(&self.pool)
        .await
        .map_err(|e| unavailable("Failed to upsert index entry", e))?;
        Ok(())
    }

    async fn search(&self, query_embedding: &[f32], top_k: usize) -> Result<Vec<IndexHit>> {
        check_dimension(self.dimension, query_embedding.len(), "Query embedding")?;
        let rows = sqlx::query("SELECT record_id, embedding, payload FROM index_entries ORDER BY seq")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| unavailable("Failed to scan index", e))?;

        let mut candidates: Vec<(String, Vec<f32>, Value)> = Vec::with_capacity(rows.len());
        for row in rows {
            let record_id: String = row
                .try_get("record_id")
                .map_err(|e| unavailable("Failed to read record_id", e))?;
            let blob: Vec<u8> = row
                .try_get("embedding")
                .map_err(|e| unavailable("Failed to read embedding", e))?;
            let payload_text: String = row
                .try_get("payload")
                .map_err(|e| unavailable("Failed to read payload", e))?;
            let payload = serde_json::from_str(&payload_text).unwrap_or(Value::Null);
            candidates.push((record_id, bytes_to_embedding(&blob)?, payload));
        }

        Ok(rank(
            query_embedding,
            candidates
                .iter()
                .map(|(id, embedding, payload)| (id.as_str(), embedding.as_slice(), payload)),
            top_k,
        ))
    }

    async fn get(&self, record_id: &str) -> Result<Option<Value>> {
        let payload: Option<String> =
            sqlx::query_scalar("SELECT payload FROM index_entries WHERE record_id = ?")
                .bind(record_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| unavailable("Failed to read index entry", e))?;
        Ok(payload.and_then(|text| serde_json::from_str(&text).ok()))
    }

    async fn remove(&self, record_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM index_entries WHERE record_id = ?")
            .bind(record_id)
            .execute(&self.pool)
            .await
            .map_err(|e| unavailable("Failed to delete index entry", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn ids(&self) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT record_id FROM index_entries ORDER BY seq")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| unavailable("Failed to list index ids", e))
    }

    async fn len(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM index_entries")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| unavailable("Failed to count index entries", e))?;
        Ok(count as usize)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| unavailable("Vector index health check failed", e))?;
        Ok(())
    }
}
