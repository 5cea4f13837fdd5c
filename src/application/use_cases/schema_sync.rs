//! Rebuilds the schema store and vector index from the live database catalogue.
//!
//! Runs under the exclusive side of the index gate, so searches never see a half-written
//! index. Tables whose description is unchanged since the last sync are not re-embedded, and
//! nothing is written until every changed table has its embedding.

use crate::application::use_cases::embedding_service::{ensure_dimension, Embedder};
use crate::application::use_cases::retriever::IndexGate;
use crate::application::use_cases::schema_store::SchemaStore;
use crate::domain::error::{AppError, Result};
use crate::domain::schema::SchemaRecord;
use crate::infrastructure::db::Database;
use crate::infrastructure::vector_index::VectorIndex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub tables: usize,
    pub embedded: usize,
    pub unchanged: usize,
    pub removed: usize,
}

pub struct SchemaSync {
    db: Arc<dyn Database>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    store: Arc<SchemaStore>,
    gate: IndexGate,
}

impl SchemaSync {
    pub fn new(
        db: Arc<dyn Database>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        store: Arc<SchemaStore>,
        gate: IndexGate,
    ) -> Self {
        Self {
            db,
            embedder,
            index,
            store,
            gate,
        }
    }

    pub async fn sync(&self) -> Result<SyncReport> {
        if self.embedder.dimension() != self.index.dimension() {
            return Err(AppError::ConfigurationError(format!(
                "Embedder produces dimension {} but the index expects {}",
                self.embedder.dimension(),
                self.index.dimension()
            )));
        }

        let start = Instant::now();
        let _write = self.gate.write().await;

        let tables = self.db.list_tables().await?;
        info!("Syncing schema for {} table(s)", tables.len());

        let mut records = Vec::with_capacity(tables.len());
        for table in &tables {
            records.push(self.db.describe_table(table).await?);
        }

        let mut report = SyncReport {
            tables: records.len(),
            ..SyncReport::default()
        };

        // Every changed table is embedded before the index is touched, so a failing
        // embedder leaves index and store as the previous sync wrote them.
        let mut pending = Vec::new();
        for record in &records {
            if self.is_unchanged(record).await? {
                debug!("Schema of '{}' unchanged, skipping embedding", record.table_name);
                report.unchanged += 1;
                continue;
            }
            let embedding = self.embedder.embed(&record.document()).await?;
            ensure_dimension(&embedding, self.index.dimension())?;
            let payload = serde_json::to_value(record)
                .map_err(|e| AppError::Internal(format!("Failed to serialize schema: {}", e)))?;
            pending.push((record.table_name.as_str(), embedding, payload));
        }

        for (table, embedding, payload) in pending {
            self.index.upsert(table, embedding, payload).await?;
            report.embedded += 1;
        }

        let live: HashSet<&str> = records.iter().map(|r| r.table_name.as_str()).collect();
        for id in self.index.ids().await? {
            if !live.contains(id.as_str()) && self.index.remove(&id).await? {
                debug!("Removed stale index entry '{}'", id);
                report.removed += 1;
            }
        }

        self.store.replace(records);

        info!(
            "Schema sync finished in {}ms: {} table(s), {} embedded, {} unchanged, {} removed",
            start.elapsed().as_millis(),
            report.tables,
            report.embedded,
            report.unchanged,
            report.removed
        );
        Ok(report)
    }

    async fn is_unchanged(&self, record: &SchemaRecord) -> Result<bool> {
        let Some(payload) = self.index.get(&record.table_name).await? else {
            return Ok(false);
        };
        match serde_json::from_value::<SchemaRecord>(payload) {
            Ok(stored) => Ok(stored.content_hash() == record.content_hash()),
            Err(e) => {
                warn!(
                    "Index entry '{}' has an unreadable payload, re-embedding: {}",
                    record.table_name, e
                );
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::use_cases::test_support::{seeded_database, FlakyEmbedder, HashEmbedder};
    use crate::infrastructure::vector_index::memory::MemoryIndex;
    use crate::infrastructure::vector_index::sqlite::SqliteIndex;
    use serde_json::json;
    use tokio::sync::RwLock;

    fn sync_with(
        db: Arc<dyn Database>,
        index: Arc<dyn VectorIndex>,
        store: Arc<SchemaStore>,
    ) -> SchemaSync {
        SchemaSync::new(
            db,
            Arc::new(HashEmbedder::new(64)),
            index,
            store,
            Arc::new(RwLock::new(())),
        )
    }

    #[tokio::test]
    async fn test_sync_fills_store_and_memory_index() {
        let db: Arc<dyn Database> = Arc::new(seeded_database().await);
        let index: Arc<dyn VectorIndex> = Arc::new(MemoryIndex::new(64));
        let store = Arc::new(SchemaStore::default());

        let report = sync_with(db, index.clone(), store.clone()).sync().await.unwrap();
        assert_eq!(report.tables, 3);
        assert_eq!(report.embedded, 3);
        assert_eq!(store.table_names(), vec!["products", "user_orders", "users"]);
        assert_eq!(index.len().await.unwrap(), 3);

        let users = store.get("users").unwrap();
        assert_eq!(users.primary_keys, vec!["id"]);
        assert_eq!(users.columns[1].name, "name");
    }

    #[tokio::test]
    async fn test_second_sync_skips_unchanged_and_prunes_stale() {
        let db: Arc<dyn Database> = Arc::new(seeded_database().await);
        let index: Arc<dyn VectorIndex> = Arc::new(MemoryIndex::new(64));
        index
            .upsert("dropped_table", vec![1.0; 64], json!({}))
            .await
            .unwrap();
        let sync = sync_with(db.clone(), index.clone(), Arc::new(SchemaStore::default()));

        let first = sync.sync().await.unwrap();
        assert_eq!(first.removed, 1);

        db.execute("ALTER TABLE products ADD COLUMN stock INTEGER")
            .await
            .unwrap();
        let second = sync.sync().await.unwrap();
        assert_eq!(second.embedded, 1);
        assert_eq!(second.unchanged, 2);
        assert_eq!(second.removed, 0);
    }

    #[tokio::test]
    async fn test_sync_into_sqlite_index_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        let db: Arc<dyn Database> = Arc::new(seeded_database().await);

        {
            let index: Arc<dyn VectorIndex> = Arc::new(SqliteIndex::open(&path, 64).await.unwrap());
            let report = sync_with(db.clone(), index, Arc::new(SchemaStore::default()))
                .sync()
                .await
                .unwrap();
            assert_eq!(report.embedded, 3);
        }

        let reopened: Arc<dyn VectorIndex> = Arc::new(SqliteIndex::open(&path, 64).await.unwrap());
        let report = sync_with(db, reopened.clone(), Arc::new(SchemaStore::default()))
            .sync()
            .await
            .unwrap();
        assert_eq!(report.unchanged, 3);
        assert_eq!(reopened.len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_embedding_failure_leaves_index_and_store_untouched() {
        let db: Arc<dyn Database> = Arc::new(seeded_database().await);
        let index: Arc<dyn VectorIndex> = Arc::new(MemoryIndex::new(64));
        let store = Arc::new(SchemaStore::default());
        sync_with(db.clone(), index.clone(), store.clone())
            .sync()
            .await
            .unwrap();
        let before = index.get("products").await.unwrap();

        db.execute("ALTER TABLE products ADD COLUMN stock INTEGER")
            .await
            .unwrap();
        db.execute("ALTER TABLE users ADD COLUMN nickname TEXT")
            .await
            .unwrap();
        let flaky = SchemaSync::new(
            db,
            Arc::new(FlakyEmbedder::new(64, 1)),
            index.clone(),
            store.clone(),
            Arc::new(RwLock::new(())),
        );
        assert!(flaky.sync().await.is_err());

        assert_eq!(index.get("products").await.unwrap(), before);
        let products = store.get("products").unwrap();
        assert!(products.find_column("stock").is_none());
        assert!(store.get("users").unwrap().find_column("nickname").is_none());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_fatal() {
        let db: Arc<dyn Database> = Arc::new(seeded_database().await);
        let store = Arc::new(SchemaStore::default());
        let err = sync_with(db, Arc::new(MemoryIndex::new(32)), store.clone())
            .sync()
            .await
            .unwrap_err();
        assert!(err.is_fatal_configuration());
        assert!(store.is_empty());
    }
}
