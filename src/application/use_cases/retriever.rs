use crate::application::use_cases::embedding_service::Embedder;
use crate::application::use_cases::schema_store::SchemaStore;
use crate::domain::error::{AppError, Result};
use crate::domain::query::{RetrievedContext, ScoredRecord};
use crate::domain::schema::SchemaRecord;
use crate::infrastructure::vector_index::VectorIndex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Score given to store records used when the index has no hits at all.
pub const FALLBACK_SCORE: f32 = 0.5;

/// Searches take the read side, a re-sync takes the write side.
pub type IndexGate = Arc<RwLock<()>>;

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    store: Arc<SchemaStore>,
    gate: IndexGate,
    timeout: Duration,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        store: Arc<SchemaStore>,
        gate: IndexGate,
        timeout: Duration,
    ) -> Self {
        Self {
            embedder,
            index,
            store,
            gate,
            timeout,
        }
    }

    /// Top-`top_k` schema records for `query`, most similar first.
    ///
    /// Backend failures and timeouts surface as `IndexUnavailable`; a dimension mismatch between
    /// embedder and index is a `ConfigurationError`.
    pub async fn retrieve(&self, query: &str, top_k: usize) -> Result<RetrievedContext> {
        if top_k == 0 {
            return Err(AppError::ValidationError(
                "top_k must be at least 1".to_string(),
            ));
        }

        let embedding = tokio::time::timeout(self.timeout, self.embedder.embed(query))
            .await
            .map_err(|_| {
                AppError::IndexUnavailable(format!(
                    "Query embedding timed out after {:?}",
                    self.timeout
                ))
            })?
            .map_err(|e| match e {
                AppError::ConfigurationError(_) => e,
                other => AppError::IndexUnavailable(format!("Query embedding failed: {}", other)),
            })?;

        if embedding.len() != self.index.dimension() {
            return Err(AppError::ConfigurationError(format!(
                "Query embedding has dimension {} but the index expects {}",
                embedding.len(),
                self.index.dimension()
            )));
        }

        let hits = {
            let _read = self.gate.read().await;
            tokio::time::timeout(self.timeout, self.index.search(&embedding, top_k))
                .await
                .map_err(|_| {
                    AppError::IndexUnavailable(format!(
                        "Vector search timed out after {:?}",
                        self.timeout
                    ))
                })?
                .map_err(|e| match e {
                    AppError::ConfigurationError(_) | AppError::IndexUnavailable(_) => e,
                    other => AppError::IndexUnavailable(other.to_string()),
                })?
        };

        let mut scored = Vec::with_capacity(hits.len());
        for hit in hits {
            match serde_json::from_value::<SchemaRecord>(hit.payload) {
                Ok(record) => scored.push(ScoredRecord {
                    record,
                    similarity_score: hit.score,
                }),
                Err(e) => warn!(
                    "Skipping index entry '{}' with unreadable payload: {}",
                    hit.record_id, e
                ),
            }
        }

        if scored.is_empty() {
            let snapshot = self.store.snapshot();
            if !snapshot.is_empty() {
                info!(
                    "No index hits for query; falling back to the first {} known tables",
                    top_k.min(snapshot.len())
                );
                scored = snapshot
                    .iter()
                    .take(top_k)
                    .map(|record| ScoredRecord {
                        record: record.clone(),
                        similarity_score: FALLBACK_SCORE,
                    })
                    .collect();
            }
        }

        let context = RetrievedContext::from_scored(scored);
        debug!(
            "Retrieved tables: {:?}",
            context.records().map(|r| r.table_name.as_str()).collect::<Vec<_>>()
        );
        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::use_cases::test_support::{
        sample_schema, seeded_index, FailingIndex, HashEmbedder, StalledEmbedder,
    };
    use crate::infrastructure::vector_index::memory::MemoryIndex;

    async fn retriever_with(index: Arc<dyn VectorIndex>, store: Vec<SchemaRecord>) -> Retriever {
        Retriever::new(
            Arc::new(HashEmbedder::new(64)),
            index,
            Arc::new(SchemaStore::new(store)),
            Arc::new(RwLock::new(())),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_retrieves_most_relevant_table_first() {
        let schema = sample_schema();
        let index = seeded_index(&schema).await;
        let retriever = retriever_with(index, schema).await;

        let context = retriever.retrieve("count orders per user", 2).await.unwrap();
        assert_eq!(context.len(), 2);
        assert_eq!(context.entries()[0].record.table_name, "user_orders");
    }

    #[tokio::test]
    async fn test_scores_are_non_increasing_and_clamped() {
        let schema = sample_schema();
        let index = seeded_index(&schema).await;
        let retriever = retriever_with(index, schema).await;

        let context = retriever.retrieve("list all products", 3).await.unwrap();
        let scores: Vec<f32> = context.entries().iter().map(|e| e.similarity_score).collect();
        assert!(scores.windows(2).all(|w| w[0] >= w[1]));
        assert!(scores.iter().all(|s| (0.0..=1.0).contains(s)));
    }

    #[tokio::test]
    async fn test_empty_index_falls_back_to_store_order() {
        let retriever = retriever_with(Arc::new(MemoryIndex::new(64)), sample_schema()).await;
        let context = retriever.retrieve("anything", 2).await.unwrap();
        let names: Vec<_> = context.records().map(|r| r.table_name.as_str()).collect();
        assert_eq!(names, vec!["users", "user_orders"]);
        assert!(context
            .entries()
            .iter()
            .all(|e| (e.similarity_score - FALLBACK_SCORE).abs() < f32::EPSILON));
    }

    #[tokio::test]
    async fn test_empty_index_and_store_gives_empty_context() {
        let retriever = retriever_with(Arc::new(MemoryIndex::new(64)), Vec::new()).await;
        assert!(retriever.retrieve("anything", 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_index_is_reported() {
        let retriever = retriever_with(Arc::new(FailingIndex::new(64)), sample_schema()).await;
        assert!(matches!(
            retriever.retrieve("list users", 3).await,
            Err(AppError::IndexUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_configuration_error() {
        let retriever = retriever_with(Arc::new(MemoryIndex::new(32)), sample_schema()).await;
        assert!(matches!(
            retriever.retrieve("list users", 3).await,
            Err(AppError::ConfigurationError(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_top_k_is_rejected() {
        let retriever = retriever_with(Arc::new(MemoryIndex::new(64)), sample_schema()).await;
        assert!(matches!(
            retriever.retrieve("list users", 0).await,
            Err(AppError::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn test_embedding_timeout_is_index_unavailable() {
        let schema = sample_schema();
        let retriever = Retriever::new(
            Arc::new(StalledEmbedder { dimension: 64 }),
            seeded_index(&schema).await,
            Arc::new(SchemaStore::new(schema)),
            Arc::new(RwLock::new(())),
            Duration::from_millis(50),
        );
        match retriever.retrieve("list users", 3).await {
            Err(AppError::IndexUnavailable(message)) => assert!(message.contains("timed out")),
            other => panic!("expected IndexUnavailable, got {:?}", other.map(|c| c.len())),
        }
    }
}
