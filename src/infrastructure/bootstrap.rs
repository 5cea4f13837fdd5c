//! Wires configuration into the running pipeline.
//!
//! Configuration problems surface before any connection is attempted; unreachable backends
//! surface from the health checks. The CLI maps the two to different exit codes.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info};

use crate::application::use_cases::embedding_service::{Embedder, EmbeddingService};
use crate::application::use_cases::orchestrator::Orchestrator;
use crate::application::use_cases::prompt_builder::PromptBuilder;
use crate::application::use_cases::retriever::{IndexGate, Retriever};
use crate::application::use_cases::schema_store::SchemaStore;
use crate::application::use_cases::schema_sync::{SchemaSync, SyncReport};
use crate::application::use_cases::sql_executor::SqlExecutor;
use crate::application::use_cases::sql_generator::{RetryPolicy, SqlGenerator};
use crate::domain::error::Result;
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::db::{self, Database};
use crate::infrastructure::llm_clients::{LLMClient, RouterClient};
use crate::infrastructure::vector_index::{IndexLocation, VectorIndex};

pub struct Services {
    pub config: AppConfig,
    pub db: Arc<dyn Database>,
    pub index: Arc<dyn VectorIndex>,
    pub store: Arc<SchemaStore>,
    pub schema_sync: SchemaSync,
    pub orchestrator: Orchestrator,
}

impl Services {
    /// Builds every service and checks that the database and the vector index answer.
    pub async fn build(config: AppConfig) -> Result<Self> {
        let llm_config = config.llm_config()?;
        let completion_options = config.completion_options()?;
        let embedding_config = config.embedding_config()?;
        let db_settings = config.db_settings()?;

        info!(
            "Generation model: {} ({:?}), embedding model: {} (dimension {})",
            llm_config.model,
            llm_config.provider,
            embedding_config.model,
            config.embedding_dimension
        );

        let embedder: Arc<dyn Embedder> = Arc::new(EmbeddingService::new(
            embedding_config,
            config.embedding_dimension,
        )?);

        let index_location = IndexLocation::parse(&config.vector_index_url)?;

        let db = db::connect(&db_settings, &config.db_pool_config()).await?;
        db.ping().await.map_err(|err| {
            error!(error = %err, database = %db_settings.describe(), "Database health check failed");
            err
        })?;

        let index = index_location.open(config.embedding_dimension).await?;
        index.ping().await.map_err(|err| {
            error!(error = %err, url = %config.vector_index_url, "Vector index health check failed");
            err
        })?;

        let store = Arc::new(SchemaStore::default());
        let gate: IndexGate = Arc::new(RwLock::new(()));

        let schema_sync = SchemaSync::new(
            db.clone(),
            embedder.clone(),
            index.clone(),
            store.clone(),
            gate.clone(),
        );

        let retriever = Retriever::new(
            embedder,
            index.clone(),
            store.clone(),
            gate,
            config.retrieval_timeout(),
        );

        let llm_client: Arc<dyn LLMClient> = Arc::new(RouterClient::new(llm_config));
        let generator = SqlGenerator::new(
            llm_client,
            PromptBuilder::new(db.backend().sql_dialect()),
            completion_options,
            RetryPolicy {
                max_attempts: config.llm_max_attempts,
                initial_backoff: config.llm_backoff(),
                timeout: config.llm_timeout(),
            },
        );

        let executor = SqlExecutor::new(db.clone(), config.result_row_limit, config.query_timeout());

        let orchestrator = Orchestrator::new(
            retriever,
            generator,
            executor,
            store.clone(),
            config.retrieval_top_k,
            config.max_debug_iterations,
        );

        Ok(Self {
            config,
            db,
            index,
            store,
            schema_sync,
            orchestrator,
        })
    }

    /// Loads the live schema into the store and the index.
    pub async fn sync_schema(&self) -> Result<SyncReport> {
        self.schema_sync.sync().await
    }
}
