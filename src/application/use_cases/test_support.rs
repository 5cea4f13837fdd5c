//! Deterministic doubles for the oracles and the index, shared by the use-case tests.

use crate::application::use_cases::embedding_service::Embedder;
use crate::domain::error::{AppError, Result};
use crate::domain::llm_config::CompletionOptions;
use crate::domain::schema::{ColumnSpec, SchemaRecord};
use crate::infrastructure::db::sqlite::{memory_database, SqliteDatabase};
use crate::infrastructure::db::Database;
use crate::infrastructure::llm_clients::LLMClient;
use crate::infrastructure::vector_index::memory::MemoryIndex;
use crate::infrastructure::vector_index::{IndexHit, VectorIndex};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const STOP_WORDS: &[&str] = &[
    "table", "description", "columns", "primary", "key", "int", "integer", "text", "real",
    "varchar", "the", "a", "of", "all", "by", "per", "each", "list", "show", "count", "how",
    "many", "id",
];

/// Bag-of-words embedder: each non-stop-word token bumps one hashed bucket.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn bucket(&self, token: &str) -> usize {
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in token.bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        (hash % self.dimension as u64) as usize
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];
        let lower = text.to_lowercase();
        for token in lower
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| !t.is_empty() && !STOP_WORDS.contains(t))
        {
            let token = token.strip_suffix('s').unwrap_or(token);
            vector[self.bucket(token)] += 1.0;
        }
        // Keeps empty queries from producing a zero vector.
        vector[0] += 0.01;
        Ok(vector)
    }
}

/// Embedder that never answers in time.
pub struct StalledEmbedder {
    pub dimension: usize,
}

#[async_trait]
impl Embedder for StalledEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(vec![0.0; self.dimension])
    }
}

/// Hashes like `HashEmbedder` for the first `successes` calls, then fails every call.
pub struct FlakyEmbedder {
    inner: HashEmbedder,
    remaining: AtomicUsize,
}

impl FlakyEmbedder {
    pub fn new(dimension: usize, successes: usize) -> Self {
        Self {
            inner: HashEmbedder::new(dimension),
            remaining: AtomicUsize::new(successes),
        }
    }
}

#[async_trait]
impl Embedder for FlakyEmbedder {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let left = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match left {
            Ok(_) => self.inner.embed(text).await,
            Err(_) => Err(AppError::Internal("embedding backend unavailable".to_string())),
        }
    }
}

/// Index whose backend is always down.
pub struct FailingIndex {
    dimension: usize,
}

impl FailingIndex {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn down() -> AppError {
        AppError::IndexUnavailable("connection refused".to_string())
    }
}

#[async_trait]
impl VectorIndex for FailingIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(&self, _record_id: &str, _embedding: Vec<f32>, _payload: Value) -> Result<()> {
        Err(Self::down())
    }

    async fn search(&self, _query_embedding: &[f32], _top_k: usize) -> Result<Vec<IndexHit>> {
        Err(Self::down())
    }

    async fn get(&self, _record_id: &str) -> Result<Option<Value>> {
        Err(Self::down())
    }

    async fn remove(&self, _record_id: &str) -> Result<bool> {
        Err(Self::down())
    }

    async fn ids(&self) -> Result<Vec<String>> {
        Err(Self::down())
    }

    async fn len(&self) -> Result<usize> {
        Err(Self::down())
    }

    async fn ping(&self) -> Result<()> {
        Err(Self::down())
    }
}

/// Generation oracle that replays a fixed script and records every prompt it saw.
pub struct ScriptedLLM {
    replies: Mutex<VecDeque<Result<String>>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedLLM {
    pub fn new(replies: Vec<Result<String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn replying(replies: &[&str]) -> Self {
        Self::new(replies.iter().map(|r| Ok(r.to_string())).collect())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LLMClient for ScriptedLLM {
    async fn complete(&self, prompt: &str, _options: &CompletionOptions) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(AppError::LLMError("script exhausted".to_string())))
    }
}

/// Oracle that always repeats the same answer.
pub struct FixedLLM(pub String);

#[async_trait]
impl LLMClient for FixedLLM {
    async fn complete(&self, _prompt: &str, _options: &CompletionOptions) -> Result<String> {
        Ok(self.0.clone())
    }
}

pub fn sample_schema() -> Vec<SchemaRecord> {
    vec![
        SchemaRecord::new(
            "users",
            vec![
                ColumnSpec::new("id", "INTEGER"),
                ColumnSpec::new("name", "TEXT").with_comment("display name"),
                ColumnSpec::new("email", "TEXT"),
                ColumnSpec::new("created_at", "TEXT"),
            ],
        )
        .with_description("Registered people and their contact email")
        .with_primary_keys(&["id"]),
        SchemaRecord::new(
            "user_orders",
            vec![
                ColumnSpec::new("order_id", "INTEGER"),
                ColumnSpec::new("user_id", "INTEGER"),
                ColumnSpec::new("product_id", "INTEGER"),
                ColumnSpec::new("amount", "REAL"),
                ColumnSpec::new("order_date", "TEXT"),
            ],
        )
        .with_description("Orders placed, one row per order")
        .with_primary_keys(&["order_id"]),
        SchemaRecord::new(
            "products",
            vec![
                ColumnSpec::new("product_id", "INTEGER"),
                ColumnSpec::new("title", "TEXT"),
                ColumnSpec::new("price", "REAL"),
                ColumnSpec::new("category", "TEXT"),
            ],
        )
        .with_description("Catalogue items for sale")
        .with_primary_keys(&["product_id"]),
    ]
}

/// Memory index (dimension 64) filled with `schema` via `HashEmbedder`.
pub async fn seeded_index(schema: &[SchemaRecord]) -> Arc<dyn VectorIndex> {
    let embedder = HashEmbedder::new(64);
    let index = MemoryIndex::new(64);
    for record in schema {
        let embedding = embedder.embed(&record.document()).await.unwrap();
        index
            .upsert(
                &record.table_name,
                embedding,
                serde_json::to_value(record).unwrap(),
            )
            .await
            .unwrap();
    }
    Arc::new(index)
}

/// In-memory SQLite database matching `sample_schema`, with a few rows.
pub async fn seeded_database() -> SqliteDatabase {
    let db = memory_database().await;
    for statement in [
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, email TEXT, created_at TEXT)",
        "CREATE TABLE user_orders (order_id INTEGER PRIMARY KEY, user_id INTEGER, product_id INTEGER, amount REAL, order_date TEXT)",
        "CREATE TABLE products (product_id INTEGER PRIMARY KEY, title TEXT, price REAL, category TEXT)",
        "INSERT INTO users (id, name, email, created_at) VALUES
            (1, 'Ada', 'ada@example.com', '2024-01-02'),
            (2, 'Linus', 'linus@example.com', '2024-02-03'),
            (3, 'Grace', 'grace@example.com', '2024-03-04')",
        "INSERT INTO products (product_id, title, price, category) VALUES
            (10, 'Keyboard', 49.5, 'hardware'),
            (11, 'Compiler Book', 30.0, 'books')",
        "INSERT INTO user_orders (order_id, user_id, product_id, amount, order_date) VALUES
            (100, 1, 10, 49.5, '2024-04-01'),
            (101, 1, 11, 30.0, '2024-04-02'),
            (102, 2, 10, 49.5, '2024-04-03'),
            (103, 3, 11, 30.0, '2024-04-04')",
    ] {
        db.execute(statement).await.unwrap();
    }
    db
}
