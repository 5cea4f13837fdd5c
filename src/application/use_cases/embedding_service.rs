use crate::domain::error::{AppError, Result};
use crate::domain::llm_config::{LLMConfig, LLMProvider};
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Embedding oracle: deterministic text → fixed-dimension vector for a given model.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[derive(Debug, Serialize)]
struct OpenAIEmbeddingRequest {
    model: String,
    input: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingResponse {
    data: Vec<OpenAIEmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct GeminiEmbeddingRequest {
    content: GeminiEmbeddingContent,
}

#[derive(Debug, Serialize)]
struct GeminiEmbeddingContent {
    parts: Vec<GeminiEmbeddingPart>,
}

#[derive(Debug, Serialize)]
struct GeminiEmbeddingPart {
    text: String,
}

#[derive(Debug, Deserialize)]
struct GeminiEmbeddingResponse {
    embedding: GeminiEmbeddingResult,
}

#[derive(Debug, Deserialize)]
struct GeminiEmbeddingResult {
    values: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct OllamaEmbeddingRequest {
    model: String,
    prompt: String,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

pub struct EmbeddingService {
    client: Client,
    config: LLMConfig,
    dimension: usize,
    local_model: Option<EmbeddingModel>,
    local_embedder: Arc<Mutex<Option<TextEmbedding>>>,
}

impl EmbeddingService {
    /// Unknown local model names are rejected here rather than at the first query.
    pub fn new(config: LLMConfig, dimension: usize) -> Result<Self> {
        let local_model = match config.provider {
            LLMProvider::Local => Some(Self::resolve_local_embedding_model(&config.model)?),
            _ => None,
        };
        Ok(Self {
            client: Client::new(),
            config,
            dimension,
            local_model,
            local_embedder: Arc::new(Mutex::new(None)),
        })
    }

    fn resolve_gemini_embedding_model(model: &str) -> String {
        let trimmed = model.trim().trim_start_matches("models/");
        if trimmed.contains("embedding") {
            trimmed.to_string()
        } else {
            "text-embedding-004".to_string()
        }
    }

    fn resolve_local_embedding_model(model: &str) -> Result<EmbeddingModel> {
        match model.trim().to_lowercase().as_str() {
            "all-minilm-l6-v2" => Ok(EmbeddingModel::AllMiniLML6V2),
            "all-minilm-l12-v2" => Ok(EmbeddingModel::AllMiniLML12V2),
            "bge-small-en-v1.5" => Ok(EmbeddingModel::BGESmallENV15),
            "bge-base-en-v1.5" => Ok(EmbeddingModel::BGEBaseENV15),
            "nomic-embed-text-v1.5" => Ok(EmbeddingModel::NomicEmbedTextV15),
            "multilingual-e5-small" => Ok(EmbeddingModel::MultilingualE5Small),
            other => Err(AppError::ConfigurationError(format!(
                "Unsupported local embedding model '{}'",
                other
            ))),
        }
    }

    /// Model loading and inference are CPU-bound and run on the blocking pool.
    async fn generate_local_embedding(&self, text: &str) -> Result<Vec<f32>> {
        let model = self.local_model.clone();
        let model_name = self.config.model.clone();
        let slot = Arc::clone(&self.local_embedder);
        let text = text.to_string();
        tokio::task::spawn_blocking(move || {
            Self::embed_locally(model, &model_name, &slot, text)
        })
        .await
        .map_err(|e| AppError::Internal(format!("Local embedding task failed: {}", e)))?
    }

    fn embed_locally(
        model: Option<EmbeddingModel>,
        model_name: &str,
        slot: &Mutex<Option<TextEmbedding>>,
        text: String,
    ) -> Result<Vec<f32>> {
        let model =
            model.ok_or_else(|| AppError::Internal("Local embedder not configured".to_string()))?;
        let mut guard = slot
            .lock()
            .map_err(|_| AppError::Internal("Local embedder lock poisoned".to_string()))?;
        if guard.is_none() {
            info!("Loading local embedding model {}", model_name);
            let mut options = InitOptions::default();
            options.model_name = model;
            let embedder = TextEmbedding::try_new(options)
                .map_err(|e| AppError::Internal(format!("Failed to init local embedder: {}", e)))?;
            *guard = Some(embedder);
        }
        let embedder = guard
            .as_mut()
            .ok_or_else(|| AppError::Internal("Local embedder unavailable".to_string()))?;
        let embeddings = embedder
            .embed(vec![text], None)
            .map_err(|e| AppError::Internal(format!("Failed to embed text: {}", e)))?;
        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Internal("Empty embedding response".to_string()))
    }

    async fn generate_openai_embedding(&self, text: &str) -> Result<Vec<f32>> {
        let config = &self.config;
        let url = if config.base_url.ends_with('/') {
            format!("{}embeddings", config.base_url)
        } else {
            format!("{}/embeddings", config.base_url)
        };

        let request = OpenAIEmbeddingRequest {
            model: config.model.clone(),
            input: text.to_string(),
        };

        let mut req = self.client.post(&url);
        if let Some(api_key) = &config.api_key {
            req = req.bearer_auth(api_key);
        }

        let response = req
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                AppError::Internal(format!("Failed to call embedding API ({}): {}", url, e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::Internal(format!(
                "Embedding API returned error {} (URL: {}): {}",
                status, url, error_text
            )));
        }

        let embedding_response: OpenAIEmbeddingResponse = response.json().await.map_err(|e| {
            AppError::Internal(format!("Failed to parse embedding response: {}", e))
        })?;

        embedding_response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| AppError::Internal("No embedding data in response".to_string()))
    }

    async fn generate_gemini_embedding(&self, text: &str) -> Result<Vec<f32>> {
        let config = &self.config;
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| AppError::Internal("Missing API key for Google provider".to_string()))?;
        let mut base_url = config.base_url.trim_end_matches('/').to_string();
        if !base_url.ends_with("/models") {
            base_url = format!("{}/models", base_url);
        }
        let model_id = Self::resolve_gemini_embedding_model(&config.model);
        let url = format!("{}/{}:embedContent?key={}", base_url, model_id, api_key);

        let request = GeminiEmbeddingRequest {
            content: GeminiEmbeddingContent {
                parts: vec![GeminiEmbeddingPart {
                    text: text.to_string(),
                }],
            },
        };

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::Internal(format!("Failed to call embedding API: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::Internal(format!(
                "Embedding API returned error {}: {}",
                status, error_text
            )));
        }

        let embedding_response: GeminiEmbeddingResponse = response.json().await.map_err(|e| {
            AppError::Internal(format!("Failed to parse embedding response: {}", e))
        })?;

        Ok(embedding_response.embedding.values)
    }

    fn ollama_url(base_url: &str) -> String {
        let url = base_url.trim_end_matches('/');
        let url = url.strip_suffix("/v1").unwrap_or(url);
        format!("{}/api/embeddings", url.trim_end_matches('/'))
    }

    async fn generate_ollama_embedding(&self, text: &str) -> Result<Vec<f32>> {
        let url = Self::ollama_url(&self.config.base_url);

        let request = OllamaEmbeddingRequest {
            model: self.config.model.clone(),
            prompt: text.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                AppError::Internal(format!("Failed to call embedding API ({}): {}", url, e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::Internal(format!(
                "Embedding API returned error {} (URL: {}): {}",
                status, url, error_text
            )));
        }

        let embedding_response: OllamaEmbeddingResponse = response.json().await.map_err(|e| {
            AppError::Internal(format!("Failed to parse embedding response: {}", e))
        })?;

        Ok(embedding_response.embedding)
    }
}

/// A vector of the wrong size means model and index disagree; no query can succeed after that.
pub fn ensure_dimension(embedding: &[f32], expected: usize) -> Result<()> {
    if embedding.is_empty() {
        return Err(AppError::Internal("Empty embedding response".to_string()));
    }
    if embedding.len() != expected {
        return Err(AppError::ConfigurationError(format!(
            "Embedding model produced {} dimensions but {} are configured",
            embedding.len(),
            expected
        )));
    }
    Ok(())
}

#[async_trait]
impl Embedder for EmbeddingService {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embedding = match self.config.provider {
            LLMProvider::Local => self.generate_local_embedding(text).await?,
            LLMProvider::OpenAI => self.generate_openai_embedding(text).await?,
            LLMProvider::Google => self.generate_gemini_embedding(text).await?,
            LLMProvider::Ollama => self.generate_ollama_embedding(text).await?,
        };
        ensure_dimension(&embedding, self.dimension)?;
        Ok(embedding)
    }
}
