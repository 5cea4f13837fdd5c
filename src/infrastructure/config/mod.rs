//! Layered runtime configuration.
//!
//! Precedence, lowest first: built-in defaults, an optional TOML file, then environment
//! variables named after the keys in upper case (`DB_HOST`, `LLM_MODEL`, ...). A `.env` file in
//! the working directory is loaded into the environment before layering.

use crate::domain::error::{AppError, Result};
use crate::domain::llm_config::{CompletionOptions, LLMConfig, LLMProvider};
use crate::infrastructure::db::{DbBackend, DbConnectionConfig, DbSettings};
use crate::infrastructure::security::keyring::resolve_secret;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};
use validator::{Validate, ValidationError};

pub const DEFAULT_CONFIG_FILE: &str = "text2sql.toml";

const KEYS: &[&str] = &[
    "db_backend",
    "db_host",
    "db_port",
    "db_name",
    "db_user",
    "db_password",
    "db_max_connections",
    "db_connect_timeout_secs",
    "db_query_timeout_secs",
    "vector_index_url",
    "embedding_provider",
    "embedding_model",
    "embedding_base_url",
    "embedding_api_key",
    "embedding_dimension",
    "llm_provider",
    "llm_model",
    "llm_base_url",
    "llm_api_key",
    "llm_temperature",
    "llm_max_tokens",
    "llm_stop_sequences",
    "llm_timeout_secs",
    "llm_max_attempts",
    "llm_backoff_ms",
    "retrieval_top_k",
    "retrieval_timeout_secs",
    "max_debug_iterations",
    "result_row_limit",
];

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AppConfig {
    #[validate(custom(function = "validate_backend"))]
    pub db_backend: String,
    #[serde(deserialize_with = "lenient_string")]
    pub db_host: String,
    pub db_port: Option<u16>,
    #[serde(deserialize_with = "lenient_string")]
    pub db_name: String,
    #[serde(deserialize_with = "lenient_string")]
    pub db_user: String,
    /// Literal, or an `env:` / `keychain:` / `plain:` reference.
    #[serde(deserialize_with = "lenient_string")]
    pub db_password: String,
    #[validate(range(min = 1, max = 100))]
    pub db_max_connections: u32,
    #[validate(range(min = 1))]
    pub db_connect_timeout_secs: u64,
    #[validate(range(min = 1))]
    pub db_query_timeout_secs: u64,

    #[validate(length(min = 1))]
    pub vector_index_url: String,

    #[validate(custom(function = "validate_provider"))]
    pub embedding_provider: String,
    #[validate(length(min = 1))]
    pub embedding_model: String,
    #[serde(default, deserialize_with = "lenient_optional_string")]
    pub embedding_base_url: Option<String>,
    #[serde(default, deserialize_with = "lenient_optional_string")]
    pub embedding_api_key: Option<String>,
    #[validate(range(min = 1, max = 8192))]
    pub embedding_dimension: usize,

    #[validate(custom(function = "validate_provider"))]
    pub llm_provider: String,
    #[validate(length(min = 1))]
    pub llm_model: String,
    #[validate(length(min = 1))]
    pub llm_base_url: String,
    #[serde(default, deserialize_with = "lenient_optional_string")]
    pub llm_api_key: Option<String>,
    #[validate(range(min = 0.0, max = 2.0))]
    pub llm_temperature: f32,
    #[validate(range(min = 1))]
    pub llm_max_tokens: u32,
    /// `|`-separated.
    #[serde(default, deserialize_with = "lenient_string")]
    pub llm_stop_sequences: String,
    #[validate(range(min = 1))]
    pub llm_timeout_secs: u64,
    #[validate(range(min = 1, max = 10))]
    pub llm_max_attempts: u32,
    pub llm_backoff_ms: u64,

    #[validate(range(min = 1, max = 100))]
    pub retrieval_top_k: usize,
    #[validate(range(min = 1))]
    pub retrieval_timeout_secs: u64,
    #[validate(range(max = 20))]
    pub max_debug_iterations: u32,
    #[validate(range(min = 1))]
    pub result_row_limit: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_backend: "mysql".to_string(),
            db_host: "localhost".to_string(),
            db_port: None,
            db_name: "test_db".to_string(),
            db_user: "root".to_string(),
            db_password: String::new(),
            db_max_connections: 5,
            db_connect_timeout_secs: 10,
            db_query_timeout_secs: 30,
            vector_index_url: "memory://".to_string(),
            embedding_provider: "local".to_string(),
            embedding_model: "all-minilm-l6-v2".to_string(),
            embedding_base_url: None,
            embedding_api_key: None,
            embedding_dimension: 384,
            llm_provider: "openai".to_string(),
            llm_model: "deepseek-chat".to_string(),
            llm_base_url: "https://api.deepseek.com".to_string(),
            llm_api_key: None,
            llm_temperature: 0.1,
            llm_max_tokens: 2000,
            llm_stop_sequences: String::new(),
            llm_timeout_secs: 60,
            llm_max_attempts: 3,
            llm_backoff_ms: 500,
            retrieval_top_k: 5,
            retrieval_timeout_secs: 15,
            max_debug_iterations: 3,
            result_row_limit: 100,
        }
    }
}

fn validate_backend(value: &str) -> std::result::Result<(), ValidationError> {
    DbBackend::parse(value)
        .map(|_| ())
        .ok_or_else(|| ValidationError::new("unknown_db_backend"))
}

fn validate_provider(value: &str) -> std::result::Result<(), ValidationError> {
    LLMProvider::parse(value)
        .map(|_| ())
        .ok_or_else(|| ValidationError::new("unknown_provider"))
}

/// Environment values that look numeric (`DB_PASSWORD=1234`) arrive as numbers; string
/// fields accept them verbatim.
#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    Flag(bool),
}

impl Scalar {
    fn into_string(self) -> String {
        match self {
            Scalar::Text(s) => s,
            Scalar::Signed(n) => n.to_string(),
            Scalar::Unsigned(n) => n.to_string(),
            Scalar::Float(n) => n.to_string(),
            Scalar::Flag(b) => b.to_string(),
        }
    }
}

fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    Scalar::deserialize(d).map(Scalar::into_string)
}

fn lenient_optional_string<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<String>, D::Error> {
    let value = Option::<Scalar>::deserialize(d)?;
    Ok(value
        .map(Scalar::into_string)
        .filter(|s| !s.trim().is_empty()))
}

impl AppConfig {
    /// Loads `.env`, layers defaults, TOML and environment, then validates.
    ///
    /// An explicit `config_path` must exist; without one, `text2sql.toml` is used when present.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!("Loaded environment from {}", path.display());
        }

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
        match config_path {
            Some(path) => {
                if !path.exists() {
                    return Err(AppError::ConfigurationError(format!(
                        "Config file {} does not exist",
                        path.display()
                    )));
                }
                info!("Using config file {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    info!("Using config file {}", default_path.display());
                    figment = figment.merge(Toml::file(default_path));
                }
            }
        }
        figment = figment.merge(Env::raw().only(KEYS));

        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: AppConfig = figment.extract()?;
        config
            .validate()
            .map_err(|e| AppError::ConfigurationError(format!("Invalid configuration: {}", e)))?;
        Ok(config)
    }

    pub fn db_backend(&self) -> Result<DbBackend> {
        DbBackend::parse(&self.db_backend).ok_or_else(|| {
            AppError::ConfigurationError(format!("Unknown db_backend '{}'", self.db_backend))
        })
    }

    /// Connection target with the password reference resolved.
    pub fn db_settings(&self) -> Result<DbSettings> {
        let backend = self.db_backend()?;
        Ok(DbSettings {
            backend,
            host: self.db_host.clone(),
            port: self.db_port.unwrap_or_else(|| backend.default_port()),
            database: self.db_name.clone(),
            user: self.db_user.clone(),
            password: resolve_secret(&self.db_password)?,
        })
    }

    pub fn db_pool_config(&self) -> DbConnectionConfig {
        DbConnectionConfig {
            max_connections: self.db_max_connections,
            connect_timeout_secs: self.db_connect_timeout_secs,
            query_timeout_secs: self.db_query_timeout_secs,
            ..DbConnectionConfig::default()
        }
    }

    /// Generation oracle settings. Falls back to `DEEPSEEK_API_KEY` / `OPENAI_API_KEY` when no
    /// key is configured.
    pub fn llm_config(&self) -> Result<LLMConfig> {
        let provider = LLMProvider::parse(&self.llm_provider).ok_or_else(|| {
            AppError::ConfigurationError(format!("Unknown llm_provider '{}'", self.llm_provider))
        })?;
        if provider == LLMProvider::Local {
            return Err(AppError::ConfigurationError(
                "llm_provider 'local' only supports embeddings; use openai, ollama or gemini"
                    .to_string(),
            ));
        }

        let api_key = self.llm_api_key.clone().or_else(|| match provider {
            LLMProvider::OpenAI => std::env::var("DEEPSEEK_API_KEY")
                .or_else(|_| std::env::var("OPENAI_API_KEY"))
                .ok()
                .filter(|k| !k.trim().is_empty()),
            LLMProvider::Google => std::env::var("GEMINI_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
            _ => None,
        });

        let config = LLMConfig {
            provider,
            base_url: self.llm_base_url.clone(),
            model: self.llm_model.clone(),
            api_key,
            max_tokens: Some(self.llm_max_tokens),
            temperature: Some(self.llm_temperature),
        };
        if config.requires_api_key() && config.api_key.is_none() {
            return Err(AppError::ConfigurationError(format!(
                "llm_api_key is required for {} at {}",
                self.llm_provider, self.llm_base_url
            )));
        }
        Ok(config)
    }

    pub fn embedding_config(&self) -> Result<LLMConfig> {
        let provider = LLMProvider::parse(&self.embedding_provider).ok_or_else(|| {
            AppError::ConfigurationError(format!(
                "Unknown embedding_provider '{}'",
                self.embedding_provider
            ))
        })?;
        let base_url = self.embedding_base_url.clone().unwrap_or_else(|| {
            match provider {
                LLMProvider::Local => "",
                LLMProvider::OpenAI => "https://api.openai.com/v1",
                LLMProvider::Ollama => "http://localhost:11434",
                LLMProvider::Google => "https://generativelanguage.googleapis.com/v1beta",
            }
            .to_string()
        });

        let config = LLMConfig {
            provider,
            base_url,
            model: self.embedding_model.clone(),
            api_key: self.embedding_api_key.clone(),
            max_tokens: None,
            temperature: None,
        };
        if config.requires_api_key() && config.api_key.is_none() {
            return Err(AppError::ConfigurationError(format!(
                "embedding_api_key is required for embedding provider {}",
                self.embedding_provider
            )));
        }
        Ok(config)
    }

    pub fn stop_sequences(&self) -> Vec<String> {
        self.llm_stop_sequences
            .split('|')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn completion_options(&self) -> Result<CompletionOptions> {
        Ok(CompletionOptions::from_config(
            &self.llm_config()?,
            self.stop_sequences(),
        ))
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }

    pub fn llm_backoff(&self) -> Duration {
        Duration::from_millis(self.llm_backoff_ms)
    }

    pub fn retrieval_timeout(&self) -> Duration {
        Duration::from_secs(self.retrieval_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.db_query_timeout_secs)
    }
}
