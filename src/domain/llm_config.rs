use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LLMProvider {
    /// In-process model (embeddings only).
    Local,
    /// Any OpenAI-compatible endpoint (OpenAI, DeepSeek, LM Studio, vLLM, ...).
    OpenAI,
    Ollama,
    #[serde(alias = "gemini")]
    Google,
}

impl LLMProvider {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "local" => Some(LLMProvider::Local),
            "openai" | "deepseek" => Some(LLMProvider::OpenAI),
            "ollama" => Some(LLMProvider::Ollama),
            "google" | "gemini" => Some(LLMProvider::Google),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LLMConfig {
    pub provider: LLMProvider,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl LLMConfig {
    /// Hosted endpoints refuse requests without a key; loopback servers usually do not.
    pub fn requires_api_key(&self) -> bool {
        match self.provider {
            LLMProvider::Local | LLMProvider::Ollama => false,
            LLMProvider::Google => true,
            LLMProvider::OpenAI => !is_loopback_url(&self.base_url),
        }
    }
}

fn is_loopback_url(base_url: &str) -> bool {
    match url::Url::parse(base_url) {
        Ok(parsed) => matches!(
            parsed.host_str(),
            Some("localhost") | Some("127.0.0.1") | Some("[::1]") | Some("0.0.0.0")
        ),
        Err(_) => false,
    }
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            provider: LLMProvider::OpenAI,
            base_url: "https://api.deepseek.com".to_string(),
            model: "deepseek-chat".to_string(),
            api_key: None,
            max_tokens: Some(2000),
            temperature: Some(0.1),
        }
    }
}

/// Per-call options understood by the generation oracle.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CompletionOptions {
    /// Sampling randomness.
    pub temperature: f32,
    /// Output length cap.
    pub max_tokens: u32,
    /// Early-termination markers.
    #[serde(default)]
    pub stop_sequences: Vec<String>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            max_tokens: 2000,
            stop_sequences: Vec::new(),
        }
    }
}

impl CompletionOptions {
    pub fn from_config(config: &LLMConfig, stop_sequences: Vec<String>) -> Self {
        let defaults = Self::default();
        Self {
            temperature: config.temperature.unwrap_or(defaults.temperature),
            max_tokens: config.max_tokens.unwrap_or(defaults.max_tokens),
            stop_sequences,
        }
    }
}
