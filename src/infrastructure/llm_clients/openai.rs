use crate::domain::error::{AppError, Result};
use crate::domain::llm_config::{CompletionOptions, LLMConfig};
use serde_json::json;

const SYSTEM_PROMPT: &str =
    "You are a SQL expert. Answer with a single SQL statement and nothing else.";

/// Chat-completions client for any OpenAI-compatible endpoint (OpenAI, DeepSeek, Ollama's
/// `/v1`, LM Studio, ...).
pub struct OpenAIClient {
    client: reqwest::Client,
}

impl OpenAIClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(base_url: &str, path: &str) -> String {
        if base_url.ends_with('/') {
            format!("{}{}", base_url, path)
        } else {
            format!("{}/{}", base_url, path)
        }
    }

    pub(crate) fn request_body(
        config: &LLMConfig,
        prompt: &str,
        options: &CompletionOptions,
    ) -> serde_json::Value {
        let mut body = json!({
            "model": config.model,
            "messages": [
                {
                    "role": "system",
                    "content": SYSTEM_PROMPT
                },
                {
                    "role": "user",
                    "content": prompt
                }
            ],
            "max_tokens": options.max_tokens,
            "temperature": options.temperature,
        });
        if !options.stop_sequences.is_empty() {
            body["stop"] = json!(options.stop_sequences);
        }
        body
    }

    pub async fn complete_with(
        &self,
        config: &LLMConfig,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String> {
        let url = Self::endpoint(&config.base_url, "chat/completions");
        let body = Self::request_body(config, prompt, options);

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = config.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            request = request.bearer_auth(key);
        } else if config.requires_api_key() {
            return Err(AppError::LLMError(format!(
                "Missing API key for {}",
                config.base_url
            )));
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::LLMError(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::LLMError(format!(
                "API error ({}): {}",
                status, text
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AppError::LLMError(format!("Failed to parse JSON: {}", e)))?;

        json["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| AppError::LLMError("Invalid response format".to_string()))
    }
}
