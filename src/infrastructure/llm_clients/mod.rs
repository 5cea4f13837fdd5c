pub mod gemini;
pub mod openai;

use crate::domain::error::Result;
use crate::domain::llm_config::{CompletionOptions, LLMConfig, LLMProvider};
use async_trait::async_trait;
use gemini::GeminiClient;
use openai::OpenAIClient;

/// Generation oracle: prompt in, untrusted text out.
#[async_trait]
pub trait LLMClient: Send + Sync {
    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String>;
}

/// Dispatches completions to the client matching the configured provider.
pub struct RouterClient {
    config: LLMConfig,
    openai: OpenAIClient,
    gemini: GeminiClient,
}

impl RouterClient {
    pub fn new(config: LLMConfig) -> Self {
        Self {
            config,
            openai: OpenAIClient::new(),
            gemini: GeminiClient::new(),
        }
    }

    pub fn config(&self) -> &LLMConfig {
        &self.config
    }
}

#[async_trait]
impl LLMClient for RouterClient {
    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String> {
        match self.config.provider {
            LLMProvider::Google => self.gemini.complete_with(&self.config, prompt, options).await,
            _ => self.openai.complete_with(&self.config, prompt, options).await,
        }
    }
}
