use crate::application::use_cases::prompt_builder::PromptBuilder;
use crate::domain::error::{AppError, Result};
use crate::domain::llm_config::CompletionOptions;
use crate::domain::query::RetrievedContext;
use crate::infrastructure::llm_clients::LLMClient;
use crate::infrastructure::response::extract_sql;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded retry for oracle calls: `max_attempts` tries, each limited by `timeout`, with a
/// doubling pause starting at `initial_backoff` between them.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            timeout: Duration::from_secs(60),
        }
    }
}

pub struct SqlGenerator {
    llm: Arc<dyn LLMClient>,
    prompts: PromptBuilder,
    options: CompletionOptions,
    retry: RetryPolicy,
}

impl SqlGenerator {
    pub fn new(
        llm: Arc<dyn LLMClient>,
        prompts: PromptBuilder,
        options: CompletionOptions,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            llm,
            prompts,
            options,
            retry,
        }
    }

    /// Produces a SQL candidate. Without a directive this is the initial call; with one, the
    /// directive steers the oracle towards a fix.
    ///
    /// The returned text is untrusted. Fails with `GenerationUnavailable` once every attempt
    /// errored or timed out.
    pub async fn generate(
        &self,
        user_query: &str,
        context: &RetrievedContext,
        repair_directive: Option<&str>,
    ) -> Result<String> {
        let prompt = self
            .prompts
            .build_prompt(user_query, context, repair_directive);
        debug!("Generation prompt:\n{}", prompt);

        let attempts = self.retry.max_attempts.max(1);
        let mut backoff = self.retry.initial_backoff;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match tokio::time::timeout(self.retry.timeout, self.llm.complete(&prompt, &self.options))
                .await
            {
                Ok(Ok(raw)) => {
                    let sql = extract_sql(&raw);
                    debug!(attempt, "Generated SQL: {}", sql);
                    return Ok(sql);
                }
                Ok(Err(e)) => {
                    last_error = e.to_string();
                }
                Err(_) => {
                    last_error = format!("timed out after {:?}", self.retry.timeout);
                }
            }

            warn!(
                attempt,
                max_attempts = attempts,
                "Generation attempt failed: {}",
                last_error
            );
            if attempt < attempts {
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
        }

        Err(AppError::GenerationUnavailable(format!(
            "{} attempt(s) failed, last error: {}",
            attempts, last_error
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::use_cases::test_support::ScriptedLLM;
    use crate::domain::llm_config::CompletionOptions;
    use async_trait::async_trait;

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            timeout: Duration::from_millis(200),
        }
    }

    fn generator(llm: Arc<dyn LLMClient>, retry: RetryPolicy) -> SqlGenerator {
        SqlGenerator::new(
            llm,
            PromptBuilder::new("SQLite"),
            CompletionOptions::default(),
            retry,
        )
    }

    #[tokio::test]
    async fn test_cleans_markdown_output() {
        let llm = Arc::new(ScriptedLLM::replying(&["```sql\nSELECT * FROM users;\n```"]));
        let sql = generator(llm.clone(), fast_retry(3))
            .generate("list all users", &RetrievedContext::empty(), None)
            .await
            .unwrap();
        assert_eq!(sql, "SELECT * FROM users");
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let llm = Arc::new(ScriptedLLM::new(vec![
            Err(AppError::LLMError("503".to_string())),
            Err(AppError::LLMError("503".to_string())),
            Ok("SELECT 1".to_string()),
        ]));
        let sql = generator(llm.clone(), fast_retry(3))
            .generate("q", &RetrievedContext::empty(), None)
            .await
            .unwrap();
        assert_eq!(sql, "SELECT 1");
        assert_eq!(llm.calls(), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_is_generation_unavailable() {
        let llm = Arc::new(ScriptedLLM::new(vec![
            Err(AppError::LLMError("down".to_string())),
            Err(AppError::LLMError("down".to_string())),
        ]));
        let err = generator(llm.clone(), fast_retry(2))
            .generate("q", &RetrievedContext::empty(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::GenerationUnavailable(_)));
        assert!(err.to_string().contains("down"));
        assert_eq!(llm.calls(), 2);
    }

    struct SlowLLM;

    #[async_trait]
    impl LLMClient for SlowLLM {
        async fn complete(&self, _prompt: &str, _options: &CompletionOptions) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("SELECT 1".to_string())
        }
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failed_attempt() {
        let retry = RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            timeout: Duration::from_millis(20),
        };
        let err = generator(Arc::new(SlowLLM), retry)
            .generate("q", &RetrievedContext::empty(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::GenerationUnavailable(_)));
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_directive_reaches_the_oracle() {
        let llm = Arc::new(ScriptedLLM::replying(&["SELECT COUNT(*) FROM user_orders"]));
        generator(llm.clone(), fast_retry(1))
            .generate(
                "count orders",
                &RetrievedContext::empty(),
                Some("did you mean `user_orders`?"),
            )
            .await
            .unwrap();
        assert!(llm.prompts()[0].contains("did you mean `user_orders`?"));
    }
}
