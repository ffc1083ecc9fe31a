//! Completion Service
//!
//! The one narrow interface the orchestration core uses to talk to a model:
//! prompt in, text out, bounded by a timeout, failing with a typed error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::json::extract_json;
use crate::llm_client::LlmClient;

/// Default bound on a single completion request
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(8);

/// Why a completion request produced no usable answer
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("completion timed out after {0:?}")]
    Timeout(Duration),

    #[error("completion provider error: {0}")]
    Provider(String),

    #[error("completion returned no text")]
    Empty,

    #[error("completion returned unparsable JSON: {message}")]
    InvalidJson { message: String, raw: String },
}

/// Timeout-bounded wrapper around an [`LlmClient`]
#[derive(Clone)]
pub struct CompletionService {
    client: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl CompletionService {
    pub fn new(client: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub fn with_default_timeout(client: Arc<dyn LlmClient>) -> Self {
        Self::new(client, DEFAULT_TIMEOUT)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Provider/model label for logging, e.g. `Anthropic/claude-sonnet-4`
    pub fn describe(&self) -> String {
        format!(
            "{}/{}",
            self.client.provider_name(),
            self.client.model_name()
        )
    }

    /// Request free text.
    pub async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
    ) -> Result<String, CompletionError> {
        let started = Instant::now();
        let call = self.client.chat(system_prompt, user_prompt, max_tokens);
        let text = self.bounded(call).await?;
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            chars = text.len(),
            "completion returned"
        );
        Ok(text)
    }

    /// Request a JSON object and deserialize it into `T`.
    pub async fn complete_json<T: DeserializeOwned>(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
    ) -> Result<T, CompletionError> {
        let started = Instant::now();
        let call = self.client.chat_json(system_prompt, user_prompt, max_tokens);
        let text = self.bounded(call).await?;
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "json completion returned"
        );

        let payload = extract_json(&text).ok_or_else(|| CompletionError::InvalidJson {
            message: "no JSON object in response".to_string(),
            raw: text.clone(),
        })?;
        serde_json::from_str(payload).map_err(|e| CompletionError::InvalidJson {
            message: e.to_string(),
            raw: text.clone(),
        })
    }

    async fn bounded<F>(&self, call: F) -> Result<String, CompletionError>
    where
        F: std::future::Future<Output = anyhow::Result<String>>,
    {
        let text = tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| CompletionError::Timeout(self.timeout))?
            .map_err(|e| CompletionError::Provider(format!("{:#}", e)))?;

        if text.trim().is_empty() {
            return Err(CompletionError::Empty);
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use serde::Deserialize;

    struct CannedClient(&'static str);

    #[async_trait]
    impl LlmClient for CannedClient {
        async fn chat(&self, _: &str, _: &str, _: u32) -> Result<String> {
            Ok(self.0.to_string())
        }
        async fn chat_json(&self, _: &str, _: &str, _: u32) -> Result<String> {
            Ok(self.0.to_string())
        }
        fn model_name(&self) -> &str {
            "canned"
        }
        fn provider_name(&self) -> &str {
            "Test"
        }
    }

    struct SlowClient;

    #[async_trait]
    impl LlmClient for SlowClient {
        async fn chat(&self, _: &str, _: &str, _: u32) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("late".to_string())
        }
        async fn chat_json(&self, s: &str, u: &str, m: u32) -> Result<String> {
            self.chat(s, u, m).await
        }
        fn model_name(&self) -> &str {
            "slow"
        }
        fn provider_name(&self) -> &str {
            "Test"
        }
    }

    struct FailingClient;

    #[async_trait]
    impl LlmClient for FailingClient {
        async fn chat(&self, _: &str, _: &str, _: u32) -> Result<String> {
            Err(anyhow!("Anthropic API error 529: overloaded"))
        }
        async fn chat_json(&self, s: &str, u: &str, m: u32) -> Result<String> {
            self.chat(s, u, m).await
        }
        fn model_name(&self) -> &str {
            "failing"
        }
        fn provider_name(&self) -> &str {
            "Test"
        }
    }

    #[derive(Debug, Deserialize)]
    struct Verdict {
        ok: bool,
    }

    #[tokio::test]
    async fn test_complete_returns_text() {
        let svc = CompletionService::with_default_timeout(Arc::new(CannedClient("hello")));
        assert_eq!(svc.complete("s", "u", 10).await.unwrap(), "hello");
        assert_eq!(svc.describe(), "Test/canned");
    }

    #[tokio::test]
    async fn test_blank_response_is_empty_error() {
        let svc = CompletionService::with_default_timeout(Arc::new(CannedClient("   ")));
        assert!(matches!(
            svc.complete("s", "u", 10).await,
            Err(CompletionError::Empty)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_times_out() {
        let svc = CompletionService::new(Arc::new(SlowClient), Duration::from_secs(2));
        match svc.complete("s", "u", 10).await {
            Err(CompletionError::Timeout(d)) => assert_eq!(d, Duration::from_secs(2)),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_provider_error_is_typed() {
        let svc = CompletionService::with_default_timeout(Arc::new(FailingClient));
        let err = svc.complete("s", "u", 10).await.unwrap_err();
        assert!(matches!(err, CompletionError::Provider(ref m) if m.contains("529")));
    }

    #[tokio::test]
    async fn test_complete_json_strips_fences() {
        let svc = CompletionService::with_default_timeout(Arc::new(CannedClient(
            "```json\n{\"ok\": true}\n```",
        )));
        let verdict: Verdict = svc.complete_json("s", "u", 10).await.unwrap();
        assert!(verdict.ok);
    }

    #[tokio::test]
    async fn test_complete_json_rejects_prose() {
        let svc = CompletionService::with_default_timeout(Arc::new(CannedClient("I think yes")));
        let err = svc.complete_json::<Verdict>("s", "u", 10).await.unwrap_err();
        assert!(matches!(err, CompletionError::InvalidJson { ref raw, .. } if raw == "I think yes"));
    }
}
