//! Provider-neutral completion interface

use anyhow::Result;
use async_trait::async_trait;

/// A chat-style model endpoint.
///
/// Implementations are stateless per call: every request carries its own
/// system prompt, so one client can serve all pipeline stages concurrently.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Free-text completion
    async fn chat(&self, system_prompt: &str, user_prompt: &str, max_tokens: u32)
        -> Result<String>;

    /// Completion constrained to a JSON object where the provider supports it.
    /// Callers still parse defensively with [`crate::extract_json`].
    async fn chat_json(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
    ) -> Result<String>;

    fn model_name(&self) -> &str;

    fn provider_name(&self) -> &str;
}
