//! Client Factory
//!
//! Builds a boxed [`LlmClient`] for the selected [`AgentBackend`].

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::info;

use crate::anthropic_client::AnthropicClient;
use crate::backend::AgentBackend;
use crate::llm_client::LlmClient;
use crate::openai_client::OpenAiClient;

/// Create a client for `backend`, reading the provider API key from the environment.
///
/// `model` overrides the provider's default (or its `*_MODEL` env var).
pub fn create_llm_client(backend: AgentBackend, model: Option<&str>) -> Result<Arc<dyn LlmClient>> {
    let api_key = std::env::var(backend.api_key_var())
        .map_err(|_| anyhow!("{} environment variable not set", backend.api_key_var()))?;

    let client: Arc<dyn LlmClient> = match (backend, model) {
        (AgentBackend::Anthropic, Some(model)) => {
            Arc::new(AnthropicClient::with_model(api_key, model))
        }
        (AgentBackend::Anthropic, None) => Arc::new(AnthropicClient::new(api_key)),
        (AgentBackend::OpenAi, Some(model)) => Arc::new(OpenAiClient::with_model(api_key, model)),
        (AgentBackend::OpenAi, None) => Arc::new(OpenAiClient::new(api_key)),
    };

    info!(
        provider = client.provider_name(),
        model = client.model_name(),
        "LLM client created"
    );
    Ok(client)
}

/// Create a client for the backend named by `AGENT_BACKEND`.
pub fn create_llm_client_from_env() -> Result<Arc<dyn LlmClient>> {
    let backend = AgentBackend::from_env()?;
    create_llm_client(backend, None)
}
