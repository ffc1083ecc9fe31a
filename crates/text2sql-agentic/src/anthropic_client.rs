//! Anthropic Messages API client

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::http::{self, ProviderError};
use crate::llm_client::LlmClient;

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

const PROVIDER: &str = "Anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// Appended to the system prompt for `chat_json`; the Messages API has no
/// JSON response mode.
const JSON_ONLY: &str =
    "Respond with a single JSON object only. Do not wrap it in markdown fences or add prose.";

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: [Message<'a>; 1],
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// First text block of a Messages API response
fn first_text(response: MessagesResponse) -> Result<String, ProviderError> {
    response
        .content
        .into_iter()
        .filter(|block| block.kind == "text")
        .find_map(|block| block.text)
        .ok_or(ProviderError::Empty { provider: PROVIDER })
}

#[derive(Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl AnthropicClient {
    /// Client using `ANTHROPIC_MODEL`, or [`DEFAULT_MODEL`] when unset
    pub fn new(api_key: String) -> Self {
        let model = std::env::var("ANTHROPIC_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Self::with_model(api_key, &model)
    }

    pub fn with_model(api_key: String, model: &str) -> Self {
        Self {
            http: http::build_client(),
            url: http::endpoint("ANTHROPIC_BASE_URL", DEFAULT_BASE_URL, "/v1/messages"),
            api_key,
            model: model.to_string(),
            temperature: 0.0,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| anyhow!("ANTHROPIC_API_KEY is not set"))?;
        Ok(Self::new(api_key))
    }

    async fn send(&self, system: &str, user_prompt: &str, max_tokens: u32) -> Result<String> {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens,
            temperature: self.temperature,
            system,
            messages: [Message {
                role: "user",
                content: user_prompt,
            }],
        };
        let request = self
            .http
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION);

        let response: MessagesResponse = http::post_json(PROVIDER, request, &body).await?;
        Ok(first_text(response)?)
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn chat(&self, system_prompt: &str, user_prompt: &str, max_tokens: u32) -> Result<String> {
        self.send(system_prompt, user_prompt, max_tokens).await
    }

    async fn chat_json(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
    ) -> Result<String> {
        let system = format!("{}\n\n{}", system_prompt, JSON_ONLY);
        self.send(&system, user_prompt, max_tokens).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider_name(&self) -> &str {
        PROVIDER
    }
}
