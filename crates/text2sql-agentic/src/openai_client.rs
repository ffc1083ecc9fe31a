//! OpenAI Chat Completions client

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::http::{self, ProviderError};
use crate::llm_client::LlmClient;

pub const DEFAULT_MODEL: &str = "gpt-4o";

const PROVIDER: &str = "OpenAI";
const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const TEMPERATURE: f32 = 0.1;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

fn first_choice(response: ChatResponse) -> Result<String, ProviderError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|content| !content.is_empty())
        .ok_or(ProviderError::Empty { provider: PROVIDER })
}

#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
}

impl OpenAiClient {
    /// Client using `OPENAI_MODEL`, or [`DEFAULT_MODEL`] when unset
    pub fn new(api_key: String) -> Self {
        let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Self::with_model(api_key, &model)
    }

    pub fn with_model(api_key: String, model: &str) -> Self {
        Self {
            http: http::build_client(),
            url: http::endpoint("OPENAI_BASE_URL", DEFAULT_BASE_URL, "/v1/chat/completions"),
            api_key,
            model: model.to_string(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let api_key =
            std::env::var("OPENAI_API_KEY").map_err(|_| anyhow!("OPENAI_API_KEY is not set"))?;
        Ok(Self::new(api_key))
    }

    fn request<'a>(
        &'a self,
        system_prompt: &'a str,
        user_prompt: &'a str,
        max_tokens: u32,
        json_mode: bool,
    ) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt,
                },
            ],
            max_tokens,
            temperature: TEMPERATURE,
            response_format: json_mode.then_some(ResponseFormat {
                kind: "json_object",
            }),
        }
    }

    async fn send(&self, body: &ChatRequest<'_>) -> Result<String> {
        let request = self.http.post(&self.url).bearer_auth(&self.api_key);
        let response: ChatResponse = http::post_json(PROVIDER, request, body).await?;
        Ok(first_choice(response)?)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn chat(&self, system_prompt: &str, user_prompt: &str, max_tokens: u32) -> Result<String> {
        let body = self.request(system_prompt, user_prompt, max_tokens, false);
        self.send(&body).await
    }

    async fn chat_json(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
    ) -> Result<String> {
        let body = self.request(system_prompt, user_prompt, max_tokens, true);
        self.send(&body).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider_name(&self) -> &str {
        PROVIDER
    }
}
