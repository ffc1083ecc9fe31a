//! Shared HTTP plumbing for provider clients

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Upper bound on connection establishment; the per-request deadline is
/// enforced by `CompletionService`.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest slice of an error body kept in `ProviderError::Status`
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} request failed: {source}")]
    Transport {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider} API error {status}: {body}")]
    Status {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("{provider} returned an unreadable body: {source}")]
    Decode {
        provider: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{provider} returned no text content")]
    Empty { provider: &'static str },
}

pub(crate) fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Resolve the endpoint, honouring a `*_BASE_URL` override (proxies, gateways)
pub(crate) fn endpoint(base_var: &str, default_base: &str, path: &str) -> String {
    let base = std::env::var(base_var).unwrap_or_else(|_| default_base.to_string());
    format!("{}{}", base.trim_end_matches('/'), path)
}

/// POST `body` as JSON and decode the response as `T`
pub(crate) async fn post_json<B, T>(
    provider: &'static str,
    request: reqwest::RequestBuilder,
    body: &B,
) -> Result<T, ProviderError>
where
    B: Serialize + ?Sized,
    T: DeserializeOwned,
{
    let response = request
        .json(body)
        .send()
        .await
        .map_err(|source| ProviderError::Transport { provider, source })?;

    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|source| ProviderError::Transport { provider, source })?;

    if !status.is_success() {
        return Err(ProviderError::Status {
            provider,
            status: status.as_u16(),
            body: truncate(&text, MAX_ERROR_BODY),
        });
    }

    decode(provider, &text)
}

pub(crate) fn decode<T: DeserializeOwned>(
    provider: &'static str,
    text: &str,
) -> Result<T, ProviderError> {
    serde_json::from_str(text).map_err(|source| ProviderError::Decode { provider, source })
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}
