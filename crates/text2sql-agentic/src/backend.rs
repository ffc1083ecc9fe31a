//! Completion provider selection

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AgentBackend {
    #[default]
    #[serde(rename = "anthropic", alias = "claude")]
    Anthropic,
    #[serde(rename = "openai", alias = "gpt")]
    OpenAi,
}

/// Accepted spellings, lowercase
const ALIASES: &[(&str, AgentBackend)] = &[
    ("anthropic", AgentBackend::Anthropic),
    ("claude", AgentBackend::Anthropic),
    ("openai", AgentBackend::OpenAi),
    ("gpt", AgentBackend::OpenAi),
];

#[derive(Debug, Error)]
#[error("unknown completion backend '{0}' (expected one of: anthropic, claude, openai, gpt)")]
pub struct ParseBackendError(String);

impl AgentBackend {
    /// Backend named by `AGENT_BACKEND`, or the default when unset
    pub fn from_env() -> Result<Self, ParseBackendError> {
        std::env::var("AGENT_BACKEND")
            .ok()
            .map_or(Ok(Self::default()), |value| value.parse())
    }

    pub fn name(&self) -> &'static str {
        match self {
            AgentBackend::Anthropic => "Anthropic",
            AgentBackend::OpenAi => "OpenAI",
        }
    }

    /// Environment variable holding this provider's API key
    pub fn api_key_var(&self) -> &'static str {
        match self {
            AgentBackend::Anthropic => "ANTHROPIC_API_KEY",
            AgentBackend::OpenAi => "OPENAI_API_KEY",
        }
    }
}

impl FromStr for AgentBackend {
    type Err = ParseBackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        ALIASES
            .iter()
            .find(|(alias, _)| *alias == wanted)
            .map(|(_, backend)| *backend)
            .ok_or(ParseBackendError(wanted))
    }
}

impl fmt::Display for AgentBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!(" Claude ".parse::<AgentBackend>().unwrap(), AgentBackend::Anthropic);
        assert_eq!("GPT".parse::<AgentBackend>().unwrap(), AgentBackend::OpenAi);

        let err = "llama".parse::<AgentBackend>().unwrap_err();
        assert!(err.to_string().contains("'llama'"));
    }

    #[test]
    fn test_serde_names_and_aliases() {
        let backend: AgentBackend = serde_json::from_str("\"gpt\"").unwrap();
        assert_eq!(backend, AgentBackend::OpenAi);
        assert_eq!(
            serde_json::to_string(&AgentBackend::OpenAi).unwrap(),
            "\"openai\""
        );
    }

    #[test]
    fn test_display_and_key_var() {
        assert_eq!(AgentBackend::OpenAi.to_string(), "OpenAI");
        assert_eq!(AgentBackend::Anthropic.api_key_var(), "ANTHROPIC_API_KEY");
    }
}
