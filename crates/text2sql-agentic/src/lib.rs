//! LLM completion clients for text-to-SQL
//!
//! This crate provides the narrow completion interface the orchestration core
//! talks to. It has no database dependencies - SQL execution stays in the
//! `text2sql` crate.
//!
//! ## Architecture
//!
//! ```text
//! prompt → CompletionService (timeout, typed error) → LlmClient → provider API
//! ```
//!
//! ## Backend Selection
//!
//! Set `AGENT_BACKEND` environment variable:
//! - `anthropic` (default): Anthropic Claude API
//! - `openai`: OpenAI API

// LLM client abstraction
pub mod anthropic_client;
pub mod backend;
pub mod client_factory;
mod http;
pub mod llm_client;
pub mod openai_client;

// Completion plumbing
pub mod completion;
pub mod json;

// Re-exports for convenience
pub use backend::AgentBackend;
pub use client_factory::{create_llm_client, create_llm_client_from_env};
pub use completion::{CompletionError, CompletionService};
pub use http::ProviderError;
pub use json::{extract_json, strip_code_blocks};
pub use llm_client::LlmClient;
