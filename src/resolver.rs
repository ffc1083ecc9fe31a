//! Query Resolver
//!
//! Turns a follow-up utterance ("what about Q4?") into a standalone query
//! using the original utterances of the last few turns. Prior SQL is never
//! shown to the model. Resolution fails open: any completion problem yields
//! the utterance unchanged.

use std::time::Instant;

use serde::Deserialize;
use text2sql_agentic::{CompletionError, CompletionService};
use tracing::{info, warn};

use crate::session::QueryRecord;

const SYSTEM_PROMPT: &str = r#"# Query Resolution

You resolve conversational follow-ups for a text-to-SQL analytics assistant.

Given the user's earlier questions and a new utterance, decide whether the new
utterance depends on the earlier ones. If it does, rewrite it as one complete,
standalone question: resolve pronouns, inherit metrics, dimensions, filters and
time periods that the user did not change. If it does not, return it unchanged.

Respond with a JSON object:
{"is_followup": true, "standalone_query": "...", "reason": "...", "confidence": 0.9}"#;

const MAX_TOKENS: u32 = 500;

/// Outcome of resolving one utterance
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub standalone_query: String,
    pub is_followup: bool,
    pub reason: Option<String>,
    pub confidence: Option<f32>,
    /// Set when the completion failed and the utterance was passed through
    pub failure: Option<String>,
}

impl Resolution {
    fn passthrough(utterance: &str) -> Self {
        Self {
            standalone_query: utterance.to_string(),
            is_followup: false,
            reason: None,
            confidence: None,
            failure: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResolverVerdict {
    is_followup: bool,
    #[serde(default)]
    standalone_query: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

pub struct QueryResolver {
    completion: CompletionService,
    context_turns: usize,
}

impl QueryResolver {
    pub fn new(completion: CompletionService, context_turns: usize) -> Self {
        Self {
            completion,
            context_turns: context_turns.clamp(1, 5),
        }
    }

    /// Resolve `utterance` against `history` (oldest first).
    pub async fn resolve(&self, utterance: &str, history: &[&QueryRecord]) -> Resolution {
        if history.is_empty() {
            return Resolution::passthrough(utterance);
        }

        let started = Instant::now();
        let skip = history.len().saturating_sub(self.context_turns);
        let prompt = build_prompt(utterance, &history[skip..]);

        match self
            .completion
            .complete_json::<ResolverVerdict>(SYSTEM_PROMPT, &prompt, MAX_TOKENS)
            .await
        {
            Ok(verdict) => {
                let resolution = interpret(utterance, verdict);
                info!(
                    is_followup = resolution.is_followup,
                    resolved = %resolution.standalone_query,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "query resolved"
                );
                resolution
            }
            Err(e) => {
                warn!(error = %e, "query resolution failed, using utterance as-is");
                Resolution {
                    failure: Some(describe(&e)),
                    ..Resolution::passthrough(utterance)
                }
            }
        }
    }
}

fn build_prompt(utterance: &str, context: &[&QueryRecord]) -> String {
    let mut prompt = String::from("## Earlier questions (oldest first)\n");
    for (i, record) in context.iter().enumerate() {
        prompt.push_str(&format!("{}. {}\n", i + 1, record.original_query));
    }
    prompt.push_str(&format!("\n## New utterance\n{}\n", utterance));
    prompt
}

fn interpret(utterance: &str, verdict: ResolverVerdict) -> Resolution {
    let standalone = verdict
        .standalone_query
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty());

    match (verdict.is_followup, standalone) {
        (true, Some(standalone_query)) => Resolution {
            standalone_query,
            is_followup: true,
            reason: verdict.reason,
            confidence: verdict.confidence,
            failure: None,
        },
        // A follow-up with no rewrite is unusable; treat it as standalone
        _ => Resolution {
            reason: verdict.reason,
            confidence: verdict.confidence,
            ..Resolution::passthrough(utterance)
        },
    }
}

fn describe(error: &CompletionError) -> String {
    format!("query resolution failed: {}", error)
}
