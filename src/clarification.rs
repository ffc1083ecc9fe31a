//! Clarification Detector
//!
//! One structured completion decides whether a standalone query is too vague
//! to turn into SQL. Detection fails open.

use serde::{Deserialize, Serialize};
use text2sql_agentic::CompletionService;
use tracing::{info, warn};

const SYSTEM_PROMPT: &str = r#"# Clarification Check

You screen questions for a text-to-SQL analytics assistant before any SQL is
written. Ask for clarification only when the question cannot be answered
sensibly from the schema without guessing: no identifiable metric or entity,
a trend with no time period, a ranking with no measure, or a bare fragment.
Questions that are answerable with a reasonable default are clear.

Respond with a JSON object:
{"needs_clarification": false, "reason": "none", "questions": []}

reason is one of: none, missing_metric, missing_entity, missing_time_period,
ambiguous_ranking, vague_fragment, other. Ask at most 3 short questions."#;

const MAX_TOKENS: u32 = 300;
const MAX_QUESTIONS: usize = 3;
const SCHEMA_EXCERPT_CHARS: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClarificationReason {
    #[default]
    None,
    MissingMetric,
    MissingEntity,
    MissingTimePeriod,
    AmbiguousRanking,
    VagueFragment,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clarification {
    pub needs_clarification: bool,
    pub reason: ClarificationReason,
    pub questions: Vec<String>,
}

impl Clarification {
    pub fn not_needed() -> Self {
        Self {
            needs_clarification: false,
            reason: ClarificationReason::None,
            questions: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DetectorVerdict {
    needs_clarification: bool,
    #[serde(default)]
    reason: ClarificationReason,
    #[serde(default)]
    questions: Vec<String>,
}

pub struct ClarificationDetector {
    completion: CompletionService,
}

impl ClarificationDetector {
    pub fn new(completion: CompletionService) -> Self {
        Self { completion }
    }

    /// Returns the verdict, or the failure message when the check could not
    /// run (callers proceed as if no clarification were needed).
    pub async fn detect(&self, query: &str, schema: &str) -> Result<Clarification, String> {
        let prompt = format!(
            "## Schema (excerpt)\n{}\n\n## Question\n{}\n",
            excerpt(schema, SCHEMA_EXCERPT_CHARS),
            query
        );

        match self
            .completion
            .complete_json::<DetectorVerdict>(SYSTEM_PROMPT, &prompt, MAX_TOKENS)
            .await
        {
            Ok(verdict) => {
                let clarification = normalize(verdict);
                info!(
                    needs_clarification = clarification.needs_clarification,
                    reason = ?clarification.reason,
                    questions = clarification.questions.len(),
                    "clarification check complete"
                );
                Ok(clarification)
            }
            Err(e) => {
                warn!(error = %e, "clarification check failed, proceeding");
                Err(format!("clarification check failed: {}", e))
            }
        }
    }
}

fn normalize(verdict: DetectorVerdict) -> Clarification {
    if !verdict.needs_clarification {
        return Clarification::not_needed();
    }
    let mut questions: Vec<String> = verdict
        .questions
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .take(MAX_QUESTIONS)
        .collect();
    if questions.is_empty() {
        questions.push("Could you add more detail about what you want to see?".to_string());
    }
    Clarification {
        needs_clarification: true,
        reason: verdict.reason,
        questions,
    }
}

/// Prefix of `text` no longer than `max` bytes, cut on a char boundary.
fn excerpt(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
