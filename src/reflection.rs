//! Reflection / retry classification
//!
//! Decides whether an execution outcome is worth another generation attempt.
//! Only errors that a rewritten query could fix (syntax, unknown objects)
//! ask for refinement. The iteration budget is enforced by the planner.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::executor::ExecutionResult;

/// Engine error fragments that a corrected query can fix
const CRITICAL_FRAGMENTS: &[&str] = &[
    "syntax error",
    "parse error",
    "invalid sql",
    "unknown column",
    "unknown table",
    "no such table",
    "no such column",
];

/// Postgres phrasing: `column "x" does not exist`, `relation "y" does not exist`
static MISSING_OBJECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(column|relation|table|function)\b.*\bdoes not exist\b"#)
        .expect("static regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reflection {
    pub is_acceptable: bool,
    pub should_refine: bool,
    pub issues: Vec<String>,
    pub reasoning: String,
}

/// True when `error` belongs to the retryable class.
pub fn is_critical_error(error: &str) -> bool {
    let lowered = error.to_lowercase();
    CRITICAL_FRAGMENTS.iter().any(|f| lowered.contains(f)) || MISSING_OBJECT.is_match(error)
}

pub fn reflect(execution: &ExecutionResult) -> Reflection {
    let mut issues = Vec::new();
    let mut should_refine = false;

    if !execution.success {
        let error = execution.error.as_deref().unwrap_or("unknown error");
        if is_critical_error(error) {
            should_refine = true;
            issues.push(format!("Critical SQL error: {}", error));
            warn!(%error, "critical SQL error, refinement requested");
        } else {
            issues.push(format!("Non-critical error: {}", error));
        }
    } else if execution.rows.is_empty() {
        issues.push("Query returned no results".to_string());
    }

    let reflection = Reflection {
        is_acceptable: !should_refine,
        should_refine,
        issues,
        reasoning: if should_refine {
            "SQL has errors a corrected query could fix".to_string()
        } else {
            "SQL quality acceptable".to_string()
        },
    };
    info!(
        acceptable = reflection.is_acceptable,
        refine = reflection.should_refine,
        issues = reflection.issues.len(),
        "reflection complete"
    );
    reflection
}
