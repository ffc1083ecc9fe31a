//! Error types for the orchestration core
//!
//! Terminal turn failures are [`TurnError`]. Stage failures that the turn
//! survives are reported as [`StageNotice`]s so callers can still see that
//! something degraded. A failed generation attempt is one of them; running
//! out of attempts is `IterationExceeded`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable classification of every failure the orchestrator can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ResolutionError,
    ClarificationError,
    GenerationError,
    SecurityValidationFailure,
    ExecutionError,
    IterationExceeded,
    ExplanationError,
    SchemaUnavailable,
    InvalidRequest,
}

impl ErrorKind {
    /// Whether a failure of this kind ends the turn. A generation failure
    /// only ends its attempt; an exhausted budget is `IterationExceeded`.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ErrorKind::ResolutionError
                | ErrorKind::ClarificationError
                | ErrorKind::GenerationError
                | ErrorKind::ExplanationError
        )
    }
}

/// Why a turn ended without usable results
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnError {
    #[error("SQL rejected by security validation: {}", failed_checks.join("; "))]
    SecurityValidation {
        failed_checks: Vec<String>,
        rejected_sql: String,
    },

    #[error("query execution failed: {message}")]
    Execution { message: String },

    #[error("could not produce valid SQL within {max_iterations} attempt(s)")]
    IterationExceeded {
        iterations: u32,
        max_iterations: u32,
        last_error: Option<String>,
    },

    #[error("schema unavailable for dataset '{dataset}': {message}")]
    SchemaUnavailable { dataset: String, message: String },

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
}

impl TurnError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TurnError::SecurityValidation { .. } => ErrorKind::SecurityValidationFailure,
            TurnError::Execution { .. } => ErrorKind::ExecutionError,
            TurnError::IterationExceeded { .. } => ErrorKind::IterationExceeded,
            TurnError::SchemaUnavailable { .. } => ErrorKind::SchemaUnavailable,
            TurnError::InvalidRequest { .. } => ErrorKind::InvalidRequest,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        TurnError::InvalidRequest {
            message: message.into(),
        }
    }
}

/// A non-fatal stage failure recorded on the turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageNotice {
    pub kind: ErrorKind,
    pub message: String,
}

impl StageNotice {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_and_budget_errors_are_distinct() {
        let security = TurnError::SecurityValidation {
            failed_checks: vec!["Tenant Filter: Missing WHERE client_id = 42 filter".to_string()],
            rejected_sql: "SELECT * FROM sales".to_string(),
        };
        let budget = TurnError::IterationExceeded {
            iterations: 3,
            max_iterations: 3,
            last_error: Some("syntax error".to_string()),
        };
        assert_eq!(security.kind(), ErrorKind::SecurityValidationFailure);
        assert_eq!(budget.kind(), ErrorKind::IterationExceeded);
        assert!(security.to_string().contains("Missing WHERE"));
        assert!(budget.to_string().contains("3 attempt"));
    }

    #[test]
    fn test_fatality() {
        assert!(!ErrorKind::ResolutionError.is_fatal());
        assert!(!ErrorKind::ExplanationError.is_fatal());
        assert!(!ErrorKind::GenerationError.is_fatal());
        assert!(ErrorKind::SecurityValidationFailure.is_fatal());
        assert!(ErrorKind::IterationExceeded.is_fatal());
    }

    #[test]
    fn test_serializes_with_kind_tag() {
        let err = TurnError::Execution {
            message: "canceling statement due to statement timeout".to_string(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "execution");
        assert!(json["message"].as_str().unwrap().contains("timeout"));
    }
}
