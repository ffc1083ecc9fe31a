//! Planner
//!
//! Pure decision table over [`WorkflowState`]. Evaluated once per pass; the
//! returned action borrows whatever state the next node needs.

use crate::error::TurnError;
use crate::executor::ExecutionResult;
use crate::generator::PriorAttempt;
use crate::validator::ApprovedSql;

use super::state::{AttemptPhase, ExplanationState, WorkflowState};

#[derive(Debug)]
pub enum Action<'a> {
    FetchSchema,
    CheckClarification {
        schema: &'a str,
    },
    GenerateSql {
        schema: &'a str,
        prior: Option<&'a PriorAttempt>,
    },
    ExecuteSql(&'a ApprovedSql),
    ValidateResults(&'a ExecutionResult),
    Reflect(&'a ExecutionResult),
    Retry,
    Explain {
        sql: &'a ApprovedSql,
        execution: &'a ExecutionResult,
    },
    Complete(Option<TurnError>),
}

impl Action<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Action::FetchSchema => "fetch_schema",
            Action::CheckClarification { .. } => "check_clarification",
            Action::GenerateSql { .. } => "generate_sql",
            Action::ExecuteSql(_) => "execute_sql",
            Action::ValidateResults(_) => "validate_results",
            Action::Reflect(_) => "reflect",
            Action::Retry => "retry",
            Action::Explain { .. } => "explain",
            Action::Complete(_) => "complete",
        }
    }
}

pub fn plan(state: &WorkflowState) -> Action<'_> {
    if state.iteration > state.max_iterations {
        return Action::Complete(Some(budget_exceeded(state, last_error(state))));
    }
    if let Some(fatal) = &state.fatal {
        return Action::Complete(Some(fatal.clone()));
    }

    let Some(schema) = state.schema.as_deref() else {
        return Action::FetchSchema;
    };

    match &state.clarification {
        None if !state.skip_clarification => return Action::CheckClarification { schema },
        Some(c) if c.needs_clarification => return Action::Complete(None),
        _ => {}
    }

    match &state.attempt {
        AttemptPhase::NotStarted => match &state.last_failure {
            Some(prior) if state.iteration >= state.max_iterations => {
                Action::Complete(Some(budget_exceeded(state, Some(prior.error.clone()))))
            }
            prior => Action::GenerateSql {
                schema,
                prior: prior.as_ref(),
            },
        },
        AttemptPhase::Approved { sql } => Action::ExecuteSql(sql),
        AttemptPhase::Executed { execution, .. } => Action::ValidateResults(execution),
        AttemptPhase::Checked { execution, .. } => Action::Reflect(execution),
        AttemptPhase::Reflected {
            sql,
            execution,
            reflection,
            ..
        } => {
            if reflection.should_refine {
                if state.iteration < state.max_iterations {
                    Action::Retry
                } else {
                    Action::Complete(Some(budget_exceeded(state, execution.error.clone())))
                }
            } else if !execution.success {
                Action::Complete(Some(TurnError::Execution {
                    message: execution
                        .error
                        .clone()
                        .unwrap_or_else(|| "query failed".to_string()),
                }))
            } else if !execution.rows.is_empty()
                && state.explanation == ExplanationState::NotRequested
            {
                Action::Explain { sql, execution }
            } else {
                Action::Complete(None)
            }
        }
    }
}

fn budget_exceeded(state: &WorkflowState, last_error: Option<String>) -> TurnError {
    TurnError::IterationExceeded {
        iterations: state.iteration,
        max_iterations: state.max_iterations,
        last_error,
    }
}

fn last_error(state: &WorkflowState) -> Option<String> {
    state
        .attempt
        .execution()
        .and_then(|e| e.error.clone())
        .or_else(|| state.last_failure.as_ref().map(|p| p.error.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clarification::{Clarification, ClarificationReason};
    use crate::error::ErrorKind;
    use crate::orchestrator::state::fixtures::{approved, rejected, state};
    use crate::orchestrator::state::StateUpdate;
    use crate::reflection::reflect;
    use crate::tools::{ResultCheck, ToolName, ToolResult};
    use serde_json::json;
    use std::time::Duration;

    fn record(tool: ToolName) -> ToolResult {
        ToolResult {
            tool,
            success: true,
            result: None,
            error: None,
            elapsed: Duration::ZERO,
        }
    }

    fn ready(max_iterations: u32) -> WorkflowState {
        let mut s = state(max_iterations);
        s.schema = Some("sales(client_id int)".to_string());
        s.clarification = Some(Clarification::not_needed());
        s
    }

    /// Drive an approved attempt through execution, checking and reflection.
    fn run_attempt(s: &mut WorkflowState, execution: ExecutionResult) {
        let (sql, validation) = approved();
        s.apply(StateUpdate::SqlApproved { sql, validation });
        let reflection = reflect(&execution);
        s.apply(StateUpdate::Executed {
            execution,
            record: record(ToolName::ExecuteSql),
        });
        s.apply(StateUpdate::ResultsChecked {
            check: ResultCheck {
                is_valid: true,
                has_results: true,
                row_count: 1,
                issues: vec![],
            },
            record: record(ToolName::ValidateResults),
        });
        s.apply(StateUpdate::Reflected { reflection });
    }

    fn completion_kind(action: Action<'_>) -> Option<ErrorKind> {
        match action {
            Action::Complete(error) => error.map(|e| e.kind()),
            other => panic!("expected completion, got {}", other.name()),
        }
    }

    #[test]
    fn test_schema_unset_fetches_schema() {
        assert!(matches!(plan(&state(3)), Action::FetchSchema));
    }

    #[test]
    fn test_clarification_checked_once_schema_known() {
        let mut s = state(3);
        s.schema = Some("t".to_string());
        assert!(matches!(plan(&s), Action::CheckClarification { .. }));

        s.skip_clarification = true;
        assert!(matches!(plan(&s), Action::GenerateSql { prior: None, .. }));
    }

    #[test]
    fn test_clarification_needed_completes_without_error() {
        let mut s = ready(3);
        s.clarification = Some(Clarification {
            needs_clarification: true,
            reason: ClarificationReason::MissingMetric,
            questions: vec!["Which metric?".to_string()],
        });
        assert_eq!(completion_kind(plan(&s)), None);
    }

    #[test]
    fn test_sql_unset_generates() {
        assert!(matches!(plan(&ready(3)), Action::GenerateSql { .. }));
    }

    #[test]
    fn test_approved_executes() {
        let mut s = ready(3);
        let (sql, validation) = approved();
        s.apply(StateUpdate::SqlApproved { sql, validation });
        assert!(matches!(plan(&s), Action::ExecuteSql(_)));
    }

    #[test]
    fn test_executed_validates_then_reflects() {
        let mut s = ready(3);
        let (sql, validation) = approved();
        s.apply(StateUpdate::SqlApproved { sql, validation });
        s.apply(StateUpdate::Executed {
            execution: ExecutionResult::rows(vec![], vec![]),
            record: record(ToolName::ExecuteSql),
        });
        assert!(matches!(plan(&s), Action::ValidateResults(_)));
        s.apply(StateUpdate::ResultsChecked {
            check: ResultCheck {
                is_valid: true,
                has_results: false,
                row_count: 0,
                issues: vec![],
            },
            record: record(ToolName::ValidateResults),
        });
        assert!(matches!(plan(&s), Action::Reflect(_)));
    }

    #[test]
    fn test_refine_within_budget_retries() {
        let mut s = ready(3);
        run_attempt(&mut s, ExecutionResult::failed("syntax error at or near \"FORM\""));
        assert!(matches!(plan(&s), Action::Retry));

        s.apply(StateUpdate::RetryRequested);
        match plan(&s) {
            Action::GenerateSql { prior: Some(prior), .. } => {
                assert!(prior.error.contains("syntax error"));
            }
            other => panic!("expected regeneration, got {}", other.name()),
        }
    }

    #[test]
    fn test_refine_at_budget_is_iteration_exceeded() {
        let mut s = ready(1);
        run_attempt(&mut s, ExecutionResult::failed("syntax error"));
        match plan(&s) {
            Action::Complete(Some(TurnError::IterationExceeded {
                iterations,
                max_iterations,
                last_error,
            })) => {
                assert_eq!(iterations, 1);
                assert_eq!(max_iterations, 1);
                assert_eq!(last_error.as_deref(), Some("syntax error"));
            }
            other => panic!("expected budget error, got {}", other.name()),
        }
    }

    #[test]
    fn test_rows_request_explanation_once() {
        let mut s = ready(3);
        run_attempt(
            &mut s,
            ExecutionResult::rows(vec!["n".into()], vec![vec![json!(1)]]),
        );
        assert!(matches!(plan(&s), Action::Explain { .. }));

        s.apply(StateUpdate::Explained {
            text: None,
            notice: None,
        });
        assert_eq!(completion_kind(plan(&s)), None);
    }

    #[test]
    fn test_empty_results_complete_without_explanation() {
        let mut s = ready(3);
        run_attempt(&mut s, ExecutionResult::rows(vec!["n".into()], vec![]));
        assert_eq!(completion_kind(plan(&s)), None);
    }

    #[test]
    fn test_non_critical_failure_completes_with_execution_error() {
        let mut s = ready(3);
        run_attempt(
            &mut s,
            ExecutionResult::failed("canceling statement due to statement timeout"),
        );
        assert_eq!(completion_kind(plan(&s)), Some(ErrorKind::ExecutionError));
    }

    #[test]
    fn test_guard_overrides_every_row() {
        let mut s = ready(2);
        run_attempt(
            &mut s,
            ExecutionResult::rows(vec!["n".into()], vec![vec![json!(1)]]),
        );
        s.iteration = 3;
        assert_eq!(completion_kind(plan(&s)), Some(ErrorKind::IterationExceeded));
    }

    #[test]
    fn test_fatal_completes() {
        let mut s = ready(3);
        s.apply(StateUpdate::SqlRejected {
            validation: rejected(),
            error: TurnError::SecurityValidation {
                failed_checks: vec!["Tenant Filter: missing".to_string()],
                rejected_sql: "SELECT * FROM sales".to_string(),
            },
        });
        assert_eq!(
            completion_kind(plan(&s)),
            Some(ErrorKind::SecurityValidationFailure)
        );
    }

    #[test]
    fn test_generation_failures_retry_then_exceed_budget() {
        let mut s = ready(2);
        s.apply(StateUpdate::GenerationFailed {
            message: "completion timed out".to_string(),
        });
        assert!(matches!(plan(&s), Action::GenerateSql { prior: Some(_), .. }));

        s.apply(StateUpdate::GenerationFailed {
            message: "completion timed out".to_string(),
        });
        match plan(&s) {
            Action::Complete(Some(TurnError::IterationExceeded {
                iterations,
                max_iterations,
                last_error,
            })) => {
                assert_eq!((iterations, max_iterations), (2, 2));
                assert_eq!(last_error.as_deref(), Some("completion timed out"));
            }
            other => panic!("expected exceeded budget, got {}", other.name()),
        }
    }

    #[test]
    fn test_single_failed_generation_exhausts_budget_of_one() {
        let mut s = ready(1);
        s.apply(StateUpdate::GenerationFailed {
            message: "overloaded".to_string(),
        });
        assert_eq!(completion_kind(plan(&s)), Some(ErrorKind::IterationExceeded));
    }

    #[test]
    fn test_execution_failure_then_generation_failure_exceeds_budget() {
        let mut s = ready(2);
        run_attempt(&mut s, ExecutionResult::failed("syntax error"));
        s.apply(StateUpdate::RetryRequested);
        s.apply(StateUpdate::GenerationFailed {
            message: "model returned no SQL".to_string(),
        });
        assert_eq!(completion_kind(plan(&s)), Some(ErrorKind::IterationExceeded));
    }
}
