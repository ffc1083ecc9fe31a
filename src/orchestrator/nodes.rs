//! Node functions
//!
//! One node per planner action. Each reads the state (and the data the action
//! borrowed from it) and returns a [`StateUpdate`]; none mutates the state.

use tracing::{info, warn};

use crate::clarification::{Clarification, ClarificationDetector};
use crate::error::{ErrorKind, StageNotice, TurnError};
use crate::executor::ExecutionResult;
use crate::explanation::Explainer;
use crate::generator::{GenerationRequest, PriorAttempt, SqlGenerator};
use crate::reflection;
use crate::tools::ToolExecutor;
use crate::validator::{approve, ApprovedSql};

use super::state::{StateUpdate, WorkflowState};

pub(super) async fn fetch_schema(tools: &ToolExecutor, state: &WorkflowState) -> StateUpdate {
    let dataset = &state.context.dataset;
    let outcome = tools.get_schema(dataset).await;
    match outcome.value {
        Some(schema) => StateUpdate::SchemaLoaded {
            schema,
            record: outcome.record,
        },
        None => StateUpdate::SchemaFailed {
            error: TurnError::SchemaUnavailable {
                dataset: dataset.id.clone(),
                message: outcome
                    .record
                    .error
                    .clone()
                    .unwrap_or_else(|| "schema provider returned nothing".to_string()),
            },
            record: outcome.record,
        },
    }
}

pub(super) async fn check_clarification(
    detector: &ClarificationDetector,
    state: &WorkflowState,
    schema: &str,
) -> StateUpdate {
    match detector.detect(&state.context.resolved_query, schema).await {
        Ok(clarification) => StateUpdate::ClarificationChecked {
            clarification,
            notice: None,
        },
        Err(message) => StateUpdate::ClarificationChecked {
            clarification: Clarification::not_needed(),
            notice: Some(StageNotice::new(ErrorKind::ClarificationError, message)),
        },
    }
}

/// Generate SQL and put it through security validation.
///
/// Rejected SQL is never patched or retried.
pub(super) async fn generate_sql(
    generator: &SqlGenerator,
    state: &WorkflowState,
    schema: &str,
    prior: Option<&PriorAttempt>,
) -> StateUpdate {
    let context = &state.context;
    let isolation = context.dataset.isolation.clone().unwrap_or_default();
    let request = GenerationRequest {
        question: &context.resolved_query,
        schema,
        dataset_description: &context.dataset.description,
        tenant: &context.tenant,
        isolation: &isolation,
        prior,
    };

    let sql = match generator.generate(&request).await {
        Ok(sql) => sql,
        Err(e) => {
            warn!(iteration = state.iteration + 1, error = %e, "SQL generation failed");
            return StateUpdate::GenerationFailed {
                message: e.to_string(),
            };
        }
    };

    let (validation, approved) = approve(&sql, &context.tenant, Some(&isolation));
    match approved {
        Some(sql) => {
            info!(
                iteration = state.iteration + 1,
                warnings = validation.warnings.len(),
                "SQL approved"
            );
            StateUpdate::SqlApproved { sql, validation }
        }
        None => {
            let failed_checks: Vec<String> = validation
                .failed_checks()
                .map(|c| format!("{}: {}", c.name, c.message))
                .collect();
            warn!(
                iteration = state.iteration + 1,
                tenant = %context.tenant,
                failed = ?failed_checks,
                "SQL rejected by security validation"
            );
            StateUpdate::SqlRejected {
                error: TurnError::SecurityValidation {
                    failed_checks,
                    rejected_sql: sql,
                },
                validation,
            }
        }
    }
}

pub(super) async fn execute_sql(
    tools: &ToolExecutor,
    state: &WorkflowState,
    sql: &ApprovedSql,
) -> StateUpdate {
    let outcome = tools.execute_sql(sql, &state.context.dataset).await;
    StateUpdate::Executed {
        execution: outcome.value,
        record: outcome.record,
    }
}

pub(super) fn validate_results(tools: &ToolExecutor, execution: &ExecutionResult) -> StateUpdate {
    let outcome = tools.validate_results(execution);
    StateUpdate::ResultsChecked {
        check: outcome.value,
        record: outcome.record,
    }
}

pub(super) fn reflect(execution: &ExecutionResult) -> StateUpdate {
    StateUpdate::Reflected {
        reflection: reflection::reflect(execution),
    }
}

pub(super) async fn explain(
    explainer: &Explainer,
    state: &WorkflowState,
    sql: &ApprovedSql,
    execution: &ExecutionResult,
) -> StateUpdate {
    match explainer
        .explain(&state.context.original_query, sql.as_str(), execution)
        .await
    {
        Ok(text) => StateUpdate::Explained {
            text: Some(text),
            notice: None,
        },
        Err(e) => StateUpdate::Explained {
            text: None,
            notice: Some(StageNotice::new(
                ErrorKind::ExplanationError,
                format!("explanation failed: {}", e),
            )),
        },
    }
}
