//! Tool Execution Layer
//!
//! Every discrete action the planner can take against an external
//! collaborator goes through [`ToolExecutor`]. Each call returns the typed
//! value the orchestrator needs plus a [`ToolResult`] envelope for the turn's
//! tool-call log. Tool failures never escape as `Err`: they are recorded in
//! the envelope and reflected in the typed value.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::config::DatasetConfig;
use crate::executor::{ExecutionLimits, ExecutionResult, SqlExecutor};
use crate::schema::SchemaProvider;
use crate::validator::ApprovedSql;

/// Slack on top of the engine's own statement timeout
const EXECUTION_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    GetSchema,
    ExecuteSql,
    ValidateResults,
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ToolName::GetSchema => "get_schema",
            ToolName::ExecuteSql => "execute_sql",
            ToolName::ValidateResults => "validate_results",
        };
        f.write_str(name)
    }
}

/// Standard envelope for one tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool: ToolName,
    pub success: bool,
    /// Short summary payload on success
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl ToolResult {
    fn ok(tool: ToolName, result: serde_json::Value, elapsed: Duration) -> Self {
        Self {
            tool,
            success: true,
            result: Some(result),
            error: None,
            elapsed,
        }
    }

    fn err(tool: ToolName, error: String, elapsed: Duration) -> Self {
        Self {
            tool,
            success: false,
            result: None,
            error: Some(error),
            elapsed,
        }
    }
}

/// Typed value plus its log envelope
#[derive(Debug, Clone)]
pub struct ToolOutcome<T> {
    pub record: ToolResult,
    pub value: T,
}

/// Output of the `validate_results` tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultCheck {
    pub is_valid: bool,
    pub has_results: bool,
    pub row_count: usize,
    pub issues: Vec<String>,
}

pub struct ToolExecutor {
    schema: Arc<dyn SchemaProvider>,
    sql: Arc<dyn SqlExecutor>,
    row_cap: usize,
    statement_timeout: Duration,
}

impl ToolExecutor {
    pub fn new(schema: Arc<dyn SchemaProvider>, sql: Arc<dyn SqlExecutor>) -> Self {
        let limits = ExecutionLimits::default();
        Self {
            schema,
            sql,
            row_cap: limits.row_cap,
            statement_timeout: limits.statement_timeout,
        }
    }

    pub fn with_limits(mut self, row_cap: usize, statement_timeout: Duration) -> Self {
        self.row_cap = row_cap;
        self.statement_timeout = statement_timeout;
        self
    }

    /// Fetch the schema description for `dataset`.
    pub async fn get_schema(&self, dataset: &DatasetConfig) -> ToolOutcome<Option<String>> {
        let started = Instant::now();
        match self.schema.describe(dataset).await {
            Ok(text) => {
                let elapsed = started.elapsed();
                info!(
                    tool = %ToolName::GetSchema,
                    dataset = %dataset.id,
                    chars = text.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "tool succeeded"
                );
                ToolOutcome {
                    record: ToolResult::ok(
                        ToolName::GetSchema,
                        json!({ "dataset": dataset.id, "chars": text.len() }),
                        elapsed,
                    ),
                    value: Some(text),
                }
            }
            Err(e) => {
                let elapsed = started.elapsed();
                let error = format!("{:#}", e);
                warn!(tool = %ToolName::GetSchema, dataset = %dataset.id, %error, "tool failed");
                ToolOutcome {
                    record: ToolResult::err(ToolName::GetSchema, error, elapsed),
                    value: None,
                }
            }
        }
    }

    /// Run approved SQL under the row cap and timeout.
    ///
    /// Engine errors, infrastructure errors and timeouts all come back as a
    /// failed [`ExecutionResult`].
    pub async fn execute_sql(
        &self,
        sql: &ApprovedSql,
        dataset: &DatasetConfig,
    ) -> ToolOutcome<ExecutionResult> {
        let started = Instant::now();
        let limits = ExecutionLimits {
            row_cap: self.row_cap,
            statement_timeout: self.statement_timeout,
            search_path: dataset.pg_schema.clone(),
        };

        let bound = self.statement_timeout + EXECUTION_GRACE;
        let mut execution = match tokio::time::timeout(bound, self.sql.execute(sql, &limits)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => ExecutionResult::failed(format!("{:#}", e)),
            Err(_) => ExecutionResult::failed(format!(
                "statement timed out after {}s",
                self.statement_timeout.as_secs_f32()
            )),
        };
        execution.cap_rows(self.row_cap);
        let elapsed = started.elapsed();

        let record = if execution.success {
            info!(
                tool = %ToolName::ExecuteSql,
                rows = execution.row_count,
                truncated = execution.truncated,
                elapsed_ms = elapsed.as_millis() as u64,
                "tool succeeded"
            );
            ToolResult::ok(
                ToolName::ExecuteSql,
                json!({
                    "row_count": execution.row_count,
                    "columns": execution.columns,
                    "truncated": execution.truncated,
                }),
                elapsed,
            )
        } else {
            let error = execution.error.clone().unwrap_or_default();
            warn!(tool = %ToolName::ExecuteSql, %error, "tool failed");
            ToolResult::err(ToolName::ExecuteSql, error, elapsed)
        };

        ToolOutcome {
            record,
            value: execution,
        }
    }

    /// Inspect an execution result for emptiness and errors.
    pub fn validate_results(&self, execution: &ExecutionResult) -> ToolOutcome<ResultCheck> {
        let started = Instant::now();
        let mut issues = Vec::new();
        let has_results = !execution.rows.is_empty();
        if !has_results {
            issues.push("No results returned".to_string());
        }
        if !execution.success {
            issues.push(format!(
                "Execution error: {}",
                execution.error.as_deref().unwrap_or("unknown error")
            ));
        }
        if execution.truncated {
            issues.push(format!("Results truncated at {} rows", self.row_cap));
        }

        let check = ResultCheck {
            is_valid: execution.success,
            has_results,
            row_count: execution.row_count,
            issues,
        };
        let payload = serde_json::to_value(&check).unwrap_or(serde_json::Value::Null);
        info!(
            tool = %ToolName::ValidateResults,
            issues = check.issues.len(),
            "tool succeeded"
        );
        ToolOutcome {
            record: ToolResult::ok(ToolName::ValidateResults, payload, started.elapsed()),
            value: check,
        }
    }
}
