//! Workflow state for one turn
//!
//! The state is owned by the driver loop. Nodes never mutate it; they return
//! a [`StateUpdate`] which the driver merges with [`WorkflowState::apply`].
//!
//! The SQL attempt is a phase enum so each stage only exists once the stages
//! before it have produced their data:
//!
//! ```text
//! NotStarted ──generate+approve──▶ Approved ──execute──▶ Executed
//!     ▲                                                    │
//!     │                                               validate_results
//!     │                                                    ▼
//!     └────────────── retry ─────────── Reflected ◀──reflect── Checked
//! ```

use uuid::Uuid;

use crate::clarification::Clarification;
use crate::config::DatasetConfig;
use crate::error::{ErrorKind, StageNotice, TurnError};
use crate::executor::ExecutionResult;
use crate::generator::PriorAttempt;
use crate::isolation::TenantId;
use crate::reflection::Reflection;
use crate::tools::{ResultCheck, ToolResult};
use crate::validator::{ApprovedSql, ValidationResult};

/// Fixed inputs of a turn
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub turn_id: Uuid,
    pub session_id: String,
    pub tenant: TenantId,
    pub dataset: DatasetConfig,
    pub original_query: String,
    pub resolved_query: String,
    pub is_followup: bool,
}

/// Progress of the current SQL attempt
#[derive(Debug, Clone, Default)]
pub enum AttemptPhase {
    #[default]
    NotStarted,
    Approved {
        sql: ApprovedSql,
    },
    Executed {
        sql: ApprovedSql,
        execution: ExecutionResult,
    },
    Checked {
        sql: ApprovedSql,
        execution: ExecutionResult,
        check: ResultCheck,
    },
    Reflected {
        sql: ApprovedSql,
        execution: ExecutionResult,
        check: ResultCheck,
        reflection: Reflection,
    },
}

impl AttemptPhase {
    pub fn sql(&self) -> Option<&ApprovedSql> {
        match self {
            AttemptPhase::NotStarted => None,
            AttemptPhase::Approved { sql }
            | AttemptPhase::Executed { sql, .. }
            | AttemptPhase::Checked { sql, .. }
            | AttemptPhase::Reflected { sql, .. } => Some(sql),
        }
    }

    pub fn execution(&self) -> Option<&ExecutionResult> {
        match self {
            AttemptPhase::Executed { execution, .. }
            | AttemptPhase::Checked { execution, .. }
            | AttemptPhase::Reflected { execution, .. } => Some(execution),
            _ => None,
        }
    }

    pub fn check(&self) -> Option<&ResultCheck> {
        match self {
            AttemptPhase::Checked { check, .. } | AttemptPhase::Reflected { check, .. } => {
                Some(check)
            }
            _ => None,
        }
    }

    pub fn reflection(&self) -> Option<&Reflection> {
        match self {
            AttemptPhase::Reflected { reflection, .. } => Some(reflection),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            AttemptPhase::NotStarted => "not_started",
            AttemptPhase::Approved { .. } => "approved",
            AttemptPhase::Executed { .. } => "executed",
            AttemptPhase::Checked { .. } => "checked",
            AttemptPhase::Reflected { .. } => "reflected",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExplanationState {
    #[default]
    NotRequested,
    Produced(String),
    /// The explanation call failed; the turn carries on without one
    Unavailable,
}

/// Partial update returned by a node
#[derive(Debug, Clone)]
pub enum StateUpdate {
    SchemaLoaded {
        schema: String,
        record: ToolResult,
    },
    SchemaFailed {
        error: TurnError,
        record: ToolResult,
    },
    ClarificationChecked {
        clarification: Clarification,
        notice: Option<StageNotice>,
    },
    /// Generation produced SQL that passed validation
    SqlApproved {
        sql: ApprovedSql,
        validation: ValidationResult,
    },
    /// Generation produced SQL that failed validation
    SqlRejected {
        validation: ValidationResult,
        error: TurnError,
    },
    GenerationFailed {
        message: String,
    },
    Executed {
        execution: ExecutionResult,
        record: ToolResult,
    },
    ResultsChecked {
        check: ResultCheck,
        record: ToolResult,
    },
    Reflected {
        reflection: Reflection,
    },
    RetryRequested,
    Explained {
        text: Option<String>,
        notice: Option<StageNotice>,
    },
    Completed {
        error: Option<TurnError>,
    },
}

#[derive(Debug, Clone)]
pub struct WorkflowState {
    pub context: TurnContext,
    /// Generation attempts begun so far
    pub iteration: u32,
    pub max_iterations: u32,
    pub skip_clarification: bool,
    pub schema: Option<String>,
    pub clarification: Option<Clarification>,
    pub attempt: AttemptPhase,
    /// Security validation of the latest generated SQL
    pub validation: Option<ValidationResult>,
    /// The most recent failed attempt, fed back into the next generation
    pub last_failure: Option<PriorAttempt>,
    pub explanation: ExplanationState,
    pub tool_calls: Vec<ToolResult>,
    pub notices: Vec<StageNotice>,
    /// Set by a node that hit a turn-ending failure
    pub fatal: Option<TurnError>,
    pub completed: bool,
    pub error: Option<TurnError>,
}

impl WorkflowState {
    pub fn new(context: TurnContext, max_iterations: u32, skip_clarification: bool) -> Self {
        Self {
            context,
            iteration: 0,
            max_iterations,
            skip_clarification,
            schema: None,
            clarification: None,
            attempt: AttemptPhase::NotStarted,
            validation: None,
            last_failure: None,
            explanation: ExplanationState::NotRequested,
            tool_calls: Vec::new(),
            notices: Vec::new(),
            fatal: None,
            completed: false,
            error: None,
        }
    }

    pub fn needs_clarification(&self) -> bool {
        self.clarification
            .as_ref()
            .is_some_and(|c| c.needs_clarification)
    }

    /// Merge one node's output.
    ///
    /// An update that does not fit the current phase leaves the attempt
    /// untouched; the planner only ever schedules fitting nodes.
    pub fn apply(&mut self, update: StateUpdate) {
        match update {
            StateUpdate::SchemaLoaded { schema, record } => {
                self.schema = Some(schema);
                self.tool_calls.push(record);
            }
            StateUpdate::SchemaFailed { error, record } => {
                self.tool_calls.push(record);
                self.fatal = Some(error);
            }
            StateUpdate::ClarificationChecked {
                clarification,
                notice,
            } => {
                self.clarification = Some(clarification);
                self.notices.extend(notice);
            }
            StateUpdate::SqlApproved { sql, validation } => {
                self.iteration += 1;
                self.validation = Some(validation);
                self.attempt = AttemptPhase::Approved { sql };
            }
            StateUpdate::SqlRejected { validation, error } => {
                self.iteration += 1;
                self.validation = Some(validation);
                self.fatal = Some(error);
            }
            StateUpdate::GenerationFailed { message } => {
                self.iteration += 1;
                self.notices.push(StageNotice::new(
                    ErrorKind::GenerationError,
                    format!("attempt {}: {}", self.iteration, message),
                ));
                self.last_failure = Some(PriorAttempt {
                    sql: None,
                    error: message,
                });
            }
            StateUpdate::Executed { execution, record } => {
                self.tool_calls.push(record);
                self.attempt = match std::mem::take(&mut self.attempt) {
                    AttemptPhase::Approved { sql } => AttemptPhase::Executed { sql, execution },
                    other => other,
                };
            }
            StateUpdate::ResultsChecked { check, record } => {
                self.tool_calls.push(record);
                self.attempt = match std::mem::take(&mut self.attempt) {
                    AttemptPhase::Executed { sql, execution } => AttemptPhase::Checked {
                        sql,
                        execution,
                        check,
                    },
                    other => other,
                };
            }
            StateUpdate::Reflected { reflection } => {
                self.attempt = match std::mem::take(&mut self.attempt) {
                    AttemptPhase::Checked {
                        sql,
                        execution,
                        check,
                    } => AttemptPhase::Reflected {
                        sql,
                        execution,
                        check,
                        reflection,
                    },
                    other => other,
                };
            }
            StateUpdate::RetryRequested => {
                if let AttemptPhase::Reflected { sql, execution, .. } =
                    std::mem::take(&mut self.attempt)
                {
                    self.last_failure = Some(PriorAttempt {
                        sql: Some(sql.as_str().to_string()),
                        error: execution
                            .error
                            .unwrap_or_else(|| "query failed".to_string()),
                    });
                }
                self.validation = None;
            }
            StateUpdate::Explained { text, notice } => {
                self.explanation = match text {
                    Some(text) => ExplanationState::Produced(text),
                    None => ExplanationState::Unavailable,
                };
                self.notices.extend(notice);
            }
            StateUpdate::Completed { error } => {
                self.completed = true;
                self.error = error;
            }
        }
    }

    /// Short phase label for logs
    pub fn phase(&self) -> &'static str {
        if self.completed {
            "completed"
        } else {
            self.attempt.label()
        }
    }
}
