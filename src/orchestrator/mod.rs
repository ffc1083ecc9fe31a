//! Turn Orchestrator
//!
//! Main entry point for a conversational text-to-SQL turn.
//!
//! ```text
//! utterance → resolver (session history) → planner loop ─┬─ fetch schema
//!                                                        ├─ check clarification
//!                                                        ├─ generate + validate SQL
//!                                                        ├─ execute SQL
//!                                                        ├─ validate results
//!                                                        ├─ reflect (retry?)
//!                                                        └─ explain
//!           → session update → TurnResponse
//! ```
//!
//! The session's mutex is held from resolution to the history update, so
//! turns on one session never interleave.

mod nodes;
pub mod planner;
pub mod state;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use text2sql_agentic::{create_llm_client, CompletionService, LlmClient};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::clarification::ClarificationDetector;
use crate::config::{AppConfig, DatasetConfig, OrchestratorConfig};
use crate::error::{ErrorKind, StageNotice, TurnError};
use crate::executor::{ExecutionResult, SqlExecutor};
use crate::explanation::Explainer;
use crate::generator::SqlGenerator;
use crate::isolation::TenantId;
use crate::reflection::Reflection;
use crate::resolver::QueryResolver;
use crate::schema::{SchemaProvider, StaticSchemaProvider};
use crate::session::{QueryRecord, SessionStore};
use crate::tools::{ToolExecutor, ToolResult};
use crate::validator::{ValidationResult, ValidationSummary};

use planner::{plan, Action};
use state::{ExplanationState, StateUpdate, TurnContext, WorkflowState};

/// Marker that a query already carries the user's answers to clarification
const CLARIFIED_MARKER: &str = "Additional context:";

/// Leading column names kept in a history record's result summary
const SUMMARY_COLUMNS: usize = 3;

/// One user turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub query: String,
    pub session_id: String,
    pub tenant: TenantId,
    /// Falls back to the configured default dataset
    #[serde(default)]
    pub dataset_id: Option<String>,
    /// Falls back to the configured budget
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub skip_clarification: bool,
}

impl TurnRequest {
    pub fn new(query: impl Into<String>, session_id: impl Into<String>, tenant: TenantId) -> Self {
        Self {
            query: query.into(),
            session_id: session_id.into(),
            tenant,
            dataset_id: None,
            max_iterations: None,
            skip_clarification: false,
        }
    }

    pub fn with_dataset(mut self, dataset_id: impl Into<String>) -> Self {
        self.dataset_id = Some(dataset_id.into());
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    pub fn skip_clarification(mut self) -> Self {
        self.skip_clarification = true;
        self
    }
}

/// Outcome of a turn
#[derive(Debug, Clone, Serialize)]
pub struct TurnResponse {
    pub turn_id: Uuid,
    pub success: bool,
    pub sql: Option<String>,
    pub results: Option<ExecutionResult>,
    pub explanation: Option<String>,
    pub validation: Option<ValidationResult>,
    pub validation_summary: Option<ValidationSummary>,
    pub reflection: Option<Reflection>,
    pub needs_clarification: bool,
    pub questions: Vec<String>,
    pub iterations: u32,
    pub tool_calls: Vec<ToolResult>,
    pub is_followup: bool,
    pub resolved_query: Option<String>,
    pub resolution_reason: Option<String>,
    /// Non-fatal stage failures
    pub notices: Vec<StageNotice>,
    pub error: Option<TurnError>,
    pub elapsed: Duration,
}

impl TurnResponse {
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(TurnError::kind)
    }

    fn rejected(error: TurnError, started: Instant) -> Self {
        Self {
            turn_id: Uuid::new_v4(),
            success: false,
            sql: None,
            results: None,
            explanation: None,
            validation: None,
            validation_summary: None,
            reflection: None,
            needs_clarification: false,
            questions: Vec::new(),
            iterations: 0,
            tool_calls: Vec::new(),
            is_followup: false,
            resolved_query: None,
            resolution_reason: None,
            notices: Vec::new(),
            error: Some(error),
            elapsed: started.elapsed(),
        }
    }

    fn from_state(state: WorkflowState, resolution_reason: Option<String>, started: Instant) -> Self {
        let needs_clarification = state.needs_clarification();
        let questions = state
            .clarification
            .as_ref()
            .filter(|c| c.needs_clarification)
            .map(|c| c.questions.clone())
            .unwrap_or_default();
        let explanation = match state.explanation {
            ExplanationState::Produced(text) => Some(text),
            _ => None,
        };
        let success = state.error.is_none()
            && !needs_clarification
            && state.attempt.execution().is_some_and(|e| e.success);
        let validation_summary = state.validation.as_ref().map(ValidationResult::summary);

        // A rejected statement is reported through the error, not as `sql`
        let sql = state.attempt.sql().map(|s| s.as_str().to_string());
        let results = state.attempt.execution().cloned();
        let reflection = state.attempt.reflection().cloned();

        Self {
            turn_id: state.context.turn_id,
            success,
            sql,
            results,
            explanation,
            validation: state.validation,
            validation_summary,
            reflection,
            needs_clarification,
            questions,
            iterations: state.iteration,
            tool_calls: state.tool_calls,
            is_followup: state.context.is_followup,
            resolved_query: Some(state.context.resolved_query),
            resolution_reason,
            notices: state.notices,
            error: state.error,
            elapsed: started.elapsed(),
        }
    }
}

/// Stage components the nodes call into
struct Stages {
    detector: ClarificationDetector,
    generator: SqlGenerator,
    explainer: Explainer,
    tools: ToolExecutor,
}

pub struct Orchestrator {
    resolver: QueryResolver,
    stages: Stages,
    sessions: Arc<SessionStore>,
    config: OrchestratorConfig,
    context_turns: usize,
    datasets: HashMap<String, DatasetConfig>,
    default_dataset: Option<String>,
}

impl Orchestrator {
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn dataset(&self, id: &str) -> Option<&DatasetConfig> {
        self.datasets.get(id)
    }

    /// Run one conversational turn end to end.
    ///
    /// Never returns `Err`: every failure is reported on the response.
    #[instrument(
        skip(self, request),
        fields(session_id = %request.session_id, tenant = %request.tenant)
    )]
    pub async fn run_turn(&self, request: TurnRequest) -> TurnResponse {
        let started = Instant::now();

        let query = request.query.trim();
        if query.is_empty() {
            return TurnResponse::rejected(TurnError::invalid_request("query is empty"), started);
        }
        let dataset = match self.select_dataset(request.dataset_id.as_deref()) {
            Ok(dataset) => dataset.clone(),
            Err(e) => return TurnResponse::rejected(e, started),
        };
        let max_iterations = request.max_iterations.unwrap_or(self.config.max_iterations);
        if max_iterations == 0 {
            return TurnResponse::rejected(
                TurnError::invalid_request("max_iterations must be at least 1"),
                started,
            );
        }

        let mut session = self.sessions.lock(&request.session_id).await;

        let stage_started = Instant::now();
        let resolution = {
            let history = session.recent(self.context_turns);
            self.resolver.resolve(query, &history).await
        };
        self.note_slow("resolve", stage_started.elapsed());

        let context = TurnContext {
            turn_id: Uuid::new_v4(),
            session_id: request.session_id.clone(),
            tenant: request.tenant.clone(),
            dataset,
            original_query: query.to_string(),
            resolved_query: resolution.standalone_query,
            is_followup: resolution.is_followup,
        };
        let skip_clarification = request.skip_clarification || query.contains(CLARIFIED_MARKER);
        let mut state = WorkflowState::new(context, max_iterations, skip_clarification);
        if let Some(failure) = resolution.failure {
            state
                .notices
                .push(StageNotice::new(ErrorKind::ResolutionError, failure));
        }

        info!(
            turn_id = %state.context.turn_id,
            dataset = %state.context.dataset.id,
            is_followup = state.context.is_followup,
            max_iterations,
            "turn started"
        );

        self.drive(&mut state).await;

        if let (Some(sql), false) = (state.attempt.sql(), state.needs_clarification()) {
            let summary = state
                .attempt
                .execution()
                .map(|e| e.summary(SUMMARY_COLUMNS))
                .unwrap_or_else(|| "not executed".to_string());
            session.push(QueryRecord::new(
                state.context.original_query.clone(),
                state.context.resolved_query.clone(),
                sql.as_str(),
                summary,
            ));
        }
        drop(session);

        let response = TurnResponse::from_state(state, resolution.reason, started);
        match &response.error {
            Some(e) => warn!(
                kind = ?e.kind(),
                error = %e,
                iterations = response.iterations,
                elapsed_ms = response.elapsed.as_millis() as u64,
                "turn failed"
            ),
            None => info!(
                success = response.success,
                needs_clarification = response.needs_clarification,
                iterations = response.iterations,
                elapsed_ms = response.elapsed.as_millis() as u64,
                "turn complete"
            ),
        }
        response
    }

    /// Plan → run one node → merge, until the planner completes the turn.
    async fn drive(&self, state: &mut WorkflowState) {
        // Every pass either completes or advances the attempt; this bound is
        // only hit if that stops holding.
        let max_passes = 8 + 6 * state.max_iterations as usize;

        for pass in 0..max_passes {
            let stage_started = Instant::now();
            let action = plan(state);
            let stage = action.name();
            debug!(pass, iteration = state.iteration, phase = state.phase(), stage, "planned");

            let update = match action {
                Action::Complete(error) => StateUpdate::Completed { error },
                Action::FetchSchema => nodes::fetch_schema(&self.stages.tools, state).await,
                Action::CheckClarification { schema } => {
                    nodes::check_clarification(&self.stages.detector, state, schema).await
                }
                Action::GenerateSql { schema, prior } => {
                    nodes::generate_sql(&self.stages.generator, state, schema, prior).await
                }
                Action::ExecuteSql(sql) => nodes::execute_sql(&self.stages.tools, state, sql).await,
                Action::ValidateResults(execution) => {
                    nodes::validate_results(&self.stages.tools, execution)
                }
                Action::Reflect(execution) => nodes::reflect(execution),
                Action::Retry => {
                    info!(iteration = state.iteration, "retrying SQL generation");
                    StateUpdate::RetryRequested
                }
                Action::Explain { sql, execution } => {
                    nodes::explain(&self.stages.explainer, state, sql, execution).await
                }
            };
            self.note_slow(stage, stage_started.elapsed());

            state.apply(update);
            if state.completed {
                return;
            }
        }

        error!(
            iteration = state.iteration,
            phase = state.phase(),
            "planner did not converge"
        );
        let last_error = state.last_failure.as_ref().map(|p| p.error.clone());
        state.apply(StateUpdate::Completed {
            error: Some(TurnError::IterationExceeded {
                iterations: state.iteration,
                max_iterations: state.max_iterations,
                last_error,
            }),
        });
    }

    fn select_dataset(&self, requested: Option<&str>) -> Result<&DatasetConfig, TurnError> {
        let id = match requested.or(self.default_dataset.as_deref()) {
            Some(id) => id,
            None if self.datasets.len() == 1 => {
                return self
                    .datasets
                    .values()
                    .next()
                    .ok_or_else(|| TurnError::invalid_request("no datasets configured"));
            }
            None => return Err(TurnError::invalid_request("no dataset specified")),
        };
        self.datasets
            .get(id)
            .ok_or_else(|| TurnError::invalid_request(format!("unknown dataset '{}'", id)))
    }

    fn note_slow(&self, stage: &str, elapsed: Duration) {
        if elapsed.as_millis() as u64 > self.config.slow_stage_ms {
            warn!(
                stage,
                elapsed_ms = elapsed.as_millis() as u64,
                target_ms = self.config.slow_stage_ms,
                "slow stage"
            );
        }
    }
}

/// Builder for [`Orchestrator`]
pub struct OrchestratorBuilder {
    config: AppConfig,
    llm_client: Option<Arc<dyn LlmClient>>,
    schema_provider: Option<Arc<dyn SchemaProvider>>,
    executor: Option<Arc<dyn SqlExecutor>>,
    sessions: Option<Arc<SessionStore>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm_client: None,
            schema_provider: None,
            executor: None,
            sessions: None,
        }
    }

    /// Use this client instead of creating one from the configured backend
    pub fn with_llm_client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.llm_client = Some(client);
        self
    }

    /// Defaults to the datasets' static schema text
    pub fn with_schema_provider(mut self, provider: Arc<dyn SchemaProvider>) -> Self {
        self.schema_provider = Some(provider);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn SqlExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Share a session store between orchestrators
    pub fn with_sessions(mut self, sessions: Arc<SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn max_iterations(mut self, max_iterations: u32) -> Self {
        self.config.orchestrator.max_iterations = max_iterations;
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let config = self.config;
        config.validate()?;
        if config.datasets.is_empty() {
            return Err(anyhow!("at least one dataset must be configured"));
        }

        let executor = self
            .executor
            .ok_or_else(|| anyhow!("no SQL executor configured"))?;
        let client = match self.llm_client {
            Some(client) => client,
            None => create_llm_client(config.completion.backend, config.completion.model.as_deref())?,
        };
        let schema_provider = self
            .schema_provider
            .unwrap_or_else(|| Arc::new(StaticSchemaProvider::new()));
        let sessions = self
            .sessions
            .unwrap_or_else(|| Arc::new(SessionStore::new(config.session.capacity)));

        let completion = CompletionService::new(client, config.completion.timeout());
        info!(
            model = %completion.describe(),
            datasets = config.datasets.len(),
            max_iterations = config.orchestrator.max_iterations,
            "orchestrator configured"
        );

        let tools = ToolExecutor::new(schema_provider, executor).with_limits(
            config.execution.row_cap,
            Duration::from_secs(config.execution.statement_timeout_secs),
        );
        let datasets = config
            .datasets
            .iter()
            .map(|d| (d.id.clone(), d.clone()))
            .collect();

        Ok(Orchestrator {
            resolver: QueryResolver::new(completion.clone(), config.session.context_turns),
            stages: Stages {
                detector: ClarificationDetector::new(completion.clone()),
                generator: SqlGenerator::new(completion.clone(), config.completion.max_tokens),
                explainer: Explainer::new(completion, config.orchestrator.explanation_rows),
                tools,
            },
            sessions,
            context_turns: config.session.context_turns,
            config: config.orchestrator,
            datasets,
            default_dataset: config.default_dataset,
        })
    }
}
