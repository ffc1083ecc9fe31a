//! Scripted collaborators for orchestrator integration tests
//!
//! `ScriptedLlm` routes each request on the first line of its system prompt
//! (the stage heading) and pops the next scripted reply for that stage.
//! `ScriptedExecutor` pops the next scripted execution result and records the
//! SQL it was handed.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;

use text2sql::text2sql_agentic::LlmClient;
use text2sql::{
    AppConfig, ApprovedSql, DatasetConfig, ExecutionLimits, ExecutionResult, IsolationConfig,
    Orchestrator, OrchestratorBuilder, SqlExecutor, TenantId, TurnRequest,
};

pub const SALES_SCHEMA: &str =
    "sales(client_id integer, region text, product text, amount numeric, order_date date)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Resolution,
    Clarification,
    Generation,
    Explanation,
}

impl Stage {
    fn from_system_prompt(system_prompt: &str) -> Option<Self> {
        match system_prompt.lines().next()?.trim() {
            "# Query Resolution" => Some(Stage::Resolution),
            "# Clarification Check" => Some(Stage::Clarification),
            "# SQL Generation" => Some(Stage::Generation),
            "# Result Explanation" => Some(Stage::Explanation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Fail(String),
    /// Never answers; exercises the completion timeout
    Hang,
}

pub fn text(s: impl Into<String>) -> Reply {
    Reply::Text(s.into())
}

#[derive(Default)]
struct Script {
    replies: HashMap<Stage, VecDeque<Reply>>,
    calls: Vec<(Stage, String)>,
}

#[derive(Clone, Default)]
pub struct ScriptedLlm {
    script: Arc<Mutex<Script>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, stage: Stage, reply: Reply) -> &Self {
        self.script
            .lock()
            .unwrap()
            .replies
            .entry(stage)
            .or_default()
            .push_back(reply);
        self
    }

    pub fn sql(&self, sql: &str) -> &Self {
        self.push(Stage::Generation, text(sql))
    }

    /// User prompts sent for `stage`, in order
    pub fn prompts(&self, stage: Stage) -> Vec<String> {
        self.script
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(s, _)| *s == stage)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn calls(&self, stage: Stage) -> usize {
        self.prompts(stage).len()
    }

    fn default_reply(stage: Stage) -> Reply {
        match stage {
            Stage::Resolution => text(json!({ "is_followup": false }).to_string()),
            Stage::Clarification => text(
                json!({ "needs_clarification": false, "reason": "none", "questions": [] })
                    .to_string(),
            ),
            Stage::Generation => Reply::Fail("no scripted SQL left".to_string()),
            Stage::Explanation => text("Revenue is concentrated in EMEA."),
        }
    }

    async fn answer(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let stage = Stage::from_system_prompt(system_prompt)
            .ok_or_else(|| anyhow!("unrecognised system prompt"))?;
        let reply = {
            let mut script = self.script.lock().unwrap();
            script.calls.push((stage, user_prompt.to_string()));
            script
                .replies
                .get_mut(&stage)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Self::default_reply(stage))
        };
        match reply {
            Reply::Text(text) => Ok(text),
            Reply::Fail(message) => Err(anyhow!(message)),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(anyhow!("hung"))
            }
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat(&self, system_prompt: &str, user_prompt: &str, _: u32) -> Result<String> {
        self.answer(system_prompt, user_prompt).await
    }

    async fn chat_json(&self, system_prompt: &str, user_prompt: &str, _: u32) -> Result<String> {
        self.answer(system_prompt, user_prompt).await
    }

    fn model_name(&self) -> &str {
        "scripted"
    }

    fn provider_name(&self) -> &str {
        "Test"
    }
}

#[derive(Clone, Default)]
pub struct ScriptedExecutor {
    results: Arc<Mutex<VecDeque<ExecutionResult>>>,
    executed: Arc<Mutex<Vec<String>>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, result: ExecutionResult) -> &Self {
        self.results.lock().unwrap().push_back(result);
        self
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl SqlExecutor for ScriptedExecutor {
    async fn execute(&self, sql: &ApprovedSql, _: &ExecutionLimits) -> Result<ExecutionResult> {
        self.executed.lock().unwrap().push(sql.as_str().to_string());
        let next = self.results.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| ExecutionResult::rows(vec!["n".to_string()], vec![])))
    }
}

pub fn revenue_rows() -> ExecutionResult {
    ExecutionResult::rows(
        vec!["region".to_string(), "revenue".to_string()],
        vec![
            vec![json!("EMEA"), json!(1200.5)],
            vec![json!("APAC"), json!(800)],
        ],
    )
}

pub fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.completion.timeout_secs = 2;
    config.datasets = vec![
        DatasetConfig::new("sales")
            .with_isolation(IsolationConfig::row_level("client_id"))
            .with_schema_text(SALES_SCHEMA),
        DatasetConfig::new("market")
            .with_isolation(IsolationConfig::hierarchical("corp_id", "dim_corporation"))
            .with_schema_text("dim_corporation(corp_id integer), fact_market(brand_id integer, corp_id integer, value numeric)"),
    ];
    config.default_dataset = Some("sales".to_string());
    config
}

pub struct Harness {
    pub llm: ScriptedLlm,
    pub executor: ScriptedExecutor,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(config())
    }

    pub fn with_config(config: AppConfig) -> Self {
        let llm = ScriptedLlm::new();
        let executor = ScriptedExecutor::new();
        let orchestrator = OrchestratorBuilder::new(config)
            .with_llm_client(Arc::new(llm.clone()))
            .with_executor(Arc::new(executor.clone()))
            .build()
            .expect("test orchestrator builds");
        Self {
            llm,
            executor,
            orchestrator,
        }
    }
}

pub fn request(query: &str) -> TurnRequest {
    TurnRequest::new(query, "session-1", TenantId::from(42))
}
