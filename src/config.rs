//! Configuration loader
//!
//! Loads the YAML configuration (completion, execution, session, orchestrator
//! settings and the dataset catalogue) and applies environment overrides.
//!
//! Path resolution order:
//! 1. `TEXT2SQL_CONFIG` environment variable
//! 2. `config/text2sql.yaml` relative to the working directory
//! 3. `config/text2sql.yaml` under `CARGO_MANIFEST_DIR`

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use text2sql_agentic::AgentBackend;
use thiserror::Error;
use tracing::info;

use crate::isolation::IsolationConfig;

const DEFAULT_CONFIG_PATH: &str = "config/text2sql.yaml";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidOverride {
        key: String,
        value: String,
        reason: String,
    },

    #[error("dataset '{dataset}': {reason}")]
    InvalidDataset { dataset: String, reason: String },

    #[error("duplicate dataset id '{0}'")]
    DuplicateDataset(String),

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    pub backend: AgentBackend,
    /// Overrides the provider default model
    pub model: Option<String>,
    pub timeout_secs: u64,
    pub max_tokens: u32,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            backend: AgentBackend::default(),
            model: None,
            timeout_secs: 8,
            max_tokens: 1000,
        }
    }
}

impl CompletionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub row_cap: usize,
    pub statement_timeout_secs: u64,
    pub database_url: Option<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            row_cap: 1000,
            statement_timeout_secs: 5,
            database_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Records kept per session
    pub capacity: usize,
    /// Records shown to the resolver
    pub context_turns: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            context_turns: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_iterations: u32,
    /// Rows sampled into the explanation prompt
    pub explanation_rows: usize,
    /// Stages slower than this log a warning
    pub slow_stage_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            explanation_rows: 10,
            slow_stage_ms: 2000,
        }
    }
}

/// One queryable dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub id: String,
    #[serde(default)]
    pub description: String,
    /// Postgres schema the dataset lives in
    #[serde(default)]
    pub pg_schema: Option<String>,
    /// Missing means row-level on `client_id`
    #[serde(default)]
    pub isolation: Option<IsolationConfig>,
    /// Static schema text used when no live schema provider is configured
    #[serde(default)]
    pub schema_text: Option<String>,
}

impl DatasetConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            pg_schema: None,
            isolation: None,
            schema_text: None,
        }
    }

    pub fn with_isolation(mut self, isolation: IsolationConfig) -> Self {
        self.isolation = Some(isolation);
        self
    }

    pub fn with_schema_text(mut self, text: impl Into<String>) -> Self {
        self.schema_text = Some(text.into());
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidDataset {
            dataset: self.id.clone(),
            reason,
        };
        if self.id.trim().is_empty() {
            return Err(ConfigError::Invalid("dataset id must not be empty".to_string()));
        }
        if let Some(schema) = &self.pg_schema {
            let plain = schema
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && schema.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !plain {
                return Err(invalid(format!("pg_schema '{}' is not a plain identifier", schema)));
            }
        }
        if let Some(isolation) = &self.isolation {
            isolation.validate().map_err(invalid)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub completion: CompletionConfig,
    pub execution: ExecutionConfig,
    pub session: SessionConfig,
    pub orchestrator: OrchestratorConfig,
    pub default_dataset: Option<String>,
    pub datasets: Vec<DatasetConfig>,
}

impl AppConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: AppConfig =
            serde_yaml::from_str(yaml).context("Failed to parse text2sql configuration")?;
        Ok(config)
    }

    pub fn dataset(&self, id: &str) -> Option<&DatasetConfig> {
        self.datasets.iter().find(|d| d.id == id)
    }

    /// Dataset used when a request names none
    pub fn default_dataset(&self) -> Option<&DatasetConfig> {
        match &self.default_dataset {
            Some(id) => self.dataset(id),
            None => self.datasets.first(),
        }
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup("AGENT_BACKEND") {
            self.completion.backend =
                value
                    .parse()
                    .map_err(|e: text2sql_agentic::backend::ParseBackendError| {
                        ConfigError::InvalidOverride {
                            key: "AGENT_BACKEND".to_string(),
                            value: value.clone(),
                            reason: e.to_string(),
                        }
                    })?;
        }
        if let Some(model) = lookup("TEXT2SQL_MODEL") {
            self.completion.model = Some(model);
        }
        if let Some(url) = lookup("DATABASE_URL") {
            self.execution.database_url = Some(url);
        }
        if let Some(value) = lookup("TEXT2SQL_MAX_ITERATIONS") {
            self.orchestrator.max_iterations =
                value.parse().map_err(|e: std::num::ParseIntError| {
                    ConfigError::InvalidOverride {
                        key: "TEXT2SQL_MAX_ITERATIONS".to_string(),
                        value: value.clone(),
                        reason: e.to_string(),
                    }
                })?;
        }
        if let Some(dataset) = lookup("ACTIVE_DATASET") {
            self.default_dataset = Some(dataset);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.capacity == 0 {
            return Err(ConfigError::Invalid(
                "session.capacity must be at least 1".to_string(),
            ));
        }
        if !(1..=5).contains(&self.session.context_turns) {
            return Err(ConfigError::Invalid(format!(
                "session.context_turns must be between 1 and 5, got {}",
                self.session.context_turns
            )));
        }
        if self.orchestrator.max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator.max_iterations must be at least 1".to_string(),
            ));
        }
        if self.execution.row_cap == 0 {
            return Err(ConfigError::Invalid(
                "execution.row_cap must be at least 1".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for dataset in &self.datasets {
            dataset.validate()?;
            if !seen.insert(dataset.id.as_str()) {
                return Err(ConfigError::DuplicateDataset(dataset.id.clone()));
            }
        }
        if let Some(id) = &self.default_dataset {
            if self.dataset(id).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "default_dataset '{}' is not configured",
                    id
                )));
            }
        }
        Ok(())
    }
}

pub struct ConfigLoader {
    path: PathBuf,
}

impl ConfigLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Create loader from TEXT2SQL_CONFIG env var or the default locations
    pub fn from_env() -> Self {
        if let Ok(path) = std::env::var("TEXT2SQL_CONFIG") {
            return Self::new(path);
        }
        if Path::new(DEFAULT_CONFIG_PATH).exists() {
            return Self::new(DEFAULT_CONFIG_PATH);
        }
        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            let candidate = Path::new(&manifest_dir).join(DEFAULT_CONFIG_PATH);
            if candidate.exists() {
                return Self::new(candidate);
            }
        }
        Self::new(DEFAULT_CONFIG_PATH)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read, parse, apply environment overrides and validate.
    pub fn load(&self) -> Result<AppConfig> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let mut config: AppConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;
        config.apply_env_overrides()?;
        config.validate()?;

        info!(
            path = %self.path.display(),
            datasets = config.datasets.len(),
            backend = %config.completion.backend,
            "Loaded text2sql configuration"
        );
        Ok(config)
    }
}
