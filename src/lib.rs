//! Tenant-safe conversational text-to-SQL
//!
//! Turns natural-language analytics questions into validated, read-only SQL
//! over multiple conversational turns, and refuses to run any statement that
//! could reach another tenant's rows or mutate data.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────┐   ┌─────────────────────────────────┐
//! │ SessionStore │──▶│ QueryResolver │──▶│ Orchestrator (planner loop)     │
//! └──────────────┘   └───────────────┘   │  schema → clarify → generate    │
//!                                        │  → validator → execute → check  │
//!                                        │  → reflect (retry) → explain    │
//!                                        └─────────────────────────────────┘
//! ```
//!
//! LLM access lives in the `text2sql-agentic` crate; everything here talks to
//! it through `CompletionService`.
//!
//! ## Features
//!
//! - `database`: Postgres executor and schema provider (sqlx)
//! - `cli`: the `text2sql_cli` developer binary

pub mod clarification;
pub mod config;
pub mod error;
pub mod executor;
pub mod explanation;
pub mod generator;
pub mod isolation;
pub mod orchestrator;
pub mod reflection;
pub mod resolver;
pub mod schema;
pub mod session;
pub mod tools;
pub mod validator;

pub use config::{AppConfig, ConfigLoader, DatasetConfig};
pub use error::{ErrorKind, StageNotice, TurnError};
pub use executor::{ExecutionLimits, ExecutionResult, SqlExecutor};
pub use isolation::{IsolationConfig, IsolationMethod, TenantId};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, TurnRequest, TurnResponse};
pub use schema::{SchemaProvider, StaticSchemaProvider};
pub use session::{QueryRecord, SessionStore};
pub use validator::{approve, validate, ApprovedSql, ValidationResult};

#[cfg(feature = "database")]
pub use executor::PgExecutor;
#[cfg(feature = "database")]
pub use schema::PgSchemaProvider;

pub use text2sql_agentic;
