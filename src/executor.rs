//! SQL execution engine interface
//!
//! Executors only ever see [`ApprovedSql`]. The Postgres implementation runs
//! each statement in a read-only transaction with a statement timeout and a
//! row cap, then rolls back.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::validator::ApprovedSql;

/// Outcome of running one statement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
    /// Set when the row cap cut the result short
    #[serde(default)]
    pub truncated: bool,
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn rows(columns: Vec<String>, rows: Vec<Vec<serde_json::Value>>) -> Self {
        Self {
            success: true,
            columns,
            row_count: rows.len(),
            rows,
            truncated: false,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Drop rows beyond `cap`, marking the result truncated.
    pub fn cap_rows(&mut self, cap: usize) {
        if self.rows.len() > cap {
            self.rows.truncate(cap);
            self.truncated = true;
        }
        self.row_count = self.rows.len();
    }

    /// Short history summary: row count plus leading column names.
    pub fn summary(&self, leading_columns: usize) -> String {
        if !self.success {
            return format!(
                "failed: {}",
                self.error.as_deref().unwrap_or("unknown error")
            );
        }
        let noun = if self.row_count == 1 { "row" } else { "rows" };
        if self.columns.is_empty() {
            return format!("{} {}", self.row_count, noun);
        }
        let shown: Vec<&str> = self
            .columns
            .iter()
            .take(leading_columns)
            .map(String::as_str)
            .collect();
        let more = if self.columns.len() > leading_columns {
            ", ..."
        } else {
            ""
        };
        format!("{} {} ({}{})", self.row_count, noun, shown.join(", "), more)
    }
}

/// Limits applied to every statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub row_cap: usize,
    pub statement_timeout: Duration,
    /// Postgres schema to resolve unqualified table names against
    pub search_path: Option<String>,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            row_cap: 1000,
            statement_timeout: Duration::from_secs(5),
            search_path: None,
        }
    }
}

/// Read-only SQL engine
///
/// Engine-level SQL errors (syntax, unknown objects) come back as
/// `Ok(ExecutionResult { success: false, .. })`; `Err` is reserved for
/// infrastructure failures such as a lost connection.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, sql: &ApprovedSql, limits: &ExecutionLimits)
        -> Result<ExecutionResult>;
}

#[cfg(feature = "database")]
pub use pg::PgExecutor;

#[cfg(feature = "database")]
mod pg {
    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use futures::TryStreamExt;
    use serde_json::Value;
    use sqlx::postgres::{PgPool, PgRow};
    use sqlx::{Column, Row, TypeInfo};
    use tracing::debug;

    use super::{ExecutionLimits, ExecutionResult, SqlExecutor};
    use crate::validator::ApprovedSql;

    /// Postgres executor backed by a connection pool
    #[derive(Clone)]
    pub struct PgExecutor {
        pool: PgPool,
    }

    impl PgExecutor {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }

        pub async fn connect(database_url: &str) -> Result<Self> {
            let pool = PgPool::connect(database_url)
                .await
                .context("Failed to connect to Postgres")?;
            Ok(Self::new(pool))
        }

        pub fn pool(&self) -> &PgPool {
            &self.pool
        }
    }

    #[async_trait]
    impl SqlExecutor for PgExecutor {
        async fn execute(
            &self,
            sql: &ApprovedSql,
            limits: &ExecutionLimits,
        ) -> Result<ExecutionResult> {
            let mut tx = self.pool.begin().await.context("Failed to open transaction")?;

            sqlx::query("SET TRANSACTION READ ONLY")
                .execute(&mut *tx)
                .await?;
            sqlx::query(&format!(
                "SET LOCAL statement_timeout = {}",
                limits.statement_timeout.as_millis()
            ))
            .execute(&mut *tx)
            .await?;
            if let Some(schema) = &limits.search_path {
                // Identifier was validated when the dataset config loaded
                sqlx::query(&format!("SET LOCAL search_path TO \"{}\", public", schema))
                    .execute(&mut *tx)
                    .await?;
            }

            let mut columns: Vec<String> = Vec::new();
            let mut rows: Vec<Vec<Value>> = Vec::new();
            let mut truncated = false;
            let mut failure: Option<String> = None;
            {
                let mut stream = sqlx::query(sql.as_str()).fetch(&mut *tx);
                loop {
                    match stream.try_next().await {
                        Ok(Some(row)) => {
                            if rows.len() >= limits.row_cap {
                                truncated = true;
                                break;
                            }
                            if columns.is_empty() {
                                columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                            }
                            rows.push(decode_row(&row));
                        }
                        Ok(None) => break,
                        Err(sqlx::Error::Database(db)) => {
                            failure = Some(db.message().to_string());
                            break;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            tx.rollback().await?;

            if let Some(error) = failure {
                debug!(%error, "statement rejected by Postgres");
                return Ok(ExecutionResult::failed(error));
            }
            let mut result = ExecutionResult::rows(columns, rows);
            result.truncated = truncated;
            Ok(result)
        }
    }

    fn decode_row(row: &PgRow) -> Vec<Value> {
        row.columns()
            .iter()
            .map(|col| decode_cell(row, col.ordinal(), col.type_info().name()))
            .collect()
    }

    fn decode_cell(row: &PgRow, idx: usize, type_name: &str) -> Value {
        fn opt<T: Into<Value>>(v: Result<Option<T>, sqlx::Error>) -> Value {
            v.ok().flatten().map(Into::into).unwrap_or(Value::Null)
        }

        match type_name {
            "BOOL" => opt(row.try_get::<Option<bool>, _>(idx)),
            "INT2" => opt(row.try_get::<Option<i16>, _>(idx)),
            "INT4" => opt(row.try_get::<Option<i32>, _>(idx)),
            "INT8" => opt(row.try_get::<Option<i64>, _>(idx)),
            "FLOAT4" => opt(row.try_get::<Option<f32>, _>(idx)),
            "FLOAT8" => opt(row.try_get::<Option<f64>, _>(idx)),
            "NUMERIC" => row
                .try_get::<Option<bigdecimal::BigDecimal>, _>(idx)
                .ok()
                .flatten()
                .map(|d| {
                    let text = d.normalized().to_string();
                    text.parse::<f64>()
                        .ok()
                        .and_then(serde_json::Number::from_f64)
                        .map(Value::Number)
                        .unwrap_or(Value::String(text))
                })
                .unwrap_or(Value::Null),
            "DATE" => row
                .try_get::<Option<chrono::NaiveDate>, _>(idx)
                .ok()
                .flatten()
                .map(|d| Value::String(d.to_string()))
                .unwrap_or(Value::Null),
            "TIMESTAMP" => row
                .try_get::<Option<chrono::NaiveDateTime>, _>(idx)
                .ok()
                .flatten()
                .map(|d| Value::String(d.to_string()))
                .unwrap_or(Value::Null),
            "TIMESTAMPTZ" => row
                .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx)
                .ok()
                .flatten()
                .map(|d| Value::String(d.to_rfc3339()))
                .unwrap_or(Value::Null),
            "UUID" => row
                .try_get::<Option<uuid::Uuid>, _>(idx)
                .ok()
                .flatten()
                .map(|u| Value::String(u.to_string()))
                .unwrap_or(Value::Null),
            "JSON" | "JSONB" => row
                .try_get::<Option<Value>, _>(idx)
                .ok()
                .flatten()
                .unwrap_or(Value::Null),
            _ => opt(row.try_get::<Option<String>, _>(idx)),
        }
    }
}
