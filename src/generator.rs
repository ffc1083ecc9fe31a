//! SQL Generator
//!
//! Builds the generation prompt (schema, tenant rule, question) and returns
//! the model's SQL with code fences stripped. A retry carries the previous
//! SQL and its engine error so the model can correct it.

use text2sql_agentic::{strip_code_blocks, CompletionError, CompletionService};
use thiserror::Error;

use crate::isolation::{IsolationConfig, IsolationMethod, TenantId};

const SYSTEM_PROMPT: &str = r#"# SQL Generation

You write PostgreSQL SELECT statements for a multi-tenant analytics database.

## Rules

1. Output ONLY the SQL statement, no explanations and no markdown
2. Use only tables and columns listed in the schema
3. Read-only: SELECT (optionally WITH) only, a single statement
4. The tenant filter described below is mandatory and must use the exact value given
5. Never reference any other tenant, never use IN lists or ranges on the tenant column
6. Use explicit column names and readable aliases
7. Add ORDER BY for rankings and LIMIT when the question asks for a top N"#;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error(transparent)]
    Completion(#[from] CompletionError),

    #[error("model returned no SQL")]
    NoSql,
}

/// A previous attempt that failed at execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorAttempt {
    pub sql: Option<String>,
    pub error: String,
}

/// Everything the generator needs for one attempt
#[derive(Debug, Clone)]
pub struct GenerationRequest<'a> {
    pub question: &'a str,
    pub schema: &'a str,
    pub dataset_description: &'a str,
    pub tenant: &'a TenantId,
    pub isolation: &'a IsolationConfig,
    pub prior: Option<&'a PriorAttempt>,
}

pub struct SqlGenerator {
    completion: CompletionService,
    max_tokens: u32,
}

impl SqlGenerator {
    pub fn new(completion: CompletionService, max_tokens: u32) -> Self {
        Self {
            completion,
            max_tokens,
        }
    }

    pub async fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, GenerationError> {
        let prompt = build_prompt(request);
        let response = self
            .completion
            .complete(SYSTEM_PROMPT, &prompt, self.max_tokens)
            .await?;
        let sql = strip_code_blocks(&response);
        let sql = sql.trim().trim_end_matches(';').trim().to_string();
        if sql.is_empty() {
            return Err(GenerationError::NoSql);
        }
        Ok(sql)
    }
}

fn tenant_rule(tenant: &TenantId, isolation: &IsolationConfig) -> String {
    match (&isolation.method, &isolation.filter_table) {
        (IsolationMethod::Hierarchical, Some(table)) => format!(
            "Join {table} and filter `{table}.{field} = {id}` so that only rows belonging to tenant {id} are returned.",
            table = table,
            field = isolation.filter_field,
            id = tenant
        ),
        _ => format!(
            "Every SELECT must include `WHERE {field} = {id}` (combined with other conditions using AND only).",
            field = isolation.filter_field,
            id = tenant
        ),
    }
}

fn build_prompt(request: &GenerationRequest<'_>) -> String {
    let mut prompt = String::new();
    if !request.dataset_description.is_empty() {
        prompt.push_str(&format!("## Dataset\n{}\n\n", request.dataset_description));
    }
    prompt.push_str(&format!("## Schema\n{}\n\n", request.schema));
    prompt.push_str(&format!(
        "## Tenant filter\n{}\n\n",
        tenant_rule(request.tenant, request.isolation)
    ));
    prompt.push_str(&format!("## Question\n{}\n", request.question));

    if let Some(prior) = request.prior {
        prompt.push_str("\n## Previous attempt failed\n");
        if let Some(sql) = &prior.sql {
            prompt.push_str(&format!("```\n{}\n```\n", sql));
        }
        prompt.push_str(&format!(
            "Error: {}\n\nReturn ONLY the corrected SQL.\n",
            prior.error
        ));
    }
    prompt
}
