//! Explanation stage
//!
//! Summarises a result set for a business user in a few sentences. The
//! prompt sees the question, the SQL and a small prefix of rows.

use text2sql_agentic::{CompletionError, CompletionService};
use tracing::{info, warn};

use crate::executor::ExecutionResult;

const SYSTEM_PROMPT: &str = r#"# Result Explanation

You are a data insights analyst. Explain query results to a business user in
2-4 sentences of plain prose. Lead with the direct answer to the question,
then mention the most notable values or patterns. Do not describe the SQL,
do not use markdown, and do not invent numbers that are not in the sample."#;

const MAX_TOKENS: u32 = 300;

pub struct Explainer {
    completion: CompletionService,
    sample_rows: usize,
}

impl Explainer {
    pub fn new(completion: CompletionService, sample_rows: usize) -> Self {
        Self {
            completion,
            sample_rows: sample_rows.max(1),
        }
    }

    pub async fn explain(
        &self,
        question: &str,
        sql: &str,
        execution: &ExecutionResult,
    ) -> Result<String, CompletionError> {
        let prompt = build_prompt(question, sql, execution, self.sample_rows);
        match self.completion.complete(SYSTEM_PROMPT, &prompt, MAX_TOKENS).await {
            Ok(text) => {
                let text = text.trim().to_string();
                info!(chars = text.len(), "explanation generated");
                Ok(text)
            }
            Err(e) => {
                warn!(error = %e, "explanation failed");
                Err(e)
            }
        }
    }
}

fn build_prompt(question: &str, sql: &str, execution: &ExecutionResult, sample_rows: usize) -> String {
    let mut prompt = format!("## Question\n{}\n\n## SQL\n{}\n\n", question, sql);

    let shown = execution.rows.len().min(sample_rows);
    prompt.push_str(&format!(
        "## Results ({} row(s){}, showing {})\n",
        execution.row_count,
        if execution.truncated { ", truncated" } else { "" },
        shown
    ));
    prompt.push_str(&execution.columns.join(" | "));
    prompt.push('\n');
    for row in execution.rows.iter().take(sample_rows) {
        let cells: Vec<String> = row.iter().map(render_cell).collect();
        prompt.push_str(&cells.join(" | "));
        prompt.push('\n');
    }
    prompt
}

fn render_cell(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "NULL".to_string(),
        other => other.to_string(),
    }
}
