//! Text-to-SQL developer CLI
//!
//! Usage:
//!   # One question
//!   cargo run --features database,cli --bin text2sql_cli -- \
//!     ask --tenant 42 --dataset sales "revenue by region for 2024"
//!
//!   # Interactive session (one question per line on stdin)
//!   cargo run --features database,cli --bin text2sql_cli -- \
//!     ask --tenant 42 --session demo
//!
//!   # Run the security validator offline
//!   cargo run --features database,cli --bin text2sql_cli -- \
//!     validate --tenant 42 "SELECT * FROM sales WHERE client_id = 42"

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use text2sql::schema::SchemaProvider;
use text2sql::validator::CheckStatus;
use text2sql::{
    validate, AppConfig, ConfigLoader, IsolationConfig, Orchestrator, OrchestratorBuilder,
    PgExecutor, PgSchemaProvider, StaticSchemaProvider, TenantId, TurnRequest, TurnResponse,
};

/// Tenant-safe conversational text-to-SQL
#[derive(Parser, Debug)]
#[command(name = "text2sql_cli")]
#[command(about = "Ask analytics questions or check SQL against tenant isolation rules")]
struct Args {
    /// Configuration file (default: $TEXT2SQL_CONFIG or config/text2sql.yaml)
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a turn, or read questions from stdin when none is given
    Ask {
        /// Question to ask
        query: Option<String>,

        /// Tenant id the SQL must be restricted to
        #[arg(long, short = 't', env = "TEXT2SQL_TENANT")]
        tenant: String,

        /// Dataset id (default: configured default dataset)
        #[arg(long, short = 'd')]
        dataset: Option<String>,

        /// Session id for follow-up questions
        #[arg(long, short = 's', default_value = "cli")]
        session: String,

        /// Override the iteration budget
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Serve schema from the configuration instead of information_schema
        #[arg(long)]
        static_schema: bool,

        /// Print the full response as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate SQL against a dataset's isolation rules without running it
    Validate {
        /// SQL to check
        sql: String,

        #[arg(long, short = 't')]
        tenant: String,

        /// Dataset whose isolation config applies (default: configured default)
        #[arg(long, short = 'd')]
        dataset: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let loader = match args.config {
        Some(path) => ConfigLoader::new(path),
        None => ConfigLoader::from_env(),
    };
    let config = loader.load()?;

    match args.command {
        Command::Ask {
            query,
            tenant,
            dataset,
            session,
            max_iterations,
            static_schema,
            json,
        } => {
            let tenant = TenantId::new(tenant).map_err(|e| anyhow!(e))?;
            let orchestrator = build_orchestrator(config, static_schema).await?;
            let request = |query: String| {
                let mut request = TurnRequest::new(query, session.clone(), tenant.clone());
                request.dataset_id = dataset.clone();
                request.max_iterations = max_iterations;
                request
            };

            match query {
                Some(query) => {
                    let response = orchestrator.run_turn(request(query)).await;
                    print_response(&response, json)?;
                }
                None => {
                    let stdin = io::stdin();
                    prompt()?;
                    for line in stdin.lock().lines() {
                        let line = line?;
                        let line = line.trim();
                        if line.is_empty() {
                            prompt()?;
                            continue;
                        }
                        if matches!(line, "exit" | "quit") {
                            break;
                        }
                        let response = orchestrator.run_turn(request(line.to_string())).await;
                        print_response(&response, json)?;
                        prompt()?;
                    }
                }
            }
        }
        Command::Validate {
            sql,
            tenant,
            dataset,
        } => {
            let tenant = TenantId::new(tenant).map_err(|e| anyhow!(e))?;
            let isolation = isolation_for(&config, dataset.as_deref())?;
            let result = validate(&sql, &tenant, Some(&isolation));

            for check in &result.checks {
                let mark = match check.status {
                    CheckStatus::Pass => "PASS",
                    CheckStatus::Fail => "FAIL",
                };
                println!("[{}] {}: {}", mark, check.name, check.message);
            }
            for warning in &result.warnings {
                println!("[WARN] {}", warning.message);
            }
            let summary = result.summary();
            println!(
                "{}/{} checks passed ({}us)",
                summary.passed_checks,
                summary.total_checks,
                result.elapsed.as_micros()
            );
            if !result.passed {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

async fn build_orchestrator(config: AppConfig, static_schema: bool) -> Result<Orchestrator> {
    let database_url = config
        .execution
        .database_url
        .clone()
        .ok_or_else(|| anyhow!("DATABASE_URL is not set"))?;
    let executor = PgExecutor::connect(&database_url).await?;
    let schema: Arc<dyn SchemaProvider> = if static_schema {
        Arc::new(StaticSchemaProvider::new())
    } else {
        Arc::new(PgSchemaProvider::new(executor.pool().clone()))
    };

    OrchestratorBuilder::new(config)
        .with_executor(Arc::new(executor))
        .with_schema_provider(schema)
        .build()
}

fn isolation_for(config: &AppConfig, dataset: Option<&str>) -> Result<IsolationConfig> {
    let dataset = match dataset {
        Some(id) => config
            .dataset(id)
            .with_context(|| format!("unknown dataset '{}'", id))?,
        None => config
            .default_dataset()
            .context("no datasets configured")?,
    };
    Ok(dataset.isolation.clone().unwrap_or_default())
}

fn prompt() -> Result<()> {
    print!("> ");
    io::stdout().flush()?;
    Ok(())
}

fn print_response(response: &TurnResponse, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(response)?);
        return Ok(());
    }

    if response.is_followup {
        if let Some(resolved) = &response.resolved_query {
            println!("(interpreted as: {})", resolved);
        }
    }
    if response.needs_clarification {
        println!("Could you clarify?");
        for question in &response.questions {
            println!("  - {}", question);
        }
        return Ok(());
    }
    if let Some(sql) = &response.sql {
        println!("SQL: {}", sql);
    }
    if let Some(results) = &response.results {
        println!("{}", results.columns.join(" | "));
        for row in results.rows.iter().take(20) {
            let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            println!("{}", cells.join(" | "));
        }
        if results.row_count > 20 {
            println!("... {} rows total", results.row_count);
        }
    }
    if let Some(explanation) = &response.explanation {
        println!("\n{}", explanation);
    }
    for notice in &response.notices {
        println!("note: {}", notice.message);
    }
    if let Some(error) = &response.error {
        println!("error ({:?}): {}", error.kind(), error);
    }
    println!(
        "[{} iteration(s), {} tool call(s), {}ms]",
        response.iterations,
        response.tool_calls.len(),
        response.elapsed.as_millis()
    );
    Ok(())
}
