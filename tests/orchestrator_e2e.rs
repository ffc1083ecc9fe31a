//! End-to-end turn tests against scripted collaborators
//!
//! No network and no database: the LLM and the SQL engine are in-memory
//! scripts from `helpers`.

mod helpers;

use helpers::{request, revenue_rows, text, Harness, Reply, Stage};
use serde_json::json;
use text2sql::tools::ToolName;
use text2sql::{ErrorKind, ExecutionResult, TenantId, TurnError, TurnRequest};

const GOOD_SQL: &str =
    "SELECT region, SUM(amount) AS revenue FROM sales WHERE client_id = 42 GROUP BY region";

#[tokio::test]
async fn test_happy_path_single_iteration() {
    let h = Harness::new();
    h.llm.sql(GOOD_SQL);
    h.executor.push(revenue_rows());

    let response = h.orchestrator.run_turn(request("revenue by region")).await;

    assert!(response.success, "{:?}", response.error);
    assert_eq!(response.iterations, 1);
    assert_eq!(response.sql.as_deref(), Some(GOOD_SQL));
    assert_eq!(response.results.as_ref().unwrap().row_count, 2);
    assert_eq!(
        response.explanation.as_deref(),
        Some("Revenue is concentrated in EMEA.")
    );
    assert!(response.validation.as_ref().unwrap().passed);
    assert_eq!(response.validation_summary.unwrap().failed_checks, 0);
    assert!(response.reflection.as_ref().unwrap().is_acceptable);
    assert!(!response.is_followup);
    assert!(response.error.is_none());

    let tools: Vec<ToolName> = response.tool_calls.iter().map(|t| t.tool).collect();
    assert_eq!(
        tools,
        vec![ToolName::GetSchema, ToolName::ExecuteSql, ToolName::ValidateResults]
    );

    // Empty history: no resolver call
    assert_eq!(h.llm.calls(Stage::Resolution), 0);
    assert_eq!(h.executor.executed(), vec![GOOD_SQL.to_string()]);

    let history = h.orchestrator.sessions().history("session-1").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].original_query, "revenue by region");
    assert_eq!(history[0].result_summary, "2 rows (region, revenue)");
}

#[tokio::test]
async fn test_critical_error_retries_with_feedback() {
    let h = Harness::new();
    h.llm
        .sql("SELECT region, SUM(revenu) FROM sales WHERE client_id = 42 GROUP BY region")
        .sql(GOOD_SQL);
    h.executor
        .push(ExecutionResult::failed("column \"revenu\" does not exist"))
        .push(revenue_rows());

    let response = h.orchestrator.run_turn(request("revenue by region")).await;

    assert!(response.success, "{:?}", response.error);
    assert_eq!(response.iterations, 2);
    assert_eq!(response.sql.as_deref(), Some(GOOD_SQL));
    assert_eq!(h.executor.executed().len(), 2);

    let prompts = h.llm.prompts(Stage::Generation);
    assert_eq!(prompts.len(), 2);
    assert!(!prompts[0].contains("Previous attempt"));
    assert!(prompts[1].contains("## Previous attempt failed"));
    assert!(prompts[1].contains("SUM(revenu)"));
    assert!(prompts[1].contains("does not exist"));
}

#[tokio::test]
async fn test_budget_exhausted_is_iteration_exceeded() {
    let h = Harness::new();
    h.llm
        .sql("SELECT regoin FROM sales WHERE client_id = 42")
        .sql("SELECT regoin2 FROM sales WHERE client_id = 42");
    h.executor
        .push(ExecutionResult::failed("syntax error at or near \"regoin\""))
        .push(ExecutionResult::failed("syntax error at or near \"regoin2\""));

    let response = h
        .orchestrator
        .run_turn(request("regions").with_max_iterations(2))
        .await;

    assert!(!response.success);
    assert_eq!(response.iterations, 2);
    assert_eq!(response.error_kind(), Some(ErrorKind::IterationExceeded));
    match response.error.unwrap() {
        TurnError::IterationExceeded {
            iterations,
            max_iterations,
            last_error,
        } => {
            assert_eq!((iterations, max_iterations), (2, 2));
            assert!(last_error.unwrap().contains("regoin2"));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(response.explanation.is_none());
    assert_eq!(h.llm.calls(Stage::Explanation), 0);
}

#[tokio::test]
async fn test_security_rejection_never_executes() {
    for sql in [
        "SELECT region FROM sales",
        "SELECT region FROM sales WHERE client_id IN (42, 43)",
        "SELECT region FROM sales WHERE client_id = 42 OR client_id = 43",
        "DELETE FROM sales WHERE client_id = 42",
    ] {
        let h = Harness::new();
        h.llm.sql(sql).sql(GOOD_SQL);

        let response = h.orchestrator.run_turn(request("revenue by region")).await;

        assert!(!response.success, "{}", sql);
        assert_eq!(
            response.error_kind(),
            Some(ErrorKind::SecurityValidationFailure),
            "{}",
            sql
        );
        match response.error.as_ref().unwrap() {
            TurnError::SecurityValidation {
                failed_checks,
                rejected_sql,
            } => {
                assert_eq!(rejected_sql, sql);
                assert!(!failed_checks.is_empty());
            }
            other => panic!("unexpected error {:?}", other),
        }
        // Rejection is final: no retry, no execution, no patched SQL
        assert_eq!(response.iterations, 1, "{}", sql);
        assert_eq!(h.llm.calls(Stage::Generation), 1);
        assert!(h.executor.executed().is_empty());
        assert!(response.sql.is_none());
        assert!(!response.validation.as_ref().unwrap().passed);
        assert!(h
            .orchestrator
            .sessions()
            .history("session-1")
            .await
            .unwrap()
            .is_empty());
    }
}

#[tokio::test]
async fn test_clarification_short_circuits() {
    let h = Harness::new();
    h.llm.push(
        Stage::Clarification,
        text(
            json!({
                "needs_clarification": true,
                "reason": "missing_metric",
                "questions": ["Which metric should be used to rank products?"]
            })
            .to_string(),
        ),
    );

    let response = h.orchestrator.run_turn(request("top products")).await;

    assert!(response.needs_clarification);
    assert!(!response.success);
    assert!(response.error.is_none());
    assert_eq!(
        response.questions,
        vec!["Which metric should be used to rank products?".to_string()]
    );
    assert_eq!(response.iterations, 0);
    assert_eq!(h.llm.calls(Stage::Generation), 0);
    assert!(h
        .orchestrator
        .sessions()
        .history("session-1")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_clarified_query_skips_detection() {
    let h = Harness::new();
    h.llm.sql(GOOD_SQL);
    h.executor.push(revenue_rows());

    let response = h
        .orchestrator
        .run_turn(request(
            "top products. Additional context: rank by revenue for 2024",
        ))
        .await;
    assert!(response.success);
    assert_eq!(h.llm.calls(Stage::Clarification), 0);

    h.llm.sql(GOOD_SQL);
    let response = h
        .orchestrator
        .run_turn(request("top products").skip_clarification())
        .await;
    assert!(response.success);
    assert_eq!(h.llm.calls(Stage::Clarification), 0);
}

#[tokio::test]
async fn test_clarification_failure_fails_open() {
    let h = Harness::new();
    h.llm
        .push(Stage::Clarification, Reply::Fail("overloaded".to_string()))
        .sql(GOOD_SQL);
    h.executor.push(revenue_rows());

    let response = h.orchestrator.run_turn(request("revenue by region")).await;

    assert!(response.success);
    assert!(response
        .notices
        .iter()
        .any(|n| n.kind == ErrorKind::ClarificationError));
}

#[tokio::test]
async fn test_followup_uses_only_prior_utterances() {
    let h = Harness::new();
    h.llm.sql(GOOD_SQL);
    h.executor.push(revenue_rows());
    let first = h
        .orchestrator
        .run_turn(request("revenue by region in 2024"))
        .await;
    assert!(first.success);

    h.llm.push(
        Stage::Resolution,
        text(
            json!({
                "is_followup": true,
                "standalone_query": "revenue by region in Q4 2024",
                "reason": "inherits metric and grouping",
                "confidence": 0.92
            })
            .to_string(),
        ),
    );
    h.llm.sql(GOOD_SQL);
    h.executor.push(revenue_rows());

    let second = h.orchestrator.run_turn(request("what about Q4?")).await;

    assert!(second.success, "{:?}", second.error);
    assert!(second.is_followup);
    assert_eq!(
        second.resolved_query.as_deref(),
        Some("revenue by region in Q4 2024")
    );
    assert_eq!(
        second.resolution_reason.as_deref(),
        Some("inherits metric and grouping")
    );

    let resolver_prompts = h.llm.prompts(Stage::Resolution);
    assert_eq!(resolver_prompts.len(), 1);
    assert!(resolver_prompts[0].contains("revenue by region in 2024"));
    assert!(resolver_prompts[0].contains("what about Q4?"));
    assert!(!resolver_prompts[0].contains("SELECT"));

    let generation = h.llm.prompts(Stage::Generation);
    assert!(generation[1].contains("revenue by region in Q4 2024"));

    // The explanation answers the question as the user asked it
    let explanation = h.llm.prompts(Stage::Explanation);
    assert_eq!(explanation.len(), 2);
    assert!(explanation[1].contains("## Question\nwhat about Q4?"));
    assert!(!explanation[1].contains("revenue by region in Q4 2024"));

    let history = h.orchestrator.sessions().history("session-1").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].original_query, "what about Q4?");
    assert_eq!(history[1].resolved_query, "revenue by region in Q4 2024");
}

#[tokio::test]
async fn test_resolver_failure_fails_open() {
    let h = Harness::new();
    h.llm.sql(GOOD_SQL).sql(GOOD_SQL);
    h.executor.push(revenue_rows()).push(revenue_rows());
    h.orchestrator.run_turn(request("revenue by region")).await;

    h.llm
        .push(Stage::Resolution, Reply::Fail("503 from provider".to_string()));
    let response = h.orchestrator.run_turn(request("and by product?")).await;

    assert!(response.success);
    assert!(!response.is_followup);
    assert_eq!(response.resolved_query.as_deref(), Some("and by product?"));
    assert!(response
        .notices
        .iter()
        .any(|n| n.kind == ErrorKind::ResolutionError));
}

#[tokio::test]
async fn test_explanation_failure_is_not_fatal() {
    let h = Harness::new();
    h.llm
        .sql(GOOD_SQL)
        .push(Stage::Explanation, Reply::Fail("rate limited".to_string()));
    h.executor.push(revenue_rows());

    let response = h.orchestrator.run_turn(request("revenue by region")).await;

    assert!(response.success);
    assert!(response.explanation.is_none());
    assert!(response.results.is_some());
    assert!(response
        .notices
        .iter()
        .any(|n| n.kind == ErrorKind::ExplanationError));
}

#[tokio::test]
async fn test_empty_results_succeed_without_explanation() {
    let h = Harness::new();
    h.llm.sql(GOOD_SQL);
    h.executor
        .push(ExecutionResult::rows(vec!["region".into(), "revenue".into()], vec![]));

    let response = h.orchestrator.run_turn(request("revenue in 1850")).await;

    assert!(response.success);
    assert_eq!(response.iterations, 1);
    assert!(response.explanation.is_none());
    assert_eq!(h.llm.calls(Stage::Explanation), 0);
    assert!(response.reflection.unwrap().is_acceptable);
}

#[tokio::test]
async fn test_statement_timeout_is_non_retryable_execution_error() {
    let h = Harness::new();
    h.llm.sql(GOOD_SQL);
    h.executor.push(ExecutionResult::failed(
        "canceling statement due to statement timeout",
    ));

    let response = h.orchestrator.run_turn(request("revenue by region")).await;

    assert!(!response.success);
    assert_eq!(response.iterations, 1);
    assert_eq!(response.error_kind(), Some(ErrorKind::ExecutionError));
    assert_eq!(h.llm.calls(Stage::Generation), 1);
    assert!(response.explanation.is_none());

    // Approved SQL was produced, so the turn is remembered
    let history = h.orchestrator.sessions().history("session-1").await.unwrap();
    assert!(history[0].result_summary.starts_with("failed:"));
}

#[tokio::test(start_paused = true)]
async fn test_generation_timeout_exhausts_budget() {
    let h = Harness::new();
    h.llm.push(Stage::Generation, Reply::Hang);

    let response = h
        .orchestrator
        .run_turn(request("revenue by region").with_max_iterations(1))
        .await;

    assert_eq!(response.error_kind(), Some(ErrorKind::IterationExceeded));
    assert_eq!(response.iterations, 1);
    match response.error.unwrap() {
        TurnError::IterationExceeded { last_error, .. } => {
            assert!(last_error.unwrap().contains("timed out"));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(h.executor.executed().is_empty());
}

#[tokio::test]
async fn test_repeated_generation_failures_exceed_budget() {
    let h = Harness::new();
    for _ in 0..3 {
        h.llm
            .push(Stage::Generation, Reply::Fail("overloaded".to_string()));
    }

    let response = h
        .orchestrator
        .run_turn(request("revenue by region").with_max_iterations(3))
        .await;

    assert!(!response.success);
    assert_eq!(response.iterations, 3);
    assert_eq!(response.error_kind(), Some(ErrorKind::IterationExceeded));
    match response.error.clone().unwrap() {
        TurnError::IterationExceeded {
            iterations,
            max_iterations,
            last_error,
        } => {
            assert_eq!((iterations, max_iterations), (3, 3));
            assert!(last_error.unwrap().contains("overloaded"));
        }
        other => panic!("unexpected error {:?}", other),
    }
    let failures = response
        .notices
        .iter()
        .filter(|n| n.kind == ErrorKind::GenerationError)
        .count();
    assert_eq!(failures, 3);
    assert_eq!(h.llm.calls(Stage::Generation), 3);
    assert!(h.executor.executed().is_empty());
}

#[tokio::test]
async fn test_generation_failure_is_retried_within_budget() {
    let h = Harness::new();
    h.llm
        .push(Stage::Generation, Reply::Fail("overloaded".to_string()))
        .sql(GOOD_SQL);
    h.executor.push(revenue_rows());

    let response = h.orchestrator.run_turn(request("revenue by region")).await;

    assert!(response.success, "{:?}", response.error);
    assert_eq!(response.iterations, 2);
}

#[tokio::test]
async fn test_hierarchical_dataset() {
    let h = Harness::new();
    h.llm.sql(
        "SELECT SUM(f.value) FROM fact_market f JOIN dim_corporation c ON f.corp_id = c.corp_id WHERE c.corp_id = 42",
    );
    h.executor.push(ExecutionResult::rows(
        vec!["sum".into()],
        vec![vec![json!(99.5)]],
    ));

    let response = h
        .orchestrator
        .run_turn(request("total market value").with_dataset("market"))
        .await;

    assert!(response.success, "{:?}", response.error);
    let prompts = h.llm.prompts(Stage::Generation);
    assert!(prompts[0].contains("dim_corporation.corp_id = 42"));
}

#[tokio::test]
async fn test_invalid_requests() {
    let h = Harness::new();

    let response = h.orchestrator.run_turn(request("   ")).await;
    assert_eq!(response.error_kind(), Some(ErrorKind::InvalidRequest));

    let response = h
        .orchestrator
        .run_turn(request("revenue").with_dataset("nope"))
        .await;
    assert_eq!(response.error_kind(), Some(ErrorKind::InvalidRequest));

    let response = h
        .orchestrator
        .run_turn(request("revenue").with_max_iterations(0))
        .await;
    assert_eq!(response.error_kind(), Some(ErrorKind::InvalidRequest));
    assert_eq!(h.llm.calls(Stage::Generation), 0);
}

#[tokio::test]
async fn test_concurrent_turns_on_one_session_are_serialized() {
    let h = Harness::new();
    h.llm.sql(GOOD_SQL).sql(GOOD_SQL);
    h.executor.push(revenue_rows()).push(revenue_rows());

    let a = TurnRequest::new("revenue by region", "shared", TenantId::from(42));
    let b = TurnRequest::new("orders by region", "shared", TenantId::from(42));
    let (ra, rb) = tokio::join!(h.orchestrator.run_turn(a), h.orchestrator.run_turn(b));

    assert!(ra.success && rb.success);
    let history = h.orchestrator.sessions().history("shared").await.unwrap();
    assert_eq!(history.len(), 2);
    // The second turn saw the first one's record
    assert_eq!(h.llm.calls(Stage::Resolution), 1);
}

#[tokio::test]
async fn test_history_is_bounded() {
    let mut config = helpers::config();
    config.session.capacity = 2;
    let h = Harness::with_config(config);
    for i in 0..4 {
        h.llm.sql(GOOD_SQL);
        h.executor.push(revenue_rows());
        let response = h
            .orchestrator
            .run_turn(request(&format!("question {}", i)))
            .await;
        assert!(response.success);
    }
    let history = h.orchestrator.sessions().history("session-1").await.unwrap();
    let originals: Vec<&str> = history.iter().map(|r| r.original_query.as_str()).collect();
    assert_eq!(originals, vec!["question 2", "question 3"]);
}
