use async_trait::async_trait;
use nl2sql_copilot::cache::ResponseCache;
use nl2sql_copilot::context::{ContextBudget, ContextEngineer};
use nl2sql_copilot::db::QueryRows;
use nl2sql_copilot::error::{Nl2SqlError, Result};
use nl2sql_copilot::llm::{
    ClarifyAnswers, FixedProvider, LlmProvider, PlanResponse, RepairResponse, SqlResponse,
};
use nl2sql_copilot::observability::InMemoryMetrics;
use nl2sql_copilot::stages::{ExecuteStage, Generator, Plan, PlanStage, Planner, Repair};
use nl2sql_copilot::types::{Outcome, StageName, StageResult, StageTrace};
use nl2sql_copilot::{ErrorCode, Pipeline, PipelineBuilder, PipelineRequest, Verifier};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const LLM_TIMEOUT: Duration = Duration::from_secs(5);

/// Executor answering from a queue of row sets; an empty queue yields no rows
#[derive(Default)]
struct ScriptedExecutor {
    responses: Mutex<VecDeque<QueryRows>>,
    seen: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    fn returning(responses: Vec<QueryRows>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecuteStage for ScriptedExecutor {
    async fn run(&self, sql: &str) -> StageResult<QueryRows> {
        self.seen.lock().unwrap().push(sql.to_string());
        let rows = self.responses.lock().unwrap().pop_front().unwrap_or_default();
        StageResult::success(rows, StageTrace::new(StageName::Executor, Duration::from_millis(1)))
    }
}

fn user_rows() -> QueryRows {
    QueryRows {
        columns: vec!["id".into(), "name".into()],
        rows: vec![vec![json!(1), json!("ada")], vec![json!(2), json!("grace")]],
    }
}

fn builder(llm: Arc<FixedProvider>) -> PipelineBuilder {
    PipelineBuilder::new()
        .planner(Arc::new(Planner::new(llm.clone(), LLM_TIMEOUT)))
        .generator(Arc::new(Generator::new(llm.clone(), LLM_TIMEOUT)))
        .verifier(Arc::new(Verifier::new()))
        .repair(Arc::new(Repair::new(llm, LLM_TIMEOUT)))
}

fn stages(result: &nl2sql_copilot::FinalResult) -> Vec<StageName> {
    result.traces.iter().map(|t| t.stage).collect()
}

const BAD_AGGREGATE: &str = "SELECT COUNT(*), country FROM customers;";
const GROUPED: &str = "SELECT country, COUNT(*) FROM customers GROUP BY country;";

#[tokio::test]
async fn test_show_all_users_is_verified() {
    let llm = Arc::new(FixedProvider::new().with_sql(
        "show all users",
        "SELECT * FROM users;",
        "All rows of users",
    ));
    let executor = Arc::new(ScriptedExecutor::returning(vec![user_rows()]));
    let pipeline = builder(llm).executor(executor.clone()).build().unwrap();

    let result = pipeline
        .run(&PipelineRequest::new("show all users", "users(id, name)"))
        .await;

    assert!(result.ok);
    assert!(!result.error);
    assert_eq!(result.verified, Some(true));
    assert_eq!(result.sql.as_deref(), Some("SELECT * FROM users"));
    assert_eq!(result.rationale.as_deref(), Some("All rows of users"));
    assert_eq!(result.outcome(), Outcome::Success);
    assert_eq!(
        stages(&result),
        vec![
            StageName::Planner,
            StageName::Generator,
            StageName::Safety,
            StageName::Executor,
            StageName::Verifier
        ]
    );
    assert_eq!(executor.seen(), vec!["SELECT * FROM users".to_string()]);
}

#[tokio::test]
async fn test_ambiguous_query_stops_before_any_stage() {
    let llm = Arc::new(FixedProvider::new().with_default_sql("SELECT * FROM customers", ""));
    let executor = Arc::new(ScriptedExecutor::default());
    let pipeline = builder(llm).executor(executor.clone()).build().unwrap();

    let result = pipeline
        .run(&PipelineRequest::new("show the top customers", "customers(id, name)"))
        .await;

    assert!(result.ambiguous);
    assert!(!result.error);
    assert!(!result.questions.is_empty());
    assert!(result.traces.is_empty());
    assert_eq!(result.sql, None);
    assert_eq!(result.outcome(), Outcome::Ambiguous);
    assert!(executor.seen().is_empty());
}

#[tokio::test]
async fn test_drop_table_is_blocked_by_safety() {
    let llm = Arc::new(FixedProvider::new().with_default_sql("DROP TABLE users;", "cleanup"));
    let executor = Arc::new(ScriptedExecutor::default());
    let pipeline = builder(llm).executor(executor.clone()).build().unwrap();

    let result = pipeline.run(&PipelineRequest::new("remove users", "users(id, name)")).await;

    assert!(!result.ok);
    assert!(result.error);
    assert_eq!(result.sql, None);
    assert_eq!(result.error_code, Some(ErrorCode::SafetyForbiddenKeyword));
    assert!(result.details[0].contains("Forbidden keyword detected"));
    assert_eq!(
        stages(&result),
        vec![StageName::Planner, StageName::Generator, StageName::Safety]
    );
    assert!(executor.seen().is_empty());
}

#[tokio::test]
async fn test_aggregate_without_group_by_is_repaired() {
    let llm = Arc::new(
        FixedProvider::new()
            .with_default_sql(BAD_AGGREGATE, "count per country")
            .with_repair(BAD_AGGREGATE, GROUPED),
    );
    let executor = Arc::new(ScriptedExecutor::default());
    let pipeline = builder(llm.clone()).executor(executor.clone()).build().unwrap();

    let result = pipeline
        .run(&PipelineRequest::new("customers per country", "customers(id, country)"))
        .await;

    assert!(result.ok);
    assert_eq!(result.verified, Some(true));
    assert_eq!(
        result.sql.as_deref(),
        Some("SELECT country, COUNT(*) FROM customers GROUP BY country")
    );
    assert_eq!(
        stages(&result),
        vec![
            StageName::Planner,
            StageName::Generator,
            StageName::Safety,
            StageName::Executor,
            StageName::Verifier,
            StageName::Repair,
            StageName::Safety,
            StageName::Executor,
            StageName::Verifier
        ]
    );

    let requests = llm.repair_requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].contains("aggregation_without_group_by"));
    assert_eq!(executor.seen().len(), 2);
}

#[tokio::test]
async fn test_repair_loop_is_bounded() {
    // no repair mapping: the provider echoes the broken SQL back
    let llm = Arc::new(FixedProvider::new().with_default_sql(BAD_AGGREGATE, "count"));
    let executor = Arc::new(ScriptedExecutor::default());
    let pipeline = builder(llm.clone()).executor(executor.clone()).build().unwrap();

    let result = pipeline
        .run(&PipelineRequest::new("customers per country", "customers(id, country)"))
        .await;

    let repairs = result.traces.iter().filter(|t| t.stage == StageName::Repair).count();
    assert_eq!(repairs, 2);
    assert_eq!(llm.repair_requests().len(), 2);
    assert_eq!(executor.seen().len(), 3);

    // the last execution succeeded, so this is a caveated success
    assert!(result.ok);
    assert_eq!(result.verified, Some(false));
    assert_eq!(result.outcome(), Outcome::SuccessWithCaveats);
    assert!(result.details.iter().any(|d| d == "aggregation_without_group_by"));
}

#[tokio::test]
async fn test_zero_repair_attempts_skips_repair() {
    let llm = Arc::new(FixedProvider::new().with_default_sql(BAD_AGGREGATE, "count"));
    let metrics = InMemoryMetrics::new();
    let pipeline = builder(llm.clone())
        .executor(Arc::new(ScriptedExecutor::default()))
        .metrics(Arc::new(metrics.clone()))
        .max_repair_attempts(0)
        .build()
        .unwrap();

    let result = pipeline.run(&PipelineRequest::new("customers per country", "")).await;

    assert!(result.traces.iter().all(|t| t.stage != StageName::Repair));
    assert!(llm.repair_requests().is_empty());
    assert_eq!(result.verified, Some(false));

    let snap = metrics.snapshot();
    assert_eq!(snap.counter(r#"repair_attempts_total{outcome="skipped"}"#), 1);
    assert_eq!(
        snap.counter(r#"repair_triggers_total{reason="aggregation_without_group_by"}"#),
        1
    );
}

#[tokio::test]
async fn test_repaired_sql_is_revalidated_by_safety() {
    let llm = Arc::new(
        FixedProvider::new()
            .with_default_sql(BAD_AGGREGATE, "count")
            .with_repair(BAD_AGGREGATE, "DELETE FROM customers"),
    );
    let executor = Arc::new(ScriptedExecutor::default());
    let pipeline = builder(llm).executor(executor.clone()).build().unwrap();

    let result = pipeline.run(&PipelineRequest::new("customers per country", "")).await;

    // only the original statement ever reached the executor
    assert_eq!(executor.seen(), vec!["SELECT COUNT(*), country FROM customers".to_string()]);
    assert_eq!(result.sql.as_deref(), Some("SELECT COUNT(*), country FROM customers"));
    assert_eq!(result.verified, Some(false));
    assert!(result.details.iter().any(|d| d.contains("Forbidden keyword detected: DELETE")));

    let safety_failures = result
        .traces
        .iter()
        .filter(|t| t.stage == StageName::Safety && t.note("reason").is_some())
        .count();
    assert_eq!(safety_failures, 2);
}

struct PanickingExecutor;

#[async_trait]
impl ExecuteStage for PanickingExecutor {
    async fn run(&self, _sql: &str) -> StageResult<QueryRows> {
        panic!("connection pool poisoned");
    }
}

#[tokio::test]
async fn test_panicking_stage_becomes_pipeline_crash() {
    let llm = Arc::new(FixedProvider::new().with_default_sql("SELECT * FROM users", ""));
    let pipeline = builder(llm).executor(Arc::new(PanickingExecutor)).build().unwrap();

    let result = pipeline.run(&PipelineRequest::new("show all users", "users(id)")).await;

    assert!(!result.ok);
    assert!(result.error);
    assert_eq!(result.error_code, Some(ErrorCode::PipelineCrash));
    assert!(result.details.iter().any(|d| d.contains("connection pool poisoned")));
    assert!(result.details.iter().any(|d| d.starts_with("exec_exception")));
    assert_eq!(result.sql.as_deref(), Some("SELECT * FROM users"));
}

struct PanickingPlanner;

#[async_trait]
impl PlanStage for PanickingPlanner {
    async fn plan(&self, _user_query: &str, _schema_preview: &str) -> StageResult<Plan> {
        panic!("planner bug");
    }
}

#[tokio::test]
async fn test_planner_panic_aborts_run() {
    let llm = Arc::new(FixedProvider::new());
    let pipeline = builder(llm)
        .planner(Arc::new(PanickingPlanner))
        .executor(Arc::new(ScriptedExecutor::default()))
        .build()
        .unwrap();

    let result = pipeline.run(&PipelineRequest::new("show all users", "")).await;

    assert_eq!(result.error_code, Some(ErrorCode::PipelineCrash));
    assert!(result.traces.is_empty());
    assert_eq!(result.sql, None);
}

/// Planner that records the schema text it was given
#[derive(Default)]
struct RecordingPlanner {
    schemas: Mutex<Vec<String>>,
}

#[async_trait]
impl PlanStage for RecordingPlanner {
    async fn plan(&self, _user_query: &str, schema_preview: &str) -> StageResult<Plan> {
        self.schemas.lock().unwrap().push(schema_preview.to_string());
        StageResult::success(
            Plan {
                plan: "plan".to_string(),
            },
            StageTrace::new(StageName::Planner, Duration::ZERO),
        )
    }
}

#[tokio::test]
async fn test_budgeted_schema_reaches_the_model() {
    let llm = Arc::new(FixedProvider::new().with_default_sql("SELECT id FROM accounts", ""));
    let planner = Arc::new(RecordingPlanner::default());
    let budget = ContextBudget {
        max_tables: 1,
        max_columns_per_table: 24,
        max_total_columns: 200,
    };
    let pipeline = builder(llm)
        .planner(planner.clone())
        .context(ContextEngineer::new(budget))
        .executor(Arc::new(ScriptedExecutor::returning(vec![user_rows()])))
        .build()
        .unwrap();

    let preview = "accounts(id, owner)\norders(id, account_id)\nusers(id, name)";
    let result = pipeline.run(&PipelineRequest::new("list accounts", preview)).await;

    let schemas = planner.schemas.lock().unwrap().clone();
    assert_eq!(schemas.len(), 1);
    assert_eq!(schemas[0].lines().count(), 1);

    let context = result.traces[0].note("context").unwrap();
    assert_eq!(context["tables_before"], json!(3));
    assert_eq!(context["tables_after"], json!(1));
    assert_eq!(context["budget_reason"], json!("tables_pruned"));
    assert!(context["constraints"]
        .as_array()
        .unwrap()
        .contains(&json!("SELECT_ONLY")));
}

#[tokio::test]
async fn test_metrics_follow_the_run() {
    let llm = Arc::new(FixedProvider::new().with_default_sql("DROP TABLE users", ""));
    let metrics = InMemoryMetrics::new();
    let pipeline = builder(llm)
        .executor(Arc::new(ScriptedExecutor::default()))
        .metrics(Arc::new(metrics.clone()))
        .build()
        .unwrap();

    pipeline.run(&PipelineRequest::new("remove users", "")).await;

    let snap = metrics.snapshot();
    assert_eq!(snap.counter(r#"pipeline_runs_total{status="error"}"#), 1);
    assert_eq!(snap.counter(r#"safety_blocks_total{reason="forbidden_keyword"}"#), 1);
    assert_eq!(snap.counter(r#"stage_calls_total{stage="safety",ok="false"}"#), 1);
    assert_eq!(
        snap.counter(r#"stage_errors_total{stage="safety",error_code="SAFETY_FORBIDDEN_KEYWORD"}"#),
        1
    );
    assert_eq!(snap.stage_durations_ms["planner"].len(), 1);
}

#[tokio::test]
async fn test_cache_serves_repeated_requests() {
    let llm = Arc::new(FixedProvider::new().with_default_sql("SELECT * FROM users", ""));
    let executor = Arc::new(ScriptedExecutor::returning(vec![user_rows()]));
    let pipeline = builder(llm)
        .executor(executor.clone())
        .cache(Arc::new(ResponseCache::new(Duration::from_secs(60), 16)))
        .build()
        .unwrap();

    let request = PipelineRequest::new("show all users", "users(id, name)");
    let first = pipeline.run(&request).await;
    let second = pipeline.run(&request).await;

    assert_eq!(first, second);
    assert_eq!(executor.seen().len(), 1);

    // different clarification answers are a different request
    let mut answers = ClarifyAnswers::new();
    answers.insert("limit".to_string(), json!(5));
    pipeline.run(&request.clone().with_clarify_answers(answers)).await;
    assert_eq!(executor.seen().len(), 2);
}

/// Provider that never answers within the stage timeout
struct StalledProvider;

#[async_trait]
impl LlmProvider for StalledProvider {
    fn provider_id(&self) -> &str {
        "stalled"
    }

    async fn plan(&self, _q: &str, _s: &str) -> Result<PlanResponse> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Err(Nl2SqlError::Llm("unreachable".into()))
    }

    async fn generate_sql(
        &self,
        _q: &str,
        _s: &str,
        _p: &str,
        _a: &ClarifyAnswers,
    ) -> Result<SqlResponse> {
        Err(Nl2SqlError::Llm("unreachable".into()))
    }

    async fn repair(&self, _sql: &str, _e: &str, _s: &str) -> Result<RepairResponse> {
        Err(Nl2SqlError::Llm("unreachable".into()))
    }
}

#[tokio::test]
async fn test_llm_timeout_is_reported() {
    let pipeline = builder(Arc::new(FixedProvider::new()))
        .planner(Arc::new(Planner::new(Arc::new(StalledProvider), Duration::from_millis(20))))
        .build()
        .unwrap();

    let result = pipeline.run(&PipelineRequest::new("show all users", "")).await;

    assert!(result.error);
    assert_eq!(result.error_code, Some(ErrorCode::LlmTimeout));
    assert!(result.error_descriptor().unwrap().retryable);
}

/// Executor that flags completion after a delay
struct SlowExecutor {
    finished: Arc<AtomicBool>,
}

#[async_trait]
impl ExecuteStage for SlowExecutor {
    async fn run(&self, _sql: &str) -> StageResult<QueryRows> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.finished.store(true, Ordering::SeqCst);
        let trace = StageTrace::new(StageName::Executor, Duration::ZERO);
        StageResult::success(QueryRows::default(), trace)
    }
}

#[tokio::test]
async fn test_dropping_the_run_cancels_in_flight_stage() {
    let finished = Arc::new(AtomicBool::new(false));
    let llm = Arc::new(FixedProvider::new().with_default_sql("SELECT * FROM users", ""));
    let pipeline: Pipeline = builder(llm)
        .executor(Arc::new(SlowExecutor {
            finished: finished.clone(),
        }))
        .build()
        .unwrap();

    let request = PipelineRequest::new("show all users", "");
    let outcome = tokio::time::timeout(Duration::from_millis(50), pipeline.run(&request)).await;
    assert!(outcome.is_err());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!finished.load(Ordering::SeqCst));
}
