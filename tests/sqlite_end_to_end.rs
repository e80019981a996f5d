use nl2sql_copilot::db::{DbAdapter, SqliteAdapter};
use nl2sql_copilot::llm::FixedProvider;
use nl2sql_copilot::stages::ExecuteStage;
use nl2sql_copilot::{
    ErrorCode, Executor, Outcome, PipelineConfig, PipelineFactory, PipelineRequest, StageDeps,
};
use rusqlite::Connection;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn seeded_shop() -> (TempDir, Arc<SqliteAdapter>) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shop.db");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);
         CREATE TABLE customers (id INTEGER PRIMARY KEY, country TEXT);
         INSERT INTO users (id, name) VALUES (1, 'ada'), (2, 'grace');",
    )
    .unwrap();
    drop(conn);
    let adapter = Arc::new(SqliteAdapter::open(&path).unwrap());
    (dir, adapter)
}

fn config() -> PipelineConfig {
    PipelineConfig {
        cache_ttl_secs: 0,
        ..PipelineConfig::default()
    }
}

#[tokio::test]
async fn test_users_query_runs_against_sqlite() {
    let (_dir, db) = seeded_shop();
    let llm = Arc::new(FixedProvider::new().with_sql(
        "show all users",
        "SELECT * FROM users;",
        "all users",
    ));
    let deps = StageDeps::new().with_llm(llm).with_db(db.clone());
    let pipeline = PipelineFactory::default().from_config(&config(), &deps).unwrap();

    let preview = db.schema_preview().await.unwrap();
    let result = pipeline.run(&PipelineRequest::new("show all users", preview)).await;

    assert_eq!(result.outcome(), Outcome::Success);
    assert_eq!(result.sql.as_deref(), Some("SELECT * FROM users"));
    let exec = result.traces.iter().find(|t| t.note("row_count").is_some()).unwrap();
    assert_eq!(exec.note("row_count"), Some(&serde_json::json!(2)));
}

#[tokio::test]
async fn test_misspelled_column_is_repaired_against_sqlite() {
    let (_dir, db) = seeded_shop();
    let llm = Arc::new(
        FixedProvider::new()
            .with_default_sql("SELECT nmae FROM users", "")
            .with_repair("SELECT nmae FROM users", "SELECT name FROM users"),
    );
    let deps = StageDeps::new().with_llm(llm.clone()).with_db(db);
    let pipeline = PipelineFactory::default().from_config(&config(), &deps).unwrap();

    let result = pipeline
        .run(&PipelineRequest::new("user names", "users(id, name)"))
        .await;

    assert!(result.ok);
    assert_eq!(result.verified, Some(true));
    assert_eq!(result.sql.as_deref(), Some("SELECT name FROM users"));
    assert_eq!(result.error_code, None);
    assert!(llm.repair_requests()[0].contains("no such column"));
}

#[tokio::test]
async fn test_missing_table_surfaces_plan_error() {
    let (_dir, db) = seeded_shop();
    let llm = Arc::new(FixedProvider::new().with_default_sql("SELECT * FROM invoices", ""));
    let deps = StageDeps::new().with_llm(llm).with_db(db);
    let pipeline = PipelineFactory::default().from_config(&config(), &deps).unwrap();

    let result = pipeline.run(&PipelineRequest::new("list invoices", "")).await;

    assert!(!result.ok);
    assert_eq!(result.error_code, Some(ErrorCode::PlanNoSuchTable));
    assert!(result.details.iter().any(|d| d.contains("no such table")));
}

#[tokio::test]
async fn test_cost_guardrail_blocks_unbounded_scan() {
    let (_dir, db) = seeded_shop();
    let llm = Arc::new(FixedProvider::new().with_default_sql("SELECT * FROM users", ""));
    let deps = StageDeps::new().with_llm(llm).with_db(db);
    let config = PipelineConfig {
        cost_guardrail: true,
        max_repair_attempts: 0,
        ..config()
    };
    let pipeline = PipelineFactory::default().from_config(&config, &deps).unwrap();

    let result = pipeline.run(&PipelineRequest::new("show all users", "")).await;

    assert!(!result.ok);
    assert_eq!(result.error_code, Some(ErrorCode::ExecutorCostGuardrailBlocked));
}

#[test]
fn test_executor_timeout_stops_the_runaway_query() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .max_blocking_threads(1)
        .enable_all()
        .build()
        .unwrap();
    let (_dir, db) = seeded_shop();
    let executor = Executor::new(db, Duration::from_millis(150));

    runtime.block_on(async {
        let endless = "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n) \
                       SELECT count(*) FROM n";
        let result = executor.run(endless).await;
        assert_eq!(result.error_code(), Some(ErrorCode::DbTimeout));
        assert!(ErrorCode::DbTimeout.retryable());

        let started = Instant::now();
        let result = executor.run("SELECT name FROM users ORDER BY id").await;
        assert!(result.is_ok(), "{:?}", result.errors());
        assert_eq!(result.data().unwrap().row_count(), 2);
        assert!(started.elapsed() < Duration::from_secs(1));
    });
}
