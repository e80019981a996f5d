//! Executor
//!
//! Runs safety-validated SQL against the bound adapter. With the cost
//! guardrail enabled, the adapter's query plan is inspected first and full
//! table scans without a `LIMIT` are refused before anything executes.

use crate::db::{DbAdapter, QueryRows};
use crate::error::{Nl2SqlError, Result};
use crate::error_code::ErrorCode;
use crate::safety::has_limit_clause;
use crate::stages::ExecuteStage;
use crate::types::{StageFailure, StageName, StageResult, StageTrace};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const FULL_SCAN_WITHOUT_LIMIT: &str = "full_scan_without_limit";

pub struct Executor {
    db: Arc<dyn DbAdapter>,
    timeout: Duration,
    cost_guardrail: bool,
}

impl Executor {
    pub fn new(db: Arc<dyn DbAdapter>, timeout: Duration) -> Self {
        Self {
            db,
            timeout,
            cost_guardrail: false,
        }
    }

    pub fn with_cost_guardrail(mut self, enabled: bool) -> Self {
        self.cost_guardrail = enabled;
        self
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Nl2SqlError::DbTimeout(self.timeout)),
        }
    }

    /// The plan line that makes `sql` too expensive, if any
    async fn guardrail_violation(&self, sql: &str) -> Option<String> {
        let lines = match self.bounded(self.db.explain_query_plan(sql)).await {
            Ok(Some(lines)) => lines,
            Ok(None) => {
                debug!(
                    adapter = self.db.name(),
                    "No query plan capability, cost guardrail skipped"
                );
                return None;
            }
            Err(e) => {
                // the execute call reports the real error
                debug!("Query plan unavailable: {}", e);
                return None;
            }
        };

        if has_limit_clause(sql) {
            return None;
        }
        find_full_scan(&lines).map(str::to_string)
    }
}

/// A `SCAN` plan line other than a constant-row scan
pub fn find_full_scan(plan_lines: &[String]) -> Option<&str> {
    plan_lines
        .iter()
        .map(|line| line.trim())
        .find(|line| {
            let upper = line.to_uppercase();
            upper.starts_with("SCAN") && !upper.starts_with("SCAN CONSTANT ROW")
        })
}

#[async_trait]
impl ExecuteStage for Executor {
    async fn run(&self, sql: &str) -> StageResult<QueryRows> {
        let started = Instant::now();

        if self.cost_guardrail {
            if let Some(plan_line) = self.guardrail_violation(sql).await {
                warn!("Cost guardrail blocked query: {}", plan_line);
                let trace = StageTrace::new(StageName::Executor, started.elapsed())
                    .with_note("blocked_reason", FULL_SCAN_WITHOUT_LIMIT)
                    .with_note("plan_line", plan_line.clone());
                return StageResult::failure(
                    StageFailure::new(format!(
                        "Query blocked by cost guardrail: full table scan without LIMIT ({})",
                        plan_line
                    ))
                    .with_code(ErrorCode::ExecutorCostGuardrailBlocked),
                    Some(trace),
                );
            }
        }

        match self.bounded(self.db.execute(sql)).await {
            Ok(rows) => {
                info!(rows = rows.row_count(), cols = rows.columns.len(), "Query executed");
                let trace = StageTrace::new(StageName::Executor, started.elapsed())
                    .with_note("row_count", rows.row_count())
                    .with_note("col_count", rows.columns.len());
                StageResult::success(rows, trace)
            }
            Err(e) => {
                warn!("Execution failed: {}", e);
                let trace = StageTrace::new(StageName::Executor, started.elapsed())
                    .with_note("error", e.to_string());
                StageResult::failure(StageFailure::from(e), Some(trace))
            }
        }
    }
}
