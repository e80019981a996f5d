//! Stand-ins used when no database is bound

use crate::db::QueryRows;
use crate::stages::{ExecuteStage, RepairStage, RepairedSql, Verification, VerifyStage};
use crate::types::{StageName, StageResult, StageTrace};
use async_trait::async_trait;
use std::time::Duration;

fn noop_trace(stage: StageName) -> StageTrace {
    StageTrace::new(stage, Duration::ZERO).with_note("noop", true)
}

/// Returns an empty result set without touching a database
#[derive(Debug, Clone, Default)]
pub struct NoopExecutor;

#[async_trait]
impl ExecuteStage for NoopExecutor {
    async fn run(&self, _sql: &str) -> StageResult<QueryRows> {
        StageResult::success(QueryRows::default(), noop_trace(StageName::Executor))
    }
}

/// Reports every statement as verified
#[derive(Debug, Clone, Default)]
pub struct NoopVerifier;

impl VerifyStage for NoopVerifier {
    fn verify(
        &self,
        _sql: &str,
        _exec_result: &StageResult<QueryRows>,
    ) -> StageResult<Verification> {
        StageResult::success(Verification { verified: true }, noop_trace(StageName::Verifier))
    }
}

/// Echoes the SQL it was asked to repair
#[derive(Debug, Clone, Default)]
pub struct NoopRepair;

#[async_trait]
impl RepairStage for NoopRepair {
    async fn repair(
        &self,
        sql: &str,
        _error_msg: &str,
        _schema_preview: &str,
    ) -> StageResult<RepairedSql> {
        let repaired = RepairedSql {
            sql: sql.to_string(),
        };
        StageResult::success(repaired, noop_trace(StageName::Repair))
    }
}
