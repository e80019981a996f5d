//! Stage capability traits
//!
//! The orchestrator is assembled from these traits only. Synchronous stages
//! (detector, safety, verifier) are pure CPU work; the others block on a
//! language model or a database and are async.

pub mod generator;
pub mod noop;
pub mod planner;
pub mod repair;

pub use generator::Generator;
pub use noop::{NoopExecutor, NoopRepair, NoopVerifier};
pub use planner::Planner;
pub use repair::{Repair, REPAIR_GUIDELINES};

use crate::db::QueryRows;
use crate::error::{Nl2SqlError, Result};
use crate::llm::ClarifyAnswers;
use crate::safety::SafeSql;
use crate::types::{StageFailure, StageResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedSql {
    pub sql: String,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairedSql {
    pub sql: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub verified: bool,
}

pub trait AmbiguityCheck: Send + Sync {
    fn detect(&self, user_query: &str, schema_preview: &str) -> Vec<String>;
}

pub trait SafetyGate: Send + Sync {
    fn check(&self, sql: &str) -> StageResult<SafeSql>;
}

pub trait VerifyStage: Send + Sync {
    fn verify(&self, sql: &str, exec_result: &StageResult<QueryRows>) -> StageResult<Verification>;
}

#[async_trait]
pub trait PlanStage: Send + Sync {
    async fn plan(&self, user_query: &str, schema_preview: &str) -> StageResult<Plan>;
}

#[async_trait]
pub trait GenerateStage: Send + Sync {
    async fn generate(
        &self,
        user_query: &str,
        schema_preview: &str,
        plan_text: &str,
        clarify_answers: &ClarifyAnswers,
    ) -> StageResult<GeneratedSql>;
}

#[async_trait]
pub trait ExecuteStage: Send + Sync {
    async fn run(&self, sql: &str) -> StageResult<QueryRows>;
}

#[async_trait]
pub trait RepairStage: Send + Sync {
    async fn repair(
        &self,
        sql: &str,
        error_msg: &str,
        schema_preview: &str,
    ) -> StageResult<RepairedSql>;
}

/// Bound a language-model call; elapsed calls become `LlmTimeout`.
pub(crate) async fn with_llm_timeout<T, F>(limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(Nl2SqlError::LlmTimeout(limit)),
    }
}

/// Failure with a stage prefix, keeping the taxonomy code of `err`
pub(crate) fn failure_from(prefix: &str, err: Nl2SqlError) -> StageFailure {
    StageFailure::new(format!("{}: {}", prefix, err)).with_code(err.error_code())
}
