use crate::error::Nl2SqlError;
use crate::llm::LlmProvider;
use crate::stages::{failure_from, with_llm_timeout, RepairStage, RepairedSql};
use crate::types::{StageName, StageResult, StageTrace};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Preamble sent ahead of every repair request
pub const REPAIR_GUIDELINES: &str = "When repairing:
1. Keep the query SELECT-only.
2. Qualify ambiguous columns with their table names.
3. Make GROUP BY match the non-aggregated columns.
4. Join through known foreign keys.
5. Add a reasonable LIMIT if missing.
Return only the corrected SQL.";

pub struct Repair {
    llm: Arc<dyn LlmProvider>,
    timeout: Duration,
}

impl Repair {
    pub fn new(llm: Arc<dyn LlmProvider>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }
}

#[async_trait]
impl RepairStage for Repair {
    async fn repair(
        &self,
        sql: &str,
        error_msg: &str,
        schema_preview: &str,
    ) -> StageResult<RepairedSql> {
        let started = Instant::now();
        let error_msg = format!("{}\n\n{}", REPAIR_GUIDELINES, error_msg);

        let request = self.llm.repair(sql, &error_msg, schema_preview);
        let reply = match with_llm_timeout(self.timeout, request).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Repair failed: {}", e);
                return StageResult::failure(failure_from("Repair failed", e), None);
            }
        };

        let patched = reply.sql.trim().to_string();
        if patched.is_empty() {
            let err = Nl2SqlError::LlmBadOutput("Repair produced empty SQL".to_string());
            return StageResult::failure(failure_from("Repair failed", err), None);
        }

        debug!("Repaired SQL: {}", patched);
        let trace = StageTrace::new(StageName::Repair, started.elapsed())
            .with_usage(reply.usage)
            .with_note("old_sql_len", sql.len())
            .with_note("new_sql_len", patched.len());

        StageResult::success(RepairedSql { sql: patched }, trace)
    }
}
