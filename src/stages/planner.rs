use crate::llm::LlmProvider;
use crate::stages::{failure_from, with_llm_timeout, Plan, PlanStage};
use crate::types::{StageName, StageResult, StageTrace};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub struct Planner {
    llm: Arc<dyn LlmProvider>,
    timeout: Duration,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmProvider>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }
}

#[async_trait]
impl PlanStage for Planner {
    async fn plan(&self, user_query: &str, schema_preview: &str) -> StageResult<Plan> {
        let started = Instant::now();
        match with_llm_timeout(self.timeout, self.llm.plan(user_query, schema_preview)).await {
            Ok(reply) => {
                debug!(provider = self.llm.provider_id(), "Plan: {}", reply.plan);
                let trace = StageTrace::new(StageName::Planner, started.elapsed())
                    .with_usage(reply.usage)
                    .with_note("len_plan", reply.plan.len());
                StageResult::success(Plan { plan: reply.plan }, trace)
            }
            Err(e) => {
                warn!("Planner failed: {}", e);
                StageResult::failure(failure_from("Planner failed", e), None)
            }
        }
    }
}
