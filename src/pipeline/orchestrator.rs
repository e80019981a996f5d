//! Pipeline Orchestrator
//!
//! Runs the stages in order: ambiguity check, context budgeting, plan,
//! generate, safety, execute, verify. A failed verification enters a bounded
//! repair loop that re-validates every patched statement from scratch.
//!
//! Each stage call is contained: async stages run on their own task and
//! sync stages under `catch_unwind`, so a panicking stage becomes a
//! `PIPELINE_CRASH` failure instead of taking the request down. Dropping the
//! `run` future aborts the task in flight.

use crate::cache::ResponseCache;
use crate::context::ContextEngineer;
use crate::db::QueryRows;
use crate::error_code::ErrorCode;
use crate::llm::ClarifyAnswers;
use crate::observability::{MetricsSink, PipelineStatus, RepairOutcome};
use crate::pipeline::fingerprint::request_fingerprint;
use crate::safety::SafeSql;
use crate::stages::{
    AmbiguityCheck, ExecuteStage, GenerateStage, PlanStage, RepairStage, SafetyGate, VerifyStage,
};
use crate::types::{FinalResult, Outcome, StageFailure, StageName, StageResult, StageTrace};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

pub const DEFAULT_MAX_REPAIR_ATTEMPTS: usize = 2;

/// One natural-language question against one schema
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub user_query: String,
    pub schema_preview: String,
    #[serde(default)]
    pub clarify_answers: ClarifyAnswers,
}

impl PipelineRequest {
    pub fn new(user_query: impl Into<String>, schema_preview: impl Into<String>) -> Self {
        Self {
            user_query: user_query.into(),
            schema_preview: schema_preview.into(),
            clarify_answers: ClarifyAnswers::new(),
        }
    }

    pub fn with_clarify_answers(mut self, answers: ClarifyAnswers) -> Self {
        self.clarify_answers = answers;
        self
    }

    pub fn fingerprint(&self) -> String {
        request_fingerprint(&self.user_query, &self.schema_preview, &self.clarify_answers)
    }
}

pub struct Pipeline {
    pub(crate) detector: Arc<dyn AmbiguityCheck>,
    pub(crate) context: ContextEngineer,
    pub(crate) planner: Arc<dyn PlanStage>,
    pub(crate) generator: Arc<dyn GenerateStage>,
    pub(crate) safety: Arc<dyn SafetyGate>,
    pub(crate) executor: Arc<dyn ExecuteStage>,
    pub(crate) verifier: Arc<dyn VerifyStage>,
    pub(crate) repair: Arc<dyn RepairStage>,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    pub(crate) cache: Option<Arc<ResponseCache>>,
    pub(crate) max_repair_attempts: usize,
}

/// Bookkeeping for a single run
#[derive(Default)]
struct RunState {
    traces: Vec<StageTrace>,
    details: Vec<String>,
    last_safe_sql: Option<String>,
    last_exec_ok: bool,
    last_error_code: Option<ErrorCode>,
}

impl RunState {
    fn absorb(&mut self, failure: StageFailure) {
        if failure.code.is_some() {
            self.last_error_code = failure.code;
        }
        self.details.extend(failure.errors);
    }

    /// Fail-fast result for a stage before execution
    fn abort(self, failure: StageFailure, rationale: Option<String>) -> FinalResult {
        FinalResult::failed(failure, None, rationale, self.traces)
    }

    fn conclude(self, verified: bool, rationale: Option<String>) -> FinalResult {
        let (ok, error_code) = if verified || self.last_exec_ok {
            (true, None)
        } else {
            (false, self.last_error_code)
        };
        FinalResult {
            ok,
            ambiguous: false,
            error: !ok,
            error_code,
            details: self.details,
            questions: Vec::new(),
            sql: self.last_safe_sql,
            rationale,
            verified: Some(verified),
            traces: self.traces,
        }
    }
}

impl Pipeline {
    pub fn max_repair_attempts(&self) -> usize {
        self.max_repair_attempts
    }

    /// Run the pipeline. Always returns a result; never panics on stage failure.
    pub async fn run(&self, request: &PipelineRequest) -> FinalResult {
        let key = self.cache.as_ref().map(|_| request.fingerprint());

        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if let Some(hit) = cache.get(key) {
                info!(fingerprint = %key, "Response cache hit");
                return hit;
            }
            debug!(fingerprint = %key, "Response cache miss");
        }

        let result = self.run_stages(request).await;

        if let (Some(cache), Some(key)) = (&self.cache, key) {
            if result.ok && !result.ambiguous {
                cache.put(key, result.clone());
            }
        }
        result
    }

    async fn run_stages(&self, request: &PipelineRequest) -> FinalResult {
        let started = Instant::now();
        info!("Pipeline run started");

        // 1) ambiguity
        let detector = Arc::clone(&self.detector);
        let detected = panic::catch_unwind(AssertUnwindSafe(|| {
            detector.detect(&request.user_query, &request.schema_preview)
        }));
        let questions = match detected {
            Ok(questions) => questions,
            Err(payload) => {
                let failure =
                    StageFailure::crash(StageName::Detector, panic_message(payload.as_ref()));
                error!("{}", failure.errors[0]);
                self.metrics
                    .inc_stage_error(StageName::Detector, ErrorCode::PipelineCrash.as_str());
                return self.finish(FinalResult::failed(failure, None, None, Vec::new()), started);
            }
        };
        if !questions.is_empty() {
            info!(count = questions.len(), "Query is ambiguous, asking for clarification");
            return self.finish(FinalResult::ambiguous(questions), started);
        }

        // 2) context budget; only the budgeted schema reaches the model
        let packet = self.context.build(&request.schema_preview);
        if let Some(reason) = packet.budget_reason {
            info!(
                tables = packet.tables_after,
                columns = packet.columns_after,
                "Schema trimmed to budget: {}",
                reason
            );
        }
        let schema_text = packet.render();
        let mut state = RunState::default();

        // 3) plan
        let planner = Arc::clone(&self.planner);
        let (query, schema) = (request.user_query.clone(), schema_text.clone());
        let mut plan_result = contain(StageName::Planner, async move {
            planner.plan(&query, &schema).await
        })
        .await;
        if let Some(trace) = plan_result.trace_mut() {
            trace.notes.insert("context".to_string(), packet.stats());
        }
        self.record(StageName::Planner, &plan_result, &mut state);
        let plan = match plan_result.into_parts().0 {
            Ok(plan) => plan,
            Err(failure) => return self.finish(state.abort(failure, None), started),
        };

        // 4) generate
        let generator = Arc::clone(&self.generator);
        let (query, schema, answers) = (
            request.user_query.clone(),
            schema_text.clone(),
            request.clarify_answers.clone(),
        );
        let gen_result = contain(StageName::Generator, async move {
            generator.generate(&query, &schema, &plan.plan, &answers).await
        })
        .await;
        self.record(StageName::Generator, &gen_result, &mut state);
        let generated = match gen_result.into_parts().0 {
            Ok(generated) => generated,
            Err(failure) => return self.finish(state.abort(failure, None), started),
        };
        let rationale = Some(generated.rationale);

        // 5) safety
        let safe = match self.check_safety(&generated.sql, &mut state) {
            Ok(safe) => safe,
            Err(failure) => return self.finish(state.abort(failure, rationale), started),
        };

        // 6) execute and 7) verify
        let mut verified = self.execute_and_verify(&safe.sql, &mut state).await;

        // 8) bounded repair loop
        if !verified {
            // verifier messages lead with their reason label
            let trigger = state
                .details
                .last()
                .and_then(|d| d.split(':').next())
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .unwrap_or("unverified");
            self.metrics.inc_repair_trigger(trigger);
            if self.max_repair_attempts == 0 {
                self.metrics.inc_repair_attempt(RepairOutcome::Skipped);
            }

            let mut candidate = safe.sql;
            for attempt in 1..=self.max_repair_attempts {
                info!("Repair attempt {} of {}", attempt, self.max_repair_attempts);
                self.metrics.inc_repair_attempt(RepairOutcome::Attempt);

                let error_msg = if state.details.is_empty() {
                    "unknown".to_string()
                } else {
                    state.details.join("; ")
                };
                let repair = Arc::clone(&self.repair);
                let (sql, schema) = (candidate.clone(), schema_text.clone());
                let fix_result = contain(StageName::Repair, async move {
                    repair.repair(&sql, &error_msg, &schema).await
                })
                .await;
                self.record(StageName::Repair, &fix_result, &mut state);

                candidate = match fix_result.into_parts().0 {
                    Ok(fixed) => fixed.sql,
                    Err(failure) => {
                        warn!("Repair failed, giving up: {:?}", failure.errors);
                        state.absorb(failure);
                        self.metrics.inc_repair_attempt(RepairOutcome::Failed);
                        break;
                    }
                };

                // repaired SQL is never trusted
                let safe = match self.check_safety(&candidate, &mut state) {
                    Ok(safe) => safe,
                    Err(failure) => {
                        state.absorb(failure);
                        self.metrics.inc_repair_attempt(RepairOutcome::Failed);
                        continue;
                    }
                };

                verified = self.execute_and_verify(&safe.sql, &mut state).await;
                if verified {
                    info!("✅ Repair succeeded on attempt {}", attempt);
                    self.metrics.inc_repair_attempt(RepairOutcome::Success);
                    break;
                }
                self.metrics.inc_repair_attempt(RepairOutcome::Failed);
            }
        }

        self.finish(state.conclude(verified, rationale), started)
    }

    fn check_safety(&self, sql: &str, state: &mut RunState) -> Result<SafeSql, StageFailure> {
        let safety = Arc::clone(&self.safety);
        let result = contain_sync(StageName::Safety, || safety.check(sql));
        self.record(StageName::Safety, &result, state);

        if !result.is_ok() {
            let reason = result
                .trace()
                .and_then(|t| t.note("reason"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            self.metrics.inc_safety_block(reason);
        }

        let (data, _) = result.into_parts();
        if let Ok(safe) = &data {
            state.last_safe_sql = Some(safe.sql.clone());
        }
        data
    }

    /// Execute then verify. Execution failures are accumulated, not fatal.
    async fn execute_and_verify(&self, sql: &str, state: &mut RunState) -> bool {
        let executor = Arc::clone(&self.executor);
        let owned = sql.to_string();
        let exec_result: StageResult<QueryRows> =
            contain(StageName::Executor, async move { executor.run(&owned).await }).await;
        self.record(StageName::Executor, &exec_result, state);

        state.last_exec_ok = exec_result.is_ok();
        if let Some(failure) = exec_result.failure_ref() {
            state.absorb(failure.clone());
        }

        let verifier = Arc::clone(&self.verifier);
        let verify_result =
            contain_sync(StageName::Verifier, || verifier.verify(sql, &exec_result));
        self.record(StageName::Verifier, &verify_result, state);

        let verified = verify_result.data().map(|v| v.verified).unwrap_or(false);
        if !verified {
            state.details.extend(verify_result.errors().iter().cloned());
        }
        verified
    }

    fn record<T>(&self, stage: StageName, result: &StageResult<T>, state: &mut RunState) {
        self.metrics.inc_stage_call(stage, result.is_ok());
        if let Some(code) = result.error_code() {
            self.metrics.inc_stage_error(stage, code.as_str());
        }
        if let Some(trace) = result.trace() {
            self.metrics.observe_stage_duration_ms(stage, trace.duration_ms);
            state.traces.push(trace.clone());
        }
        debug!(stage = %stage, ok = result.is_ok(), "Stage finished");
    }

    fn finish(&self, result: FinalResult, started: Instant) -> FinalResult {
        let status = match result.outcome() {
            Outcome::Ambiguous => PipelineStatus::Ambiguous,
            Outcome::Error => PipelineStatus::Error,
            Outcome::Success | Outcome::SuccessWithCaveats => PipelineStatus::Ok,
        };
        self.metrics.inc_pipeline_run(status);
        info!(
            outcome = ?result.outcome(),
            stages = result.traces.len(),
            cost = result.total_cost(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Pipeline run finished"
        );
        result
    }
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<T> Future for AbortOnDrop<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

/// Run an async stage on its own task, turning a panic into a crash failure
async fn contain<T, F>(stage: StageName, call: F) -> StageResult<T>
where
    T: Send + 'static,
    F: Future<Output = StageResult<T>> + Send + 'static,
{
    match AbortOnDrop(tokio::spawn(call)).await {
        Ok(result) => result,
        Err(e) => {
            let message = if e.is_panic() {
                panic_message(e.into_panic().as_ref())
            } else {
                e.to_string()
            };
            error!(stage = %stage, "Stage crashed: {}", message);
            StageResult::failure(StageFailure::crash(stage, message), None)
        }
    }
}

fn contain_sync<T>(stage: StageName, call: impl FnOnce() -> StageResult<T>) -> StageResult<T> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(stage = %stage, "Stage crashed: {}", message);
            StageResult::failure(StageFailure::crash(stage, message), None)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
