//! Observability
//!
//! Metrics are recorded through an injected [`MetricsSink`]. The orchestrator
//! decides which events to record; stages never touch metrics directly.

pub mod metrics;

pub use metrics::{InMemoryMetrics, MetricsSnapshot, NoopMetrics};

use crate::types::StageName;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Ok,
    Error,
    Ambiguous,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Ok => "ok",
            PipelineStatus::Error => "error",
            PipelineStatus::Ambiguous => "ambiguous",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepairOutcome {
    Attempt,
    Success,
    Failed,
    Skipped,
}

impl RepairOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepairOutcome::Attempt => "attempt",
            RepairOutcome::Success => "success",
            RepairOutcome::Failed => "failed",
            RepairOutcome::Skipped => "skipped",
        }
    }
}

pub trait MetricsSink: Send + Sync {
    fn observe_stage_duration_ms(&self, stage: StageName, duration_ms: f64);

    fn inc_stage_call(&self, stage: StageName, ok: bool);

    fn inc_stage_error(&self, stage: StageName, error_code: &str);

    fn inc_pipeline_run(&self, status: PipelineStatus);

    /// Why the repair loop was entered
    fn inc_repair_trigger(&self, reason: &str);

    fn inc_repair_attempt(&self, outcome: RepairOutcome);

    fn inc_safety_block(&self, reason: &str);
}
