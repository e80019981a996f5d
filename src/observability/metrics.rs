use crate::observability::{MetricsSink, PipelineStatus, RepairOutcome};
use crate::types::StageName;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn observe_stage_duration_ms(&self, _stage: StageName, _duration_ms: f64) {}
    fn inc_stage_call(&self, _stage: StageName, _ok: bool) {}
    fn inc_stage_error(&self, _stage: StageName, _error_code: &str) {}
    fn inc_pipeline_run(&self, _status: PipelineStatus) {}
    fn inc_repair_trigger(&self, _reason: &str) {}
    fn inc_repair_attempt(&self, _outcome: RepairOutcome) {}
    fn inc_safety_block(&self, _reason: &str) {}
}

/// Point-in-time copy of the in-memory counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub stage_durations_ms: BTreeMap<String, Vec<f64>>,
}

impl MetricsSnapshot {
    pub fn counter(&self, key: &str) -> u64 {
        self.counters.get(key).copied().unwrap_or(0)
    }
}

/// Counter store kept in process memory. Keys follow the
/// `name{label="value"}` exposition shape.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMetrics {
    counters: Arc<Mutex<HashMap<String, u64>>>,
    durations: Arc<Mutex<HashMap<String, Vec<f64>>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn incr(&self, name: &str, labels: &[(&str, &str)]) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(counter_key(name, labels)).or_insert(0) += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .lock()
            .map(|c| c.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default();
        let stage_durations_ms = self
            .durations
            .lock()
            .map(|d| d.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        MetricsSnapshot {
            counters,
            stage_durations_ms,
        }
    }
}

pub fn counter_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let rendered: Vec<String> = labels.iter().map(|(k, v)| format!("{}=\"{}\"", k, v)).collect();
    format!("{}{{{}}}", name, rendered.join(","))
}

impl MetricsSink for InMemoryMetrics {
    fn observe_stage_duration_ms(&self, stage: StageName, duration_ms: f64) {
        if let Ok(mut durations) = self.durations.lock() {
            durations.entry(stage.as_str().to_string()).or_default().push(duration_ms);
        }
    }

    fn inc_stage_call(&self, stage: StageName, ok: bool) {
        let ok = if ok { "true" } else { "false" };
        self.incr("stage_calls_total", &[("stage", stage.as_str()), ("ok", ok)]);
    }

    fn inc_stage_error(&self, stage: StageName, error_code: &str) {
        self.incr("stage_errors_total", &[("stage", stage.as_str()), ("error_code", error_code)]);
    }

    fn inc_pipeline_run(&self, status: PipelineStatus) {
        self.incr("pipeline_runs_total", &[("status", status.as_str())]);
    }

    fn inc_repair_trigger(&self, reason: &str) {
        self.incr("repair_triggers_total", &[("reason", reason)]);
    }

    fn inc_repair_attempt(&self, outcome: RepairOutcome) {
        self.incr("repair_attempts_total", &[("outcome", outcome.as_str())]);
    }

    fn inc_safety_block(&self, reason: &str) {
        self.incr("safety_blocks_total", &[("reason", reason)]);
    }
}
