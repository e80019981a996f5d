//! Stage and pipeline result types
//!
//! Every stage produces a [`StageResult`]; the orchestrator folds them into a
//! single [`FinalResult`], the only value handed back to callers.

use crate::error_code::{ErrorCode, ErrorDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Pipeline stage identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Detector,
    Planner,
    Generator,
    Safety,
    Executor,
    Verifier,
    Repair,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Detector => "detector",
            StageName::Planner => "planner",
            StageName::Generator => "generator",
            StageName::Safety => "safety",
            StageName::Executor => "executor",
            StageName::Verifier => "verifier",
            StageName::Repair => "repair",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token and cost accounting reported by the language model
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub token_in: u32,
    pub token_out: u32,
    pub cost: f64,
}

/// Timing / cost record for one stage invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTrace {
    pub stage: StageName,
    pub duration_ms: f64,
    pub token_in: Option<u32>,
    pub token_out: Option<u32>,
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub notes: BTreeMap<String, serde_json::Value>,
}

impl StageTrace {
    pub fn new(stage: StageName, elapsed: Duration) -> Self {
        Self {
            stage,
            duration_ms: elapsed.as_secs_f64() * 1000.0,
            token_in: None,
            token_out: None,
            cost: None,
            notes: BTreeMap::new(),
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.token_in = Some(usage.token_in);
        self.token_out = Some(usage.token_out);
        self.cost = Some(usage.cost);
        self
    }

    pub fn with_note(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.notes.insert(key.to_string(), value.into());
        self
    }

    pub fn note(&self, key: &str) -> Option<&serde_json::Value> {
        self.notes.get(key)
    }
}

/// Failure payload of a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub errors: Vec<String>,
    pub code: Option<ErrorCode>,
}

impl StageFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            errors: vec![message.into()],
            code: None,
        }
    }

    pub fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Synthetic failure for a stage that panicked or was torn down
    pub fn crash(stage: StageName, message: impl fmt::Display) -> Self {
        Self::new(format!("{} stage crashed: {}", stage, message))
            .with_code(ErrorCode::PipelineCrash)
    }
}

impl From<crate::error::Nl2SqlError> for StageFailure {
    fn from(err: crate::error::Nl2SqlError) -> Self {
        let code = err.error_code();
        StageFailure::new(err.to_string()).with_code(code)
    }
}

/// Result of one stage invocation. Never escapes as a panic or error.
#[derive(Debug, Clone)]
pub enum StageResult<T> {
    Ok {
        data: T,
        trace: Option<StageTrace>,
    },
    Failed {
        failure: StageFailure,
        trace: Option<StageTrace>,
    },
}

impl<T> StageResult<T> {
    pub fn success(data: T, trace: StageTrace) -> Self {
        StageResult::Ok {
            data,
            trace: Some(trace),
        }
    }

    pub fn failure(failure: StageFailure, trace: Option<StageTrace>) -> Self {
        StageResult::Failed { failure, trace }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, StageResult::Ok { .. })
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            StageResult::Ok { data, .. } => Some(data),
            StageResult::Failed { .. } => None,
        }
    }

    pub fn failure_ref(&self) -> Option<&StageFailure> {
        match self {
            StageResult::Ok { .. } => None,
            StageResult::Failed { failure, .. } => Some(failure),
        }
    }

    pub fn errors(&self) -> &[String] {
        self.failure_ref().map(|f| f.errors.as_slice()).unwrap_or(&[])
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.failure_ref().and_then(|f| f.code)
    }

    pub fn trace(&self) -> Option<&StageTrace> {
        match self {
            StageResult::Ok { trace, .. } | StageResult::Failed { trace, .. } => trace.as_ref(),
        }
    }

    pub fn trace_mut(&mut self) -> Option<&mut StageTrace> {
        match self {
            StageResult::Ok { trace, .. } | StageResult::Failed { trace, .. } => trace.as_mut(),
        }
    }

    pub fn into_parts(self) -> (std::result::Result<T, StageFailure>, Option<StageTrace>) {
        match self {
            StageResult::Ok { data, trace } => (Ok(data), trace),
            StageResult::Failed { failure, trace } => (Err(failure), trace),
        }
    }
}

/// Terminal classification of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ambiguous,
    Error,
    Success,
    SuccessWithCaveats,
}

/// The only object returned to pipeline callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    pub ok: bool,
    pub ambiguous: bool,
    pub error: bool,
    pub error_code: Option<ErrorCode>,
    #[serde(default)]
    pub details: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub questions: Vec<String>,
    pub sql: Option<String>,
    pub rationale: Option<String>,
    pub verified: Option<bool>,
    #[serde(default)]
    pub traces: Vec<StageTrace>,
}

impl FinalResult {
    pub fn ambiguous(questions: Vec<String>) -> Self {
        Self {
            ok: true,
            ambiguous: true,
            error: false,
            error_code: None,
            details: vec![format!("Ambiguities found: {}", questions.len())],
            questions,
            sql: None,
            rationale: None,
            verified: None,
            traces: Vec::new(),
        }
    }

    /// Fail-fast result for a stage that aborted the run
    pub fn failed(
        failure: StageFailure,
        sql: Option<String>,
        rationale: Option<String>,
        traces: Vec<StageTrace>,
    ) -> Self {
        Self {
            ok: false,
            ambiguous: false,
            error: true,
            error_code: failure.code,
            details: failure.errors,
            questions: Vec::new(),
            sql,
            rationale,
            verified: None,
            traces,
        }
    }

    pub fn outcome(&self) -> Outcome {
        if self.ambiguous && !self.error {
            Outcome::Ambiguous
        } else if !self.ok {
            Outcome::Error
        } else if self.verified == Some(true) {
            Outcome::Success
        } else {
            Outcome::SuccessWithCaveats
        }
    }

    pub fn error_descriptor(&self) -> Option<ErrorDescriptor> {
        self.error_code.map(|c| c.descriptor())
    }

    pub fn total_cost(&self) -> f64 {
        self.traces.iter().filter_map(|t| t.cost).sum()
    }

    pub fn total_tokens(&self) -> u64 {
        self.traces
            .iter()
            .map(|t| t.token_in.unwrap_or(0) as u64 + t.token_out.unwrap_or(0) as u64)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_builder_records_usage_and_notes() {
        let trace = StageTrace::new(StageName::Planner, Duration::from_millis(12))
            .with_usage(TokenUsage {
                token_in: 10,
                token_out: 4,
                cost: 0.002,
            })
            .with_note("len_plan", 42);

        assert_eq!(trace.stage, StageName::Planner);
        assert!((trace.duration_ms - 12.0).abs() < 1e-9);
        assert_eq!(trace.token_in, Some(10));
        assert_eq!(trace.note("len_plan"), Some(&serde_json::json!(42)));
    }

    #[test]
    fn test_stage_result_accessors() {
        let ok: StageResult<u8> =
            StageResult::success(7, StageTrace::new(StageName::Safety, Duration::ZERO));
        assert!(ok.is_ok());
        assert_eq!(ok.data(), Some(&7));
        assert!(ok.errors().is_empty());

        let failed: StageResult<u8> = StageResult::failure(
            StageFailure::new("boom").with_code(ErrorCode::DbLocked),
            None,
        );
        assert!(!failed.is_ok());
        assert_eq!(failed.errors(), &["boom".to_string()]);
        assert_eq!(failed.error_code(), Some(ErrorCode::DbLocked));
        assert!(failed.trace().is_none());
    }

    #[test]
    fn test_outcome_classification() {
        let ambiguous = FinalResult::ambiguous(vec!["q".into()]);
        assert_eq!(ambiguous.outcome(), Outcome::Ambiguous);
        assert!(ambiguous.traces.is_empty());

        let failed = FinalResult::failed(StageFailure::new("x"), None, None, Vec::new());
        assert_eq!(failed.outcome(), Outcome::Error);
    }

    #[test]
    fn test_stage_name_serializes_lowercase() {
        let json = serde_json::to_string(&StageName::Executor).unwrap();
        assert_eq!(json, "\"executor\"");
    }
}
