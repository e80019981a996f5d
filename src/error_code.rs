//! Error Taxonomy
//!
//! Stable error codes exported to front-ends. Each code carries the HTTP
//! status class a web layer should answer with and whether a client may retry.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Enumerated failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Safety
    SafetyNonSelect,
    SafetyMultiStatement,
    SafetyForbiddenKeyword,

    // Plan / statement errors reported by the database
    PlanNoSuchTable,
    PlanNoSuchColumn,
    PlanSyntaxError,

    // Executor / DB
    DbLocked,
    DbTimeout,
    DbExecutionError,
    ExecutorCostGuardrailBlocked,

    // LLM
    LlmTimeout,
    LlmUnavailable,
    LlmBadOutput,

    // Internal
    PipelineCrash,
}

/// Serializable view of a code for the web layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub code: ErrorCode,
    pub http_status: u16,
    pub retryable: bool,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 14] = [
        ErrorCode::SafetyNonSelect,
        ErrorCode::SafetyMultiStatement,
        ErrorCode::SafetyForbiddenKeyword,
        ErrorCode::PlanNoSuchTable,
        ErrorCode::PlanNoSuchColumn,
        ErrorCode::PlanSyntaxError,
        ErrorCode::DbLocked,
        ErrorCode::DbTimeout,
        ErrorCode::DbExecutionError,
        ErrorCode::ExecutorCostGuardrailBlocked,
        ErrorCode::LlmTimeout,
        ErrorCode::LlmUnavailable,
        ErrorCode::LlmBadOutput,
        ErrorCode::PipelineCrash,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::SafetyNonSelect => "SAFETY_NON_SELECT",
            ErrorCode::SafetyMultiStatement => "SAFETY_MULTI_STATEMENT",
            ErrorCode::SafetyForbiddenKeyword => "SAFETY_FORBIDDEN_KEYWORD",
            ErrorCode::PlanNoSuchTable => "PLAN_NO_SUCH_TABLE",
            ErrorCode::PlanNoSuchColumn => "PLAN_NO_SUCH_COLUMN",
            ErrorCode::PlanSyntaxError => "PLAN_SYNTAX_ERROR",
            ErrorCode::DbLocked => "DB_LOCKED",
            ErrorCode::DbTimeout => "DB_TIMEOUT",
            ErrorCode::DbExecutionError => "DB_EXECUTION_ERROR",
            ErrorCode::ExecutorCostGuardrailBlocked => "EXECUTOR_COST_GUARDRAIL_BLOCKED",
            ErrorCode::LlmTimeout => "LLM_TIMEOUT",
            ErrorCode::LlmUnavailable => "LLM_UNAVAILABLE",
            ErrorCode::LlmBadOutput => "LLM_BAD_OUTPUT",
            ErrorCode::PipelineCrash => "PIPELINE_CRASH",
        }
    }

    /// HTTP status class for this code
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::SafetyNonSelect
            | ErrorCode::SafetyMultiStatement
            | ErrorCode::SafetyForbiddenKeyword
            | ErrorCode::PlanNoSuchTable
            | ErrorCode::PlanNoSuchColumn
            | ErrorCode::PlanSyntaxError
            | ErrorCode::ExecutorCostGuardrailBlocked => 422,
            ErrorCode::DbLocked
            | ErrorCode::DbTimeout
            | ErrorCode::LlmTimeout
            | ErrorCode::LlmUnavailable => 503,
            ErrorCode::LlmBadOutput => 502,
            ErrorCode::DbExecutionError | ErrorCode::PipelineCrash => 500,
        }
    }

    /// Dependency errors are retryable; validation and internal errors are not.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::DbLocked
                | ErrorCode::DbTimeout
                | ErrorCode::LlmTimeout
                | ErrorCode::LlmUnavailable
        )
    }

    pub fn descriptor(&self) -> ErrorDescriptor {
        ErrorDescriptor {
            code: *self,
            http_status: self.http_status(),
            retryable: self.retryable(),
        }
    }

    /// Classify a raw database error message into the taxonomy.
    pub fn classify_db_message(message: &str) -> ErrorCode {
        let msg = message.to_lowercase();

        if msg.contains("no such table")
            || (msg.contains("relation") && msg.contains("does not exist"))
        {
            return ErrorCode::PlanNoSuchTable;
        }

        if msg.contains("no such column")
            || (msg.contains("column") && msg.contains("does not exist"))
        {
            return ErrorCode::PlanNoSuchColumn;
        }

        if msg.contains("syntax error") || msg.contains("incomplete input") {
            return ErrorCode::PlanSyntaxError;
        }

        if msg.contains("database is locked")
            || msg.contains("database is busy")
            || msg.contains("locked")
        {
            return ErrorCode::DbLocked;
        }

        if msg.contains("timeout") || msg.contains("timed out") || msg.contains("interrupted") {
            return ErrorCode::DbTimeout;
        }

        ErrorCode::DbExecutionError
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
