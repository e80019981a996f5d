use crate::error_code::ErrorCode;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Nl2SqlError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("LLM timed out after {0:?}")]
    LlmTimeout(Duration),

    #[error("LLM returned unusable output: {0}")]
    LlmBadOutput(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Database is locked: {0}")]
    DbLocked(String),

    #[error("Database timed out after {0:?}")]
    DbTimeout(Duration),

    #[error("Statement rejected by adapter: {0}")]
    DbRejected(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Nl2SqlError {
    /// Map into the exported taxonomy
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Nl2SqlError::LlmTimeout(_) => ErrorCode::LlmTimeout,
            Nl2SqlError::LlmBadOutput(_) | Nl2SqlError::Json(_) => ErrorCode::LlmBadOutput,
            Nl2SqlError::Llm(_) => ErrorCode::LlmUnavailable,
            Nl2SqlError::DbLocked(_) => ErrorCode::DbLocked,
            Nl2SqlError::DbTimeout(_) => ErrorCode::DbTimeout,
            Nl2SqlError::DbRejected(_) => ErrorCode::SafetyNonSelect,
            Nl2SqlError::Database(msg) => ErrorCode::classify_db_message(msg),
            Nl2SqlError::Config(_) | Nl2SqlError::Io(_) => ErrorCode::PipelineCrash,
        }
    }
}

pub type Result<T> = std::result::Result<T, Nl2SqlError>;
