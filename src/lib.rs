//! Natural-language to SQL copilot core
//!
//! A question and a schema preview go through ambiguity detection, context
//! budgeting, planning, generation, a safety gate, execution under a cost
//! guardrail and semantic verification, with a bounded repair loop.

pub mod ambiguity;
pub mod cache;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod error_code;
pub mod executor;
pub mod llm;
pub mod observability;
pub mod pipeline;
pub mod safety;
pub mod stages;
pub mod types;
pub mod verifier;

pub use ambiguity::AmbiguityDetector;
pub use config::{LlmSettings, PipelineConfig};
pub use context::{ContextBudget, ContextEngineer, ContextPacket};
pub use db::{DbAdapter, QueryRows, SqliteAdapter};
pub use error::{Nl2SqlError, Result};
pub use error_code::{ErrorCode, ErrorDescriptor};
pub use executor::Executor;
pub use llm::{FixedProvider, LlmProvider, OpenAiProvider};
pub use pipeline::{
    Pipeline, PipelineBuilder, PipelineFactory, PipelineRequest, StageDeps, StageRegistry,
};
pub use safety::{SafeSql, SafetyFilter};
pub use types::{FinalResult, Outcome, StageName, StageTrace};
pub use verifier::Verifier;
