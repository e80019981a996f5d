//! Pipeline assembly and execution

pub mod builder;
pub mod fingerprint;
pub mod orchestrator;

pub use builder::{PipelineBuilder, PipelineFactory, StageDeps, StageRegistry};
pub use fingerprint::request_fingerprint;
pub use orchestrator::{Pipeline, PipelineRequest, DEFAULT_MAX_REPAIR_ATTEMPTS};
