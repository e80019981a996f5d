//! Language-model provider contract
//!
//! Planner, Generator and Repair stages only see [`LlmProvider`]. The HTTP
//! provider lives in [`openai`]; [`fixed`] is a canned-answer provider for
//! tests and offline runs.

pub mod fixed;
pub mod openai;

pub use fixed::FixedProvider;
pub use openai::OpenAiProvider;

use crate::error::Result;
use crate::types::TokenUsage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Answers the user gave to earlier clarification questions
pub type ClarifyAnswers = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResponse {
    pub plan: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlResponse {
    pub sql: String,
    pub rationale: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairResponse {
    pub sql: String,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn provider_id(&self) -> &str;

    async fn plan(&self, user_query: &str, schema_preview: &str) -> Result<PlanResponse>;

    async fn generate_sql(
        &self,
        user_query: &str,
        schema_preview: &str,
        plan_text: &str,
        clarify_answers: &ClarifyAnswers,
    ) -> Result<SqlResponse>;

    async fn repair(
        &self,
        sql: &str,
        error_msg: &str,
        schema_preview: &str,
    ) -> Result<RepairResponse>;
}
