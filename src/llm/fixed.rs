use crate::error::{Nl2SqlError, Result};
use crate::llm::{ClarifyAnswers, LlmProvider, PlanResponse, RepairResponse, SqlResponse};
use crate::types::TokenUsage;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// Deterministic provider answering from fixed mappings.
///
/// Generation looks up the user query, repair looks up the incoming SQL.
/// SQL keys are compared with surrounding whitespace and trailing `;` removed.
/// A repair without a mapping echoes its input.
pub struct FixedProvider {
    plan_text: String,
    sql_by_query: HashMap<String, (String, String)>,
    default_sql: Option<(String, String)>,
    repairs: HashMap<String, String>,
    usage: TokenUsage,
    repair_requests: Mutex<Vec<String>>,
}

impl FixedProvider {
    pub fn new() -> Self {
        Self {
            plan_text: "Select the requested columns from the relevant table.".to_string(),
            sql_by_query: HashMap::new(),
            default_sql: None,
            repairs: HashMap::new(),
            usage: TokenUsage {
                token_in: 10,
                token_out: 5,
                cost: 0.0001,
            },
            repair_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_plan(mut self, plan: impl Into<String>) -> Self {
        self.plan_text = plan.into();
        self
    }

    pub fn with_sql(
        mut self,
        query: impl Into<String>,
        sql: impl Into<String>,
        rationale: impl Into<String>,
    ) -> Self {
        self.sql_by_query
            .insert(query.into().trim().to_lowercase(), (sql.into(), rationale.into()));
        self
    }

    /// SQL returned for any query without its own mapping
    pub fn with_default_sql(
        mut self,
        sql: impl Into<String>,
        rationale: impl Into<String>,
    ) -> Self {
        self.default_sql = Some((sql.into(), rationale.into()));
        self
    }

    pub fn with_repair(mut self, broken_sql: &str, patched_sql: impl Into<String>) -> Self {
        self.repairs.insert(sql_key(broken_sql), patched_sql.into());
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Error messages received by `repair`, in call order
    pub fn repair_requests(&self) -> Vec<String> {
        self.repair_requests
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

impl Default for FixedProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn sql_key(sql: &str) -> String {
    sql.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace()).to_string()
}

#[async_trait]
impl LlmProvider for FixedProvider {
    fn provider_id(&self) -> &str {
        "fixed"
    }

    async fn plan(&self, _user_query: &str, _schema_preview: &str) -> Result<PlanResponse> {
        Ok(PlanResponse {
            plan: self.plan_text.clone(),
            usage: self.usage,
        })
    }

    async fn generate_sql(
        &self,
        user_query: &str,
        _schema_preview: &str,
        _plan_text: &str,
        _clarify_answers: &ClarifyAnswers,
    ) -> Result<SqlResponse> {
        let (sql, rationale) = self
            .sql_by_query
            .get(&user_query.trim().to_lowercase())
            .or(self.default_sql.as_ref())
            .cloned()
            .ok_or_else(|| {
                Nl2SqlError::LlmBadOutput(format!("no canned SQL for query: {}", user_query))
            })?;

        Ok(SqlResponse {
            sql,
            rationale,
            usage: self.usage,
        })
    }

    async fn repair(
        &self,
        sql: &str,
        error_msg: &str,
        _schema_preview: &str,
    ) -> Result<RepairResponse> {
        if let Ok(mut requests) = self.repair_requests.lock() {
            requests.push(error_msg.to_string());
        }
        let patched = self
            .repairs
            .get(&sql_key(sql))
            .cloned()
            .unwrap_or_else(|| sql.to_string());
        Ok(RepairResponse {
            sql: patched,
            usage: self.usage,
        })
    }
}
