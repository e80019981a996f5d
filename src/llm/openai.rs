use crate::config::LlmSettings;
use crate::error::{Nl2SqlError, Result};
use crate::llm::{ClarifyAnswers, LlmProvider, PlanResponse, RepairResponse, SqlResponse};
use crate::types::TokenUsage;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

lazy_static! {
    static ref FENCE: Regex = Regex::new(r"```[A-Za-z0-9_+-]*").expect("static pattern");
}

#[derive(Debug, Deserialize)]
struct SqlReply {
    #[serde(default)]
    sql: Option<String>,
    #[serde(default)]
    rationale: Option<String>,
}

/// OpenAI-compatible chat-completions provider
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    settings: LlmSettings,
}

impl OpenAiProvider {
    pub fn new(api_key: String, settings: LlmSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            settings,
        }
    }

    /// Reads `OPENAI_API_KEY`; model and base URL come from `settings`.
    pub fn from_env(settings: LlmSettings) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Nl2SqlError::Config("OPENAI_API_KEY is not set".to_string()))?;
        Ok(Self::new(api_key, settings))
    }

    fn estimate_cost(&self, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        (prompt_tokens as f64 / 1000.0) * self.settings.price_in_per_1k
            + (completion_tokens as f64 / 1000.0) * self.settings.price_out_per_1k
    }

    async fn call_llm(&self, system: &str, prompt: &str) -> Result<(String, TokenUsage)> {
        let body = serde_json::json!({
            "model": self.settings.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt}
            ],
            "temperature": 0
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.settings.base_url.trim_end_matches('/')))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| Nl2SqlError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Nl2SqlError::Llm(format!("LLM API returned {}: {}", status, text)));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| {
                Nl2SqlError::LlmBadOutput(format!("Failed to parse LLM response: {}", e))
            })?;

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| Nl2SqlError::LlmBadOutput("No content in LLM response".to_string()))?
            .to_string();

        let prompt_tokens = response_json["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32;
        let completion_tokens =
            response_json["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32;
        let usage = TokenUsage {
            token_in: prompt_tokens,
            token_out: completion_tokens,
            cost: self.estimate_cost(prompt_tokens, completion_tokens),
        };

        debug!(
            model = %self.settings.model,
            token_in = usage.token_in,
            token_out = usage.token_out,
            "LLM call completed"
        );

        Ok((content, usage))
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn provider_id(&self) -> &str {
        "openai"
    }

    async fn plan(&self, user_query: &str, schema_preview: &str) -> Result<PlanResponse> {
        let prompt = format!("Query: {}\nSchema:\n{}", user_query, schema_preview);
        let (plan, usage) = self.call_llm("You create SQL query plans.", &prompt).await?;
        Ok(PlanResponse { plan, usage })
    }

    async fn generate_sql(
        &self,
        user_query: &str,
        schema_preview: &str,
        plan_text: &str,
        clarify_answers: &ClarifyAnswers,
    ) -> Result<SqlResponse> {
        let clarifications = serde_json::to_string(clarify_answers)?;
        let prompt = format!(
            r#"You are a precise SQL generator.
Return ONLY valid JSON with two keys: "sql" and "rationale".
Do not include any markdown, backticks, or extra text.

Example:
{{
  "sql": "SELECT * FROM singer;",
  "rationale": "The user requested to list all singers."
}}

User query: {}
Schema preview:
{}
Plan: {}
Clarifications: {}"#,
            user_query, schema_preview, plan_text, clarifications
        );

        let (content, usage) = self
            .call_llm("You convert natural language to SQL.", &prompt)
            .await?;
        let (sql, rationale) = parse_sql_reply(&content)?;
        Ok(SqlResponse {
            sql,
            rationale,
            usage,
        })
    }

    async fn repair(
        &self,
        sql: &str,
        error_msg: &str,
        schema_preview: &str,
    ) -> Result<RepairResponse> {
        let prompt = format!("SQL:\n{}\nError:\n{}\nSchema:\n{}", sql, error_msg, schema_preview);
        let (content, usage) = self
            .call_llm("You fix SQL queries keeping them SELECT-only.", &prompt)
            .await?;
        Ok(RepairResponse {
            sql: strip_fences(&content),
            usage,
        })
    }
}

/// Parse a `{"sql": ..., "rationale": ...}` reply, falling back to the
/// outermost `{...}` span when the model wraps the object in prose.
pub fn parse_sql_reply(content: &str) -> Result<(String, String)> {
    let content = strip_fences(content);
    let reply: SqlReply = match serde_json::from_str(&content) {
        Ok(reply) => reply,
        Err(_) => {
            let start = content.find('{');
            let end = content.rfind('}');
            match (start, end) {
                (Some(s), Some(e)) if s < e => serde_json::from_str(&content[s..=e]).map_err(|_| {
                    Nl2SqlError::LlmBadOutput(format!(
                        "Invalid LLM JSON output: {}",
                        preview(&content)
                    ))
                })?,
                _ => {
                    return Err(Nl2SqlError::LlmBadOutput(format!(
                        "Invalid LLM JSON output: {}",
                        preview(&content)
                    )))
                }
            }
        }
    };

    let sql = reply.sql.unwrap_or_default().trim().to_string();
    if sql.is_empty() {
        return Err(Nl2SqlError::LlmBadOutput("LLM returned empty 'sql'".to_string()));
    }
    Ok((sql, reply.rationale.unwrap_or_default()))
}

fn strip_fences(content: &str) -> String {
    FENCE.replace_all(content, "").trim().to_string()
}

fn preview(content: &str) -> String {
    content.chars().take(200).collect()
}
