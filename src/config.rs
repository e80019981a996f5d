//! Pipeline configuration
//!
//! JSON file with every field defaulted, then environment overrides.

use crate::context::ContextBudget;
use crate::error::{Nl2SqlError, Result};
use crate::pipeline::DEFAULT_MAX_REPAIR_ATTEMPTS;
use crate::verifier::ParseFailurePolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Language-model endpoint and pricing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub model: String,
    pub base_url: String,
    /// Currency units per 1000 prompt tokens
    pub price_in_per_1k: f64,
    /// Currency units per 1000 completion tokens
    pub price_out_per_1k: f64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            price_in_per_1k: 0.00015,
            price_out_per_1k: 0.0006,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // stage implementation keys, resolved by the stage registry
    pub detector: String,
    pub planner: String,
    pub generator: String,
    pub safety: String,
    pub executor: String,
    pub verifier: String,
    pub repair: String,

    pub budget: ContextBudget,
    pub max_repair_attempts: usize,
    pub llm_timeout_ms: u64,
    pub db_timeout_ms: u64,
    pub allow_explain: bool,
    pub cost_guardrail: bool,
    pub verifier_parse_failure: ParseFailurePolicy,
    /// Zero disables the response cache
    pub cache_ttl_secs: u64,
    pub cache_max_entries: usize,
    pub llm: LlmSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            detector: "default".to_string(),
            planner: "default".to_string(),
            generator: "default".to_string(),
            safety: "default".to_string(),
            executor: "default".to_string(),
            verifier: "default".to_string(),
            repair: "default".to_string(),
            budget: ContextBudget::default(),
            max_repair_attempts: DEFAULT_MAX_REPAIR_ATTEMPTS,
            llm_timeout_ms: 30_000,
            db_timeout_ms: 5_000,
            allow_explain: false,
            cost_guardrail: false,
            verifier_parse_failure: ParseFailurePolicy::Unverified,
            cache_ttl_secs: 300,
            cache_max_entries: 1024,
            llm: LlmSettings::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from `path` when given, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                info!("Loading pipeline config from {}", path.display());
                let text = std::fs::read_to_string(path)?;
                Self::from_json(&text)
                    .map_err(|e| Nl2SqlError::Config(format!("{}: {}", path.display(), e)))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Nl2SqlError::Config(format!("invalid config: {}", e)))
    }

    /// Apply overrides from `lookup` (the process environment in `load`)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var(&lookup, "NL2SQL_MAX_REPAIR_ATTEMPTS")? {
            self.max_repair_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, "NL2SQL_LLM_TIMEOUT_MS")? {
            self.llm_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "NL2SQL_DB_TIMEOUT_MS")? {
            self.db_timeout_ms = v;
        }
        if let Some(v) = parse_flag(&lookup, "NL2SQL_ALLOW_EXPLAIN")? {
            self.allow_explain = v;
        }
        if let Some(v) = parse_flag(&lookup, "NL2SQL_COST_GUARDRAIL")? {
            self.cost_guardrail = v;
        }
        if let Some(v) = parse_var(&lookup, "NL2SQL_CACHE_TTL_SECS")? {
            self.cache_ttl_secs = v;
        }
        if let Some(model) = lookup("OPENAI_MODEL_ID").filter(|v| !v.trim().is_empty()) {
            self.llm.model = model;
        }
        if let Some(base_url) = lookup("OPENAI_BASE_URL").filter(|v| !v.trim().is_empty()) {
            self.llm.base_url = base_url;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let budget = &self.budget;
        if budget.max_tables == 0
            || budget.max_columns_per_table == 0
            || budget.max_total_columns == 0
        {
            return Err(Nl2SqlError::Config("context budget limits must be positive".to_string()));
        }
        if self.llm_timeout_ms == 0 || self.db_timeout_ms == 0 {
            return Err(Nl2SqlError::Config("timeouts must be positive".to_string()));
        }
        Ok(())
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_millis(self.llm_timeout_ms)
    }

    pub fn db_timeout(&self) -> Duration {
        Duration::from_millis(self.db_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Nl2SqlError::Config(format!("{} has an invalid value: {:?}", key, raw))),
    }
}

fn parse_flag<F>(lookup: &F, key: &str) -> Result<Option<bool>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.trim().to_lowercase()) {
        None => Ok(None),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(Nl2SqlError::Config(format!("{} must be a boolean, got {:?}", key, v))),
        },
    }
}
