use crate::error::Nl2SqlError;
use crate::llm::{ClarifyAnswers, LlmProvider};
use crate::stages::{failure_from, with_llm_timeout, GenerateStage, GeneratedSql};
use crate::types::{StageName, StageResult, StageTrace};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

lazy_static! {
    static ref FENCE: Regex = Regex::new(r"```[A-Za-z0-9_+-]*").expect("static pattern");
}

/// Leading words accepted as "this is SQL". Write statements are included so
/// that the safety filter, not the generator, reports them.
const STATEMENT_KEYWORDS: &[&str] = &[
    "SELECT", "WITH", "EXPLAIN", "VALUES", "DELETE", "UPDATE", "INSERT", "DROP", "CREATE", "ALTER",
    "ATTACH", "DETACH", "PRAGMA", "REINDEX", "VACUUM", "REPLACE", "GRANT", "REVOKE", "EXECUTE",
    "TRIGGER", "BEGIN", "COMMIT", "ROLLBACK",
];

pub struct Generator {
    llm: Arc<dyn LlmProvider>,
    timeout: Duration,
}

impl Generator {
    pub fn new(llm: Arc<dyn LlmProvider>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }
}

/// Fence-stripped, trimmed SQL, or the reason the output is unusable
fn validate_output(raw: &str) -> Result<String, Nl2SqlError> {
    let sql = FENCE.replace_all(raw, " ").trim().to_string();
    if sql.is_empty() {
        return Err(Nl2SqlError::LlmBadOutput("Generator produced empty SQL".to_string()));
    }
    let keyword = leading_keyword(&sql);
    if !STATEMENT_KEYWORDS.contains(&keyword.as_str()) {
        let head: String = sql.chars().take(80).collect();
        return Err(Nl2SqlError::LlmBadOutput(format!(
            "Generator output is not a SQL statement: {}",
            head
        )));
    }
    Ok(sql)
}

fn leading_keyword(sql: &str) -> String {
    let mut rest = sql.trim_start();
    loop {
        if let Some(r) = rest.strip_prefix("--") {
            rest = r.split_once('\n').map(|(_, tail)| tail).unwrap_or("").trim_start();
        } else if let Some(r) = rest.strip_prefix("/*") {
            rest = r.split_once("*/").map(|(_, tail)| tail).unwrap_or("").trim_start();
        } else if let Some(r) = rest.strip_prefix('(') {
            rest = r.trim_start();
        } else {
            break;
        }
    }
    rest.chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_uppercase()
}

#[async_trait]
impl GenerateStage for Generator {
    async fn generate(
        &self,
        user_query: &str,
        schema_preview: &str,
        plan_text: &str,
        clarify_answers: &ClarifyAnswers,
    ) -> StageResult<GeneratedSql> {
        let started = Instant::now();
        let call = self
            .llm
            .generate_sql(user_query, schema_preview, plan_text, clarify_answers);

        let reply = match with_llm_timeout(self.timeout, call).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Generator failed: {}", e);
                return StageResult::failure(failure_from("Generator failed", e), None);
            }
        };

        let sql = match validate_output(&reply.sql) {
            Ok(sql) => sql,
            Err(e) => {
                warn!("Generator contract violation: {}", e);
                return StageResult::failure(failure_from("Generator contract violation", e), None);
            }
        };

        debug!("Generated SQL: {}", sql);
        let trace = StageTrace::new(StageName::Generator, started.elapsed())
            .with_usage(reply.usage)
            .with_note("rationale_len", reply.rationale.len());

        StageResult::success(
            GeneratedSql {
                sql,
                rationale: reply.rationale,
            },
            trace,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_code::ErrorCode;
    use crate::llm::FixedProvider;

    fn generator(sql: &str) -> Generator {
        Generator::new(
            Arc::new(FixedProvider::new().with_default_sql(sql, "because")),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_generate_success_has_trace() {
        let result = generator("```sql\nSELECT * FROM users;\n```")
            .generate("q", "users(id)", "plan", &ClarifyAnswers::new())
            .await;
        let data = result.data().unwrap();
        assert_eq!(data.sql, "SELECT * FROM users;");
        assert_eq!(data.rationale, "because");
        assert_eq!(
            result.trace().unwrap().note("rationale_len"),
            Some(&serde_json::json!(7))
        );
    }

    #[tokio::test]
    async fn test_prose_is_bad_output_without_trace() {
        let result = generator("I could not work that out")
            .generate("q", "", "", &ClarifyAnswers::new())
            .await;
        assert!(!result.is_ok());
        assert!(result.trace().is_none());
        assert_eq!(result.error_code(), Some(ErrorCode::LlmBadOutput));
    }

    #[tokio::test]
    async fn test_empty_sql_is_bad_output() {
        let result = generator("  ").generate("q", "", "", &ClarifyAnswers::new()).await;
        assert_eq!(result.error_code(), Some(ErrorCode::LlmBadOutput));
    }

    #[tokio::test]
    async fn test_write_statement_is_left_for_safety() {
        let result = generator("DROP TABLE users;")
            .generate("q", "", "", &ClarifyAnswers::new())
            .await;
        assert!(result.is_ok());
    }

    #[test]
    fn test_leading_keyword_skips_comments_and_parens() {
        assert_eq!(leading_keyword("-- note\n/* x */ (select 1)"), "SELECT");
        assert_eq!(leading_keyword("with x as (select 1) select * from x"), "WITH");
    }
}
