use anyhow::{Context, Result};
use clap::Parser;
use nl2sql_copilot::db::DbAdapter;
use nl2sql_copilot::llm::ClarifyAnswers;
use nl2sql_copilot::{
    OpenAiProvider, PipelineConfig, PipelineFactory, PipelineRequest, SqliteAdapter, StageDeps,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nl2sql")]
#[command(about = "Answer a natural-language question with a safe, verified SQL query")]
struct Args {
    /// The question in natural language
    question: String,

    /// SQLite database to run the query against (read-only)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Pipeline config file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Schema preview text; read from the database when omitted
    #[arg(long)]
    schema_preview: Option<String>,

    /// Clarification answer as key=value, repeatable
    #[arg(long = "clarify", value_parser = parse_clarify)]
    clarify: Vec<(String, serde_json::Value)>,
}

/// `key=value`; the value is read as JSON when it parses, else as a string
fn parse_clarify(raw: &str) -> std::result::Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err("clarification key must not be empty".to_string());
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    info!("NL2SQL starting...");
    info!("Question: {}", args.question);

    let mut config =
        PipelineConfig::load(args.config.as_deref()).context("loading pipeline config")?;

    let llm = Arc::new(OpenAiProvider::from_env(config.llm.clone())?);
    let mut deps = StageDeps::new().with_llm(llm);

    let schema_preview = match &args.db {
        Some(path) => {
            let adapter = Arc::new(SqliteAdapter::open(path)?);
            let preview = match &args.schema_preview {
                Some(preview) => preview.clone(),
                None => adapter.schema_preview().await?,
            };
            deps = deps.with_db(adapter);
            preview
        }
        None => {
            warn!("No database given, SQL will be generated but not executed");
            config.executor = "noop".to_string();
            args.schema_preview.clone().unwrap_or_default()
        }
    };

    let pipeline = PipelineFactory::default().from_config(&config, &deps)?;
    let request = PipelineRequest::new(args.question, schema_preview)
        .with_clarify_answers(args.clarify.into_iter().collect::<ClarifyAnswers>());

    let result = pipeline.run(&request).await;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if result.error {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_clarify_json_and_string_values() {
        assert_eq!(
            parse_clarify("limit=10").unwrap(),
            ("limit".to_string(), serde_json::json!(10))
        );
        assert_eq!(
            parse_clarify("top=by revenue").unwrap(),
            ("top".to_string(), serde_json::json!("by revenue"))
        );
        assert!(parse_clarify("novalue").is_err());
        assert!(parse_clarify("=x").is_err());
    }
}
