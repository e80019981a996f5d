//! Database adapter contract
//!
//! The executor talks to a database only through [`DbAdapter`]. Adapters
//! reject anything that is not a read-only query, independently of the
//! safety filter.

pub mod registry;
pub mod sqlite;

pub use registry::DbRegistry;
pub use sqlite::SqliteAdapter;

use crate::context::{render_schema_pack, SchemaPack};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result set of a query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl QueryRows {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
pub trait DbAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn dialect(&self) -> &str;

    /// Run a read-only statement
    async fn execute(&self, sql: &str) -> Result<QueryRows>;

    /// Query plan lines, or `None` when the adapter has no plan capability
    async fn explain_query_plan(&self, _sql: &str) -> Result<Option<Vec<String>>> {
        Ok(None)
    }

    async fn describe_schema(&self) -> Result<SchemaPack>;

    /// `table(col1, col2, ...)`-per-line rendering of the schema
    async fn schema_preview(&self) -> Result<String> {
        let pack = self.describe_schema().await?;
        Ok(render_schema_pack(&pack))
    }
}
