//! Context Engineering
//!
//! Turns a raw schema preview into the budgeted schema text handed to the
//! planner and generator. The raw preview never reaches prompt construction.

pub mod budget;
pub mod render;
pub mod schema_pack;

pub use budget::{apply_budget, BudgetReason, ContextBudget};
pub use render::render_schema_pack;
pub use schema_pack::{SchemaPack, SchemaTable, SCHEMA_PACK_VERSION};

use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_CONSTRAINTS: &[&str] = &[
    "SELECT_ONLY",
    "NO_DDL_DML",
    "NO_ATTACH_PRAGMA",
    "SINGLE_STATEMENT",
    "LIMIT_REQUIRED_IF_MISSING",
];

/// Budgeted schema plus the statistics of how it was trimmed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPacket {
    pub schema_pack: SchemaPack,
    pub constraints: Vec<String>,
    pub budget: ContextBudget,
    pub tables_before: usize,
    pub columns_before: usize,
    pub tables_after: usize,
    pub columns_after: usize,
    pub budget_reason: Option<BudgetReason>,
}

impl ContextPacket {
    /// Schema text for prompts
    pub fn render(&self) -> String {
        render_schema_pack(&self.schema_pack)
    }

    pub fn was_trimmed(&self) -> bool {
        self.budget_reason.is_some()
    }

    /// Statistics as trace notes
    pub fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "tables_before": self.tables_before,
            "columns_before": self.columns_before,
            "tables_after": self.tables_after,
            "columns_after": self.columns_after,
            "budget_reason": self.budget_reason.map(|r| r.as_str()),
            "constraints": self.constraints,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ContextEngineer {
    budget: ContextBudget,
    constraints: Vec<String>,
}

impl ContextEngineer {
    pub fn new(budget: ContextBudget) -> Self {
        Self {
            budget,
            constraints: DEFAULT_CONSTRAINTS.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn budget(&self) -> &ContextBudget {
        &self.budget
    }

    pub fn build(&self, schema_preview: &str) -> ContextPacket {
        self.build_from_pack(&SchemaPack::parse_preview(schema_preview))
    }

    pub fn build_from_pack(&self, pack: &SchemaPack) -> ContextPacket {
        let (trimmed, reason) = apply_budget(pack, &self.budget);

        let packet = ContextPacket {
            tables_before: pack.table_count(),
            columns_before: pack.column_count(),
            tables_after: trimmed.table_count(),
            columns_after: trimmed.column_count(),
            schema_pack: trimmed,
            constraints: self.constraints.clone(),
            budget: self.budget,
            budget_reason: reason,
        };

        debug!(
            tables_before = packet.tables_before,
            tables_after = packet.tables_after,
            columns_before = packet.columns_before,
            columns_after = packet.columns_after,
            budget_reason = ?packet.budget_reason,
            constraints = ?packet.constraints,
            "Built context packet"
        );

        packet
    }
}

impl Default for ContextEngineer {
    fn default() -> Self {
        Self::new(ContextBudget::default())
    }
}
