use crate::context::schema_pack::{SchemaPack, SchemaTable};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Caps on how much schema reaches the language model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextBudget {
    pub max_tables: usize,
    pub max_columns_per_table: usize,
    pub max_total_columns: usize,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            max_tables: 12,
            max_columns_per_table: 24,
            max_total_columns: 200,
        }
    }
}

/// First trimming step that fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetReason {
    TablesPruned,
    ColumnsTrimmedPerTable,
    ColumnsTrimmedTotalCap,
}

impl BudgetReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetReason::TablesPruned => "tables_pruned",
            BudgetReason::ColumnsTrimmedPerTable => "columns_trimmed_per_table",
            BudgetReason::ColumnsTrimmedTotalCap => "columns_trimmed_total_cap",
        }
    }
}

impl fmt::Display for BudgetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Apply `budget` to `pack`.
///
/// Tables are kept in alphabetical order, each table's columns are cut to the
/// per-table cap, and if the total still exceeds the global cap the remaining
/// allowance is handed out table by table in sorted order.
pub fn apply_budget(
    pack: &SchemaPack,
    budget: &ContextBudget,
) -> (SchemaPack, Option<BudgetReason>) {
    let mut reason: Option<BudgetReason> = None;

    if pack.tables.len() > budget.max_tables {
        reason = Some(BudgetReason::TablesPruned);
    }

    let mut tables: BTreeMap<String, SchemaTable> = BTreeMap::new();
    for (name, table) in pack.tables.iter().take(budget.max_tables) {
        if table.columns.len() > budget.max_columns_per_table {
            reason.get_or_insert(BudgetReason::ColumnsTrimmedPerTable);
        }
        tables.insert(
            name.clone(),
            SchemaTable {
                columns: table.columns.iter().take(budget.max_columns_per_table).cloned().collect(),
                foreign_keys: table.foreign_keys.clone(),
            },
        );
    }

    let total: usize = tables.values().map(|t| t.columns.len()).sum();
    if total > budget.max_total_columns {
        reason.get_or_insert(BudgetReason::ColumnsTrimmedTotalCap);
        let mut remaining = budget.max_total_columns;
        for table in tables.values_mut() {
            let keep = table.columns.len().min(remaining);
            table.columns.truncate(keep);
            remaining -= keep;
        }
    }

    (
        SchemaPack {
            tables,
            version: pack.version.clone(),
        },
        reason,
    )
}
