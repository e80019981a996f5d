//! Schema Pack
//!
//! Deterministic, sorted view of a database schema. Built either from a
//! textual preview (`table(col1, col2, ...)` per line) or directly by a
//! database adapter.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

lazy_static! {
    static ref PREVIEW_LINE: Regex = Regex::new(
        r"^\s*(?:-\s*)?([A-Za-z_][A-Za-z0-9_]*)\s*\((.*)\)\s*$"
    )
    .expect("static pattern");
}

pub const SCHEMA_PACK_VERSION: &str = "v1";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaTable {
    /// Sorted, de-duplicated column names
    pub columns: Vec<String>,
    /// column -> "table.column"
    #[serde(default)]
    pub foreign_keys: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaPack {
    pub tables: BTreeMap<String, SchemaTable>,
    pub version: String,
}

impl Default for SchemaPack {
    fn default() -> Self {
        Self {
            tables: BTreeMap::new(),
            version: SCHEMA_PACK_VERSION.to_string(),
        }
    }
}

impl SchemaPack {
    /// Build from raw table -> columns and table -> (column, target) maps.
    /// Input order does not matter; output is sorted.
    pub fn build<I, C>(raw_tables: I, raw_fks: &BTreeMap<String, Vec<(String, String)>>) -> Self
    where
        I: IntoIterator<Item = (String, C)>,
        C: IntoIterator<Item = String>,
    {
        let mut tables = BTreeMap::new();
        for (name, cols) in raw_tables {
            let columns: BTreeSet<String> = cols.into_iter().collect();
            let foreign_keys = raw_fks
                .get(&name)
                .map(|fks| fks.iter().cloned().collect::<BTreeMap<_, _>>())
                .unwrap_or_default();
            tables.insert(
                name,
                SchemaTable {
                    columns: columns.into_iter().collect(),
                    foreign_keys,
                },
            );
        }
        Self {
            tables,
            version: SCHEMA_PACK_VERSION.to_string(),
        }
    }

    /// Parse a `table(col1, col2, ...)`-per-line preview. Lines in any other
    /// shape are skipped.
    pub fn parse_preview(schema_preview: &str) -> Self {
        let mut raw: Vec<(String, Vec<String>)> = Vec::new();

        for line in schema_preview.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some(caps) = PREVIEW_LINE.captures(line) else {
                continue;
            };
            let table = caps[1].to_string();
            let cols = caps[2]
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect();
            raw.push((table, cols));
        }

        Self::build(raw, &BTreeMap::new())
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn column_count(&self) -> usize {
        self.tables.values().map(|t| t.columns.len()).sum()
    }
}
