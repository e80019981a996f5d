use crate::context::schema_pack::SchemaPack;

/// Render a pack back into the `table(col1, col2)` preview format.
pub fn render_schema_pack(pack: &SchemaPack) -> String {
    pack.tables
        .iter()
        .map(|(name, table)| format!("{}({})", name, table.columns.join(", ")))
        .collect::<Vec<_>>()
        .join("\n")
}
