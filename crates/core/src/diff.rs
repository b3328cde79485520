//! Field filtering and before/after diffing for captured rows.

use crate::config::AuditConfig;
use crate::record::Row;

/// Project `row` down to its auditable columns: the configured include list
/// for `table` (in list order) when one exists, otherwise every column in
/// row order; globally excluded columns never appear.
pub fn filter_fields(row: &Row, table: &str, config: &AuditConfig) -> Row {
    let mut filtered = Row::new();
    match config.included_fields(table) {
        Some(columns) => {
            for column in columns {
                if config.exclude_fields.contains(column) {
                    continue;
                }
                if let Some(value) = row.get(column.as_str()) {
                    filtered.insert(column.clone(), value.clone());
                }
            }
        }
        None => {
            for (column, value) in row {
                if config.exclude_fields.contains(column) {
                    continue;
                }
                filtered.insert(column.clone(), value.clone());
            }
        }
    }
    filtered
}

/// The columns of `after` whose values differ structurally from `before`.
/// A column present only in `after` counts as changed. Empty when nothing
/// changed.
pub fn changed_values(before: &Row, after: &Row) -> Row {
    let mut changed = Row::new();
    for (column, value) in after {
        if before.get(column) != Some(value) {
            changed.insert(column.clone(), value.clone());
        }
    }
    changed
}
