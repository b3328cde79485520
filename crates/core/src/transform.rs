//! Capture transforms: raw captured rows to audit records.
//!
//! Primary-key failures on individual rows follow the strict/lenient dial:
//! strict mode propagates [`AuditError::Capture`], lenient mode reports the
//! failure through the configured error sink and drops the affected row.
//! Missing table configuration is always fatal.

use std::collections::HashMap;

use crate::config::{AuditConfig, UpdateValuesMode};
use crate::diff::{changed_values, filter_fields};
use crate::error::AuditError;
use crate::key::extract_primary_key;
use crate::record::{AuditAction, AuditRecord, Row};

/// Build one INSERT record per captured row.
pub fn insert_audit_logs(
    table: &str,
    rows: &[Row],
    config: &AuditConfig,
) -> Result<Vec<AuditRecord>, AuditError> {
    snapshot_audit_logs(AuditAction::Insert, table, rows, config)
}

/// Build one DELETE record per captured row.
pub fn delete_audit_logs(
    table: &str,
    rows: &[Row],
    config: &AuditConfig,
) -> Result<Vec<AuditRecord>, AuditError> {
    snapshot_audit_logs(AuditAction::Delete, table, rows, config)
}

/// Build UPDATE records.
///
/// In full mode, or whenever the before-state is unavailable, each `after`
/// row is recorded as a snapshot. In changed mode, `before` rows are indexed
/// by record id and each paired `after` row records only the columns whose
/// permitted values differ; an update that changes no permitted column emits
/// nothing. An `after` row with no paired before-row falls back to a
/// snapshot.
pub fn update_audit_logs(
    table: &str,
    before: &[Row],
    after: &[Row],
    config: &AuditConfig,
) -> Result<Vec<AuditRecord>, AuditError> {
    if config.update_values_mode == UpdateValuesMode::Full || before.is_empty() {
        return snapshot_audit_logs(AuditAction::Update, table, after, config);
    }

    let mut before_index: HashMap<String, &Row> = HashMap::with_capacity(before.len());
    for row in before {
        match extract_primary_key(row, table, config) {
            Ok(record_id) => {
                before_index.insert(record_id, row);
            }
            Err(err) => capture_failure(config, table, err)?,
        }
    }

    let mut records = Vec::with_capacity(after.len());
    for row in after {
        let record_id = match extract_primary_key(row, table, config) {
            Ok(record_id) => record_id,
            Err(err) => {
                capture_failure(config, table, err)?;
                continue;
            }
        };
        let values = match before_index.get(&record_id) {
            Some(before_row) => {
                let changed = changed_values(
                    &filter_fields(before_row, table, config),
                    &filter_fields(row, table, config),
                );
                if changed.is_empty() {
                    continue;
                }
                changed
            }
            None => filter_fields(row, table, config),
        };
        records.push(
            AuditRecord::new(AuditAction::Update, table, record_id).with_values(values),
        );
    }
    Ok(records)
}

/// Build one record per row with the given action and the row's filtered
/// values: the shape shared by INSERT, DELETE, and manual emission
/// (including READ and caller-supplied actions).
pub fn snapshot_audit_logs(
    action: AuditAction,
    table: &str,
    rows: &[Row],
    config: &AuditConfig,
) -> Result<Vec<AuditRecord>, AuditError> {
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let record_id = match extract_primary_key(row, table, config) {
            Ok(record_id) => record_id,
            Err(err) => {
                capture_failure(config, table, err)?;
                continue;
            }
        };
        records.push(
            AuditRecord::new(action.clone(), table, record_id)
                .with_values(filter_fields(row, table, config)),
        );
    }
    Ok(records)
}

/// Apply the error policy to a per-row capture failure. Configuration
/// errors always propagate.
fn capture_failure(config: &AuditConfig, table: &str, err: AuditError) -> Result<(), AuditError> {
    if config.strict_mode || matches!(err, AuditError::Configuration(_)) {
        return Err(err);
    }
    (config.log_error)(
        &format!("[AUDIT] dropping unrecordable row for table {table}"),
        &err,
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpdateValuesMode;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn row(value: serde_json::Value) -> Row {
        match value {
            serde_json::Value::Object(map) => map,
            _ => unreachable!("test rows are objects"),
        }
    }

    fn users_config(mode: UpdateValuesMode) -> AuditConfig {
        AuditConfig::builder()
            .table("users", "id")
            .update_values_mode(mode)
            .build()
            .unwrap()
    }

    #[test]
    fn insert_emits_one_record_per_row_with_filtered_values() {
        let config = users_config(UpdateValuesMode::Changed);
        let rows = vec![
            row(json!({"id": 1, "email": "a@x", "password": "pw"})),
            row(json!({"id": 2, "email": "b@x", "password": "pw"})),
        ];
        let records = insert_audit_logs("users", &rows, &config).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].action, AuditAction::Insert);
        assert_eq!(records[0].record_id, "1");
        assert_eq!(records[1].record_id, "2");
        let values = records[0].values.as_ref().unwrap();
        assert_eq!(values["email"], json!("a@x"));
        assert!(!values.contains_key("password"));
    }

    #[test]
    fn delete_records_the_removed_values() {
        let config = users_config(UpdateValuesMode::Changed);
        let rows = vec![row(json!({"id": 9, "email": "x@x", "name": "X"}))];
        let records = delete_audit_logs("users", &rows, &config).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, AuditAction::Delete);
        let values = records[0].values.as_ref().unwrap();
        assert_eq!(values["email"], json!("x@x"));
        assert_eq!(values["name"], json!("X"));
    }

    #[test]
    fn changed_mode_records_only_the_diff() {
        let config = users_config(UpdateValuesMode::Changed);
        let before = vec![row(json!({"id": 1, "email": "o@x", "name": "Original"}))];
        let after = vec![row(json!({"id": 1, "email": "o@x", "name": "Updated"}))];
        let records = update_audit_logs("users", &before, &after, &config).unwrap();
        assert_eq!(records.len(), 1);
        let values = records[0].values.as_ref().unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values["name"], json!("Updated"));
    }

    #[test]
    fn changed_mode_with_no_permitted_change_emits_nothing() {
        let config = AuditConfig::builder()
            .table("users", "id")
            .fields("users", ["name"])
            .build()
            .unwrap();
        let before = vec![row(json!({"id": 1, "name": "Same", "email": "o@x"}))];
        let after = vec![row(json!({"id": 1, "name": "Same", "email": "n@x"}))];
        let records = update_audit_logs("users", &before, &after, &config).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn full_mode_records_the_whole_row() {
        let config = users_config(UpdateValuesMode::Full);
        let before = vec![row(json!({"id": 1, "email": "o@x", "name": "Original"}))];
        let after = vec![row(json!({"id": 1, "email": "o@x", "name": "Updated"}))];
        let records = update_audit_logs("users", &before, &after, &config).unwrap();
        let values = records[0].values.as_ref().unwrap();
        assert_eq!(values["email"], json!("o@x"));
        assert_eq!(values["name"], json!("Updated"));
    }

    #[test]
    fn missing_before_state_falls_back_to_snapshots() {
        let config = users_config(UpdateValuesMode::Changed);
        let after = vec![row(json!({"id": 1, "email": "o@x", "name": "Updated"}))];
        let records = update_audit_logs("users", &[], &after, &config).unwrap();
        let values = records[0].values.as_ref().unwrap();
        assert_eq!(values["email"], json!("o@x"));
    }

    #[test]
    fn unpaired_after_row_falls_back_to_a_snapshot() {
        let config = users_config(UpdateValuesMode::Changed);
        let before = vec![row(json!({"id": 1, "name": "A"}))];
        let after = vec![
            row(json!({"id": 1, "name": "A2"})),
            row(json!({"id": 2, "name": "B", "email": "b@x"})),
        ];
        let records = update_audit_logs("users", &before, &after, &config).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].values.as_ref().unwrap().len(), 1);
        let snapshot = records[1].values.as_ref().unwrap();
        assert_eq!(snapshot["email"], json!("b@x"));
    }

    #[test]
    fn strict_mode_propagates_capture_failures() {
        let config = AuditConfig::builder()
            .table("users", "id")
            .strict_mode(true)
            .build()
            .unwrap();
        let rows = vec![row(json!({"email": "no-id@x"}))];
        let err = insert_audit_logs("users", &rows, &config).unwrap_err();
        assert!(matches!(err, AuditError::Capture(_)));
    }

    #[test]
    fn lenient_mode_logs_and_drops_the_bad_row() {
        let reported: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&reported);
        let config = AuditConfig::builder()
            .table("users", "id")
            .log_error(move |message, _| seen.lock().unwrap().push(message.to_owned()))
            .build()
            .unwrap();

        let rows = vec![
            row(json!({"email": "no-id@x"})),
            row(json!({"id": 2, "email": "b@x"})),
        ];
        let records = insert_audit_logs("users", &rows, &config).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record_id, "2");

        let messages = reported.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("[AUDIT]"));
    }

    #[test]
    fn unconfigured_table_is_fatal_even_in_lenient_mode() {
        let config = users_config(UpdateValuesMode::Changed);
        let rows = vec![row(json!({"id": 1}))];
        let err = insert_audit_logs("orders", &rows, &config).unwrap_err();
        assert!(matches!(err, AuditError::Configuration(_)));
    }
}
