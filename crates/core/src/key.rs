//! Primary-key extraction and deterministic key encoding.
//!
//! A record id must be a stable, non-empty string: single keys stringify
//! directly, composite keys serialize as an ordered JSON object. The
//! encoder normalizes values first so that identity survives lossy JSON
//! consumers: integers at or beyond the double-precision safe bound become
//! decimal strings, and nesting past [`MAX_KEY_DEPTH`] is replaced by the
//! `"[Circular]"` sentinel. Timestamps arrive from the driver as RFC 3339
//! strings and pass through unchanged.

use serde_json::Value;

use crate::config::AuditConfig;
use crate::error::AuditError;
use crate::record::Row;

/// Nesting depth at which key encoding cuts off.
pub const MAX_KEY_DEPTH: usize = 64;

/// Smallest integer magnitude no longer exactly representable alongside its
/// neighbors in an IEEE 754 double.
const SAFE_INTEGER_BOUND: u64 = 9_007_199_254_740_991;

const CIRCULAR_SENTINEL: &str = "[Circular]";

/// Derive the stringified primary key of `row` in `table`.
///
/// Fails with [`AuditError::Configuration`] when no primary key is
/// configured for the table, and with [`AuditError::Capture`] when the row
/// is missing (or has `null` in) a configured key column.
pub fn extract_primary_key(
    row: &Row,
    table: &str,
    config: &AuditConfig,
) -> Result<String, AuditError> {
    let Some(primary_key) = config.primary_key(table) else {
        return Err(AuditError::Configuration(format!(
            "primary key required for table {table}"
        )));
    };

    let keys = primary_key.columns();
    let mut pairs: Vec<(&String, &Value)> = Vec::with_capacity(keys.len());
    for key in keys {
        match row.get(key.as_str()) {
            None | Some(Value::Null) => {
                return Err(AuditError::Capture(format!(
                    "row missing configured primary key field(s) for table {table}"
                )));
            }
            Some(value) => pairs.push((key, value)),
        }
    }

    if let [(_, value)] = pairs.as_slice() {
        let key = key_component(value);
        if key.is_empty() {
            return Err(AuditError::Capture(format!(
                "row has an empty primary key for table {table}"
            )));
        }
        return Ok(key);
    }

    let composite: Row = pairs
        .iter()
        .map(|(key, value)| ((*key).clone(), normalize_key_value(value, 0)))
        .collect();
    match serde_json::to_string(&composite) {
        Ok(encoded) => Ok(encoded),
        Err(_) => Ok(fallback_key(keys)),
    }
}

/// Encode an arbitrary value through the normalizing key encoder.
pub fn encode_key_value(value: &Value) -> Result<String, AuditError> {
    serde_json::to_string(&normalize_key_value(value, 0))
        .map_err(|e| AuditError::Serialization(e.to_string()))
}

/// Stringify a single-column key the way the row presented it.
fn key_component(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(_) => match normalize_key_value(value, 0) {
            Value::String(s) => s,
            normalized => normalized.to_string(),
        },
        other => encode_key_value(other).unwrap_or_else(|_| fallback_key(&[])),
    }
}

fn normalize_key_value(value: &Value, depth: usize) -> Value {
    if depth >= MAX_KEY_DEPTH {
        return Value::String(CIRCULAR_SENTINEL.to_owned());
    }
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if i.unsigned_abs() >= SAFE_INTEGER_BOUND {
                    return Value::String(i.to_string());
                }
            } else if let Some(u) = n.as_u64() {
                if u >= SAFE_INTEGER_BOUND {
                    return Value::String(u.to_string());
                }
            }
            value.clone()
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, nested)| (key.clone(), normalize_key_value(nested, depth + 1)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| normalize_key_value(item, depth + 1))
                .collect(),
        ),
        _ => value.clone(),
    }
}

/// Stable but lossy key used when the primary encoder fails: identifies the
/// row's key-set without its values.
fn fallback_key(keys: &[String]) -> String {
    let mut sorted: Vec<&str> = keys.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    format!("composite_key_{}_{}", sorted.join("_"), keys.len())
}
