use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A captured database row, keyed by column name in insertion order.
pub type Row = serde_json::Map<String, Value>;

/// The kind of mutation (or access) an audit record describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum AuditAction {
    Insert,
    Update,
    Delete,
    Read,
    /// A caller-supplied action string for manual emission.
    Other(String),
}

impl AuditAction {
    /// The wire representation persisted in the `action` column.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Read => "READ",
            Self::Other(action) => action,
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<AuditAction> for String {
    fn from(action: AuditAction) -> Self {
        action.as_str().to_owned()
    }
}

impl From<String> for AuditAction {
    fn from(action: String) -> Self {
        match action.as_str() {
            "INSERT" => Self::Insert,
            "UPDATE" => Self::Update,
            "DELETE" => Self::Delete,
            "READ" => Self::Read,
            _ => Self::Other(action),
        }
    }
}

/// An in-memory description of a single row-level mutation awaiting
/// persistence.
///
/// Records are produced by the capture transforms (or manual logging calls)
/// and carry no ambient context; context is attached when the record is
/// enqueued on the writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub action: AuditAction,
    pub table_name: String,
    /// Stringified primary key of the affected row. Never empty.
    pub record_id: String,
    /// The captured column values, already filtered and redacted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Row>,
    /// Per-record metadata supplied by the caller on manual emission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Row>,
}

impl AuditRecord {
    pub fn new(
        action: AuditAction,
        table_name: impl Into<String>,
        record_id: impl Into<String>,
    ) -> Self {
        Self {
            action,
            table_name: table_name.into(),
            record_id: record_id.into(),
            values: None,
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_values(mut self, values: Row) -> Self {
        self.values = Some(values);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Row) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A fully resolved audit row as handed to a sink: the record plus the
/// context snapshot that was in effect when it was enqueued.
///
/// `id` and `created_at` are stamped client-side at enqueue time so that
/// persisted timestamps reflect capture order rather than flush time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    pub action: AuditAction,
    pub table_name: String,
    pub record_id: String,
    /// Captured values as a JSON object, or `None` (persisted as SQL NULL).
    #[serde(default)]
    pub values: Option<Value>,
    /// Merged metadata as a JSON object, or `None` (persisted as SQL NULL).
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_wire_strings() {
        assert_eq!(AuditAction::Insert.as_str(), "INSERT");
        assert_eq!(AuditAction::Delete.as_str(), "DELETE");
        assert_eq!(AuditAction::Other("ARCHIVE".to_owned()).as_str(), "ARCHIVE");
    }

    #[test]
    fn action_roundtrips_through_string() {
        for action in [
            AuditAction::Insert,
            AuditAction::Update,
            AuditAction::Delete,
            AuditAction::Read,
            AuditAction::Other("EXPORT".to_owned()),
        ] {
            let wire = String::from(action.clone());
            assert_eq!(AuditAction::from(wire), action);
        }
    }

    #[test]
    fn record_builders_attach_optional_parts() {
        let mut values = Row::new();
        values.insert("email".to_owned(), serde_json::json!("a@x"));

        let record = AuditRecord::new(AuditAction::Insert, "users", "1").with_values(values);
        assert_eq!(record.table_name, "users");
        assert_eq!(record.record_id, "1");
        assert!(record.values.is_some());
        assert!(record.metadata.is_none());
    }
}
