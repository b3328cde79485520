//! Logger configuration: audited tables, field rules, writer tuning, and
//! ambient context extractors.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::AuditError;
use crate::record::Row;

/// Default redacted column names.
pub const DEFAULT_EXCLUDE_FIELDS: [&str; 4] = ["password", "token", "secret", "apiKey"];
/// Default audit table name.
pub const DEFAULT_AUDIT_TABLE: &str = "audit_logs";
/// Default number of records per flush batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;
/// Default cadence of the periodic flusher.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
/// Default queue capacity.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 10_000;

/// Extractor for the acting principal, consulted when no scoped context
/// supplies one.
pub type UserIdFn = Arc<dyn Fn() -> Option<String> + Send + Sync>;
/// Extractor for ambient metadata merged under scoped and per-record
/// metadata.
pub type MetadataFn = Arc<dyn Fn() -> Option<Row> + Send + Sync>;
/// Sink for non-fatal errors (lenient-mode drops, background flush
/// failures).
pub type ErrorSinkFn = Arc<dyn Fn(&str, &AuditError) + Send + Sync>;

/// Which tables are audited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tables {
    /// Audit every table except the audit table itself.
    All,
    /// Audit exactly the listed tables, in configuration order.
    Only(Vec<String>),
}

/// Primary key specification for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKey {
    Single(String),
    Composite(Vec<String>),
}

impl PrimaryKey {
    /// The key columns as an ordered list (a single key lifts to a list of
    /// one).
    pub fn columns(&self) -> &[String] {
        match self {
            Self::Single(column) => std::slice::from_ref(column),
            Self::Composite(columns) => columns,
        }
    }
}

impl From<&str> for PrimaryKey {
    fn from(column: &str) -> Self {
        Self::Single(column.to_owned())
    }
}

impl From<String> for PrimaryKey {
    fn from(column: String) -> Self {
        Self::Single(column)
    }
}

impl From<Vec<String>> for PrimaryKey {
    fn from(columns: Vec<String>) -> Self {
        Self::Composite(columns)
    }
}

impl<const N: usize> From<[&str; N]> for PrimaryKey {
    fn from(columns: [&str; N]) -> Self {
        Self::Composite(columns.iter().map(|c| (*c).to_owned()).collect())
    }
}

/// Per-table audit settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    pub primary_key: PrimaryKey,
}

impl TableConfig {
    pub fn new(primary_key: impl Into<PrimaryKey>) -> Self {
        Self {
            primary_key: primary_key.into(),
        }
    }
}

/// Policy for what an UPDATE records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateValuesMode {
    /// Record the full post-update row.
    Full,
    /// Record only the columns whose values changed.
    #[default]
    Changed,
}

/// Column names of the audit table. Remappable; defaults match the
/// documented schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMap {
    pub id: String,
    pub user_id: String,
    pub ip_address: String,
    pub user_agent: String,
    pub action: String,
    pub table_name: String,
    pub record_id: String,
    pub values: String,
    pub metadata: String,
    pub transaction_id: String,
    pub created_at: String,
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self {
            id: "id".to_owned(),
            user_id: "user_id".to_owned(),
            ip_address: "ip_address".to_owned(),
            user_agent: "user_agent".to_owned(),
            action: "action".to_owned(),
            table_name: "table_name".to_owned(),
            record_id: "record_id".to_owned(),
            values: "values".to_owned(),
            metadata: "metadata".to_owned(),
            transaction_id: "transaction_id".to_owned(),
            created_at: "created_at".to_owned(),
        }
    }
}

/// Normalized audit logger configuration.
///
/// Build one with [`AuditConfig::builder`]; [`AuditConfigBuilder::build`]
/// validates it.
#[derive(Clone)]
pub struct AuditConfig {
    /// Audited tables: wildcard or an ordered allowlist.
    pub tables: Tables,
    /// Per-table include lists; a table without an entry captures all
    /// columns.
    pub fields: HashMap<String, Vec<String>>,
    /// Column names filtered out of every capture.
    pub exclude_fields: HashSet<String>,
    /// Target audit table name.
    pub audit_table: String,
    /// Whether failures propagate to callers (strict) or are logged
    /// (lenient).
    pub strict_mode: bool,
    /// Whether callers await persistence of the flush their enqueue
    /// triggered.
    pub wait_for_write: bool,
    /// Records per flush batch.
    pub batch_size: usize,
    /// Cadence of the periodic flusher.
    pub flush_interval: Duration,
    /// Queue capacity; excess enqueues fail (strict) or drop (lenient).
    pub max_queue_size: usize,
    /// Full-row or changed-columns recording for UPDATEs.
    pub update_values_mode: UpdateValuesMode,
    /// Per-table primary key configuration.
    pub table_config: HashMap<String, TableConfig>,
    /// Audit table column names.
    pub columns: ColumnMap,
    /// Ambient principal extractor.
    pub get_user_id: Option<UserIdFn>,
    /// Ambient metadata extractor.
    pub get_metadata: Option<MetadataFn>,
    /// Non-fatal error sink.
    pub log_error: ErrorSinkFn,
}

impl std::fmt::Debug for AuditConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditConfig")
            .field("tables", &self.tables)
            .field("fields", &self.fields)
            .field("exclude_fields", &self.exclude_fields)
            .field("audit_table", &self.audit_table)
            .field("strict_mode", &self.strict_mode)
            .field("wait_for_write", &self.wait_for_write)
            .field("batch_size", &self.batch_size)
            .field("flush_interval", &self.flush_interval)
            .field("max_queue_size", &self.max_queue_size)
            .field("update_values_mode", &self.update_values_mode)
            .field("table_config", &self.table_config)
            .field("columns", &self.columns)
            .finish_non_exhaustive()
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            tables: Tables::Only(Vec::new()),
            fields: HashMap::new(),
            exclude_fields: DEFAULT_EXCLUDE_FIELDS
                .iter()
                .map(|f| (*f).to_owned())
                .collect(),
            audit_table: DEFAULT_AUDIT_TABLE.to_owned(),
            strict_mode: false,
            wait_for_write: false,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            update_values_mode: UpdateValuesMode::default(),
            table_config: HashMap::new(),
            columns: ColumnMap::default(),
            get_user_id: None,
            get_metadata: None,
            log_error: Arc::new(|message, err| error!(error = %err, "{message}")),
        }
    }
}

impl AuditConfig {
    pub fn builder() -> AuditConfigBuilder {
        AuditConfigBuilder::new()
    }

    /// Whether mutations on `table` are audited. The audit table itself
    /// never is.
    pub fn should_audit(&self, table: &str) -> bool {
        if table == self.audit_table {
            return false;
        }
        match &self.tables {
            Tables::All => true,
            Tables::Only(tables) => tables.iter().any(|t| t == table),
        }
    }

    /// The configured primary key for `table`, if any.
    pub fn primary_key(&self, table: &str) -> Option<&PrimaryKey> {
        self.table_config.get(table).map(|c| &c.primary_key)
    }

    /// The configured include list for `table`, if any.
    pub fn included_fields(&self, table: &str) -> Option<&[String]> {
        self.fields.get(table).map(Vec::as_slice)
    }

    /// Validate tuning parameters and the table allowlist.
    pub fn validate(&self) -> Result<(), AuditError> {
        if self.batch_size == 0 {
            return Err(AuditError::Configuration(
                "batch_size must be at least 1".to_owned(),
            ));
        }
        if self.max_queue_size == 0 {
            return Err(AuditError::Configuration(
                "max_queue_size must be at least 1".to_owned(),
            ));
        }
        if self.flush_interval.is_zero() {
            return Err(AuditError::Configuration(
                "flush_interval must be non-zero".to_owned(),
            ));
        }
        if self.audit_table.is_empty() {
            return Err(AuditError::Configuration(
                "audit_table must not be empty".to_owned(),
            ));
        }
        if let Tables::Only(tables) = &self.tables {
            for table in tables {
                if table == &self.audit_table {
                    return Err(AuditError::Configuration(format!(
                        "audit table {table} cannot itself be audited"
                    )));
                }
                if !self.table_config.contains_key(table) {
                    return Err(AuditError::Configuration(format!(
                        "primary key required for table {table}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Builder for [`AuditConfig`].
pub struct AuditConfigBuilder {
    config: AuditConfig,
}

impl AuditConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AuditConfig::default(),
        }
    }

    /// Audit `table` with the given primary key. Adds the table to the
    /// allowlist unless wildcard auditing is enabled.
    #[must_use]
    pub fn table(mut self, table: impl Into<String>, primary_key: impl Into<PrimaryKey>) -> Self {
        let table = table.into();
        if let Tables::Only(tables) = &mut self.config.tables {
            if !tables.contains(&table) {
                tables.push(table.clone());
            }
        }
        self.config
            .table_config
            .insert(table, TableConfig::new(primary_key));
        self
    }

    /// Audit every table. Primary keys still come from [`Self::table`]
    /// entries.
    #[must_use]
    pub fn all_tables(mut self) -> Self {
        self.config.tables = Tables::All;
        self
    }

    /// Capture only the listed columns of `table`.
    #[must_use]
    pub fn fields<I, S>(mut self, table: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config
            .fields
            .insert(table.into(), columns.into_iter().map(Into::into).collect());
        self
    }

    /// Replace the globally redacted column set.
    #[must_use]
    pub fn exclude_fields<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.exclude_fields = columns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn audit_table(mut self, table: impl Into<String>) -> Self {
        self.config.audit_table = table.into();
        self
    }

    #[must_use]
    pub fn strict_mode(mut self, strict: bool) -> Self {
        self.config.strict_mode = strict;
        self
    }

    #[must_use]
    pub fn wait_for_write(mut self, wait: bool) -> Self {
        self.config.wait_for_write = wait;
        self
    }

    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval = interval;
        self
    }

    #[must_use]
    pub fn max_queue_size(mut self, capacity: usize) -> Self {
        self.config.max_queue_size = capacity;
        self
    }

    #[must_use]
    pub fn update_values_mode(mut self, mode: UpdateValuesMode) -> Self {
        self.config.update_values_mode = mode;
        self
    }

    #[must_use]
    pub fn columns(mut self, columns: ColumnMap) -> Self {
        self.config.columns = columns;
        self
    }

    #[must_use]
    pub fn get_user_id(mut self, get: impl Fn() -> Option<String> + Send + Sync + 'static) -> Self {
        self.config.get_user_id = Some(Arc::new(get));
        self
    }

    #[must_use]
    pub fn get_metadata(mut self, get: impl Fn() -> Option<Row> + Send + Sync + 'static) -> Self {
        self.config.get_metadata = Some(Arc::new(get));
        self
    }

    #[must_use]
    pub fn log_error(mut self, sink: impl Fn(&str, &AuditError) + Send + Sync + 'static) -> Self {
        self.config.log_error = Arc::new(sink);
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<AuditConfig, AuditError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for AuditConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AuditConfig::default();
        assert_eq!(config.audit_table, "audit_logs");
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.max_queue_size, 10_000);
        assert_eq!(config.update_values_mode, UpdateValuesMode::Changed);
        assert!(config.exclude_fields.contains("password"));
        assert!(config.exclude_fields.contains("apiKey"));
        assert!(!config.strict_mode);
    }

    #[test]
    fn should_audit_respects_allowlist_and_audit_table() {
        let config = AuditConfig::builder()
            .table("users", "id")
            .build()
            .unwrap();
        assert!(config.should_audit("users"));
        assert!(!config.should_audit("sessions"));
        assert!(!config.should_audit("audit_logs"));
    }

    #[test]
    fn wildcard_audits_everything_but_the_audit_table() {
        let config = AuditConfig::builder()
            .all_tables()
            .table("users", "id")
            .build()
            .unwrap();
        assert!(config.should_audit("users"));
        assert!(config.should_audit("anything_else"));
        assert!(!config.should_audit("audit_logs"));
    }

    #[test]
    fn listed_table_without_primary_key_fails_validation() {
        let mut config = AuditConfig::default();
        config.tables = Tables::Only(vec!["users".to_owned()]);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, AuditError::Configuration(_)));
        assert!(err.to_string().contains("users"));
    }

    #[test]
    fn zero_tuning_values_fail_validation() {
        assert!(AuditConfig::builder().batch_size(0).build().is_err());
        assert!(AuditConfig::builder().max_queue_size(0).build().is_err());
        assert!(
            AuditConfig::builder()
                .flush_interval(Duration::ZERO)
                .build()
                .is_err()
        );
    }

    #[test]
    fn auditing_the_audit_table_is_rejected() {
        let err = AuditConfig::builder()
            .table("audit_logs", "id")
            .build()
            .unwrap_err();
        assert!(matches!(err, AuditError::Configuration(_)));
    }

    #[test]
    fn composite_primary_key_from_array() {
        let key = PrimaryKey::from(["org_id", "entry_id"]);
        assert_eq!(key.columns(), ["org_id".to_owned(), "entry_id".to_owned()]);
    }
}
