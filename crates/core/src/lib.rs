//! Core capture pipeline for transparent audit logging of database
//! mutations: record and context types, configuration, primary-key
//! extraction, field filtering and diffing, per-operation capture
//! transforms, and the asynchronous batching writer with its pluggable
//! persistence sink.
//!
//! Database-specific pieces (the query interceptor and the PostgreSQL
//! sink) live in the `rowtrail-postgres` crate.

pub mod config;
pub mod context;
pub mod diff;
pub mod error;
pub mod key;
pub mod record;
pub mod sink;
pub mod transform;
pub mod writer;

pub use config::{
    AuditConfig, AuditConfigBuilder, ColumnMap, PrimaryKey, TableConfig, Tables, UpdateValuesMode,
};
pub use context::{AuditContext, current_context, merge_context, merge_metadata, with_context};
pub use error::AuditError;
pub use record::{AuditAction, AuditLogEntry, AuditRecord, Row};
pub use sink::{AuditSink, MemorySink};
pub use writer::{BatchWriter, WriterStats};
