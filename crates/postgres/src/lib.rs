//! Transparent audit logging for PostgreSQL mutations.
//!
//! Wrap a [`sqlx::PgPool`] once with [`AuditLogger::new`]; every INSERT,
//! UPDATE, and DELETE issued through the wrapped handle is captured and
//! batch-persisted to an audit table, carrying the operation, affected
//! table, per-row primary key, the relevant column values, and the ambient
//! context bound with [`AuditLogger::with_context`].
//!
//! ```no_run
//! use rowtrail_postgres::{AuditConfig, AuditLogger, eq};
//! use serde_json::json;
//!
//! # async fn demo(pool: sqlx::PgPool) -> Result<(), rowtrail_postgres::AuditError> {
//! let logger = AuditLogger::new(
//!     pool,
//!     AuditConfig::builder().table("users", "id").build()?,
//! )?;
//! let db = logger.db();
//!
//! db.insert("users")
//!     .values(json!({"email": "a@x", "name": "A"}))
//!     .execute()
//!     .await?;
//! db.update("users")
//!     .set(json!({"name": "B"}))
//!     .filter(eq("email", "a@x"))
//!     .execute()
//!     .await?;
//!
//! logger.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod handle;
pub mod logger;
pub mod sink;

pub use builder::{Filter, Selection, eq, gt, gte, is_in, is_null, lt, lte, ne, not_null};
pub use handle::{
    AuditedDb, AuditedTransaction, DeleteBuilder, InsertBuilder, MutationResult, SelectBuilder,
    UpdateBuilder,
};
pub use logger::AuditLogger;
pub use sink::PostgresSink;

pub use rowtrail_core::{
    AuditAction, AuditConfig, AuditContext, AuditError, AuditRecord, AuditSink, MemorySink, Row,
    UpdateValuesMode, WriterStats,
};
