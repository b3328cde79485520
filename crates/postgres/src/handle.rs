//! Query interception: the audited handle, mutation builders, and audited
//! transactions.
//!
//! Builders created from [`AuditedDb`] run through the audit-aware
//! execution path. Mutations on audited tables always execute with an
//! internal `RETURNING to_jsonb(t.*)` capture clause; the caller's own
//! `returning` selection is projected client-side from the captured rows,
//! so the audit pipeline and the caller are served by one statement. For
//! UPDATEs in changed mode a pre-update snapshot is read on the same
//! connection with the mutation's WHERE conjunction. Non-audited tables
//! pass through untouched (capture only when the caller asked for rows).

use std::sync::Arc;

use serde_json::Value;
use sqlx::PgConnection;

use rowtrail_core::config::UpdateValuesMode;
use rowtrail_core::context::current_context;
use rowtrail_core::record::AuditRecord;
use rowtrail_core::transform;
use rowtrail_core::{AuditContext, AuditError, Row};

use crate::builder::{
    Filter, Selection, build_delete, build_insert, build_select, build_update, query_error,
};
use crate::logger::LoggerInner;

/// Outcome of an intercepted mutation.
///
/// `rows` is `Some` exactly when the caller chained a `returning`
/// projection; without one the caller gets the driver's native
/// rows-affected result even though audited statements capture rows
/// internally.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationResult {
    pub rows_affected: u64,
    pub rows: Option<Vec<Row>>,
}

enum Target<'a> {
    Pool(Arc<LoggerInner>),
    Tx(&'a mut AuditedTransaction),
}

/// The wrapped database handle.
#[derive(Clone)]
pub struct AuditedDb {
    pub(crate) inner: Arc<LoggerInner>,
}

impl AuditedDb {
    pub fn insert(&self, table: impl Into<String>) -> InsertBuilder<'static> {
        InsertBuilder {
            target: Target::Pool(Arc::clone(&self.inner)),
            table: table.into(),
            rows: Vec::new(),
            returning: None,
        }
    }

    pub fn update(&self, table: impl Into<String>) -> UpdateBuilder<'static> {
        UpdateBuilder {
            target: Target::Pool(Arc::clone(&self.inner)),
            table: table.into(),
            assignments: None,
            filters: Vec::new(),
            returning: None,
        }
    }

    pub fn delete(&self, table: impl Into<String>) -> DeleteBuilder<'static> {
        DeleteBuilder {
            target: Target::Pool(Arc::clone(&self.inner)),
            table: table.into(),
            filters: Vec::new(),
            returning: None,
        }
    }

    /// Plain row reads; never audited.
    pub fn select(&self, table: impl Into<String>) -> SelectBuilder<'static> {
        SelectBuilder {
            target: Target::Pool(Arc::clone(&self.inner)),
            table: table.into(),
            columns: None,
            filters: Vec::new(),
        }
    }

    /// Open a wrapped transaction. Mutations inside it capture rows on the
    /// transaction's connection; their audit records are held back and
    /// enqueued only after a successful commit.
    pub async fn begin(&self) -> Result<AuditedTransaction, AuditError> {
        let tx = self.inner.pool.begin().await.map_err(query_error)?;
        Ok(AuditedTransaction {
            tx,
            inner: Arc::clone(&self.inner),
            staged: Vec::new(),
        })
    }
}

/// A wrapped transaction with commit-gated audit emission.
///
/// The audit INSERT is never part of the user's transaction: records from a
/// rolled-back (or dropped) transaction are discarded, and committed
/// records flow through the batching writer afterwards.
pub struct AuditedTransaction {
    tx: sqlx::Transaction<'static, sqlx::Postgres>,
    inner: Arc<LoggerInner>,
    staged: Vec<Staged>,
}

struct Staged {
    records: Vec<AuditRecord>,
    scope: Option<AuditContext>,
}

impl AuditedTransaction {
    pub fn insert(&mut self, table: impl Into<String>) -> InsertBuilder<'_> {
        InsertBuilder {
            table: table.into(),
            target: Target::Tx(self),
            rows: Vec::new(),
            returning: None,
        }
    }

    pub fn update(&mut self, table: impl Into<String>) -> UpdateBuilder<'_> {
        UpdateBuilder {
            table: table.into(),
            target: Target::Tx(self),
            assignments: None,
            filters: Vec::new(),
            returning: None,
        }
    }

    pub fn delete(&mut self, table: impl Into<String>) -> DeleteBuilder<'_> {
        DeleteBuilder {
            table: table.into(),
            target: Target::Tx(self),
            filters: Vec::new(),
            returning: None,
        }
    }

    pub fn select(&mut self, table: impl Into<String>) -> SelectBuilder<'_> {
        SelectBuilder {
            table: table.into(),
            target: Target::Tx(self),
            columns: None,
            filters: Vec::new(),
        }
    }

    fn stage(&mut self, records: Vec<AuditRecord>) {
        if records.is_empty() {
            return;
        }
        self.staged.push(Staged {
            records,
            scope: current_context(),
        });
    }

    /// Commit the transaction, then enqueue the staged audit records.
    pub async fn commit(self) -> Result<(), AuditError> {
        let Self { tx, inner, staged } = self;
        tx.commit().await.map_err(query_error)?;
        for batch in staged {
            inner.emit(batch.records, batch.scope.as_ref()).await?;
        }
        Ok(())
    }

    /// Roll back the transaction, discarding the staged audit records.
    pub async fn rollback(self) -> Result<(), AuditError> {
        let Self { tx, .. } = self;
        tx.rollback().await.map_err(query_error)
    }
}

/// Builder for an intercepted INSERT.
pub struct InsertBuilder<'a> {
    target: Target<'a>,
    table: String,
    rows: Vec<Value>,
    returning: Option<Selection>,
}

impl InsertBuilder<'_> {
    /// Add a row (JSON object) or several rows (JSON array of objects).
    #[must_use]
    pub fn values(mut self, rows: Value) -> Self {
        match rows {
            Value::Array(items) => self.rows.extend(items),
            row => self.rows.push(row),
        }
        self
    }

    /// Return the full inserted rows to the caller.
    #[must_use]
    pub fn returning_all(mut self) -> Self {
        self.returning = Some(Selection::All);
        self
    }

    /// Return exactly the listed columns of the inserted rows.
    #[must_use]
    pub fn returning<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.returning = Some(Selection::Columns(
            columns.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub async fn execute(self) -> Result<MutationResult, AuditError> {
        let Self {
            target,
            table,
            rows,
            returning,
        } = self;
        match target {
            Target::Pool(inner) => {
                let mut conn = inner.pool.acquire().await.map_err(query_error)?;
                let (result, records) =
                    run_insert(&inner, &mut conn, &table, rows, returning.as_ref()).await?;
                // Release the connection before a possibly-awaited audit
                // write needs one from the same pool.
                drop(conn);
                if let Some(records) = records {
                    inner.emit(records, current_context().as_ref()).await?;
                }
                Ok(result)
            }
            Target::Tx(tx) => {
                let inner = Arc::clone(&tx.inner);
                let (result, records) =
                    run_insert(&inner, &mut tx.tx, &table, rows, returning.as_ref()).await?;
                if let Some(records) = records {
                    tx.stage(records);
                }
                Ok(result)
            }
        }
    }
}

/// Builder for an intercepted UPDATE.
pub struct UpdateBuilder<'a> {
    target: Target<'a>,
    table: String,
    assignments: Option<Value>,
    filters: Vec<Filter>,
    returning: Option<Selection>,
}

impl UpdateBuilder<'_> {
    /// Columns to assign, as a JSON object.
    #[must_use]
    pub fn set(mut self, assignments: Value) -> Self {
        self.assignments = Some(assignments);
        self
    }

    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub fn returning_all(mut self) -> Self {
        self.returning = Some(Selection::All);
        self
    }

    #[must_use]
    pub fn returning<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.returning = Some(Selection::Columns(
            columns.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub async fn execute(self) -> Result<MutationResult, AuditError> {
        let Self {
            target,
            table,
            assignments,
            filters,
            returning,
        } = self;
        let assignments = assignments
            .ok_or_else(|| AuditError::Query("update requires set(..)".to_owned()))?;
        match target {
            Target::Pool(inner) => {
                let mut conn = inner.pool.acquire().await.map_err(query_error)?;
                let (result, records) = run_update(
                    &inner,
                    &mut conn,
                    &table,
                    assignments,
                    &filters,
                    returning.as_ref(),
                )
                .await?;
                drop(conn);
                if let Some(records) = records {
                    inner.emit(records, current_context().as_ref()).await?;
                }
                Ok(result)
            }
            Target::Tx(tx) => {
                let inner = Arc::clone(&tx.inner);
                let (result, records) = run_update(
                    &inner,
                    &mut tx.tx,
                    &table,
                    assignments,
                    &filters,
                    returning.as_ref(),
                )
                .await?;
                if let Some(records) = records {
                    tx.stage(records);
                }
                Ok(result)
            }
        }
    }
}

/// Builder for an intercepted DELETE.
pub struct DeleteBuilder<'a> {
    target: Target<'a>,
    table: String,
    filters: Vec<Filter>,
    returning: Option<Selection>,
}

impl DeleteBuilder<'_> {
    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub fn returning_all(mut self) -> Self {
        self.returning = Some(Selection::All);
        self
    }

    #[must_use]
    pub fn returning<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.returning = Some(Selection::Columns(
            columns.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub async fn execute(self) -> Result<MutationResult, AuditError> {
        let Self {
            target,
            table,
            filters,
            returning,
        } = self;
        match target {
            Target::Pool(inner) => {
                let mut conn = inner.pool.acquire().await.map_err(query_error)?;
                let (result, records) =
                    run_delete(&inner, &mut conn, &table, &filters, returning.as_ref()).await?;
                drop(conn);
                if let Some(records) = records {
                    inner.emit(records, current_context().as_ref()).await?;
                }
                Ok(result)
            }
            Target::Tx(tx) => {
                let inner = Arc::clone(&tx.inner);
                let (result, records) =
                    run_delete(&inner, &mut tx.tx, &table, &filters, returning.as_ref()).await?;
                if let Some(records) = records {
                    tx.stage(records);
                }
                Ok(result)
            }
        }
    }
}

/// Builder for a pass-through SELECT.
pub struct SelectBuilder<'a> {
    target: Target<'a>,
    table: String,
    columns: Option<Vec<String>>,
    filters: Vec<Filter>,
}

impl SelectBuilder<'_> {
    /// Project the result down to the listed columns.
    #[must_use]
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub async fn fetch_all(self) -> Result<Vec<Row>, AuditError> {
        let Self {
            target,
            table,
            columns,
            filters,
        } = self;
        let mut qb = build_select(&table, &filters)?;
        let rows = match target {
            Target::Pool(inner) => {
                let mut conn = inner.pool.acquire().await.map_err(query_error)?;
                fetch_captured(&mut qb, &mut conn).await?
            }
            Target::Tx(tx) => fetch_captured(&mut qb, &mut tx.tx).await?,
        };
        Ok(match columns {
            Some(columns) => project_rows(&rows, &Selection::Columns(columns)),
            None => rows,
        })
    }

    pub async fn fetch_optional(self) -> Result<Option<Row>, AuditError> {
        Ok(self.fetch_all().await?.into_iter().next())
    }
}

async fn run_insert(
    inner: &LoggerInner,
    conn: &mut PgConnection,
    table: &str,
    rows: Vec<Value>,
    selection: Option<&Selection>,
) -> Result<(MutationResult, Option<Vec<AuditRecord>>), AuditError> {
    let rows = normalize_rows(rows)?;
    let columns: Vec<String> = rows[0].keys().cloned().collect();
    let audited = inner.config.should_audit(table);
    let capture = audited || selection.is_some();

    let row_refs: Vec<&Row> = rows.iter().collect();
    let mut qb = build_insert(table, &columns, &row_refs, capture)?;

    if capture {
        let captured = fetch_captured(&mut qb, conn).await?;
        let result = MutationResult {
            rows_affected: captured.len() as u64,
            rows: selection.map(|sel| project_rows(&captured, sel)),
        };
        let records = if audited {
            Some(transform::insert_audit_logs(table, &captured, &inner.config)?)
        } else {
            None
        };
        Ok((result, records))
    } else {
        let done = qb
            .build()
            .execute(&mut *conn)
            .await
            .map_err(query_error)?;
        let result = MutationResult {
            rows_affected: done.rows_affected(),
            rows: None,
        };
        Ok((result, None))
    }
}

async fn run_update(
    inner: &LoggerInner,
    conn: &mut PgConnection,
    table: &str,
    assignments: Value,
    filters: &[Filter],
    selection: Option<&Selection>,
) -> Result<(MutationResult, Option<Vec<AuditRecord>>), AuditError> {
    let Value::Object(assignments) = assignments else {
        return Err(AuditError::Query(
            "update set(..) requires a JSON object".to_owned(),
        ));
    };
    if assignments.is_empty() {
        return Err(AuditError::Query(
            "update set(..) requires at least one column".to_owned(),
        ));
    }

    let audited = inner.config.should_audit(table);
    let capture = audited || selection.is_some();

    // Changed mode needs the pre-update state; read it on the same
    // connection so the snapshot precedes the mutation.
    let before = if audited && inner.config.update_values_mode == UpdateValuesMode::Changed {
        let mut select = build_select(table, filters)?;
        fetch_captured(&mut select, conn).await?
    } else {
        Vec::new()
    };

    let mut qb = build_update(table, &assignments, filters, capture)?;
    if capture {
        let captured = fetch_captured(&mut qb, conn).await?;
        let result = MutationResult {
            rows_affected: captured.len() as u64,
            rows: selection.map(|sel| project_rows(&captured, sel)),
        };
        let records = if audited {
            Some(transform::update_audit_logs(
                table,
                &before,
                &captured,
                &inner.config,
            )?)
        } else {
            None
        };
        Ok((result, records))
    } else {
        let done = qb
            .build()
            .execute(&mut *conn)
            .await
            .map_err(query_error)?;
        let result = MutationResult {
            rows_affected: done.rows_affected(),
            rows: None,
        };
        Ok((result, None))
    }
}

async fn run_delete(
    inner: &LoggerInner,
    conn: &mut PgConnection,
    table: &str,
    filters: &[Filter],
    selection: Option<&Selection>,
) -> Result<(MutationResult, Option<Vec<AuditRecord>>), AuditError> {
    let audited = inner.config.should_audit(table);
    let capture = audited || selection.is_some();

    let mut qb = build_delete(table, filters, capture)?;
    if capture {
        let captured = fetch_captured(&mut qb, conn).await?;
        let result = MutationResult {
            rows_affected: captured.len() as u64,
            rows: selection.map(|sel| project_rows(&captured, sel)),
        };
        let records = if audited {
            Some(transform::delete_audit_logs(table, &captured, &inner.config)?)
        } else {
            None
        };
        Ok((result, records))
    } else {
        let done = qb
            .build()
            .execute(&mut *conn)
            .await
            .map_err(query_error)?;
        let result = MutationResult {
            rows_affected: done.rows_affected(),
            rows: None,
        };
        Ok((result, None))
    }
}

/// Run a capturing statement and decode each returned `jsonb` row.
async fn fetch_captured(
    qb: &mut sqlx::QueryBuilder<'static, sqlx::Postgres>,
    conn: &mut PgConnection,
) -> Result<Vec<Row>, AuditError> {
    let values: Vec<Value> = qb
        .build_query_scalar()
        .fetch_all(&mut *conn)
        .await
        .map_err(query_error)?;
    values
        .into_iter()
        .map(|value| match value {
            Value::Object(map) => Ok(map),
            other => Err(AuditError::Query(format!(
                "expected captured row object, got {other}"
            ))),
        })
        .collect()
}

fn normalize_rows(rows: Vec<Value>) -> Result<Vec<Row>, AuditError> {
    if rows.is_empty() {
        return Err(AuditError::Query(
            "insert requires at least one row".to_owned(),
        ));
    }
    let mut normalized = Vec::with_capacity(rows.len());
    for row in rows {
        let Value::Object(map) = row else {
            return Err(AuditError::Query(
                "insert rows must be JSON objects".to_owned(),
            ));
        };
        normalized.push(map);
    }
    let first: Vec<&String> = normalized[0].keys().collect();
    for row in &normalized[1..] {
        if row.len() != first.len() || !first.iter().all(|key| row.contains_key(key.as_str())) {
            return Err(AuditError::Query(
                "insert rows must share the same columns".to_owned(),
            ));
        }
    }
    Ok(normalized)
}

fn project_rows(rows: &[Row], selection: &Selection) -> Vec<Row> {
    match selection {
        Selection::All => rows.to_vec(),
        Selection::Columns(columns) => rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .filter_map(|column| {
                        row.get(column.as_str())
                            .map(|value| (column.clone(), value.clone()))
                    })
                    .collect()
            })
            .collect(),
    }
}
