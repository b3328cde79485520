//! SQL assembly for the interceptor: identifier quoting, typed binds of
//! JSON values, conjunctive filters, and the four statement shapes.
//!
//! Every capturing statement carries `RETURNING to_jsonb(t.*) AS row` (or
//! selects the same expression), so each affected row comes back as a
//! single `jsonb` column regardless of the table's schema.

use serde_json::Value;
use sqlx::query_builder::Separated;
use sqlx::{Postgres, QueryBuilder};

use rowtrail_core::{AuditError, Row};

/// Alias every statement binds its target table to, so the capture
/// projection has a stable qualifier.
pub(crate) const CAPTURE_ALIAS: &str = "t";

/// Projection requested by a caller's `returning` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Every column of the affected rows.
    All,
    /// Exactly the listed columns, in list order.
    Columns(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

impl FilterOp {
    fn sql(self) -> &'static str {
        match self {
            Self::Eq => " = ",
            Self::Ne => " <> ",
            Self::Gt => " > ",
            Self::Gte => " >= ",
            Self::Lt => " < ",
            Self::Lte => " <= ",
            Self::In => " IN ",
        }
    }
}

/// One conjunct of a WHERE clause. Build with the free constructors
/// ([`eq`], [`ne`], [`gt`], [`gte`], [`lt`], [`lte`], [`is_in`],
/// [`is_null`], [`not_null`]).
#[derive(Debug, Clone)]
pub struct Filter {
    column: String,
    op: FilterOp,
    value: Value,
}

pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Filter {
    Filter {
        column: column.into(),
        op: FilterOp::Eq,
        value: value.into(),
    }
}

pub fn ne(column: impl Into<String>, value: impl Into<Value>) -> Filter {
    Filter {
        column: column.into(),
        op: FilterOp::Ne,
        value: value.into(),
    }
}

pub fn gt(column: impl Into<String>, value: impl Into<Value>) -> Filter {
    Filter {
        column: column.into(),
        op: FilterOp::Gt,
        value: value.into(),
    }
}

pub fn gte(column: impl Into<String>, value: impl Into<Value>) -> Filter {
    Filter {
        column: column.into(),
        op: FilterOp::Gte,
        value: value.into(),
    }
}

pub fn lt(column: impl Into<String>, value: impl Into<Value>) -> Filter {
    Filter {
        column: column.into(),
        op: FilterOp::Lt,
        value: value.into(),
    }
}

pub fn lte(column: impl Into<String>, value: impl Into<Value>) -> Filter {
    Filter {
        column: column.into(),
        op: FilterOp::Lte,
        value: value.into(),
    }
}

/// Membership in a value list. An empty list matches nothing.
pub fn is_in(column: impl Into<String>, values: Vec<Value>) -> Filter {
    Filter {
        column: column.into(),
        op: FilterOp::In,
        value: Value::Array(values),
    }
}

pub fn is_null(column: impl Into<String>) -> Filter {
    Filter {
        column: column.into(),
        op: FilterOp::Eq,
        value: Value::Null,
    }
}

pub fn not_null(column: impl Into<String>) -> Filter {
    Filter {
        column: column.into(),
        op: FilterOp::Ne,
        value: Value::Null,
    }
}

/// Quote a single identifier, rejecting characters that cannot appear in a
/// quoted PostgreSQL name.
pub(crate) fn quote_ident(name: &str) -> Result<String, AuditError> {
    if name.is_empty() || name.contains('"') || name.contains('\0') {
        return Err(AuditError::Query(format!("invalid identifier: {name:?}")));
    }
    Ok(format!("\"{name}\""))
}

/// Quote a possibly schema-qualified table name.
pub(crate) fn quote_table(name: &str) -> Result<String, AuditError> {
    let quoted: Result<Vec<String>, AuditError> = name.split('.').map(quote_ident).collect();
    Ok(quoted?.join("."))
}

/// Bind a JSON value into the statement with the PostgreSQL type its shape
/// implies. Objects and arrays bind as `jsonb`; integers beyond `i64` cast
/// to `numeric`; `null` renders as a literal so it stays type-neutral.
fn push_bind_value(qb: &mut QueryBuilder<'_, Postgres>, value: &Value) {
    match value {
        Value::Null => {
            qb.push("NULL");
        }
        Value::Bool(b) => {
            qb.push_bind(*b);
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                qb.push_bind(i);
            } else if let Some(u) = n.as_u64() {
                qb.push_bind(u.to_string());
                qb.push("::numeric");
            } else if let Some(f) = n.as_f64() {
                qb.push_bind(f);
            } else {
                qb.push("NULL");
            }
        }
        Value::String(s) => {
            qb.push_bind(s.clone());
        }
        other @ (Value::Array(_) | Value::Object(_)) => {
            qb.push_bind(other.clone());
        }
    }
}

/// [`push_bind_value`] for a separated VALUES tuple.
fn push_row_value(b: &mut Separated<'_, '_, Postgres, &'static str>, value: &Value) {
    match value {
        Value::Null => {
            b.push("NULL");
        }
        Value::Bool(v) => {
            b.push_bind(*v);
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                b.push_bind(i);
            } else if let Some(u) = n.as_u64() {
                b.push_bind(u.to_string());
                b.push_unseparated("::numeric");
            } else if let Some(f) = n.as_f64() {
                b.push_bind(f);
            } else {
                b.push("NULL");
            }
        }
        Value::String(s) => {
            b.push_bind(s.clone());
        }
        other @ (Value::Array(_) | Value::Object(_)) => {
            b.push_bind(other.clone());
        }
    }
}

fn push_filters(
    qb: &mut QueryBuilder<'static, Postgres>,
    filters: &[Filter],
) -> Result<(), AuditError> {
    if filters.is_empty() {
        return Ok(());
    }
    qb.push(" WHERE ");
    for (i, filter) in filters.iter().enumerate() {
        if i > 0 {
            qb.push(" AND ");
        }
        let column = quote_ident(&filter.column)?;
        match (filter.op, &filter.value) {
            (FilterOp::Eq, Value::Null) => {
                qb.push(column);
                qb.push(" IS NULL");
            }
            (FilterOp::Ne, Value::Null) => {
                qb.push(column);
                qb.push(" IS NOT NULL");
            }
            (FilterOp::In, Value::Array(items)) => {
                if items.is_empty() {
                    qb.push("FALSE");
                    continue;
                }
                qb.push(column);
                qb.push(" IN (");
                for (j, item) in items.iter().enumerate() {
                    if j > 0 {
                        qb.push(", ");
                    }
                    push_bind_value(qb, item);
                }
                qb.push(")");
            }
            (FilterOp::In, _) => {
                return Err(AuditError::Query(format!(
                    "IN filter on {} requires a value list",
                    filter.column
                )));
            }
            (op, value) => {
                qb.push(column);
                qb.push(op.sql());
                push_bind_value(qb, value);
            }
        }
    }
    Ok(())
}

fn push_capture(qb: &mut QueryBuilder<'static, Postgres>) {
    qb.push(format!(" RETURNING to_jsonb({CAPTURE_ALIAS}.*) AS row"));
}

/// Multi-row INSERT; with `capture` the full rows come back as `jsonb`.
pub(crate) fn build_insert(
    table: &str,
    columns: &[String],
    rows: &[&Row],
    capture: bool,
) -> Result<QueryBuilder<'static, Postgres>, AuditError> {
    let table_sql = quote_table(table)?;
    let quoted: Result<Vec<String>, AuditError> =
        columns.iter().map(|c| quote_ident(c)).collect();
    let quoted = quoted?;

    let mut qb = QueryBuilder::new(format!("INSERT INTO {table_sql} AS {CAPTURE_ALIAS} ("));
    qb.push(quoted.join(", "));
    qb.push(") ");
    qb.push_values(rows, |mut b, row| {
        for column in columns {
            let value = row.get(column.as_str()).unwrap_or(&Value::Null);
            push_row_value(&mut b, value);
        }
    });
    if capture {
        push_capture(&mut qb);
    }
    Ok(qb)
}

pub(crate) fn build_update(
    table: &str,
    assignments: &Row,
    filters: &[Filter],
    capture: bool,
) -> Result<QueryBuilder<'static, Postgres>, AuditError> {
    let table_sql = quote_table(table)?;
    let mut qb = QueryBuilder::new(format!("UPDATE {table_sql} AS {CAPTURE_ALIAS} SET "));
    for (i, (column, value)) in assignments.iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        qb.push(quote_ident(column)?);
        qb.push(" = ");
        push_bind_value(&mut qb, value);
    }
    push_filters(&mut qb, filters)?;
    if capture {
        push_capture(&mut qb);
    }
    Ok(qb)
}

pub(crate) fn build_delete(
    table: &str,
    filters: &[Filter],
    capture: bool,
) -> Result<QueryBuilder<'static, Postgres>, AuditError> {
    let table_sql = quote_table(table)?;
    let mut qb = QueryBuilder::new(format!("DELETE FROM {table_sql} AS {CAPTURE_ALIAS}"));
    push_filters(&mut qb, filters)?;
    if capture {
        push_capture(&mut qb);
    }
    Ok(qb)
}

/// SELECT of whole rows as `jsonb`, used for pre-update snapshots and the
/// pass-through select builder.
pub(crate) fn build_select(
    table: &str,
    filters: &[Filter],
) -> Result<QueryBuilder<'static, Postgres>, AuditError> {
    let table_sql = quote_table(table)?;
    let mut qb = QueryBuilder::new(format!(
        "SELECT to_jsonb({CAPTURE_ALIAS}.*) AS row FROM {table_sql} AS {CAPTURE_ALIAS}"
    ));
    push_filters(&mut qb, filters)?;
    Ok(qb)
}

/// Describe a sqlx failure, folding in the server error code when present.
pub(crate) fn describe_sqlx_error(err: &sqlx::Error) -> String {
    match err.as_database_error() {
        Some(db_err) => match db_err.code() {
            Some(code) => format!("{db_err} (code {code})"),
            None => db_err.to_string(),
        },
        None => err.to_string(),
    }
}

pub(crate) fn query_error(err: sqlx::Error) -> AuditError {
    AuditError::Query(describe_sqlx_error(&err))
}
