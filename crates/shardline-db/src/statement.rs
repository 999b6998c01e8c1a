//! Parameterized statement generation for the CRUD helpers.
//!
//! Every generated statement follows the same rules:
//!
//! - the table is checked against the allow-list and every column against the
//!   identifier pattern before any text is produced;
//! - identifiers are double-quoted, values become `$n` placeholders and are
//!   carried separately in [`Statement::params`];
//! - writes end in `RETURNING *` so callers get the affected rows back.
//!
//! Predicates are column-equality conjunctions. A `NULL` predicate value
//! becomes `IS NULL` rather than a bound parameter, and a `NULL` data value is
//! written as the `NULL` keyword so the server infers the column type.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DbError;
use crate::identifiers::{quote_identifier, quote_table};

/// A value bound to a statement placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SqlValue {
    /// SQL `NULL`.
    Null,
    /// `BOOL`.
    Bool(bool),
    /// `INT8` (narrower integer columns accept it by assignment cast).
    Int(i64),
    /// `FLOAT8`.
    Float(f64),
    /// `TEXT`.
    Text(String),
    /// `JSONB`.
    Json(serde_json::Value),
    /// `TIMESTAMPTZ`.
    Timestamp(DateTime<Utc>),
    /// `UUID`.
    Uuid(Uuid),
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<serde_json::Value> for SqlValue {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

impl From<Uuid> for SqlValue {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl<T: Into<Self>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Column name to value map used for inserted data and equality predicates.
///
/// A `BTreeMap` keeps column order (and therefore placeholder numbering)
/// deterministic.
pub type Record = BTreeMap<String, SqlValue>;

/// A decoded result row, keyed by column name.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Build a [`Record`] from `(column, value)` pairs.
pub fn record<K, V, I>(pairs: I) -> Record
where
    K: Into<String>,
    V: Into<SqlValue>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// SQL text plus its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// Statement text with `$1..$n` placeholders.
    pub sql: String,
    /// Values for the placeholders, in order.
    pub params: Vec<SqlValue>,
}

impl Statement {
    /// Wrap caller-supplied SQL and parameters.
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Accumulates bound values and hands out placeholders.
#[derive(Debug, Default)]
struct Params {
    values: Vec<SqlValue>,
}

impl Params {
    fn bind(&mut self, value: &SqlValue) -> String {
        self.values.push(value.clone());
        format!("${}", self.values.len())
    }

    /// Like [`Params::bind`] but renders `NULL` without binding it.
    fn bind_or_null(&mut self, value: &SqlValue) -> String {
        if matches!(value, SqlValue::Null) {
            "NULL".to_owned()
        } else {
            self.bind(value)
        }
    }
}

/// Render a predicate as `"a" = $1 AND "b" IS NULL ...`.
fn where_clause(predicate: &Record, params: &mut Params) -> Result<String, DbError> {
    let mut parts = Vec::with_capacity(predicate.len());
    for (column, value) in predicate {
        let column = quote_identifier(column)?;
        if matches!(value, SqlValue::Null) {
            parts.push(format!("{column} IS NULL"));
        } else {
            let placeholder = params.bind(value);
            parts.push(format!("{column} = {placeholder}"));
        }
    }
    Ok(parts.join(" AND "))
}

fn columns_and_values(
    data: &Record,
    params: &mut Params,
) -> Result<(Vec<String>, Vec<String>), DbError> {
    let mut columns = Vec::with_capacity(data.len());
    let mut placeholders = Vec::with_capacity(data.len());
    for (column, value) in data {
        columns.push(quote_identifier(column)?);
        placeholders.push(params.bind_or_null(value));
    }
    Ok((columns, placeholders))
}

fn require_columns(data: &Record, what: &str) -> Result<(), DbError> {
    if data.is_empty() {
        Err(DbError::EmptyWrite(format!("{what} requires at least one column")))
    } else {
        Ok(())
    }
}

fn require_predicate(predicate: &Record, what: &str) -> Result<(), DbError> {
    if predicate.is_empty() {
        Err(DbError::EmptyWrite(format!(
            "{what} requires a non-empty predicate"
        )))
    } else {
        Ok(())
    }
}

/// `INSERT INTO "t" (...) VALUES (...) RETURNING *`.
///
/// # Errors
///
/// Returns a validation error for a non-allow-listed table, a malformed
/// column, or an empty record.
pub fn insert(table: &str, data: &Record) -> Result<Statement, DbError> {
    build_insert(table, data, false)
}

/// Like [`insert`] but with `ON CONFLICT DO NOTHING`, so replaying a row that
/// already landed is a no-op on tables with a unique key.
///
/// # Errors
///
/// Same as [`insert`].
pub fn insert_ignoring_conflicts(table: &str, data: &Record) -> Result<Statement, DbError> {
    build_insert(table, data, true)
}

fn build_insert(table: &str, data: &Record, ignore_conflicts: bool) -> Result<Statement, DbError> {
    let table = quote_table(table)?;
    require_columns(data, "insert")?;
    let mut params = Params::default();
    let (columns, placeholders) = columns_and_values(data, &mut params)?;
    let conflict = if ignore_conflicts {
        " ON CONFLICT DO NOTHING"
    } else {
        ""
    };
    let sql = format!(
        "INSERT INTO {table} ({}) VALUES ({}){conflict} RETURNING *",
        columns.join(", "),
        placeholders.join(", ")
    );
    Ok(Statement::new(sql, params.values))
}

/// `UPDATE "t" SET ... WHERE ... RETURNING *`.
///
/// # Errors
///
/// Returns a validation error for a bad table or column, an empty record,
/// or an empty predicate (unbounded updates are refused).
pub fn update(table: &str, data: &Record, predicate: &Record) -> Result<Statement, DbError> {
    let table = quote_table(table)?;
    require_columns(data, "update")?;
    require_predicate(predicate, "update")?;
    let mut params = Params::default();
    let mut assignments = Vec::with_capacity(data.len());
    for (column, value) in data {
        let column = quote_identifier(column)?;
        let placeholder = params.bind_or_null(value);
        assignments.push(format!("{column} = {placeholder}"));
    }
    let filter = where_clause(predicate, &mut params)?;
    let sql = format!(
        "UPDATE {table} SET {} WHERE {filter} RETURNING *",
        assignments.join(", ")
    );
    Ok(Statement::new(sql, params.values))
}

/// `INSERT ... ON CONFLICT (key) DO UPDATE SET col = EXCLUDED.col RETURNING *`.
///
/// Columns named in `conflict_key` are not re-assigned. When every column is
/// part of the key the statement degrades to `DO NOTHING`.
///
/// # Errors
///
/// Returns a validation error for a bad table, column, or conflict key, or
/// when the record or conflict key is empty.
pub fn upsert(table: &str, data: &Record, conflict_key: &[String]) -> Result<Statement, DbError> {
    let table = quote_table(table)?;
    require_columns(data, "upsert")?;
    if conflict_key.is_empty() {
        return Err(DbError::EmptyWrite(
            "upsert requires a conflict key".to_owned(),
        ));
    }
    let key_columns = conflict_key
        .iter()
        .map(|k| quote_identifier(k))
        .collect::<Result<Vec<_>, _>>()?;

    let mut params = Params::default();
    let (columns, placeholders) = columns_and_values(data, &mut params)?;

    let mut assignments = Vec::new();
    for column in data.keys() {
        if conflict_key.iter().any(|k| k == column) {
            continue;
        }
        let quoted = quote_identifier(column)?;
        assignments.push(format!("{quoted} = EXCLUDED.{quoted}"));
    }
    let action = if assignments.is_empty() {
        "DO NOTHING".to_owned()
    } else {
        format!("DO UPDATE SET {}", assignments.join(", "))
    };

    let sql = format!(
        "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT ({}) {action} RETURNING *",
        columns.join(", "),
        placeholders.join(", "),
        key_columns.join(", ")
    );
    Ok(Statement::new(sql, params.values))
}

/// `DELETE FROM "t" WHERE ... RETURNING *`.
///
/// # Errors
///
/// Returns a validation error for a bad table or column, or an empty
/// predicate (unbounded deletes are refused).
pub fn delete(table: &str, predicate: &Record) -> Result<Statement, DbError> {
    let table = quote_table(table)?;
    require_predicate(predicate, "delete")?;
    let mut params = Params::default();
    let filter = where_clause(predicate, &mut params)?;
    Ok(Statement::new(
        format!("DELETE FROM {table} WHERE {filter} RETURNING *"),
        params.values,
    ))
}
