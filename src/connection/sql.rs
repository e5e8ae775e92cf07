//! Relational [`Connection`] over any [`SqlExecutor`].
//!
//! Statements are rendered with sea-query for the configured [`Dialect`] and
//! executed with their values bound as parameters. Inserted keys come back via
//! `RETURNING` where the dialect supports it, otherwise via
//! [`SqlExecutor::last_insert_id`].

use crate::connection::Connection;
use crate::error::{EngineError, Result};
use crate::executor::{instrumented, SqlExecutor};
use crate::query::sql::Dialect;
use crate::query::{DeleteStatement, InsertStatement, SelectQuery, UpdateStatement};
use crate::transaction::{IsolationLevel, Savepoints};
use crate::value::{Row, Value};

/// SQL-backed connection
///
/// # Example
///
/// ```
/// use breakwater::connection::{sql::SqlConnection, Connection};
/// use breakwater::executor::SqlExecutor;
/// use breakwater::query::{sql::Dialect, SelectQuery};
/// use breakwater::{Result, Row};
/// use sea_query::Values;
///
/// struct Empty;
/// impl SqlExecutor for Empty {
///     fn query_all(&self, _: &str, _: &Values) -> Result<Vec<Row>> { Ok(Vec::new()) }
///     fn execute(&self, _: &str, _: &Values) -> Result<u64> { Ok(0) }
/// }
///
/// let conn = SqlConnection::new("primary", Empty, Dialect::Sqlite);
/// assert!(conn.select(&SelectQuery::new("users")).unwrap().is_empty());
/// ```
pub struct SqlConnection<E: SqlExecutor> {
    name: String,
    executor: E,
    dialect: Dialect,
    savepoints: Savepoints,
}

impl<E: SqlExecutor> SqlConnection<E> {
    pub fn new(name: &str, executor: E, dialect: Dialect) -> Self {
        Self {
            name: name.to_string(),
            executor,
            dialect,
            savepoints: Savepoints::new(),
        }
    }

    /// Run outermost transactions at `isolation`
    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.savepoints = Savepoints::with_isolation(isolation);
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }
}

fn count_from(rows: &[Row]) -> u64 {
    rows.first()
        .and_then(|row| row.get("count").or_else(|| row.values().next()))
        .and_then(|value| match value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
        .unwrap_or(0)
}

impl<E: SqlExecutor> Connection for SqlConnection<E> {
    fn name(&self) -> &str {
        &self.name
    }

    fn select(&self, query: &SelectQuery) -> Result<Vec<Row>> {
        let (sql, values) = self.dialect.select(query)?;
        instrumented(&sql, || self.executor.query_all(&sql, &values))
    }

    fn count(&self, query: &SelectQuery) -> Result<u64> {
        let (sql, values) = self.dialect.count(query)?;
        let rows = instrumented(&sql, || self.executor.query_all(&sql, &values))?;
        Ok(count_from(&rows))
    }

    fn insert(&self, insert: &InsertStatement) -> Result<Option<Value>> {
        let (sql, values) = self.dialect.insert(insert)?;
        let Some(pk) = &insert.returning else {
            instrumented(&sql, || self.executor.execute(&sql, &values))?;
            return Ok(None);
        };
        if let Some(given) = insert.values.get(pk).filter(|v| !v.is_null()) {
            instrumented(&sql, || self.executor.execute(&sql, &values))?;
            return Ok(Some(given.clone()));
        }
        if self.dialect.supports_returning() {
            let rows = instrumented(&sql, || self.executor.query_all(&sql, &values))?;
            return Ok(rows.first().and_then(|row| row.get(pk)).cloned());
        }
        instrumented(&sql, || self.executor.execute(&sql, &values))?;
        self.executor.last_insert_id()
    }

    fn update(&self, update: &UpdateStatement) -> Result<u64> {
        if update.set.is_empty() {
            return Err(EngineError::validation(format!(
                "update of {} has no columns to set",
                update.table
            )));
        }
        let (sql, values) = self.dialect.update(update)?;
        instrumented(&sql, || self.executor.execute(&sql, &values))
    }

    fn delete(&self, delete: &DeleteStatement) -> Result<u64> {
        let (sql, values) = self.dialect.delete(delete)?;
        instrumented(&sql, || self.executor.execute(&sql, &values))
    }

    fn transaction(&self, body: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        let level = self.savepoints.begin(&self.executor)?;
        match body() {
            Ok(()) => Ok(self.savepoints.commit(&self.executor, level)?),
            Err(e) => {
                if let Err(rollback) = self.savepoints.rollback(&self.executor, level) {
                    log::warn!("{}: rollback failed after error ({e}): {rollback}", self.name);
                }
                Err(e)
            }
        }
    }
}
