//! `SqlExecutor`: the relational driver contract.
//!
//! The engine never talks to a database driver directly. It renders statements
//! with sea-query and hands the SQL text plus bound [`Values`] to an executor.
//! Anything that can run parameterised SQL (a `may_postgres` client, a pooled
//! connection, a test double recording statements) can back a
//! [`SqlConnection`](crate::connection::sql::SqlConnection).

use crate::error::Result;
use crate::value::{Row, Value};
use sea_query::Values;
use std::time::Instant;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Trait for executing rendered SQL
///
/// Rows come back as insertion-ordered column → value maps; the executor is
/// responsible for decoding driver types into [`Value`]s.
///
/// # Examples
///
/// ```
/// use breakwater::executor::SqlExecutor;
/// use breakwater::{Result, Row};
/// use sea_query::Values;
///
/// struct Nothing;
///
/// impl SqlExecutor for Nothing {
///     fn query_all(&self, _sql: &str, _values: &Values) -> Result<Vec<Row>> {
///         Ok(Vec::new())
///     }
///     fn execute(&self, _sql: &str, _values: &Values) -> Result<u64> {
///         Ok(0)
///     }
/// }
///
/// assert!(Nothing.query_all("SELECT 1", &Values(Vec::new())).unwrap().is_empty());
/// ```
pub trait SqlExecutor: Send + Sync {
    /// Run a query and return every row
    ///
    /// # Errors
    ///
    /// Returns the driver failure unchanged (wrapped in [`crate::EngineError`]).
    fn query_all(&self, sql: &str, values: &Values) -> Result<Vec<Row>>;

    /// Run a statement and return the number of rows affected
    ///
    /// # Errors
    ///
    /// Returns the driver failure unchanged (wrapped in [`crate::EngineError`]).
    fn execute(&self, sql: &str, values: &Values) -> Result<u64>;

    /// Key generated by the most recent INSERT, for drivers without RETURNING
    fn last_insert_id(&self) -> Result<Option<Value>> {
        Ok(None)
    }
}

impl<E: SqlExecutor + ?Sized> SqlExecutor for std::sync::Arc<E> {
    fn query_all(&self, sql: &str, values: &Values) -> Result<Vec<Row>> {
        (**self).query_all(sql, values)
    }

    fn execute(&self, sql: &str, values: &Values) -> Result<u64> {
        (**self).execute(sql, values)
    }

    fn last_insert_id(&self) -> Result<Option<Value>> {
        (**self).last_insert_id()
    }
}

/// Run `f` inside the statement span, recording duration and failures
pub(crate) fn instrumented<T>(sql: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    #[cfg(feature = "tracing")]
    let _span = tracing_helpers::execute_query_span(sql).entered();

    log::debug!("executing: {sql}");
    let start = Instant::now();
    let result = f();
    let duration = start.elapsed();

    #[cfg(feature = "metrics")]
    {
        METRICS.record_statement(duration);
        if result.is_err() {
            METRICS.record_statement_error();
        }
    }
    #[cfg(not(feature = "metrics"))]
    let _ = duration;

    if let Err(e) = &result {
        log::debug!("statement failed: {e}");
    }
    result
}
