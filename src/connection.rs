//! Storage capability contract.
//!
//! Repositories and the unit of work only ever see a [`Connection`]: something
//! that can run the structured statements from [`crate::query`] and wrap a
//! closure in a transaction (or session, for document stores).
//!
//! Two implementations ship with the crate:
//! - [`memory::MemoryStore`]: an in-process document store
//! - [`sql::SqlConnection`]: renders statements via sea-query and runs them
//!   on any [`SqlExecutor`](crate::executor::SqlExecutor)

pub mod memory;
pub mod sql;

use crate::error::Result;
use crate::query::{DeleteStatement, InsertStatement, SelectQuery, UpdateStatement};
use crate::value::{Row, Value};
use std::sync::Arc;

/// Capability interface every backing store provides
pub trait Connection: Send + Sync {
    /// Short label used in logs
    fn name(&self) -> &str;

    fn select(&self, query: &SelectQuery) -> Result<Vec<Row>>;

    /// Number of rows the query would return, ignoring ordering and paging
    fn count(&self, query: &SelectQuery) -> Result<u64>;

    /// Insert one row and return the key it was stored under, when known
    fn insert(&self, insert: &InsertStatement) -> Result<Option<Value>>;

    /// Returns the number of rows changed
    fn update(&self, update: &UpdateStatement) -> Result<u64>;

    /// Returns the number of rows removed
    fn delete(&self, delete: &DeleteStatement) -> Result<u64>;

    /// Run `body` atomically: commit on `Ok`, roll back and return the error on `Err`.
    ///
    /// Calls may nest; inner scopes are undone independently where the
    /// backend supports it.
    fn transaction(&self, body: &mut dyn FnMut() -> Result<()>) -> Result<()>;
}

/// Shared handle to a connection
pub type SharedConnection = Arc<dyn Connection>;

/// `true` when both handles point at the same physical connection
pub fn same_connection(a: &SharedConnection, b: &SharedConnection) -> bool {
    Arc::ptr_eq(a, b)
}

/// Run a value-returning closure inside [`Connection::transaction`]
///
/// # Example
///
/// ```
/// use breakwater::connection::{in_transaction, memory::MemoryStore};
///
/// let store = MemoryStore::new();
/// let answer = in_transaction(&store, || Ok(42)).unwrap();
/// assert_eq!(answer, 42);
/// ```
pub fn in_transaction<T>(
    connection: &dyn Connection,
    body: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let mut body = Some(body);
    let mut output = None;
    connection.transaction(&mut || {
        if let Some(body) = body.take() {
            output = Some(body()?);
        }
        Ok(())
    })?;
    output.ok_or_else(|| crate::error::EngineError::Transaction("transaction body did not run".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use memory::MemoryStore;

    #[test]
    fn test_in_transaction_returns_body_value() {
        let store = MemoryStore::new();
        let value = in_transaction(&store, || Ok("done")).unwrap();
        assert_eq!(value, "done");
    }

    #[test]
    fn test_in_transaction_propagates_error() {
        let store = MemoryStore::new();
        let result: Result<()> = in_transaction(&store, || Err(EngineError::validation("nope")));
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_same_connection_is_pointer_identity() {
        let a: SharedConnection = Arc::new(MemoryStore::new());
        let b = Arc::clone(&a);
        let c: SharedConnection = Arc::new(MemoryStore::new());
        assert!(same_connection(&a, &b));
        assert!(!same_connection(&a, &c));
    }
}
