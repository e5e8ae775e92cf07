//! Transaction bookkeeping for SQL executors.
//!
//! The outermost scope issues `BEGIN` / `COMMIT` / `ROLLBACK`; nested scopes
//! become savepoints (`sp_1`, `sp_2`, ...) so an inner failure can be undone
//! without abandoning the outer transaction.

use crate::error::EngineError;
use crate::executor::SqlExecutor;
use sea_query::Values;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Read uncommitted (PostgreSQL treats it as ReadCommitted)
    ReadUncommitted,
    /// Read committed (default)
    ReadCommitted,
    /// Repeatable read
    RepeatableRead,
    /// Serializable
    Serializable,
}

impl IsolationLevel {
    fn to_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Transaction error type
#[derive(Debug)]
pub enum TransactionError {
    /// Commit or rollback without a matching begin
    TransactionClosed,
    /// Savepoint creation, release or rollback failed
    NestedTransactionError(String),
    /// BEGIN / COMMIT / ROLLBACK failed
    Other(String),
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionError::TransactionClosed => {
                write!(f, "No transaction is open on this connection")
            }
            TransactionError::NestedTransactionError(s) => {
                write!(f, "Nested transaction error: {s}")
            }
            TransactionError::Other(s) => write!(f, "Transaction error: {s}"),
        }
    }
}

impl std::error::Error for TransactionError {}

impl From<TransactionError> for EngineError {
    fn from(err: TransactionError) -> Self {
        EngineError::Transaction(err.to_string())
    }
}

/// Open-scope counter for one SQL connection.
///
/// A connection is used by one logical caller at a time; the counter only
/// tracks how deeply `transaction` calls are nested.
#[derive(Debug, Default)]
pub struct Savepoints {
    depth: AtomicU32,
    isolation: Option<IsolationLevel>,
}

impl Savepoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `level` to every outermost transaction
    pub fn with_isolation(isolation: IsolationLevel) -> Self {
        Self {
            depth: AtomicU32::new(0),
            isolation: Some(isolation),
        }
    }

    /// Number of scopes currently open
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::SeqCst)
    }

    /// Open a scope and return its level (0 = outermost)
    pub fn begin<E: SqlExecutor + ?Sized>(&self, executor: &E) -> Result<u32, TransactionError> {
        let level = self.depth.fetch_add(1, Ordering::SeqCst);

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::begin_transaction_span(level).entered();

        let result = if level == 0 {
            run(executor, "BEGIN").map_err(TransactionError::Other).and_then(|_| {
                match self.isolation {
                    Some(isolation) if isolation != IsolationLevel::ReadCommitted => {
                        let sql = format!("SET TRANSACTION ISOLATION LEVEL {}", isolation.to_sql());
                        run(executor, &sql).map_err(TransactionError::Other)
                    }
                    _ => Ok(()),
                }
            })
        } else {
            run(executor, &format!("SAVEPOINT sp_{level}"))
                .map_err(TransactionError::NestedTransactionError)
        };

        match result {
            Ok(()) => Ok(level),
            Err(e) => {
                self.depth.fetch_sub(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Close scope `level`, keeping its work
    pub fn commit<E: SqlExecutor + ?Sized>(
        &self,
        executor: &E,
        level: u32,
    ) -> Result<(), TransactionError> {
        self.close(level)?;

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::commit_transaction_span(level).entered();

        if level == 0 {
            run(executor, "COMMIT").map_err(TransactionError::Other)
        } else {
            run(executor, &format!("RELEASE SAVEPOINT sp_{level}"))
                .map_err(TransactionError::NestedTransactionError)
        }
    }

    /// Close scope `level`, discarding its work
    pub fn rollback<E: SqlExecutor + ?Sized>(
        &self,
        executor: &E,
        level: u32,
    ) -> Result<(), TransactionError> {
        self.close(level)?;

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::rollback_transaction_span(level).entered();

        if level == 0 {
            run(executor, "ROLLBACK").map_err(TransactionError::Other)
        } else {
            run(executor, &format!("ROLLBACK TO SAVEPOINT sp_{level}"))
                .map_err(TransactionError::NestedTransactionError)
        }
    }

    fn close(&self, level: u32) -> Result<(), TransactionError> {
        // scopes close innermost first
        self.depth
            .compare_exchange(level + 1, level, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| TransactionError::TransactionClosed)
    }
}

fn run<E: SqlExecutor + ?Sized>(executor: &E, sql: &str) -> Result<(), String> {
    executor
        .execute(sql, &Values(Vec::new()))
        .map(|_| ())
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::value::Row;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Log(Mutex<Vec<String>>);

    impl SqlExecutor for Log {
        fn query_all(&self, _sql: &str, _values: &Values) -> Result<Vec<Row>> {
            Ok(Vec::new())
        }

        fn execute(&self, sql: &str, _values: &Values) -> Result<u64> {
            self.0.lock().unwrap().push(sql.to_string());
            Ok(0)
        }
    }

    #[test]
    fn test_isolation_level_to_sql() {
        assert_eq!(IsolationLevel::ReadUncommitted.to_sql(), "READ UNCOMMITTED");
        assert_eq!(IsolationLevel::ReadCommitted.to_sql(), "READ COMMITTED");
        assert_eq!(IsolationLevel::RepeatableRead.to_sql(), "REPEATABLE READ");
        assert_eq!(IsolationLevel::Serializable.to_sql(), "SERIALIZABLE");
    }

    #[test]
    fn test_nested_scopes_use_savepoints() {
        let log = Log::default();
        let savepoints = Savepoints::new();

        let outer = savepoints.begin(&log).unwrap();
        let inner = savepoints.begin(&log).unwrap();
        assert_eq!((outer, inner), (0, 1));
        savepoints.rollback(&log, inner).unwrap();
        savepoints.commit(&log, outer).unwrap();

        assert_eq!(
            *log.0.lock().unwrap(),
            vec!["BEGIN", "SAVEPOINT sp_1", "ROLLBACK TO SAVEPOINT sp_1", "COMMIT"]
        );
        assert_eq!(savepoints.depth(), 0);
    }

    #[test]
    fn test_isolation_applied_to_outer_scope_only() {
        let log = Log::default();
        let savepoints = Savepoints::with_isolation(IsolationLevel::Serializable);
        let outer = savepoints.begin(&log).unwrap();
        let inner = savepoints.begin(&log).unwrap();
        savepoints.commit(&log, inner).unwrap();
        savepoints.commit(&log, outer).unwrap();

        let log = log.0.lock().unwrap();
        assert_eq!(log[1], "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE");
        assert_eq!(log[3], "RELEASE SAVEPOINT sp_1");
    }

    #[test]
    fn test_commit_without_begin_is_closed() {
        let log = Log::default();
        let err = Savepoints::new().commit(&log, 0).unwrap_err();
        assert!(matches!(err, TransactionError::TransactionClosed));
        let engine: EngineError = err.into();
        assert!(engine.to_string().contains("No transaction is open"));
    }

    #[test]
    fn test_transaction_error_display() {
        let err = TransactionError::NestedTransactionError("test".to_string());
        assert!(err.to_string().contains("Nested transaction error"));
        let err = TransactionError::Other("test error".to_string());
        assert!(err.to_string().contains("Transaction error"));
    }
}
