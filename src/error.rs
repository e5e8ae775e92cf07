//! Error types for repository and unit-of-work operations.
//!
//! "Not found" is never an error in this crate: finders return `None` or an
//! empty list. Everything that can go wrong is expressed by [`EngineError`].

use crate::value::Value;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, EngineError>;

/// Error type for repository, relation and unit-of-work operations
#[derive(Debug)]
pub enum EngineError {
    /// Empty or malformed mutation payload
    Validation(String),
    /// Compare-and-swap on the lock column lost the race
    OptimisticLock {
        table: String,
        id: Value,
        expected: Value,
    },
    /// Bulk update attempted on a repository with row-level optimistic locking
    LockingUnsupported { table: String },
    /// Relation name not declared on the entity schema (strict mode only)
    UnknownRelation { table: String, relation: String },
    /// Invalid schema or engine configuration
    Config(String),
    /// Statement could not be rendered for the target backend
    Query(String),
    /// Failure reported by the storage backend
    Storage(String),
    /// Transaction bookkeeping failure (begin/commit/rollback)
    Transaction(String),
    /// `PostgreSQL` error from `may_postgres`
    #[cfg(feature = "postgres")]
    Postgres(may_postgres::Error),
}

impl EngineError {
    /// Shorthand for building a [`EngineError::Validation`]
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    /// Shorthand for building a [`EngineError::Storage`]
    pub fn storage(msg: impl Into<String>) -> Self {
        EngineError::Storage(msg.into())
    }

    /// `true` when another writer won an optimistic-lock race.
    ///
    /// This is the one recoverable condition callers are expected to handle
    /// (reload and retry, or report a conflict). It is never retried here.
    pub fn is_optimistic_lock(&self) -> bool {
        matches!(self, EngineError::OptimisticLock { .. })
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "Validation error: {msg}"),
            EngineError::OptimisticLock {
                table,
                id,
                expected,
            } => write!(
                f,
                "Optimistic lock failed on {table} (id {id}): row no longer at version {expected}"
            ),
            EngineError::LockingUnsupported { table } => write!(
                f,
                "Bulk update on {table} is not supported while optimistic locking is enabled"
            ),
            EngineError::UnknownRelation { table, relation } => {
                write!(f, "Unknown relation `{relation}` on {table}")
            }
            EngineError::Config(msg) => write!(f, "Configuration error: {msg}"),
            EngineError::Query(msg) => write!(f, "Query error: {msg}"),
            EngineError::Storage(msg) => write!(f, "Storage error: {msg}"),
            EngineError::Transaction(msg) => write!(f, "Transaction error: {msg}"),
            #[cfg(feature = "postgres")]
            EngineError::Postgres(e) => write!(f, "PostgreSQL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            #[cfg(feature = "postgres")]
            EngineError::Postgres(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(feature = "postgres")]
impl From<may_postgres::Error> for EngineError {
    fn from(err: may_postgres::Error) -> Self {
        EngineError::Postgres(err)
    }
}

impl From<sea_query::error::Error> for EngineError {
    fn from(err: sea_query::error::Error) -> Self {
        EngineError::Query(err.to_string())
    }
}
