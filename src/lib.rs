//! # Breakwater
//!
//! Repository and unit-of-work engine over pluggable storage: schema-described
//! entities, batched or joined eager loading, many-to-many junction sync,
//! optimistic locking, and a commit pipeline that expands cascades, diffs
//! snapshots and coalesces writes per connection.
//!
//! Storage is reached through [`Connection`]: [`MemoryStore`] for documents
//! kept in process, [`SqlConnection`] for relational drivers (PostgreSQL via
//! `may_postgres` with the `postgres` feature).

pub mod config;
pub mod connection;
pub mod entity;
pub mod error;
pub mod events;
pub mod executor;
pub mod metrics;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod query;
pub mod relation;
pub mod repository;
pub mod schema;
pub mod transaction;
pub mod unit_of_work;
pub mod value;

pub use config::{EagerStrategy, EngineConfig};
pub use connection::memory::MemoryStore;
pub use connection::sql::SqlConnection;
pub use connection::{Connection, SharedConnection};
pub use entity::{Entity, Related, Transforms};
pub use error::{EngineError, Result};
pub use events::{EventBus, EventPayload};
pub use executor::SqlExecutor;
pub use query::{Criteria, Order};
pub use relation::{RelationDef, SyncResult};
pub use repository::{Finder, Page, Repository, SimplePage, Trashed};
pub use schema::{EntitySchema, Model};
pub use unit_of_work::UnitOfWork;
pub use value::{Cast, Row, Value};
