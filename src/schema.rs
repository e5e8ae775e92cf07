//! Entity schemas: everything a repository needs to know about one entity type.
//!
//! A schema names the table (or collection), its primary key, declared
//! columns with their casts, optional timestamp / soft-delete / locking
//! columns, relations and attribute transforms. It is validated once, when a
//! [`Repository`](crate::repository::Repository) is built from it.
//!
//! # Example
//!
//! ```
//! use breakwater::relation::RelationDef;
//! use breakwater::schema::{EntitySchema, Model};
//! use breakwater::value::Cast;
//!
//! struct Post;
//! impl Model for Post {
//!     fn schema() -> EntitySchema {
//!         EntitySchema::new("posts").column("user_id").column("title")
//!     }
//! }
//!
//! struct User;
//! impl Model for User {
//!     fn schema() -> EntitySchema {
//!         EntitySchema::new("users")
//!             .column("name")
//!             .cast("active", Cast::Bool)
//!             .timestamps()
//!             .soft_deletes()
//!             .relation("posts", RelationDef::has_many(Post::schema, "user_id").cascade_delete())
//!     }
//! }
//!
//! assert!(User::schema().validate().is_ok());
//! ```

use crate::entity::{Entity, Transforms};
use crate::error::{EngineError, Result};
use crate::relation::RelationDef;
use crate::value::{Cast, Row, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Types that can describe their own schema
pub trait Model {
    fn schema() -> EntitySchema;
}

/// Auto-maintained timestamp columns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timestamps {
    pub created_at: String,
    pub updated_at: String,
}

impl Default for Timestamps {
    fn default() -> Self {
        Self {
            created_at: "created_at".to_string(),
            updated_at: "updated_at".to_string(),
        }
    }
}

/// Optimistic locking strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locking {
    /// Integer column compared on update and incremented by one
    Version { column: String },
}

impl Locking {
    pub fn column(&self) -> &str {
        match self {
            Locking::Version { column } => column,
        }
    }

    /// Lock value to write after `current`; a null version starts at 1
    pub fn next_value(&self, current: &Value) -> std::result::Result<Value, String> {
        let Locking::Version { column } = self;
        let version = match current {
            Value::Null => 0,
            Value::Number(n) => n
                .as_i64()
                .ok_or_else(|| format!("version column `{column}` holds non-integer {n}"))?,
            Value::String(s) => s
                .parse::<i64>()
                .map_err(|_| format!("version column `{column}` holds non-integer {s:?}"))?,
            other => return Err(format!("version column `{column}` holds non-integer {other}")),
        };
        version
            .checked_add(1)
            .map(Value::from)
            .ok_or_else(|| format!("version column `{column}` overflowed"))
    }
}

/// Static description of one entity type
#[derive(Clone)]
pub struct EntitySchema {
    pub table: String,
    pub primary_key: String,
    /// Declared columns; when non-empty, write payloads are filtered to them
    pub columns: Vec<String>,
    pub casts: HashMap<String, Cast>,
    pub timestamps: Option<Timestamps>,
    /// Deleted-marker column when soft deletes are enabled
    pub soft_delete: Option<String>,
    pub locking: Option<Locking>,
    pub relations: Vec<(String, RelationDef)>,
    pub transforms: Arc<Transforms>,
}

impl EntitySchema {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            primary_key: "id".to_string(),
            columns: Vec::new(),
            casts: HashMap::new(),
            timestamps: None,
            soft_delete: None,
            locking: None,
            relations: Vec::new(),
            transforms: Arc::new(Transforms::new()),
        }
    }

    pub fn primary_key(mut self, column: &str) -> Self {
        self.primary_key = column.to_string();
        self
    }

    /// Declare a column (enables payload filtering)
    pub fn column(mut self, name: &str) -> Self {
        if !self.columns.iter().any(|c| c == name) {
            self.columns.push(name.to_string());
        }
        self
    }

    /// Declare a column with a cast
    pub fn cast(mut self, name: &str, cast: Cast) -> Self {
        self.casts.insert(name.to_string(), cast);
        self.column(name)
    }

    /// Maintain `created_at` / `updated_at`
    pub fn timestamps(self) -> Self {
        self.timestamp_columns("created_at", "updated_at")
    }

    pub fn timestamp_columns(mut self, created_at: &str, updated_at: &str) -> Self {
        self.timestamps = Some(Timestamps {
            created_at: created_at.to_string(),
            updated_at: updated_at.to_string(),
        });
        self
    }

    /// Soft delete through `deleted_at`
    pub fn soft_deletes(self) -> Self {
        self.soft_delete_column("deleted_at")
    }

    pub fn soft_delete_column(mut self, column: &str) -> Self {
        self.soft_delete = Some(column.to_string());
        self
    }

    /// Optimistic locking on an integer version column
    pub fn version_column(mut self, column: &str) -> Self {
        self.locking = Some(Locking::Version {
            column: column.to_string(),
        });
        self
    }

    pub fn relation(mut self, name: &str, relation: RelationDef) -> Self {
        self.relations.push((name.to_string(), relation));
        self
    }

    pub fn accessor<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        let transforms = (*self.transforms).clone();
        self.transforms = Arc::new(transforms.accessor(name, f));
        self
    }

    pub fn mutator<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        let transforms = (*self.transforms).clone();
        self.transforms = Arc::new(transforms.mutator(name, f));
        self
    }

    pub fn find_relation(&self, name: &str) -> Option<&RelationDef> {
        self.relations
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, r)| r)
    }

    pub fn relation_names(&self) -> impl Iterator<Item = &str> {
        self.relations.iter().map(|(n, _)| n.as_str())
    }

    /// Check the schema for inconsistencies
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` naming the first problem found.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(EngineError::Config(format!("{}: {msg}", self.table)));
        if self.table.trim().is_empty() {
            return Err(EngineError::Config("schema table name is empty".to_string()));
        }
        if self.primary_key.trim().is_empty() {
            return fail("primary key column is empty".to_string());
        }
        if let Some(column) = &self.soft_delete {
            if column.is_empty() || *column == self.primary_key {
                return fail(format!("invalid soft-delete column `{column}`"));
            }
        }
        if let Some(locking) = &self.locking {
            let column = locking.column();
            if column.is_empty() || column == self.primary_key {
                return fail(format!("invalid lock column `{column}`"));
            }
        }
        let mut seen = HashSet::new();
        for (name, relation) in &self.relations {
            if name.is_empty() || name.contains('.') {
                return fail(format!("invalid relation name `{name}`"));
            }
            if !seen.insert(name.as_str()) {
                return fail(format!("relation `{name}` declared twice"));
            }
            if let Err(msg) = relation.check() {
                return fail(format!("relation `{name}`: {msg}"));
            }
        }
        Ok(())
    }

    /// Columns always accepted in write payloads, declared or not
    fn managed_columns(&self) -> Vec<&str> {
        let mut managed = vec![self.primary_key.as_str()];
        if let Some(ts) = &self.timestamps {
            managed.push(ts.created_at.as_str());
            managed.push(ts.updated_at.as_str());
        }
        if let Some(column) = &self.soft_delete {
            managed.push(column.as_str());
        }
        if let Some(locking) = &self.locking {
            managed.push(locking.column());
        }
        managed
    }

    /// Drop keys that are not declared columns (no-op when none are declared)
    pub fn filter_fields(&self, data: Row) -> Row {
        if self.columns.is_empty() {
            return data;
        }
        let managed = self.managed_columns();
        data.into_iter()
            .filter(|(key, _)| self.columns.contains(key) || managed.contains(&key.as_str()))
            .collect()
    }

    pub fn cast_for_storage(&self, mut data: Row) -> Row {
        for (key, value) in data.iter_mut() {
            if let Some(cast) = self.casts.get(key) {
                *value = cast.for_storage(std::mem::take(value));
            }
        }
        data
    }

    pub fn cast_from_storage(&self, mut row: Row) -> Row {
        for (key, value) in row.iter_mut() {
            if let Some(cast) = self.casts.get(key) {
                *value = cast.from_storage(std::mem::take(value));
            }
        }
        row
    }

    /// Build an entity from a storage row
    pub fn hydrate(&self, row: Row) -> Entity {
        let transforms = if self.transforms.is_empty() {
            None
        } else {
            Some(Arc::clone(&self.transforms))
        };
        Entity::hydrate(self.cast_from_storage(row), transforms)
    }
}

impl std::fmt::Debug for EntitySchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntitySchema")
            .field("table", &self.table)
            .field("primary_key", &self.primary_key)
            .field("columns", &self.columns)
            .field("timestamps", &self.timestamps)
            .field("soft_delete", &self.soft_delete)
            .field("locking", &self.locking)
            .field(
                "relations",
                &self.relations.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            )
            .finish()
    }
}
