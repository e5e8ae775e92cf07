//! Repositories: the query and persistence façade for one entity type.
//!
//! A [`Repository`] pairs a validated [`EntitySchema`] with a connection. Reads
//! go through a per-call [`Finder`] (eager loading, projections, trashed
//! visibility, scopes, ordering and paging); writes live in `crud`.
//!
//! Binding a repository to a [`UnitOfWork`] with [`Repository::bind`] makes
//! `update`/`delete` calls deferred while that unit of work is active, and
//! makes `find_by_id` consult its identity map.
//!
//! # Example
//!
//! ```
//! use breakwater::connection::memory::MemoryStore;
//! use breakwater::query::Criteria;
//! use breakwater::repository::Repository;
//! use breakwater::schema::EntitySchema;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # fn main() -> breakwater::Result<()> {
//! let users = Repository::new(EntitySchema::new("users"), Arc::new(MemoryStore::new()))?;
//! let mut data = breakwater::Row::new();
//! data.insert("name".into(), json!("Ada"));
//! let ada = users.insert(data)?;
//!
//! let found = users.find_one_by(Criteria::new().eq("name", "Ada"))?;
//! assert_eq!(found.and_then(|e| e.get("id")), ada.get("id"));
//! # Ok(())
//! # }
//! ```

mod crud;
mod finder;
mod paginate;

pub use finder::{Constraint, Finder, Trashed};
pub use paginate::{Page, SimplePage};

use crate::config::EngineConfig;
use crate::connection::SharedConnection;
use crate::entity::Entity;
use crate::error::{EngineError, Result};
use crate::events::EventBus;
use crate::query::{ColumnRef, Criteria, Predicate};
use crate::relation::{self, pivot, RelationDef, SyncResult};
use crate::schema::{EntitySchema, Model};
use crate::unit_of_work::UnitOfWork;
use crate::value::{now_string, Row, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Reusable criteria mutator registered under a name
pub type NamedScope = Arc<dyn Fn(&mut Criteria) + Send + Sync>;

/// Query and persistence façade for one entity type on one connection
#[derive(Clone)]
pub struct Repository {
    schema: Arc<EntitySchema>,
    connection: SharedConnection,
    config: Arc<EngineConfig>,
    events: EventBus,
    scopes: Arc<RwLock<HashMap<String, NamedScope>>>,
    unit_of_work: Option<UnitOfWork>,
}

impl Repository {
    /// Build a repository, validating `schema` first
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` when the schema is inconsistent.
    pub fn new(schema: EntitySchema, connection: SharedConnection) -> Result<Self> {
        schema.validate()?;
        Ok(Self {
            schema: Arc::new(schema),
            connection,
            config: Arc::new(EngineConfig::default()),
            events: EventBus::new(),
            scopes: Arc::new(RwLock::new(HashMap::new())),
            unit_of_work: None,
        })
    }

    pub fn for_model<M: Model>(connection: SharedConnection) -> Result<Self> {
        Self::new(M::schema(), connection)
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// A handle on the same repository that participates in `unit_of_work`
    pub fn bind(&self, unit_of_work: &UnitOfWork) -> Self {
        let mut bound = self.clone();
        bound.unit_of_work = Some(unit_of_work.clone());
        bound
    }

    /// A handle that always executes immediately
    pub fn unbound(&self) -> Self {
        let mut unbound = self.clone();
        unbound.unit_of_work = None;
        unbound
    }

    pub fn schema(&self) -> &EntitySchema {
        &self.schema
    }

    pub fn table(&self) -> &str {
        &self.schema.table
    }

    pub fn primary_key(&self) -> &str {
        &self.schema.primary_key
    }

    pub fn connection(&self) -> &SharedConnection {
        &self.connection
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn unit_of_work(&self) -> Option<&UnitOfWork> {
        self.unit_of_work.as_ref()
    }

    /// The bound unit of work, when it is active and not replaying
    pub(crate) fn deferring(&self) -> Option<&UnitOfWork> {
        self.unit_of_work.as_ref().filter(|uow| uow.is_deferring())
    }

    /// Repository for the relation `name`, sharing connection, config, events
    /// and unit of work
    pub fn related(&self, name: &str) -> Result<Repository> {
        let def = self
            .schema
            .find_relation(name)
            .ok_or_else(|| EngineError::UnknownRelation {
                table: self.table().to_string(),
                relation: name.to_string(),
            })?;
        self.related_for(def)
    }

    pub(crate) fn related_for(&self, def: &RelationDef) -> Result<Repository> {
        let schema = def.related_schema();
        schema.validate()?;
        Ok(Repository {
            schema: Arc::new(schema),
            connection: Arc::clone(&self.connection),
            config: Arc::clone(&self.config),
            events: self.events.clone(),
            scopes: Arc::new(RwLock::new(HashMap::new())),
            unit_of_work: self.unit_of_work.clone(),
        })
    }

    /// Install a reusable criteria mutator, applied by [`Finder::scoped`]
    pub fn register_scope<F>(&self, name: &str, scope: F)
    where
        F: Fn(&mut Criteria) + Send + Sync + 'static,
    {
        match self.scopes.write() {
            Ok(mut scopes) => {
                scopes.insert(name.to_string(), Arc::new(scope));
            }
            Err(_) => log::warn!("scope registry poisoned; `{name}` not registered"),
        }
    }

    pub(crate) fn named_scope(&self, name: &str) -> Option<NamedScope> {
        self.scopes.read().ok()?.get(name).cloned()
    }

    /// Start a per-call query
    pub fn query(&self) -> Finder<'_> {
        Finder::new(self)
    }

    pub fn with(&self, relations: &[&str]) -> Finder<'_> {
        self.query().with(relations)
    }

    pub fn fields(&self, fields: &[&str]) -> Finder<'_> {
        self.query().fields(fields)
    }

    pub fn with_trashed(&self) -> Finder<'_> {
        self.query().with_trashed()
    }

    pub fn only_trashed(&self) -> Finder<'_> {
        self.query().only_trashed()
    }

    pub fn scoped(&self, name: &str) -> Finder<'_> {
        self.query().scoped(name)
    }

    pub fn find_by_id(&self, id: impl Into<Value>) -> Result<Option<Entity>> {
        self.query().find_by_id(id)
    }

    pub fn find_one_by(&self, criteria: impl Into<Criteria>) -> Result<Option<Entity>> {
        self.query().find_one_by(criteria)
    }

    pub fn find_all_by(&self, criteria: impl Into<Criteria>) -> Result<Vec<Entity>> {
        self.query().find_all_by(criteria)
    }

    /// Every visible row whose `column` is one of `values`
    pub fn find_all_where_in(&self, column: &str, values: Vec<Value>) -> Result<Vec<Entity>> {
        self.query().find_all_where_in(column, values)
    }

    pub fn paginate(&self, page: u64, page_size: u64, criteria: impl Into<Criteria>) -> Result<Page> {
        self.query().paginate(page, page_size, criteria)
    }

    pub fn simple_paginate(
        &self,
        page: u64,
        page_size: u64,
        criteria: impl Into<Criteria>,
    ) -> Result<SimplePage> {
        self.query().simple_paginate(page, page_size, criteria)
    }

    /// Load `relation` (dotted paths allowed) onto an already hydrated entity
    pub fn load(&self, entity: &Entity, relation: &str) -> Result<()> {
        relation::lazy::load(self, entity, relation)
    }

    pub fn load_many(&self, entities: &[Entity], relation: &str) -> Result<()> {
        relation::lazy::load_many(self, entities, relation)
    }

    /// Insert junction rows linking `parent_key` to each of `related_ids`
    pub fn attach(&self, relation: &str, parent_key: Value, related_ids: &[Value]) -> Result<u64> {
        pivot::attach(self, relation, &parent_key, related_ids)
    }

    /// Remove junction rows for `parent_key`; all of them when `related_ids` is `None`
    pub fn detach(
        &self,
        relation: &str,
        parent_key: Value,
        related_ids: Option<&[Value]>,
    ) -> Result<u64> {
        pivot::detach(self, relation, &parent_key, related_ids)
    }

    /// Make the junction rows for `parent_key` exactly `related_ids`
    pub fn sync(&self, relation: &str, parent_key: Value, related_ids: &[Value]) -> Result<SyncResult> {
        pivot::sync(self, relation, &parent_key, related_ids)
    }

    /// Turn storage rows into entities, registering full rows in the
    /// identity map of an active unit of work
    pub(crate) fn hydrate_rows(&self, rows: Vec<Row>, register: bool) -> Vec<Entity> {
        let uow = if register { self.deferring() } else { None };
        rows.into_iter()
            .map(|row| {
                let entity = self.schema.hydrate(row);
                match (uow, entity.raw(self.primary_key())) {
                    (Some(uow), Some(id)) if !id.is_null() => {
                        uow.register(self.table(), &id, entity, self.unbound())
                    }
                    _ => entity,
                }
            })
            .collect()
    }

    /// Visibility predicate for soft-deleted rows, if soft deletes are enabled
    pub(crate) fn trashed_predicate(&self, trashed: Trashed) -> Option<Predicate> {
        let column = ColumnRef::new(self.schema.soft_delete.as_deref()?);
        match trashed {
            Trashed::Exclude => Some(Predicate::IsNull(column)),
            Trashed::Only => Some(Predicate::IsNotNull(column)),
            Trashed::Include => None,
        }
    }

    pub(crate) fn now(&self) -> Value {
        Value::String(now_string(&self.config.timestamp_format))
    }
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("table", &self.schema.table)
            .field("connection", &self.connection.name())
            .field("bound", &self.unit_of_work.is_some())
            .finish()
    }
}
