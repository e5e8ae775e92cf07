//! Per-call query options.
//!
//! A [`Finder`] collects everything that only applies to the next read:
//! eager-load paths, projections, trashed visibility, scopes, ordering and
//! paging. It is consumed by its terminal call, so nothing leaks into the
//! following query.

use super::Repository;
use crate::config::EagerStrategy;
use crate::entity::Entity;
use crate::error::{EngineError, Result};
use crate::events::{EventPayload, AFTER_FIND, BEFORE_FIND};
use crate::query::{ColumnRef, Criteria, Order, Predicate, SelectQuery};
use crate::relation::{eager, join};
use crate::value::Value;
use std::fmt;
use std::rc::Rc;

/// Visibility of soft-deleted rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Trashed {
    /// Only rows whose deleted marker is null
    #[default]
    Exclude,
    Include,
    Only,
}

/// Adjusts the related query of one eager-load path
pub type Constraint = Rc<dyn for<'a> Fn(Finder<'a>) -> Finder<'a>>;

type OneShotScope<'r> = Box<dyn FnOnce(&mut Criteria) + 'r>;

pub struct Finder<'r> {
    pub(crate) repo: &'r Repository,
    pub(crate) eager: Vec<(String, Option<Constraint>)>,
    pub(crate) fields: Vec<String>,
    pub(crate) trashed: Trashed,
    named_scopes: Vec<String>,
    scopes: Vec<OneShotScope<'r>>,
    pub(crate) order_by: Vec<(String, Order)>,
    pub(crate) limit: Option<u64>,
    pub(crate) offset: Option<u64>,
    join_eager: Option<bool>,
}

impl<'r> Finder<'r> {
    pub(crate) fn new(repo: &'r Repository) -> Self {
        Self {
            repo,
            eager: Vec::new(),
            fields: Vec::new(),
            trashed: Trashed::Exclude,
            named_scopes: Vec::new(),
            scopes: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            join_eager: None,
        }
    }

    /// Eager-load relations; dotted paths load nested relations
    pub fn with(mut self, relations: &[&str]) -> Self {
        for relation in relations {
            self.eager.push((relation.to_string(), None));
        }
        self
    }

    /// Eager-load `path`, adjusting its query with `constraint`
    pub fn with_constrained<F>(mut self, path: &str, constraint: F) -> Self
    where
        F: for<'a> Fn(Finder<'a>) -> Finder<'a> + 'static,
    {
        self.eager.push((path.to_string(), Some(Rc::new(constraint))));
        self
    }

    pub(crate) fn with_paths(mut self, paths: Vec<(String, Option<Constraint>)>) -> Self {
        self.eager.extend(paths);
        self
    }

    /// Restrict the projection; `relation.column` restricts an eager-loaded relation
    pub fn fields(mut self, fields: &[&str]) -> Self {
        self.fields.extend(fields.iter().map(|f| f.to_string()));
        self
    }

    pub(crate) fn raw_fields(mut self, fields: Vec<String>) -> Self {
        self.fields.extend(fields);
        self
    }

    pub fn with_trashed(mut self) -> Self {
        self.trashed = Trashed::Include;
        self
    }

    pub fn only_trashed(mut self) -> Self {
        self.trashed = Trashed::Only;
        self
    }

    /// Apply a registered named scope
    pub fn scoped(mut self, name: &str) -> Self {
        self.named_scopes.push(name.to_string());
        self
    }

    /// Apply a one-off criteria mutator
    pub fn scope<F>(mut self, scope: F) -> Self
    where
        F: FnOnce(&mut Criteria) + 'r,
    {
        self.scopes.push(Box::new(scope));
        self
    }

    pub fn order_by(mut self, column: &str, order: Order) -> Self {
        self.order_by.push((column.to_string(), order));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Force (or refuse) the single-query join strategy for this call
    pub fn join_eager(mut self, enabled: bool) -> Self {
        self.join_eager = Some(enabled);
        self
    }

    pub fn find_by_id(self, id: impl Into<Value>) -> Result<Option<Entity>> {
        let id = id.into();
        if self.uses_identity_map() {
            if let Some(uow) = self.repo.deferring() {
                if let Some(entity) = uow.lookup(self.repo.table(), &id) {
                    log::debug!("{}#{} served from identity map", self.repo.table(), id);
                    if !self.eager.is_empty() {
                        eager::load(self.repo, std::slice::from_ref(&entity), &self.eager, &self.fields)?;
                    }
                    return Ok(Some(entity));
                }
            }
        }
        let pk = self.repo.primary_key().to_string();
        self.find_one_by(Criteria::new().eq(&pk, id))
    }

    pub fn find_one_by(self, criteria: impl Into<Criteria>) -> Result<Option<Entity>> {
        Ok(self.run(criteria.into(), Vec::new(), true)?.into_iter().next())
    }

    pub fn find_all_by(self, criteria: impl Into<Criteria>) -> Result<Vec<Entity>> {
        self.run(criteria.into(), Vec::new(), false)
    }

    /// Every visible row whose `column` is one of `values`
    pub fn find_all_where_in(self, column: &str, values: Vec<Value>) -> Result<Vec<Entity>> {
        if values.is_empty() {
            return Ok(Vec::new());
        }
        let membership = Predicate::In(ColumnRef::new(column), values);
        self.run(Criteria::new(), vec![membership], false)
    }

    /// Only complete rows of live entities are registered in the identity map
    pub(crate) fn registers_entities(&self) -> bool {
        self.trashed == Trashed::Exclude && self.base_projection().is_empty()
    }

    fn uses_identity_map(&self) -> bool {
        self.trashed == Trashed::Exclude
            && self.fields.is_empty()
            && self.named_scopes.is_empty()
            && self.scopes.is_empty()
    }

    /// Apply scopes and the before-find event; returns the final criteria
    pub(crate) fn prepare(&mut self, criteria: Criteria) -> Result<Criteria> {
        let mut criteria = criteria;
        for name in std::mem::take(&mut self.named_scopes) {
            let scope = self.repo.named_scope(&name).ok_or_else(|| {
                EngineError::validation(format!("unknown scope `{name}` on {}", self.repo.table()))
            })?;
            scope(&mut criteria);
        }
        for scope in std::mem::take(&mut self.scopes) {
            scope(&mut criteria);
        }
        let mut payload = EventPayload::for_table(self.repo.table()).with_criteria(criteria);
        self.repo.events().publish(BEFORE_FIND, &mut payload);
        Ok(payload.criteria.unwrap_or_default())
    }

    /// Base-table columns to select; empty means all of them
    pub(crate) fn base_projection(&self) -> Vec<String> {
        let mut columns: Vec<String> = self
            .fields
            .iter()
            .filter(|f| !f.contains('.'))
            .cloned()
            .collect();
        if columns.is_empty() {
            return columns;
        }
        let schema = self.repo.schema();
        let mut required = vec![schema.primary_key.clone()];
        for (path, _) in &self.eager {
            let first = path.split('.').next().unwrap_or(path);
            if let Some(def) = schema.find_relation(first) {
                required.push(def.parent_key(schema));
            }
        }
        for column in required {
            if !columns.contains(&column) {
                columns.push(column);
            }
        }
        columns
    }

    /// Filter predicates for the base table
    pub(crate) fn filter(&self, criteria: &Criteria, extra: Vec<Predicate>) -> Vec<Predicate> {
        let mut filter = criteria.to_predicates();
        filter.extend(extra);
        filter.extend(self.repo.trashed_predicate(self.trashed));
        filter
    }

    pub(crate) fn select(&self, criteria: &Criteria, extra: Vec<Predicate>) -> SelectQuery {
        let mut query = SelectQuery::new(self.repo.table())
            .columns(&self.base_projection())
            .filters(self.filter(criteria, extra));
        for (column, order) in &self.order_by {
            query = query.order_by(ColumnRef::new(column), *order);
        }
        query.limit = self.limit;
        query.offset = self.offset;
        query
    }

    fn wants_join(&self) -> bool {
        let configured = self.repo.config().eager_strategy == EagerStrategy::Join;
        !self.eager.is_empty()
            && self.join_eager.unwrap_or(configured)
            && self.limit.is_none()
            && self.offset.is_none()
    }

    fn run(mut self, criteria: Criteria, extra: Vec<Predicate>, single: bool) -> Result<Vec<Entity>> {
        let criteria = self.prepare(criteria)?;

        let joined = if self.wants_join() {
            match join::plan(self.repo, &self.eager, &self.fields)? {
                Some(plan) => Some(join::execute(self.repo, &plan, &self, &criteria, extra.clone())?),
                None => {
                    log::debug!(
                        "join eager loading not applicable on {}; using batched loading",
                        self.repo.table()
                    );
                    None
                }
            }
        } else {
            None
        };

        let entities = match joined {
            Some(mut entities) => {
                if single {
                    entities.truncate(1);
                }
                entities
            }
            None => {
                let mut query = self.select(&criteria, extra);
                if single {
                    query.limit = Some(1);
                }
                let rows = self.repo.connection().select(&query)?;
                let entities = self
                    .repo
                    .hydrate_rows(rows, self.registers_entities());
                if !self.eager.is_empty() {
                    eager::load(self.repo, &entities, &self.eager, &self.fields)?;
                }
                entities
            }
        };

        let mut payload = EventPayload::for_table(self.repo.table()).with_criteria(criteria);
        payload.affected = Some(entities.len() as u64);
        self.repo.events().publish(AFTER_FIND, &mut payload);
        Ok(entities)
    }
}

impl fmt::Debug for Finder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Finder")
            .field("table", &self.repo.table())
            .field("eager", &self.eager.iter().map(|(p, _)| p).collect::<Vec<_>>())
            .field("fields", &self.fields)
            .field("trashed", &self.trashed)
            .field("order_by", &self.order_by)
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .finish()
    }
}
