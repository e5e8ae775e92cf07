//! Writes: insert, update, delete and their soft-delete / locking variants.
//!
//! `update*` and `delete*` defer to the bound unit of work while it is active;
//! the `apply_*` functions are what eventually runs, either immediately or
//! when the unit of work replays its queue.

use super::{Repository, Trashed};
use crate::connection::in_transaction;
use crate::entity::Entity;
use crate::error::{EngineError, Result};
use crate::events::{
    EventPayload, AFTER_DELETE, AFTER_INSERT, AFTER_UPDATE, BEFORE_DELETE, BEFORE_INSERT,
    BEFORE_UPDATE,
};
use crate::query::{
    ColumnRef, Criteria, DeleteStatement, InsertStatement, Predicate, SelectQuery, UpdateStatement,
};
use crate::unit_of_work::Operation;
use crate::value::{Row, Value};

impl Repository {
    /// Insert a row and return the stored entity.
    ///
    /// # Errors
    ///
    /// `EngineError::Validation` when `data` is empty, or nothing is left
    /// after filtering to declared columns.
    pub fn insert(&self, data: Row) -> Result<Entity> {
        if data.is_empty() {
            return Err(EngineError::validation(format!(
                "insert into {} with empty data",
                self.table()
            )));
        }
        let mut payload = EventPayload::for_table(self.table()).with_data(data);
        self.events().publish(BEFORE_INSERT, &mut payload);
        let data = self.schema().filter_fields(payload.data.unwrap_or_default());
        let mut data = self.schema().transforms.apply_mutators(data);
        if data.is_empty() {
            return Err(EngineError::validation(format!(
                "insert into {}: no known columns in data",
                self.table()
            )));
        }

        if let Some(ts) = &self.schema().timestamps {
            let now = self.now();
            for column in [&ts.created_at, &ts.updated_at] {
                if !data.get(column).is_some_and(|v| !v.is_null()) {
                    data.insert(column.clone(), now.clone());
                }
            }
        }
        if let Some(locking) = &self.schema().locking {
            let column = locking.column();
            if !data.get(column).is_some_and(|v| !v.is_null()) {
                data.insert(column.to_string(), Value::from(1));
            }
        }
        let data = self.schema().cast_for_storage(data);

        let pk = self.primary_key().to_string();
        let generated = self.connection().insert(&InsertStatement {
            table: self.table().to_string(),
            values: data.clone(),
            returning: Some(pk.clone()),
        })?;
        let id = data
            .get(&pk)
            .filter(|v| !v.is_null())
            .cloned()
            .or(generated);

        let entity = match &id {
            Some(id) => match self.with_trashed().find_by_id(id.clone())? {
                Some(entity) => entity,
                None => self.synthesize(data.clone(), Some(id.clone())),
            },
            None => self.synthesize(data.clone(), None),
        };

        let mut after = EventPayload::for_table(self.table()).with_data(data);
        after.id = id;
        after.affected = Some(1);
        self.events().publish(AFTER_INSERT, &mut after);
        Ok(entity)
    }

    fn synthesize(&self, mut row: Row, id: Option<Value>) -> Entity {
        if let Some(id) = id {
            row.insert(self.primary_key().to_string(), id);
        }
        self.schema().hydrate(row)
    }

    /// Update one row by primary key.
    ///
    /// Executes immediately and returns the re-fetched entity (`None` when the
    /// row does not exist). While a bound unit of work is active the change is
    /// queued instead and a merged in-memory view is returned.
    ///
    /// # Errors
    ///
    /// `EngineError::Validation` for an empty payload and
    /// `EngineError::OptimisticLock` when the version check fails.
    pub fn update(&self, id: impl Into<Value>, data: Row) -> Result<Option<Entity>> {
        let id = id.into();
        if data.is_empty() {
            return Err(EngineError::validation(format!(
                "update of {}#{id} with empty data",
                self.table()
            )));
        }
        let mut payload = EventPayload::for_table(self.table())
            .with_id(id.clone())
            .with_data(data);
        self.events().publish(BEFORE_UPDATE, &mut payload);
        let mut data = self
            .schema()
            .transforms
            .apply_mutators(self.schema().filter_fields(payload.data.unwrap_or_default()));
        data.remove(self.primary_key());

        match self.deferring() {
            Some(uow) => {
                let attached = uow.lookup(self.table(), &id);
                if let (Some(locking), Some(entity)) = (&self.schema().locking, &attached) {
                    let column = locking.column();
                    if !data.contains_key(column) {
                        let seen = uow
                            .snapshot(self.table(), &id)
                            .and_then(|s| s.get(column).cloned())
                            .or_else(|| entity.raw(column));
                        if let Some(seen) = seen {
                            data.insert(column.to_string(), seen);
                        }
                    }
                }
                let view = match attached {
                    Some(entity) => Some(entity),
                    None => self.with_trashed().find_by_id(id.clone())?,
                };
                uow.enqueue(Operation::update_by_id(self.unbound(), id.clone(), data.clone()));
                let mut visible = data;
                if let Some(locking) = &self.schema().locking {
                    visible.remove(locking.column());
                }
                Ok(Some(match view {
                    Some(entity) => {
                        entity.merge_raw(&visible);
                        entity
                    }
                    None => self.synthesize(visible, Some(id)),
                }))
            }
            None => self.apply_update(&id, data),
        }
    }

    /// Execute an update by primary key now; `data` has been filtered and mutated
    pub(crate) fn apply_update(&self, id: &Value, mut data: Row) -> Result<Option<Entity>> {
        let pk = self.primary_key().to_string();
        data.remove(&pk);
        if let Some(ts) = &self.schema().timestamps {
            data.insert(ts.updated_at.clone(), self.now());
        }
        let mut set = self.schema().cast_for_storage(data);
        let mut criteria = Criteria::new().eq(&pk, id.clone());

        let mut expected = None;
        if let Some(locking) = &self.schema().locking {
            let column = locking.column().to_string();
            let current = match set.remove(&column) {
                Some(value) => value,
                None => match self.stored_value(id, &column)? {
                    Some(value) => value,
                    None => return Ok(None),
                },
            };
            let next = locking
                .next_value(&current)
                .map_err(|e| EngineError::validation(format!("update of {}#{id}: {e}", self.table())))?;
            set.insert(column.clone(), next);
            criteria.set(&column, current.clone());
            expected = Some(current);
        }
        if set.is_empty() {
            return Err(EngineError::validation(format!(
                "update of {}#{id}: no known columns in data",
                self.table()
            )));
        }

        let affected = self.connection().update(&UpdateStatement {
            table: self.table().to_string(),
            set: set.clone(),
            filter: criteria.to_predicates(),
        })?;
        if affected == 0 {
            if let Some(expected) = expected {
                return Err(EngineError::OptimisticLock {
                    table: self.table().to_string(),
                    id: id.clone(),
                    expected,
                });
            }
            return Ok(None);
        }

        let mut after = EventPayload::for_table(self.table())
            .with_id(id.clone())
            .with_data(set);
        after.affected = Some(affected);
        self.events().publish(AFTER_UPDATE, &mut after);
        self.with_trashed().find_by_id(id.clone())
    }

    pub(crate) fn stored_value(&self, id: &Value, column: &str) -> Result<Option<Value>> {
        let query = SelectQuery::new(self.table())
            .column(column)
            .filter(Predicate::Eq(ColumnRef::new(self.primary_key()), id.clone()))
            .limit(1);
        Ok(self
            .connection()
            .select(&query)?
            .into_iter()
            .next()
            .map(|mut row| row.remove(column).unwrap_or(Value::Null)))
    }

    /// The stored row for `id`, unless it is missing or trashed
    pub(crate) fn live_row(&self, id: &Value) -> Result<Option<Row>> {
        let criteria = Criteria::new().eq(self.primary_key(), id.clone());
        let query = SelectQuery::new(self.table())
            .filters(self.visible(&criteria, false))
            .limit(1);
        Ok(self.connection().select(&query)?.into_iter().next())
    }

    /// Bulk update of every visible row matching `criteria`.
    ///
    /// Returns the number of rows changed, or `0` when deferred.
    ///
    /// # Errors
    ///
    /// `EngineError::LockingUnsupported` when the schema uses optimistic locking.
    pub fn update_by(&self, criteria: impl Into<Criteria>, data: Row) -> Result<u64> {
        if self.schema().locking.is_some() {
            return Err(EngineError::LockingUnsupported {
                table: self.table().to_string(),
            });
        }
        if data.is_empty() {
            return Err(EngineError::validation(format!(
                "bulk update of {} with empty data",
                self.table()
            )));
        }
        let mut payload = EventPayload::for_table(self.table())
            .with_criteria(criteria.into())
            .with_data(data);
        self.events().publish(BEFORE_UPDATE, &mut payload);
        let criteria = payload.criteria.unwrap_or_default();
        let data = self
            .schema()
            .transforms
            .apply_mutators(self.schema().filter_fields(payload.data.unwrap_or_default()));

        match self.deferring() {
            Some(uow) => {
                uow.enqueue(Operation::update_by(self.unbound(), criteria, data));
                Ok(0)
            }
            None => self.apply_update_by(&criteria, data),
        }
    }

    pub(crate) fn apply_update_by(&self, criteria: &Criteria, mut data: Row) -> Result<u64> {
        data.remove(self.primary_key());
        if let Some(ts) = &self.schema().timestamps {
            data.insert(ts.updated_at.clone(), self.now());
        }
        let set = self.schema().cast_for_storage(data);
        if set.is_empty() {
            return Err(EngineError::validation(format!(
                "bulk update of {}: no known columns in data",
                self.table()
            )));
        }
        let mut filter = criteria.to_predicates();
        filter.extend(self.trashed_predicate(Trashed::Exclude));
        let affected = self.connection().update(&UpdateStatement {
            table: self.table().to_string(),
            set: set.clone(),
            filter,
        })?;

        let mut after = EventPayload::for_table(self.table())
            .with_criteria(criteria.clone())
            .with_data(set);
        after.affected = Some(affected);
        self.events().publish(AFTER_UPDATE, &mut after);
        Ok(affected)
    }

    /// Delete (or soft delete) one row; dependents marked for cascade go with it.
    ///
    /// Returns the number of rows removed, or `0` when deferred.
    pub fn delete_by_id(&self, id: impl Into<Value>) -> Result<u64> {
        let id = id.into();
        let mut payload = EventPayload::for_table(self.table()).with_id(id.clone());
        self.events().publish(BEFORE_DELETE, &mut payload);
        let id = payload.id.unwrap_or(id);
        match self.deferring() {
            Some(uow) => {
                uow.enqueue(Operation::delete_by_id(self.unbound(), id));
                Ok(0)
            }
            None => self.apply_delete_by_id(&id, true),
        }
    }

    /// Delete (or soft delete) every row matching `criteria`
    pub fn delete_by(&self, criteria: impl Into<Criteria>) -> Result<u64> {
        let mut payload = EventPayload::for_table(self.table()).with_criteria(criteria.into());
        self.events().publish(BEFORE_DELETE, &mut payload);
        let criteria = payload.criteria.unwrap_or_default();
        match self.deferring() {
            Some(uow) => {
                uow.enqueue(Operation::delete_by(self.unbound(), criteria));
                Ok(0)
            }
            None => self.apply_delete_by(&criteria, true),
        }
    }

    pub(crate) fn apply_delete_by_id(&self, id: &Value, cascade: bool) -> Result<u64> {
        let criteria = Criteria::new().eq(self.primary_key(), id.clone());
        let affected = self.remove(&criteria, cascade, false)?;
        let mut after = EventPayload::for_table(self.table()).with_id(id.clone());
        after.affected = Some(affected);
        self.events().publish(AFTER_DELETE, &mut after);
        Ok(affected)
    }

    pub(crate) fn apply_delete_by(&self, criteria: &Criteria, cascade: bool) -> Result<u64> {
        let affected = self.remove(criteria, cascade, false)?;
        let mut after = EventPayload::for_table(self.table()).with_criteria(criteria.clone());
        after.affected = Some(affected);
        self.events().publish(AFTER_DELETE, &mut after);
        Ok(affected)
    }

    /// Physically delete one row, even under soft deletes
    pub fn force_delete_by_id(&self, id: impl Into<Value>) -> Result<u64> {
        let criteria = Criteria::new().eq(self.primary_key(), id.into());
        self.force_delete_by(criteria)
    }

    /// Physically delete every row matching `criteria`, trashed or not
    pub fn force_delete_by(&self, criteria: impl Into<Criteria>) -> Result<u64> {
        let mut payload = EventPayload::for_table(self.table()).with_criteria(criteria.into());
        self.events().publish(BEFORE_DELETE, &mut payload);
        let criteria = payload.criteria.unwrap_or_default();
        let affected = self.remove(&criteria, true, true)?;
        let mut after = EventPayload::for_table(self.table()).with_criteria(criteria);
        after.affected = Some(affected);
        self.events().publish(AFTER_DELETE, &mut after);
        Ok(affected)
    }

    /// Delete matching rows and, when `cascade`, their dependents, in one transaction
    fn remove(&self, criteria: &Criteria, cascade: bool, force: bool) -> Result<u64> {
        let cascading: Vec<_> = self
            .schema()
            .relations
            .iter()
            .filter(|(_, def)| cascade && def.cascades())
            .map(|(_, def)| def.clone())
            .collect();
        let soft = if force { None } else { self.schema().soft_delete.clone() };

        in_transaction(self.connection().as_ref(), || {
            if !cascading.is_empty() {
                let parents = self.connection().select(
                    &SelectQuery::new(self.table()).filters(self.visible(criteria, force)),
                )?;
                for def in &cascading {
                    let related = self.related_for(def)?.unbound();
                    let parent_key = def.parent_key(self.schema());
                    let child_key = def.child_key(related.schema());
                    for parent in &parents {
                        match parent.get(&parent_key) {
                            Some(value) if !value.is_null() => {
                                let children = Criteria::new().eq(&child_key, value.clone());
                                related.remove(&children, true, force)?;
                            }
                            _ => {}
                        }
                    }
                }
            }

            match &soft {
                Some(column) => {
                    let mut set = Row::new();
                    let now = self.now();
                    set.insert(column.clone(), now.clone());
                    if let Some(ts) = &self.schema().timestamps {
                        set.insert(ts.updated_at.clone(), now);
                    }
                    self.connection().update(&UpdateStatement {
                        table: self.table().to_string(),
                        set,
                        filter: self.visible(criteria, false),
                    })
                }
                None => self.connection().delete(&DeleteStatement {
                    table: self.table().to_string(),
                    filter: criteria.to_predicates(),
                }),
            }
        })
    }

    fn visible(&self, criteria: &Criteria, include_trashed: bool) -> Vec<Predicate> {
        let mut filter = criteria.to_predicates();
        if !include_trashed {
            filter.extend(self.trashed_predicate(Trashed::Exclude));
        }
        filter
    }

    /// Clear the deleted marker of one trashed row
    pub fn restore_by_id(&self, id: impl Into<Value>) -> Result<u64> {
        self.restore_by(Criteria::new().eq(self.primary_key(), id.into()))
    }

    /// Clear the deleted marker of every trashed row matching `criteria`.
    ///
    /// A no-op returning `0` without soft deletes.
    pub fn restore_by(&self, criteria: impl Into<Criteria>) -> Result<u64> {
        let Some(column) = self.schema().soft_delete.clone() else {
            return Ok(0);
        };
        let criteria = criteria.into();
        let mut set = Row::new();
        set.insert(column, Value::Null);
        if let Some(ts) = &self.schema().timestamps {
            set.insert(ts.updated_at.clone(), self.now());
        }
        let mut filter = criteria.to_predicates();
        filter.extend(self.trashed_predicate(Trashed::Only));
        self.connection().update(&UpdateStatement {
            table: self.table().to_string(),
            set,
            filter,
        })
    }

    /// Bump `updated_at` only; a no-op returning `0` without timestamps
    pub fn touch(&self, id: impl Into<Value>) -> Result<u64> {
        let Some(ts) = &self.schema().timestamps else {
            return Ok(0);
        };
        let mut set = Row::new();
        set.insert(ts.updated_at.clone(), self.now());
        self.connection().update(&UpdateStatement {
            table: self.table().to_string(),
            set,
            filter: vec![Predicate::Eq(ColumnRef::new(self.primary_key()), id.into())],
        })
    }

    /// Update the row with this key, or insert it under this key when absent
    pub fn upsert_by_id(&self, id: impl Into<Value>, data: Row) -> Result<Entity> {
        let id = id.into();
        if self.stored_value(&id, self.primary_key())?.is_some() {
            if let Some(entity) = self.update(id.clone(), data.clone())? {
                return Ok(entity);
            }
        }
        let mut data = data;
        data.insert(self.primary_key().to_string(), id);
        self.insert(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::memory::{MemoryStore, StatementKind};
    use crate::schema::EntitySchema;
    use crate::value::Cast;
    use serde_json::json;
    use std::sync::Arc;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => Row::new(),
        }
    }

    fn articles() -> EntitySchema {
        EntitySchema::new("articles")
            .column("title")
            .cast("published", Cast::Bool)
            .timestamps()
            .soft_deletes()
    }

    fn repo(schema: EntitySchema) -> (Repository, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Repository::new(schema, store.clone()).unwrap(), store)
    }

    #[test]
    fn test_insert_filters_casts_and_stamps() {
        let (repo, store) = repo(articles());
        let entity = repo
            .insert(row(json!({"title": "Hi", "published": true, "bogus": 1})))
            .unwrap();
        assert_eq!(entity.get("id"), Some(json!(1)));
        assert_eq!(entity.get("published"), Some(json!(true)));
        assert!(entity.get("bogus").is_none());
        assert!(entity.get("created_at").is_some_and(|v| v.is_string()));

        let stored = store.rows("articles").unwrap();
        assert_eq!(stored[0]["published"], json!(1));
    }

    #[test]
    fn test_insert_empty_is_validation_error() {
        let (repo, _) = repo(articles());
        assert!(matches!(repo.insert(Row::new()), Err(EngineError::Validation(_))));
        assert!(matches!(
            repo.insert(row(json!({"bogus": 1}))),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_update_returns_refetched_entity() {
        let (repo, _) = repo(articles());
        repo.insert(row(json!({"title": "a"}))).unwrap();
        let updated = repo.update(1, row(json!({"title": "b"}))).unwrap().unwrap();
        assert_eq!(updated.get("title"), Some(json!("b")));
        assert!(repo.update(99, row(json!({"title": "x"}))).unwrap().is_none());
    }

    #[test]
    fn test_version_lock_increments() {
        let (repo, _) = repo(EntitySchema::new("docs").column("body").version_column("version"));
        let doc = repo.insert(row(json!({"body": "v1"}))).unwrap();
        assert_eq!(doc.get("version"), Some(json!(1)));
        let doc = repo.update(1, row(json!({"body": "v2"}))).unwrap().unwrap();
        assert_eq!(doc.get("version"), Some(json!(2)));

        let stale = repo.update(1, row(json!({"body": "v3", "version": 1}))).unwrap_err();
        assert!(stale.is_optimistic_lock());
        let current = repo.find_by_id(1).unwrap().unwrap();
        assert_eq!(current.get("body"), Some(json!("v2")));
    }

    #[test]
    fn test_unusable_version_values_are_rejected() {
        let (repo, store) = repo(EntitySchema::new("docs").column("body").version_column("version"));
        repo.insert(row(json!({"body": "v1"}))).unwrap();

        let err = repo
            .update(1, row(json!({"body": "v2", "version": i64::MAX})))
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let err = repo
            .update(1, row(json!({"body": "v2", "version": "abc"})))
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(store.rows("docs").unwrap()[0]["version"], json!(1));
    }

    #[test]
    fn test_update_by_rejected_under_locking() {
        let (repo, _) = repo(EntitySchema::new("docs").version_column("version"));
        let err = repo
            .update_by(Criteria::new(), row(json!({"body": "x"})))
            .unwrap_err();
        assert!(matches!(err, EngineError::LockingUnsupported { .. }));
    }

    #[test]
    fn test_soft_delete_restore_and_force() {
        let (repo, store) = repo(articles());
        repo.insert(row(json!({"title": "a"}))).unwrap();

        assert_eq!(repo.delete_by_id(1).unwrap(), 1);
        assert!(repo.find_by_id(1).unwrap().is_none());
        assert_eq!(store.rows("articles").unwrap().len(), 1);
        // already trashed rows are not deleted twice
        assert_eq!(repo.delete_by_id(1).unwrap(), 0);

        assert_eq!(repo.restore_by_id(1).unwrap(), 1);
        assert!(repo.find_by_id(1).unwrap().is_some());

        assert_eq!(repo.force_delete_by_id(1).unwrap(), 1);
        assert!(store.rows("articles").unwrap().is_empty());
    }

    #[test]
    fn test_force_delete_publishes_both_delete_events() {
        use crate::events::EventBus;
        use std::sync::Mutex;

        let events = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for event in [BEFORE_DELETE, AFTER_DELETE] {
            let seen = Arc::clone(&seen);
            events.listen(event, move |payload| {
                seen.lock().unwrap().push((event, payload.affected));
                Ok(())
            });
        }
        let (repo, store) = repo(articles());
        let repo = repo.with_events(events);
        repo.insert(row(json!({"title": "a"}))).unwrap();

        assert_eq!(repo.force_delete_by_id(1).unwrap(), 1);
        assert!(store.rows("articles").unwrap().is_empty());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(BEFORE_DELETE, None), (AFTER_DELETE, Some(1))]
        );
    }

    #[test]
    fn test_touch_and_restore_are_noops_without_features() {
        let (repo, store) = repo(EntitySchema::new("plain"));
        repo.insert(row(json!({"name": "x"}))).unwrap();
        store.clear_statements().unwrap();
        assert_eq!(repo.touch(1).unwrap(), 0);
        assert_eq!(repo.restore_by_id(1).unwrap(), 0);
        assert!(store.statements().unwrap().is_empty());
    }

    #[test]
    fn test_upsert_by_id() {
        let (repo, store) = repo(EntitySchema::new("settings").primary_key("key"));
        let created = repo.upsert_by_id("theme", row(json!({"value": "dark"}))).unwrap();
        assert_eq!(created.get("key"), Some(json!("theme")));
        let updated = repo.upsert_by_id("theme", row(json!({"value": "light"}))).unwrap();
        assert_eq!(updated.get("value"), Some(json!("light")));
        assert_eq!(store.rows("settings").unwrap().len(), 1);
        assert_eq!(store.count_statements(StatementKind::Insert, "settings").unwrap(), 1);
    }

    #[test]
    fn test_mutators_apply_to_write_payloads() {
        let schema = EntitySchema::new("users").mutator("email", |v| {
            Value::String(v.as_str().unwrap_or_default().to_lowercase())
        });
        let (repo, _) = repo(schema);
        let user = repo.insert(row(json!({"email": "A@B.C"}))).unwrap();
        assert_eq!(user.get("email"), Some(json!("a@b.c")));
    }
}
