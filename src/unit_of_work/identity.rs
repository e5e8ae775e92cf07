//! Identity map: one entity instance per (table, id) within a unit of work.

use crate::entity::Entity;
use crate::repository::Repository;
use crate::value::{id_key, Row, Value};
use std::collections::HashMap;

pub(crate) type EntityKey = (String, String);

pub(crate) fn entity_key(table: &str, id: &Value) -> EntityKey {
    (table.to_string(), id_key(id))
}

pub(crate) struct IdentityEntry {
    pub entity: Entity,
    pub id: Value,
    /// Flat view recorded on attach (or after the last commit)
    pub snapshot: Option<Row>,
    /// Unbound repository able to persist changes to the entity
    pub repository: Repository,
}

#[derive(Default)]
pub(crate) struct IdentityMap {
    entries: HashMap<EntityKey, IdentityEntry>,
    order: Vec<EntityKey>,
}

impl IdentityMap {
    pub fn get(&self, key: &EntityKey) -> Option<&IdentityEntry> {
        self.entries.get(key)
    }

    /// Register `entity` unless one is already known under `key`; returns the
    /// instance that is now canonical
    pub fn attach(&mut self, key: EntityKey, id: &Value, entity: Entity, repository: Repository, snapshot: bool) -> Entity {
        if let Some(existing) = self.entries.get(&key) {
            return existing.entity.clone();
        }
        let snapshot = snapshot.then(|| entity.to_flat_view());
        self.entries.insert(
            key.clone(),
            IdentityEntry {
                entity: entity.clone(),
                id: id.clone(),
                snapshot,
                repository,
            },
        );
        self.order.push(key);
        entity
    }

    pub fn detach(&mut self, key: &EntityKey) -> bool {
        self.order.retain(|k| k != key);
        self.entries.remove(key).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entries in attach order
    pub fn iter(&self) -> impl Iterator<Item = (&EntityKey, &IdentityEntry)> {
        self.order
            .iter()
            .filter_map(|key| self.entries.get(key).map(|entry| (key, entry)))
    }

    /// Re-record snapshots for every entry (after a successful commit)
    pub fn refresh_snapshots(&mut self, enabled: bool) {
        for entry in self.entries.values_mut() {
            entry.snapshot = enabled.then(|| entry.entity.to_flat_view());
        }
    }
}

/// Fields whose current value differs from the snapshot, primary key excluded
pub(crate) fn changed_fields(entry: &IdentityEntry) -> Row {
    let Some(snapshot) = &entry.snapshot else {
        return Row::new();
    };
    let pk = entry.repository.primary_key();
    let current = entry.entity.to_flat_view();
    let mut changes = Row::new();
    for (key, value) in &current {
        if key != pk && snapshot.get(key) != Some(value) {
            changes.insert(key.clone(), value.clone());
        }
    }
    for key in snapshot.keys() {
        if key != pk && !current.contains_key(key) {
            changes.insert(key.clone(), Value::Null);
        }
    }
    changes
}
