//! Commit pipeline stages.
//!
//! `commit` takes the queued operations through, in order: cascade expansion,
//! snapshot-diff injection, coalescing, and grouping per connection. Each
//! stage is a plain function over `Vec<Operation>` so it can be tested alone.

use super::identity::{changed_fields, EntityKey, IdentityMap};
use super::operation::{Operation, Target};
use crate::connection::{same_connection, SharedConnection};
use crate::error::Result;
use crate::query::Criteria;
use std::collections::{HashMap, HashSet};

/// Prepend a child `delete_by` for every cascading relation of each by-id
/// delete. The parent delete then runs without cascading itself. Parents
/// that are missing or already trashed keep their children, as an
/// immediate delete would.
pub(crate) fn expand_cascades(operations: Vec<Operation>) -> Result<Vec<Operation>> {
    let mut expanded = Vec::with_capacity(operations.len());
    for mut op in operations {
        if !(op.is_delete_by_id() && op.cascade) {
            expanded.push(op);
            continue;
        }
        let Target::ById(id) = op.target.clone() else {
            expanded.push(op);
            continue;
        };
        op.cascade = false;
        let repo = op.repository.clone();
        let cascading: Vec<_> = repo
            .schema()
            .relations
            .iter()
            .filter(|(_, def)| def.cascades())
            .collect();
        if cascading.is_empty() {
            expanded.push(op);
            continue;
        }
        let Some(parent) = repo.live_row(&id)? else {
            log::debug!("cascade from {}#{id} skipped: row missing or trashed", repo.table());
            expanded.push(op);
            continue;
        };
        for (name, def) in cascading {
            let parent_key = def.parent_key(repo.schema());
            let Some(parent_value) = parent.get(&parent_key).filter(|v| !v.is_null()) else {
                continue;
            };
            let related = repo.related_for(def)?;
            let child_key = def.child_key(related.schema());
            log::debug!(
                "cascade {}.{name}: delete {} where {child_key} = {parent_value}",
                repo.table(),
                related.table()
            );
            let criteria = Criteria::new().eq(&child_key, parent_value.clone());
            expanded.push(Operation::delete_by(related.unbound(), criteria));
        }
        expanded.push(op);
    }
    Ok(expanded)
}

/// Append an update for every attached entity changed since its snapshot,
/// unless an explicit update for it is already queued
pub(crate) fn inject_dirty(mut operations: Vec<Operation>, identity: &IdentityMap) -> Vec<Operation> {
    let explicit: HashSet<EntityKey> = operations
        .iter()
        .filter(|op| op.is_update_by_id())
        .filter_map(Operation::entity_key)
        .collect();

    for (key, entry) in identity.iter() {
        if explicit.contains(key) || entry.snapshot.is_none() {
            continue;
        }
        let schema = entry.repository.schema();
        let mut changes = schema.filter_fields(changed_fields(entry));
        if changes.is_empty() {
            continue;
        }
        if let (Some(locking), Some(snapshot)) = (&schema.locking, &entry.snapshot) {
            let column = locking.column();
            if !changes.contains_key(column) {
                if let Some(seen) = snapshot.get(column) {
                    changes.insert(column.to_string(), seen.clone());
                }
            }
        }
        log::debug!("dirty {}#{}: {} changed fields", key.0, key.1, changes.len());
        operations.push(Operation::update_by_id(
            entry.repository.clone(),
            entry.id.clone(),
            changes,
        ));
    }
    operations
}

/// Merge updates per entity (later fields win). An entity that is also
/// deleted by id gets its merged update right before that delete; any other
/// merged update takes the place of its first occurrence. Everything else
/// keeps its relative order.
pub(crate) fn coalesce(operations: Vec<Operation>) -> Vec<Operation> {
    let mut merged: HashMap<EntityKey, Operation> = HashMap::new();
    for op in operations.iter().filter(|op| op.is_update_by_id()) {
        let Some(key) = op.entity_key() else { continue };
        match merged.get_mut(&key) {
            Some(existing) => {
                for (column, value) in &op.payload {
                    existing.payload.insert(column.clone(), value.clone());
                }
            }
            None => {
                merged.insert(key, op.clone());
            }
        }
    }
    let deleted: HashSet<EntityKey> = operations
        .iter()
        .filter(|op| op.is_delete_by_id())
        .filter_map(Operation::entity_key)
        .collect();

    let mut ordered = Vec::with_capacity(operations.len());
    for op in operations {
        let key = op.entity_key();
        if op.is_update_by_id() {
            let held = key.as_ref().is_some_and(|k| deleted.contains(k));
            if !held {
                if let Some(update) = key.and_then(|k| merged.remove(&k)) {
                    ordered.push(update);
                }
            }
            continue;
        }
        if op.is_delete_by_id() {
            if let Some(update) = key.and_then(|k| merged.remove(&k)) {
                ordered.push(update);
            }
        }
        ordered.push(op);
    }
    ordered
}

/// Split operations per connection, preserving first-appearance order
pub(crate) fn group_by_connection(operations: Vec<Operation>) -> Vec<(SharedConnection, Vec<Operation>)> {
    let mut groups: Vec<(SharedConnection, Vec<Operation>)> = Vec::new();
    for op in operations {
        let connection = op.repository.connection().clone();
        match groups.iter_mut().find(|(c, _)| same_connection(c, &connection)) {
            Some((_, group)) => group.push(op),
            None => groups.push((connection, vec![op])),
        }
    }
    groups
}
