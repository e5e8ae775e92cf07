//! Many-to-many relations through a junction table.
//!
//! Loading always takes the same path regardless of the eager strategy:
//! junction rows for the parent keys, then the related rows for the distinct
//! related keys, then re-assembly per parent. `attach`, `detach` and `sync`
//! write junction rows immediately (they are never deferred).

use super::eager::{distinct_keys, EagerNode};
use super::RelationDef;
use crate::connection::in_transaction;
use crate::entity::{Entity, Related};
use crate::error::{EngineError, Result};
use crate::query::{ColumnRef, DeleteStatement, InsertStatement, Predicate, SelectQuery};
use crate::repository::Repository;
use crate::value::{id_key, Row, Value};
use std::collections::{HashMap, HashSet};

/// Outcome of [`sync`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncResult {
    pub attached: usize,
    pub detached: usize,
}

struct Junction<'a> {
    table: &'a str,
    local: &'a str,
    foreign: &'a str,
}

fn junction(def: &RelationDef) -> Option<Junction<'_>> {
    match def {
        RelationDef::BelongsToMany {
            junction_table,
            junction_local_key,
            junction_foreign_key,
            ..
        } => Some(Junction {
            table: junction_table,
            local: junction_local_key,
            foreign: junction_foreign_key,
        }),
        _ => None,
    }
}

fn many_to_many(repo: &Repository, relation: &str) -> Result<RelationDef> {
    let def = repo
        .schema()
        .find_relation(relation)
        .ok_or_else(|| EngineError::UnknownRelation {
            table: repo.table().to_string(),
            relation: relation.to_string(),
        })?;
    if junction(def).is_none() {
        return Err(EngineError::validation(format!(
            "relation `{relation}` on {} is not many-to-many",
            repo.table()
        )));
    }
    Ok(def.clone())
}

fn junction_rows(repo: &Repository, junction: &Junction<'_>, parent_keys: Vec<Value>) -> Result<Vec<Row>> {
    let query = SelectQuery::new(junction.table)
        .columns(&[junction.local, junction.foreign])
        .filter(Predicate::In(ColumnRef::new(junction.local), parent_keys));
    repo.connection().select(&query)
}

/// Eager-load a many-to-many relation onto `parents`
pub(crate) fn load(repo: &Repository, parents: &[Entity], def: &RelationDef, node: &EagerNode) -> Result<()> {
    let Some(junction) = junction(def) else {
        return Ok(());
    };
    let related = repo.related_for(def)?;
    let parent_key = def.parent_key(repo.schema());
    let related_key = def.child_key(related.schema());

    let keys = distinct_keys(parents, &parent_key);
    let links = if keys.is_empty() {
        Vec::new()
    } else {
        junction_rows(repo, &junction, keys)?
    };

    let mut seen = HashSet::new();
    let related_ids: Vec<Value> = links
        .iter()
        .filter_map(|row| row.get(junction.foreign))
        .filter(|v| !v.is_null() && seen.insert(id_key(v)))
        .cloned()
        .collect();
    let by_key: HashMap<String, Entity> = if related_ids.is_empty() {
        HashMap::new()
    } else {
        let required = vec![related.primary_key().to_string(), related_key.clone()];
        node.finder(&related, &required)
            .find_all_where_in(&related_key, related_ids)?
            .into_iter()
            .filter_map(|e| e.raw(&related_key).map(|k| (id_key(&k), e)))
            .collect()
    };

    let mut per_parent: HashMap<String, Vec<Entity>> = HashMap::new();
    for link in &links {
        let (Some(local), Some(foreign)) = (link.get(junction.local), link.get(junction.foreign)) else {
            continue;
        };
        if let Some(entity) = by_key.get(&id_key(foreign)) {
            per_parent
                .entry(id_key(local))
                .or_default()
                .push(entity.clone());
        }
    }

    for parent in parents {
        let matched = parent
            .raw(&parent_key)
            .and_then(|key| per_parent.get(&id_key(&key)))
            .cloned()
            .unwrap_or_default();
        parent.attach_relation(&node.name, Related::Many(matched));
    }
    Ok(())
}

/// Related keys currently linked to `parent_key`
pub fn linked_ids(repo: &Repository, relation: &str, parent_key: &Value) -> Result<Vec<Value>> {
    let def = many_to_many(repo, relation)?;
    let Some(junction) = junction(&def) else {
        return Ok(Vec::new());
    };
    Ok(junction_rows(repo, &junction, vec![parent_key.clone()])?
        .into_iter()
        .filter_map(|mut row| row.remove(junction.foreign))
        .collect())
}

pub fn attach(repo: &Repository, relation: &str, parent_key: &Value, related_ids: &[Value]) -> Result<u64> {
    let def = many_to_many(repo, relation)?;
    let Some(junction) = junction(&def) else {
        return Ok(0);
    };
    in_transaction(repo.connection().as_ref(), || {
        let mut inserted = 0u64;
        for id in related_ids {
            let mut values = Row::new();
            values.insert(junction.local.to_string(), parent_key.clone());
            values.insert(junction.foreign.to_string(), id.clone());
            repo.connection().insert(&InsertStatement {
                table: junction.table.to_string(),
                values,
                returning: None,
            })?;
            inserted += 1;
        }
        Ok(inserted)
    })
}

pub fn detach(
    repo: &Repository,
    relation: &str,
    parent_key: &Value,
    related_ids: Option<&[Value]>,
) -> Result<u64> {
    let def = many_to_many(repo, relation)?;
    let Some(junction) = junction(&def) else {
        return Ok(0);
    };
    let mut filter = vec![Predicate::Eq(ColumnRef::new(junction.local), parent_key.clone())];
    if let Some(ids) = related_ids {
        filter.push(Predicate::In(ColumnRef::new(junction.foreign), ids.to_vec()));
    }
    repo.connection().delete(&DeleteStatement {
        table: junction.table.to_string(),
        filter,
    })
}

/// Attach and detach the minimum needed so that exactly `related_ids` are linked
pub fn sync(repo: &Repository, relation: &str, parent_key: &Value, related_ids: &[Value]) -> Result<SyncResult> {
    let current = linked_ids(repo, relation, parent_key)?;
    let current_keys: HashSet<String> = current.iter().map(id_key).collect();

    let mut wanted_keys = HashSet::new();
    let to_attach: Vec<Value> = related_ids
        .iter()
        .filter(|id| wanted_keys.insert(id_key(id)) && !current_keys.contains(&id_key(id)))
        .cloned()
        .collect();
    let to_detach: Vec<Value> = current
        .into_iter()
        .filter(|id| !wanted_keys.contains(&id_key(id)))
        .collect();

    in_transaction(repo.connection().as_ref(), || {
        if !to_attach.is_empty() {
            attach(repo, relation, parent_key, &to_attach)?;
        }
        if !to_detach.is_empty() {
            detach(repo, relation, parent_key, Some(&to_detach))?;
        }
        Ok(())
    })?;
    Ok(SyncResult {
        attached: to_attach.len(),
        detached: to_detach.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::memory::{MemoryStore, StatementKind};
    use crate::schema::EntitySchema;
    use serde_json::json;
    use std::sync::Arc;

    fn tags() -> EntitySchema {
        EntitySchema::new("tags").column("label")
    }

    fn posts() -> EntitySchema {
        EntitySchema::new("posts")
            .column("title")
            .relation("tags", RelationDef::belongs_to_many(tags, "post_tag", "post_id", "tag_id"))
            .relation("self", RelationDef::has_many(posts, "parent_id"))
    }

    fn repo() -> (Repository, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Repository::new(posts(), store.clone()).unwrap(), store)
    }

    #[test]
    fn test_attach_detach() {
        let (repo, store) = repo();
        assert_eq!(repo.attach("tags", json!(1), &[json!(10), json!(11)]).unwrap(), 2);
        assert_eq!(store.rows("post_tag").unwrap().len(), 2);
        assert_eq!(repo.detach("tags", json!(1), Some(&[json!(10)])).unwrap(), 1);
        assert_eq!(repo.detach("tags", json!(1), None).unwrap(), 1);
        assert!(store.rows("post_tag").unwrap().is_empty());
    }

    #[test]
    fn test_sync_is_minimal_and_idempotent() {
        let (repo, store) = repo();
        repo.attach("tags", json!(1), &[json!(10), json!(11)]).unwrap();

        let first = repo.sync("tags", json!(1), &[json!(11), json!(12)]).unwrap();
        assert_eq!(first, SyncResult { attached: 1, detached: 1 });

        store.clear_statements().unwrap();
        let second = repo.sync("tags", json!(1), &[json!(11), json!(12)]).unwrap();
        assert_eq!(second, SyncResult::default());
        assert_eq!(store.count_statements(StatementKind::Insert, "post_tag").unwrap(), 0);
        assert_eq!(store.count_statements(StatementKind::Delete, "post_tag").unwrap(), 0);
    }

    #[test]
    fn test_pivot_operations_require_many_to_many() {
        let (repo, _) = repo();
        let err = repo.attach("self", json!(1), &[json!(2)]).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        let err = repo.sync("missing", json!(1), &[]).unwrap_err();
        assert!(matches!(err, EngineError::UnknownRelation { .. }));
    }
}
