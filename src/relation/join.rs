//! Single-query eager loading through LEFT JOINs.
//!
//! Only used for one level of relations that each have an explicit projection
//! (`fields(&["posts.title"])`). Each relation is joined under its own name as
//! alias, its columns come back as `relation__column`, and rows sharing a
//! parent key are folded into one parent entity.

use super::eager::{self, EagerNode};
use super::{resolve, RelationDef, RelationKind};
use crate::entity::{Entity, Related};
use crate::error::Result;
use crate::query::{ColumnRef, Criteria, Join, Predicate, SelectItem, SelectQuery};
use crate::repository::{Constraint, Finder, Repository};
use crate::value::{id_key, Row, Value};
use std::collections::{HashMap, HashSet};

const SEPARATOR: &str = "__";

pub(crate) struct JoinedRelation {
    name: String,
    def: RelationDef,
    related: Repository,
    parent_key: String,
    child_key: String,
    columns: Vec<String>,
}

pub(crate) struct JoinPlan {
    relations: Vec<JoinedRelation>,
}

/// Build a join plan, or `None` when the request does not qualify
pub(crate) fn plan(
    repo: &Repository,
    paths: &[(String, Option<Constraint>)],
    fields: &[String],
) -> Result<Option<JoinPlan>> {
    let mut relations = Vec::new();
    for node in eager::tree(paths, fields) {
        if !qualifies(&node) {
            return Ok(None);
        }
        let Some(def) = resolve(repo, &node.name)? else {
            continue;
        };
        if def.kind() == RelationKind::ManyToMany {
            return Ok(None);
        }
        let related = repo.related_for(&def)?;
        let parent_key = def.parent_key(repo.schema());
        let child_key = def.child_key(related.schema());
        let mut columns = node.projection();
        for column in [related.primary_key().to_string(), child_key.clone()] {
            if !columns.contains(&column) {
                columns.push(column);
            }
        }
        relations.push(JoinedRelation {
            name: node.name,
            def,
            related,
            parent_key,
            child_key,
            columns,
        });
    }
    if relations.is_empty() {
        return Ok(None);
    }
    Ok(Some(JoinPlan { relations }))
}

fn qualifies(node: &EagerNode) -> bool {
    node.nested.is_empty() && node.constraint.is_none() && !node.projection().is_empty()
}

/// Run the joined query and hydrate parents with their relations
pub(crate) fn execute(
    repo: &Repository,
    plan: &JoinPlan,
    finder: &Finder<'_>,
    criteria: &Criteria,
    extra: Vec<Predicate>,
) -> Result<Vec<Entity>> {
    let table = repo.table();
    let base_columns = finder.base_projection();

    let mut query = SelectQuery::new(table);
    if base_columns.is_empty() {
        query = query.item(SelectItem::AllOf(table.to_string()));
    } else {
        for column in &base_columns {
            query = query.item(SelectItem::Column {
                column: ColumnRef::qualified(table, column),
                alias: Some(column.clone()),
            });
        }
    }
    for rel in &plan.relations {
        let mut on = vec![Predicate::ColumnsEq(
            ColumnRef::qualified(&rel.name, &rel.child_key),
            ColumnRef::qualified(table, &rel.parent_key),
        )];
        if let Some(column) = &rel.related.schema().soft_delete {
            on.push(Predicate::IsNull(ColumnRef::qualified(&rel.name, column)));
        }
        query = query.left_join(Join {
            table: rel.related.table().to_string(),
            alias: rel.name.clone(),
            on,
        });
        for column in &rel.columns {
            query = query.item(SelectItem::Column {
                column: ColumnRef::qualified(&rel.name, column),
                alias: Some(format!("{}{SEPARATOR}{column}", rel.name)),
            });
        }
    }
    query = query.filters(
        finder
            .filter(criteria, extra)
            .into_iter()
            .map(|p| p.qualify(table)),
    );
    for (column, order) in &finder.order_by {
        query = query.order_by(ColumnRef::qualified(table, column), *order);
    }

    let rows = repo.connection().select(&query)?;
    log::debug!(
        "join eager load on {}: {} rows for {} relations",
        table,
        rows.len(),
        plan.relations.len()
    );
    Ok(fold(repo, plan, rows, finder.registers_entities()))
}

/// Split joined rows into parents and related segments
fn fold(repo: &Repository, plan: &JoinPlan, rows: Vec<Row>, full_rows: bool) -> Vec<Entity> {
    let pk = repo.primary_key().to_string();
    let mut parents: Vec<Entity> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut seen: HashSet<(usize, usize, String)> = HashSet::new();
    let prefixes: Vec<String> = plan
        .relations
        .iter()
        .map(|rel| format!("{}{SEPARATOR}", rel.name))
        .collect();

    for row in rows {
        let mut base = Row::new();
        let mut segments: Vec<Row> = vec![Row::new(); plan.relations.len()];
        for (key, value) in row {
            match prefixes.iter().position(|p| key.starts_with(p.as_str())) {
                Some(i) => {
                    segments[i].insert(key[prefixes[i].len()..].to_string(), value);
                }
                None => {
                    base.insert(key, value);
                }
            }
        }

        let parent_key = base.get(&pk).map(id_key).unwrap_or_default();
        let position = match index.get(&parent_key) {
            Some(&position) => position,
            None => {
                let Some(parent) = repo.hydrate_rows(vec![base], full_rows).into_iter().next() else {
                    continue;
                };
                for rel in &plan.relations {
                    let empty = if rel.def.is_to_many() {
                        Related::Many(Vec::new())
                    } else {
                        Related::One(None)
                    };
                    parent.attach_relation(&rel.name, empty);
                }
                parents.push(parent);
                index.insert(parent_key, parents.len() - 1);
                parents.len() - 1
            }
        };

        for (i, (rel, segment)) in plan.relations.iter().zip(segments).enumerate() {
            if segment.values().all(Value::is_null) {
                continue;
            }
            let child_id = segment
                .get(rel.related.primary_key())
                .map(id_key)
                .unwrap_or_default();
            if !seen.insert((position, i, child_id)) {
                continue;
            }
            let Some(child) = rel.related.hydrate_rows(vec![segment], false).into_iter().next() else {
                continue;
            };
            let parent = &parents[position];
            if rel.def.is_to_many() {
                parent.push_related(&rel.name, child);
            } else {
                parent.attach_relation(&rel.name, Related::One(Some(child)));
            }
        }
    }
    parents
}
