//! Batched eager loading.
//!
//! For each requested relation one membership query is issued against the
//! related repository (`WHERE child_key IN (parent keys)`); results are grouped
//! by key and attached to every parent. Nested paths (`posts.comments`) are
//! forwarded to the related finder, which repeats the process one level down.

use super::{pivot, resolve, RelationDef, RelationKind};
use crate::entity::{Entity, Related};
use crate::error::Result;
use crate::repository::{Constraint, Finder, Repository};
use crate::value::{id_key, Value};
use std::collections::{HashMap, HashSet};

/// One first-level relation of an eager request
pub(crate) struct EagerNode {
    pub name: String,
    pub constraint: Option<Constraint>,
    /// Remaining path segments, forwarded to the related finder
    pub nested: Vec<(String, Option<Constraint>)>,
    /// `relation.*` fields with the relation prefix stripped
    pub fields: Vec<String>,
}

impl EagerNode {
    /// Plain columns requested for this relation
    pub fn projection(&self) -> Vec<String> {
        self.fields.iter().filter(|f| !f.contains('.')).cloned().collect()
    }

    /// Build the related finder for this node; `required` columns are added
    /// to an explicit projection
    pub fn finder<'a>(&self, related: &'a Repository, required: &[String]) -> Finder<'a> {
        let mut fields = self.fields.clone();
        if !self.projection().is_empty() {
            for column in required {
                if !fields.contains(column) {
                    fields.push(column.clone());
                }
            }
        }
        let finder = related
            .query()
            .with_paths(self.nested.clone())
            .raw_fields(fields);
        match &self.constraint {
            Some(constraint) => constraint(finder),
            None => finder,
        }
    }
}

/// Group dotted paths by their first segment, keeping request order
pub(crate) fn tree(paths: &[(String, Option<Constraint>)], fields: &[String]) -> Vec<EagerNode> {
    let mut nodes: Vec<EagerNode> = Vec::new();
    for (path, constraint) in paths {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path.as_str(), None),
        };
        let index = match nodes.iter().position(|n| n.name == head) {
            Some(index) => index,
            None => {
                nodes.push(EagerNode {
                    name: head.to_string(),
                    constraint: None,
                    nested: Vec::new(),
                    fields: prefixed(fields, head),
                });
                nodes.len() - 1
            }
        };
        let node = &mut nodes[index];
        match rest {
            Some(rest) => node.nested.push((rest.to_string(), constraint.clone())),
            None => {
                if constraint.is_some() {
                    node.constraint = constraint.clone();
                }
            }
        }
    }
    nodes
}

fn prefixed(fields: &[String], relation: &str) -> Vec<String> {
    let prefix = format!("{relation}.");
    fields
        .iter()
        .filter_map(|f| f.strip_prefix(&prefix).map(str::to_string))
        .collect()
}

/// Distinct non-null values of `column` across `entities`
pub(crate) fn distinct_keys(entities: &[Entity], column: &str) -> Vec<Value> {
    let mut seen = HashSet::new();
    entities
        .iter()
        .filter_map(|e| e.raw(column))
        .filter(|v| !v.is_null() && seen.insert(id_key(v)))
        .collect()
}

/// Columns the related side must always return for matching and nesting
pub(crate) fn required_columns(related: &Repository, child_key: &str, node: &EagerNode) -> Vec<String> {
    let schema = related.schema();
    let mut required = vec![schema.primary_key.clone(), child_key.to_string()];
    for (path, _) in &node.nested {
        let first = path.split('.').next().unwrap_or(path);
        if let Some(def) = schema.find_relation(first) {
            required.push(def.parent_key(schema));
        }
    }
    required
}

/// Resolve every requested path onto `parents`
pub(crate) fn load(
    repo: &Repository,
    parents: &[Entity],
    paths: &[(String, Option<Constraint>)],
    fields: &[String],
) -> Result<()> {
    if parents.is_empty() {
        return Ok(());
    }
    for node in tree(paths, fields) {
        let Some(def) = resolve(repo, &node.name)? else {
            continue;
        };
        #[cfg(feature = "tracing")]
        let _span = crate::metrics::tracing_helpers::relation_load_span(repo.table(), &node.name)
            .entered();
        match def.kind() {
            RelationKind::ManyToMany => pivot::load(repo, parents, &def, &node)?,
            _ => load_batched(repo, parents, &def, &node)?,
        }
    }
    Ok(())
}

fn load_batched(repo: &Repository, parents: &[Entity], def: &RelationDef, node: &EagerNode) -> Result<()> {
    let related = repo.related_for(def)?;
    let parent_key = def.parent_key(repo.schema());
    let child_key = def.child_key(related.schema());

    let keys = distinct_keys(parents, &parent_key);
    let children = if keys.is_empty() {
        Vec::new()
    } else {
        let required = required_columns(&related, &child_key, node);
        node.finder(&related, &required)
            .find_all_where_in(&child_key, keys)?
    };
    log::debug!(
        "loaded {} {} for {} {}",
        children.len(),
        node.name,
        parents.len(),
        repo.table()
    );

    let mut grouped: HashMap<String, Vec<Entity>> = HashMap::new();
    for child in children {
        if let Some(key) = child.raw(&child_key).filter(|v| !v.is_null()) {
            grouped.entry(id_key(&key)).or_default().push(child);
        }
    }

    for parent in parents {
        let matched = parent
            .raw(&parent_key)
            .filter(|v| !v.is_null())
            .and_then(|key| grouped.get(&id_key(&key)))
            .cloned()
            .unwrap_or_default();
        let value = if def.is_to_many() {
            Related::Many(matched)
        } else {
            Related::One(matched.into_iter().next())
        };
        parent.attach_relation(&node.name, value);
    }
    Ok(())
}
