//! Entity: a mutable attribute bag for one record.
//!
//! An [`Entity`] is a cheap-to-clone handle; clones share state. This is what
//! lets the identity map hand out "the same instance" for repeated lookups and
//! lets the unit of work diff an attached entity against its snapshot.
//!
//! Relations live beside the attributes: [`Entity::to_flat_view`] never
//! includes them, [`Entity::to_deep_view`] expands them recursively.

use crate::value::{Row, Value};
use serde::{Serialize, Serializer};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

/// Attribute transform (accessor or mutator)
pub type Transform = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Per-attribute accessor and mutator hooks declared on a schema
#[derive(Clone, Default)]
pub struct Transforms {
    accessors: HashMap<String, Transform>,
    mutators: HashMap<String, Transform>,
}

impl Transforms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a read-side transform applied by [`Entity::get`]
    pub fn accessor<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.accessors.insert(name.to_string(), Arc::new(f));
        self
    }

    /// Register a write-side transform applied by [`Entity::set`] and write payloads
    pub fn mutator<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.mutators.insert(name.to_string(), Arc::new(f));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.accessors.is_empty() && self.mutators.is_empty()
    }

    /// Run every registered mutator over the matching keys of `row`
    pub fn apply_mutators(&self, mut row: Row) -> Row {
        if self.mutators.is_empty() {
            return row;
        }
        for (key, value) in row.iter_mut() {
            if let Some(mutator) = self.mutators.get(key) {
                *value = mutator(value);
            }
        }
        row
    }

    fn access(&self, name: &str, raw: Option<&Value>) -> Option<Value> {
        match self.accessors.get(name) {
            Some(accessor) => Some(accessor(raw.unwrap_or(&Value::Null))),
            None => raw.cloned(),
        }
    }

    fn mutate(&self, name: &str, value: Value) -> Value {
        match self.mutators.get(name) {
            Some(mutator) => mutator(&value),
            None => value,
        }
    }
}

impl fmt::Debug for Transforms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut accessors: Vec<&String> = self.accessors.keys().collect();
        let mut mutators: Vec<&String> = self.mutators.keys().collect();
        accessors.sort();
        mutators.sort();
        f.debug_struct("Transforms")
            .field("accessors", &accessors)
            .field("mutators", &mutators)
            .finish()
    }
}

/// A loaded relation value
#[derive(Clone, Debug)]
pub enum Related {
    /// To-one relation; `None` when no related record matched
    One(Option<Entity>),
    /// To-many relation; empty when nothing matched
    Many(Vec<Entity>),
}

struct EntityData {
    attributes: Row,
    relations: Vec<(String, Related)>,
    transforms: Option<Arc<Transforms>>,
}

/// In-memory representation of one persisted (or about to be persisted) record
#[derive(Clone)]
pub struct Entity {
    inner: Rc<RefCell<EntityData>>,
}

impl Entity {
    /// Construct an entity from raw attributes (no transforms)
    pub fn new(attributes: Row) -> Self {
        Self::hydrate(attributes, None)
    }

    /// Construct an entity, running each attribute through its mutator
    pub fn build(attributes: Row, transforms: Arc<Transforms>) -> Self {
        let entity = Self::hydrate(Row::new(), Some(transforms));
        for (name, value) in attributes {
            entity.set(&name, value);
        }
        entity
    }

    /// Hydration path: store attributes as read from storage.
    pub(crate) fn hydrate(attributes: Row, transforms: Option<Arc<Transforms>>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(EntityData {
                attributes,
                relations: Vec::new(),
                transforms,
            })),
        }
    }

    /// Read an attribute, applying its accessor when one is registered
    pub fn get(&self, name: &str) -> Option<Value> {
        let data = self.inner.borrow();
        match &data.transforms {
            Some(transforms) => transforms.access(name, data.attributes.get(name)),
            None => data.attributes.get(name).cloned(),
        }
    }

    /// Read an attribute exactly as stored
    pub fn raw(&self, name: &str) -> Option<Value> {
        self.inner.borrow().attributes.get(name).cloned()
    }

    /// Write an attribute, applying its mutator when one is registered.
    ///
    /// Changes made to an entity attached to an active unit of work with
    /// snapshots enabled are picked up at commit time.
    pub fn set(&self, name: &str, value: Value) {
        let mut data = self.inner.borrow_mut();
        let value = match &data.transforms {
            Some(transforms) => transforms.mutate(name, value),
            None => value,
        };
        data.attributes.insert(name.to_string(), value);
    }

    /// Overwrite attributes without running mutators
    pub(crate) fn merge_raw(&self, values: &Row) {
        let mut data = self.inner.borrow_mut();
        for (key, value) in values {
            data.attributes.insert(key.clone(), value.clone());
        }
    }

    /// Store a loaded relation under `name`, replacing any previous value
    pub fn attach_relation(&self, name: &str, value: Related) {
        let mut data = self.inner.borrow_mut();
        match data.relations.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => data.relations.push((name.to_string(), value)),
        }
    }

    /// Append to a to-many relation, creating it when absent
    pub(crate) fn push_related(&self, name: &str, child: Entity) {
        let mut data = self.inner.borrow_mut();
        match data.relations.iter_mut().find(|(n, _)| n == name) {
            Some((_, Related::Many(list))) => list.push(child),
            Some(slot) => slot.1 = Related::Many(vec![child]),
            None => data
                .relations
                .push((name.to_string(), Related::Many(vec![child]))),
        }
    }

    pub fn relation(&self, name: &str) -> Option<Related> {
        self.inner
            .borrow()
            .relations
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, r)| r.clone())
    }

    /// The to-one relation `name`, if loaded and matched
    pub fn one(&self, name: &str) -> Option<Entity> {
        match self.relation(name) {
            Some(Related::One(entity)) => entity,
            Some(Related::Many(list)) => list.into_iter().next(),
            None => None,
        }
    }

    /// The to-many relation `name` (empty if not loaded)
    pub fn many(&self, name: &str) -> Vec<Entity> {
        match self.relation(name) {
            Some(Related::Many(list)) => list,
            Some(Related::One(Some(entity))) => vec![entity],
            _ => Vec::new(),
        }
    }

    pub fn has_relation(&self, name: &str) -> bool {
        self.inner.borrow().relations.iter().any(|(n, _)| n == name)
    }

    pub fn relation_names(&self) -> Vec<String> {
        self.inner
            .borrow()
            .relations
            .iter()
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Shallow copy of the attributes; relations are not included
    pub fn to_flat_view(&self) -> Row {
        self.inner.borrow().attributes.clone()
    }

    /// Attributes plus every loaded relation, expanded recursively.
    ///
    /// An entity reachable from itself (possible once the identity map hands
    /// out shared instances) is rendered flat on the second visit.
    pub fn to_deep_view(&self) -> Value {
        let mut visiting = HashSet::new();
        self.deep_view(&mut visiting)
    }

    fn deep_view(&self, visiting: &mut HashSet<*const RefCell<EntityData>>) -> Value {
        let ptr = Rc::as_ptr(&self.inner);
        if !visiting.insert(ptr) {
            return Value::Object(self.to_flat_view());
        }
        let data = self.inner.borrow();
        let mut out = data.attributes.clone();
        for (name, related) in &data.relations {
            let expanded = match related {
                Related::One(Some(entity)) => entity.deep_view(visiting),
                Related::One(None) => Value::Null,
                Related::Many(list) => {
                    Value::Array(list.iter().map(|e| e.deep_view(visiting)).collect())
                }
            };
            out.insert(name.clone(), expanded);
        }
        visiting.remove(&ptr);
        Value::Object(out)
    }

    /// `true` when both handles refer to the same instance
    pub fn ptr_eq(a: &Entity, b: &Entity) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.inner.borrow();
        f.debug_struct("Entity")
            .field("attributes", &data.attributes)
            .field(
                "relations",
                &data.relations.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Serialize for Entity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_deep_view().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => Row::new(),
        }
    }

    #[test]
    fn test_accessor_applied_on_get_only() {
        let transforms = Arc::new(Transforms::new().accessor("name", |v| {
            Value::String(v.as_str().unwrap_or_default().to_uppercase())
        }));
        let entity = Entity::hydrate(row(json!({"id": 1, "name": "alice"})), Some(transforms));
        assert_eq!(entity.get("name"), Some(json!("ALICE")));
        assert_eq!(entity.raw("name"), Some(json!("alice")));
        assert_eq!(entity.to_flat_view()["name"], json!("alice"));
    }

    #[test]
    fn test_mutator_applied_on_build_and_set() {
        let transforms = Arc::new(
            Transforms::new().mutator("email", |v| {
                Value::String(v.as_str().unwrap_or_default().trim().to_lowercase())
            }),
        );
        let entity = Entity::build(row(json!({"email": "  Bob@Example.COM "})), transforms);
        assert_eq!(entity.raw("email"), Some(json!("bob@example.com")));

        entity.set("email", json!("X@Y.Z"));
        assert_eq!(entity.raw("email"), Some(json!("x@y.z")));
    }

    #[test]
    fn test_flat_view_excludes_relations() {
        let user = Entity::new(row(json!({"id": 1})));
        let post = Entity::new(row(json!({"id": 10, "title": "Hello"})));
        user.attach_relation("posts", Related::Many(vec![post]));

        assert!(!user.to_flat_view().contains_key("posts"));
        let deep = user.to_deep_view();
        assert_eq!(deep["posts"][0]["title"], json!("Hello"));
    }

    #[test]
    fn test_deep_view_missing_relations() {
        let post = Entity::new(row(json!({"id": 10})));
        post.attach_relation("author", Related::One(None));
        post.attach_relation("tags", Related::Many(Vec::new()));
        let deep = post.to_deep_view();
        assert_eq!(deep["author"], Value::Null);
        assert_eq!(deep["tags"], json!([]));
        assert!(post.one("author").is_none());
        assert!(post.many("tags").is_empty());
    }

    #[test]
    fn test_deep_view_breaks_cycles() {
        let user = Entity::new(row(json!({"id": 1})));
        let post = Entity::new(row(json!({"id": 10, "user_id": 1})));
        post.attach_relation("user", Related::One(Some(user.clone())));
        user.attach_relation("posts", Related::Many(vec![post]));

        let deep = user.to_deep_view();
        assert_eq!(deep["posts"][0]["user"]["id"], json!(1));
        assert!(deep["posts"][0]["user"].get("posts").is_none());
    }

    #[test]
    fn test_clones_share_state() {
        let a = Entity::new(row(json!({"id": 1, "name": "a"})));
        let b = a.clone();
        b.set("name", json!("b"));
        assert_eq!(a.raw("name"), Some(json!("b")));
        assert!(Entity::ptr_eq(&a, &b));
        assert!(!Entity::ptr_eq(&a, &Entity::new(a.to_flat_view())));
    }

    #[test]
    fn test_serialize_uses_deep_view() {
        let user = Entity::new(row(json!({"id": 1})));
        user.attach_relation("profile", Related::One(None));
        let text = serde_json::to_string(&user).unwrap();
        assert_eq!(text, r#"{"id":1,"profile":null}"#);
    }
}
