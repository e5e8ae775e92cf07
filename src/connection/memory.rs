//! In-process document store.
//!
//! Collections are lists of insertion-ordered documents held behind a mutex.
//! Statements are evaluated directly (no SQL), including LEFT JOINs with
//! aliased projections, so every repository feature can run without a
//! database. Transactions snapshot the collections and restore them on
//! failure; nested transactions snapshot again, so an inner rollback leaves
//! the outer scope's work intact.
//!
//! A transaction belongs to the thread that opened it. Until it closes,
//! every statement issued from another thread blocks, so concurrent
//! transactions are serialized and a rollback only undoes its own work.
//!
//! Every statement is appended to a log that tests can inspect.

use crate::connection::Connection;
use crate::error::{EngineError, Result};
use crate::query::{
    ColumnRef, DeleteStatement, InsertStatement, Order, Predicate, SelectItem, SelectQuery,
    UpdateStatement,
};
use crate::value::{compare_values, id_key, values_equal, Row, Value};
use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use uuid::Uuid;

/// How keys are generated for documents inserted without one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyStrategy {
    /// 1, 2, 3, ... per collection
    #[default]
    AutoIncrement,
    /// Random v4 UUID strings
    Uuid,
}

/// Kind of a logged statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Count,
    Insert,
    Update,
    Delete,
    Begin,
    Commit,
    Rollback,
}

/// One entry of the statement log
#[derive(Debug, Clone, PartialEq)]
pub struct StatementRecord {
    pub kind: StatementKind,
    /// Empty for transaction control
    pub table: String,
    /// Written columns for inserts/updates, projected columns for selects
    pub columns: Vec<String>,
    pub affected: u64,
}

#[derive(Debug, Clone, Default)]
struct Collection {
    rows: Vec<Row>,
    last_id: i64,
}

#[derive(Default)]
struct State {
    collections: HashMap<String, Collection>,
    snapshots: Vec<HashMap<String, Collection>>,
    /// Thread holding the open transactions, if any
    owner: Option<ThreadId>,
    log: Vec<StatementRecord>,
}

impl State {
    /// Pop the innermost transaction; restores its snapshot unless committed
    fn close(&mut self, commit: bool) {
        let snapshot = self.snapshots.pop();
        if !commit {
            if let Some(snapshot) = snapshot {
                self.collections = snapshot;
            }
        }
        if self.snapshots.is_empty() {
            self.owner = None;
        }
    }
}

/// In-memory [`Connection`]
pub struct MemoryStore {
    name: String,
    keys: KeyStrategy,
    state: Mutex<State>,
    released: Condvar,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::named("memory")
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            keys: KeyStrategy::AutoIncrement,
            state: Mutex::new(State::default()),
            released: Condvar::new(),
        }
    }

    /// Generate UUID string keys instead of integers
    pub fn with_key_strategy(mut self, keys: KeyStrategy) -> Self {
        self.keys = keys;
        self
    }

    /// Lock the state, waiting while another thread owns a transaction
    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        let me = thread::current().id();
        let state = self
            .state
            .lock()
            .map_err(|_| EngineError::storage("memory store mutex poisoned"))?;
        self.released
            .wait_while(state, |s| s.owner.is_some_and(|owner| owner != me))
            .map_err(|_| EngineError::storage("memory store mutex poisoned"))
    }

    fn finish(&self, commit: bool) -> Result<()> {
        let mut state = self.lock()?;
        state.close(commit);
        state
            .log
            .push(control(if commit { StatementKind::Commit } else { StatementKind::Rollback }));
        if state.owner.is_none() {
            self.released.notify_all();
        }
        Ok(())
    }

    /// Current contents of `table`, in insertion order
    pub fn rows(&self, table: &str) -> Result<Vec<Row>> {
        Ok(self
            .lock()?
            .collections
            .get(table)
            .map(|c| c.rows.clone())
            .unwrap_or_default())
    }

    /// Every statement executed so far
    pub fn statements(&self) -> Result<Vec<StatementRecord>> {
        Ok(self.lock()?.log.clone())
    }

    /// Number of logged statements of `kind` against `table`
    pub fn count_statements(&self, kind: StatementKind, table: &str) -> Result<usize> {
        Ok(self
            .lock()?
            .log
            .iter()
            .filter(|r| r.kind == kind && r.table == table)
            .count())
    }

    pub fn clear_statements(&self) -> Result<()> {
        self.lock()?.log.clear();
        Ok(())
    }

    /// Number of transactions currently open
    pub fn transaction_depth(&self) -> Result<usize> {
        Ok(self.lock()?.snapshots.len())
    }

    fn next_key(&self, collection: &mut Collection) -> Value {
        match self.keys {
            KeyStrategy::AutoIncrement => {
                collection.last_id += 1;
                Value::from(collection.last_id)
            }
            KeyStrategy::Uuid => Value::String(Uuid::new_v4().to_string()),
        }
    }
}

// ============================================================================
// Statement evaluation
// ============================================================================

/// Alias → row bound for one candidate result row (`None` = unmatched LEFT JOIN)
type Scope<'a> = Vec<(&'a str, Option<&'a Row>)>;

/// Equality as a document store applies it: `7` and `"7"` address the same key
fn loosely_equal(a: &Value, b: &Value) -> bool {
    if values_equal(a, b) {
        return true;
    }
    match (a, b) {
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            id_key(a) == id_key(b)
        }
        _ => false,
    }
}

fn resolve<'a>(scope: &Scope<'a>, base: &str, column: &ColumnRef) -> Option<&'a Value> {
    let alias = column.table.as_deref().unwrap_or(base);
    scope
        .iter()
        .find(|(a, _)| *a == alias)
        .and_then(|(_, row)| *row)
        .and_then(|row| row.get(&column.column))
}

fn matches(predicate: &Predicate, scope: &Scope<'_>, base: &str) -> bool {
    let value = |c: &ColumnRef| resolve(scope, base, c).filter(|v| !v.is_null());
    match predicate {
        Predicate::Eq(column, expected) => {
            value(column).is_some_and(|v| loosely_equal(v, expected))
        }
        Predicate::IsNull(column) => value(column).is_none(),
        Predicate::IsNotNull(column) => value(column).is_some(),
        Predicate::In(column, candidates) => value(column)
            .is_some_and(|v| candidates.iter().any(|c| loosely_equal(v, c))),
        Predicate::ColumnsEq(left, right) => match (value(left), value(right)) {
            (Some(l), Some(r)) => loosely_equal(l, r),
            _ => false,
        },
    }
}

fn expand<'a>(collections: &'a HashMap<String, Collection>, query: &'a SelectQuery) -> Vec<Scope<'a>> {
    let base = query.table.as_str();
    let mut scopes: Vec<Scope<'a>> = collections
        .get(base)
        .map(|c| c.rows.iter().map(|row| vec![(base, Some(row))]).collect())
        .unwrap_or_default();

    for join in &query.joins {
        let candidates: &[Row] = collections
            .get(&join.table)
            .map(|c| c.rows.as_slice())
            .unwrap_or(&[]);
        let mut joined = Vec::with_capacity(scopes.len());
        for scope in scopes {
            let mut matched = false;
            for candidate in candidates {
                let mut trial = scope.clone();
                trial.push((join.alias.as_str(), Some(candidate)));
                if join.on.iter().all(|p| matches(p, &trial, base)) {
                    joined.push(trial);
                    matched = true;
                }
            }
            if !matched {
                let mut unmatched = scope;
                unmatched.push((join.alias.as_str(), None));
                joined.push(unmatched);
            }
        }
        scopes = joined;
    }

    scopes.retain(|scope| query.filter.iter().all(|p| matches(p, scope, base)));
    scopes
}

fn project(scope: &Scope<'_>, query: &SelectQuery) -> Row {
    let base = query.table.as_str();
    if query.items.is_empty() {
        return scope
            .first()
            .and_then(|(_, row)| row.cloned())
            .unwrap_or_default();
    }
    let mut out = Row::new();
    for item in &query.items {
        match item {
            SelectItem::AllOf(alias) => {
                if let Some((_, Some(row))) = scope.iter().find(|(a, _)| *a == alias.as_str()) {
                    for (key, value) in row.iter() {
                        out.insert(key.clone(), value.clone());
                    }
                }
            }
            SelectItem::Column { column, alias } => {
                let key = alias.clone().unwrap_or_else(|| column.column.clone());
                let value = resolve(scope, base, column).cloned().unwrap_or(Value::Null);
                out.insert(key, value);
            }
        }
    }
    out
}

fn projected_columns(query: &SelectQuery) -> Vec<String> {
    query
        .items
        .iter()
        .map(|item| match item {
            SelectItem::AllOf(alias) => format!("{alias}.*"),
            SelectItem::Column {
                alias: Some(alias), ..
            } => alias.clone(),
            SelectItem::Column { column, .. } => column.column.clone(),
        })
        .collect()
}

fn matching_indices(rows: &[Row], table: &str, filter: &[Predicate]) -> Vec<usize> {
    rows.iter()
        .enumerate()
        .filter(|(_, row)| {
            let scope: Scope<'_> = vec![(table, Some(*row))];
            filter.iter().all(|p| matches(p, &scope, table))
        })
        .map(|(i, _)| i)
        .collect()
}

impl Connection for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn select(&self, query: &SelectQuery) -> Result<Vec<Row>> {
        let mut state = self.lock()?;
        let rows = {
            let mut scopes = expand(&state.collections, query);
            if !query.order_by.is_empty() {
                let base = query.table.as_str();
                scopes.sort_by(|a, b| {
                    query
                        .order_by
                        .iter()
                        .map(|(column, order)| {
                            let left = resolve(a, base, column).unwrap_or(&Value::Null);
                            let right = resolve(b, base, column).unwrap_or(&Value::Null);
                            let ord = compare_values(left, right);
                            match order {
                                Order::Asc => ord,
                                Order::Desc => ord.reverse(),
                            }
                        })
                        .find(|ord| ord.is_ne())
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            }
            let offset = query.offset.unwrap_or(0) as usize;
            let limit = query.limit.map(|l| l as usize).unwrap_or(usize::MAX);
            scopes
                .iter()
                .skip(offset)
                .take(limit)
                .map(|scope| project(scope, query))
                .collect::<Vec<Row>>()
        };
        state.log.push(StatementRecord {
            kind: StatementKind::Select,
            table: query.table.clone(),
            columns: projected_columns(query),
            affected: rows.len() as u64,
        });
        Ok(rows)
    }

    fn count(&self, query: &SelectQuery) -> Result<u64> {
        let mut state = self.lock()?;
        let total = expand(&state.collections, query).len() as u64;
        state.log.push(StatementRecord {
            kind: StatementKind::Count,
            table: query.table.clone(),
            columns: Vec::new(),
            affected: total,
        });
        Ok(total)
    }

    fn insert(&self, insert: &InsertStatement) -> Result<Option<Value>> {
        let mut state = self.lock()?;
        let collection = state.collections.entry(insert.table.clone()).or_default();

        let mut document = Row::new();
        let key = match &insert.returning {
            Some(pk) => {
                let key = match insert.values.get(pk) {
                    Some(given) if !given.is_null() => {
                        if let Some(n) = given.as_i64() {
                            collection.last_id = collection.last_id.max(n);
                        }
                        given.clone()
                    }
                    _ => self.next_key(collection),
                };
                document.insert(pk.clone(), key.clone());
                Some(key)
            }
            None => None,
        };
        for (column, value) in &insert.values {
            if insert.returning.as_deref() != Some(column.as_str()) {
                document.insert(column.clone(), value.clone());
            }
        }
        collection.rows.push(document);

        state.log.push(StatementRecord {
            kind: StatementKind::Insert,
            table: insert.table.clone(),
            columns: insert.values.keys().cloned().collect(),
            affected: 1,
        });
        Ok(key)
    }

    fn update(&self, update: &UpdateStatement) -> Result<u64> {
        let mut state = self.lock()?;
        let mut affected = 0u64;
        if let Some(collection) = state.collections.get_mut(&update.table) {
            for index in matching_indices(&collection.rows, &update.table, &update.filter) {
                let row = &mut collection.rows[index];
                for (column, value) in &update.set {
                    row.insert(column.clone(), value.clone());
                }
                affected += 1;
            }
        }
        state.log.push(StatementRecord {
            kind: StatementKind::Update,
            table: update.table.clone(),
            columns: update.set.keys().cloned().collect(),
            affected,
        });
        Ok(affected)
    }

    fn delete(&self, delete: &DeleteStatement) -> Result<u64> {
        let mut state = self.lock()?;
        let mut affected = 0u64;
        if let Some(collection) = state.collections.get_mut(&delete.table) {
            let doomed = matching_indices(&collection.rows, &delete.table, &delete.filter);
            affected = doomed.len() as u64;
            let mut index = 0usize;
            collection.rows.retain(|_| {
                let keep = !doomed.contains(&index);
                index += 1;
                keep
            });
        }
        state.log.push(StatementRecord {
            kind: StatementKind::Delete,
            table: delete.table.clone(),
            columns: Vec::new(),
            affected,
        });
        Ok(affected)
    }

    fn transaction(&self, body: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        {
            let mut state = self.lock()?;
            let snapshot = state.collections.clone();
            state.snapshots.push(snapshot);
            state.owner = Some(thread::current().id());
            state.log.push(control(StatementKind::Begin));
        }

        let mut open = OpenTransaction { store: self, done: false };
        let result = body();
        open.done = true;

        match result {
            Ok(()) => self.finish(true),
            Err(e) => {
                self.finish(false)?;
                log::debug!("{}: transaction rolled back: {e}", self.name);
                Err(e)
            }
        }
    }
}

/// Rolls back and releases ownership if the body unwinds
struct OpenTransaction<'a> {
    store: &'a MemoryStore,
    done: bool,
}

impl Drop for OpenTransaction<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut state = self.store.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.close(false);
        state.log.push(control(StatementKind::Rollback));
        if state.owner.is_none() {
            self.store.released.notify_all();
        }
    }
}

fn control(kind: StatementKind) -> StatementRecord {
    StatementRecord {
        kind,
        table: String::new(),
        columns: Vec::new(),
        affected: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Criteria, Join};
    use serde_json::json;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => Row::new(),
        }
    }

    fn insert(store: &MemoryStore, table: &str, values: Value) -> Value {
        store
            .insert(&InsertStatement {
                table: table.to_string(),
                values: row(values),
                returning: Some("id".to_string()),
            })
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_auto_increment_keys() {
        let store = MemoryStore::new();
        assert_eq!(insert(&store, "users", json!({"name": "a"})), json!(1));
        assert_eq!(insert(&store, "users", json!({"id": 10, "name": "b"})), json!(10));
        assert_eq!(insert(&store, "users", json!({"name": "c"})), json!(11));
        let rows = store.rows("users").unwrap();
        assert_eq!(rows[0].keys().next().map(String::as_str), Some("id"));
    }

    #[test]
    fn test_uuid_keys() {
        let store = MemoryStore::new().with_key_strategy(KeyStrategy::Uuid);
        let key = insert(&store, "docs", json!({"title": "x"}));
        assert_eq!(key.as_str().map(str::len), Some(36));
    }

    #[test]
    fn test_filter_order_and_paging() {
        let store = MemoryStore::new();
        for (name, age) in [("a", 30), ("b", 20), ("c", 40), ("d", 20)] {
            insert(&store, "users", json!({"name": name, "age": age, "deleted_at": null}));
        }
        let query = SelectQuery::new("users")
            .filters(Criteria::new().eq("age", 20).is_null("deleted_at").to_predicates())
            .order_by(ColumnRef::new("name"), Order::Desc);
        let names: Vec<Value> = store
            .select(&query)
            .unwrap()
            .into_iter()
            .map(|r| r["name"].clone())
            .collect();
        assert_eq!(names, vec![json!("d"), json!("b")]);

        let page = SelectQuery::new("users")
            .order_by(ColumnRef::new("id"), Order::Asc)
            .limit(2)
            .offset(1);
        let ids: Vec<Value> = store.select(&page).unwrap().into_iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(2), json!(3)]);
        assert_eq!(store.count(&page).unwrap(), 4);
    }

    #[test]
    fn test_string_and_numeric_keys_match() {
        let store = MemoryStore::new();
        insert(&store, "users", json!({"name": "a"}));
        let query = SelectQuery::new("users").filters(Criteria::new().eq("id", "1").to_predicates());
        assert_eq!(store.select(&query).unwrap().len(), 1);
        let none = SelectQuery::new("users").filter(Predicate::In(ColumnRef::new("id"), Vec::new()));
        assert!(store.select(&none).unwrap().is_empty());
    }

    #[test]
    fn test_left_join_with_aliases() {
        let store = MemoryStore::new();
        insert(&store, "users", json!({"name": "alice"}));
        insert(&store, "users", json!({"name": "bob"}));
        insert(&store, "posts", json!({"user_id": 1, "title": "one"}));
        insert(&store, "posts", json!({"user_id": 1, "title": "two"}));

        let query = SelectQuery::new("users")
            .item(SelectItem::AllOf("users".to_string()))
            .item(SelectItem::Column {
                column: ColumnRef::qualified("posts", "title"),
                alias: Some("posts__title".to_string()),
            })
            .left_join(Join {
                table: "posts".to_string(),
                alias: "posts".to_string(),
                on: vec![Predicate::ColumnsEq(
                    ColumnRef::qualified("posts", "user_id"),
                    ColumnRef::qualified("users", "id"),
                )],
            });
        let rows = store.select(&query).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["posts__title"], json!("one"));
        assert_eq!(rows[1]["posts__title"], json!("two"));
        assert_eq!(rows[2]["name"], json!("bob"));
        assert_eq!(rows[2]["posts__title"], Value::Null);
    }

    #[test]
    fn test_update_and_delete_counts() {
        let store = MemoryStore::new();
        insert(&store, "posts", json!({"user_id": 1}));
        insert(&store, "posts", json!({"user_id": 1}));
        insert(&store, "posts", json!({"user_id": 2}));

        let updated = store
            .update(&UpdateStatement {
                table: "posts".to_string(),
                set: row(json!({"flag": true})),
                filter: Criteria::new().eq("user_id", 1).to_predicates(),
            })
            .unwrap();
        assert_eq!(updated, 2);

        let deleted = store
            .delete(&DeleteStatement {
                table: "posts".to_string(),
                filter: Criteria::new().eq("flag", true).to_predicates(),
            })
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.rows("posts").unwrap().len(), 1);
        assert_eq!(store.count_statements(StatementKind::Update, "posts").unwrap(), 1);
    }

    #[test]
    fn test_rollback_restores_collections() {
        let store = MemoryStore::new();
        insert(&store, "users", json!({"name": "kept"}));

        let result = store.transaction(&mut || {
            insert(&store, "users", json!({"name": "discarded"}));
            Err(EngineError::storage("boom"))
        });
        assert!(result.is_err());
        assert_eq!(store.rows("users").unwrap().len(), 1);
        assert_eq!(store.transaction_depth().unwrap(), 0);
    }

    #[test]
    fn test_inner_rollback_keeps_outer_work() {
        let store = MemoryStore::new();
        store
            .transaction(&mut || {
                insert(&store, "users", json!({"name": "outer"}));
                let inner = store.transaction(&mut || {
                    insert(&store, "users", json!({"name": "inner"}));
                    Err(EngineError::storage("inner failed"))
                });
                assert!(inner.is_err());
                Ok(())
            })
            .unwrap();
        let rows = store.rows("users").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("outer"));
    }

    #[test]
    fn test_concurrent_transactions_are_isolated() {
        use std::sync::{Arc, Barrier};
        use std::time::Duration;

        let store = Arc::new(MemoryStore::new());
        let barrier = Arc::new(Barrier::new(2));

        let failing = {
            let (store, barrier) = (Arc::clone(&store), Arc::clone(&barrier));
            thread::spawn(move || {
                barrier.wait();
                store.transaction(&mut || {
                    insert(&store, "users", json!({"name": "discarded"}));
                    thread::sleep(Duration::from_millis(20));
                    Err(EngineError::storage("boom"))
                })
            })
        };
        let committing = {
            let (store, barrier) = (Arc::clone(&store), Arc::clone(&barrier));
            thread::spawn(move || {
                barrier.wait();
                store.transaction(&mut || {
                    insert(&store, "users", json!({"name": "kept"}));
                    thread::sleep(Duration::from_millis(20));
                    Ok(())
                })
            })
        };

        assert!(failing.join().unwrap().is_err());
        assert!(committing.join().unwrap().is_ok());
        let rows = store.rows("users").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("kept"));
        assert_eq!(store.transaction_depth().unwrap(), 0);
    }

    #[test]
    fn test_panicking_transaction_releases_store() {
        use std::panic::{catch_unwind, AssertUnwindSafe};
        use std::sync::Arc;

        let store = Arc::new(MemoryStore::new());
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let _ = store.transaction(&mut || {
                insert(&store, "users", json!({"name": "lost"}));
                panic!("listener exploded");
            });
        }));
        assert!(outcome.is_err());
        assert_eq!(store.transaction_depth().unwrap(), 0);

        let other = Arc::clone(&store);
        let written = thread::spawn(move || insert(&other, "users", json!({"name": "after"})));
        assert_eq!(written.join().unwrap(), json!(1));
        assert_eq!(store.rows("users").unwrap().len(), 1);
    }
}
