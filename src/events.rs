//! Event publication.
//!
//! A plain ordered-listener dispatcher. Repositories and units of work publish
//! named events with a mutable [`EventPayload`]; listeners run in registration
//! order and may rewrite `data` or `criteria` before the operation proceeds.
//! A listener that returns an error or panics is logged and skipped. It
//! never aborts the operation that published the event; a panicking
//! listener's partial edits to the payload are discarded.

use crate::error::Result;
use crate::query::Criteria;
use crate::value::{Row, Value};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

pub const BEFORE_INSERT: &str = "repository.beforeInsert";
pub const AFTER_INSERT: &str = "repository.afterInsert";
pub const BEFORE_UPDATE: &str = "repository.beforeUpdate";
pub const AFTER_UPDATE: &str = "repository.afterUpdate";
pub const BEFORE_DELETE: &str = "repository.beforeDelete";
pub const AFTER_DELETE: &str = "repository.afterDelete";
pub const BEFORE_FIND: &str = "repository.beforeFind";
pub const AFTER_FIND: &str = "repository.afterFind";
pub const BEFORE_COMMIT: &str = "unitOfWork.beforeCommit";
pub const AFTER_COMMIT: &str = "unitOfWork.afterCommit";

/// Mutable payload handed to every listener
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventPayload {
    /// Table (or collection) the event concerns
    pub table: String,
    pub id: Option<Value>,
    /// Write payload for insert/update events
    pub data: Option<Row>,
    /// Filter for find/update/delete events
    pub criteria: Option<Criteria>,
    /// Rows returned or affected, once known
    pub affected: Option<u64>,
}

impl EventPayload {
    pub fn for_table(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: Value) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_data(mut self, data: Row) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_criteria(mut self, criteria: Criteria) -> Self {
        self.criteria = Some(criteria);
        self
    }
}

type Listener = Arc<dyn Fn(&mut EventPayload) -> Result<()> + Send + Sync>;

/// Ordered listener registry; clones share listeners
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<RwLock<HashMap<String, Vec<Listener>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `event`; listeners run in registration order
    pub fn listen<F>(&self, event: &str, listener: F)
    where
        F: Fn(&mut EventPayload) -> Result<()> + Send + Sync + 'static,
    {
        match self.listeners.write() {
            Ok(mut map) => map
                .entry(event.to_string())
                .or_default()
                .push(Arc::new(listener)),
            Err(_) => log::warn!("event bus lock poisoned; listener for {event} not registered"),
        }
    }

    /// Run every listener for `event` against `payload`
    pub fn publish(&self, event: &str, payload: &mut EventPayload) {
        let listeners: Vec<Listener> = match self.listeners.read() {
            Ok(map) => map.get(event).cloned().unwrap_or_default(),
            Err(_) => return,
        };
        for listener in listeners {
            let before = payload.clone();
            match catch_unwind(AssertUnwindSafe(|| listener(payload))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("listener for {event} failed and was ignored: {e}"),
                Err(_) => {
                    *payload = before;
                    log::warn!("listener for {event} panicked and was ignored");
                }
            }
        }
    }

    pub fn has_listeners(&self, event: &str) -> bool {
        self.listeners
            .read()
            .map(|map| map.get(event).is_some_and(|l| !l.is_empty()))
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let events: Vec<String> = self
            .listeners
            .read()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("EventBus").field("events", &events).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn test_listeners_run_in_order_and_mutate_payload() {
        let bus = EventBus::new();
        bus.listen(BEFORE_INSERT, |payload| {
            if let Some(data) = payload.data.as_mut() {
                data.insert("step".to_string(), json!(1));
            }
            Ok(())
        });
        bus.listen(BEFORE_INSERT, |payload| {
            if let Some(data) = payload.data.as_mut() {
                let step = data.get("step").and_then(Value::as_i64).unwrap_or(0);
                data.insert("step".to_string(), json!(step + 1));
            }
            Ok(())
        });

        let mut payload = EventPayload::for_table("users").with_data(Row::new());
        bus.publish(BEFORE_INSERT, &mut payload);
        assert_eq!(payload.data.unwrap()["step"], json!(2));
    }

    #[test]
    fn test_failing_listener_is_ignored() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(0));
        bus.listen(AFTER_DELETE, |_| Err(EngineError::storage("listener broke")));
        let counter = Arc::clone(&seen);
        bus.listen(AFTER_DELETE, move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        bus.publish(AFTER_DELETE, &mut EventPayload::for_table("users"));
        assert_eq!(*seen.lock().unwrap(), 1);
        assert!(bus.has_listeners(AFTER_DELETE));
        assert!(!bus.has_listeners(BEFORE_FIND));
    }

    #[test]
    fn test_panicking_listener_is_ignored() {
        let bus = EventBus::new();
        bus.listen(BEFORE_UPDATE, |payload| {
            payload.table = "half-written".to_string();
            panic!("listener bug");
        });
        bus.listen(BEFORE_UPDATE, |payload| {
            payload.affected = Some(1);
            Ok(())
        });

        let mut payload = EventPayload::for_table("users");
        bus.publish(BEFORE_UPDATE, &mut payload);
        assert_eq!(payload.table, "users");
        assert_eq!(payload.affected, Some(1));
    }

    #[test]
    fn test_clones_share_listeners() {
        let bus = EventBus::new();
        let clone = bus.clone();
        clone.listen(BEFORE_COMMIT, |_| Ok(()));
        assert!(bus.has_listeners(BEFORE_COMMIT));
    }
}
