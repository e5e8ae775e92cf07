//! Unit of work: identity map, deferred mutations and the commit pipeline.
//!
//! A [`UnitOfWork`] is an explicit, cheaply cloneable context handle. Bind a
//! repository to it with [`Repository::bind`](crate::Repository::bind); while
//! the unit of work is active, that repository:
//!
//! - hands out one [`Entity`] instance per row (identity map),
//! - queues `update`/`delete` calls instead of executing them,
//! - returns a best-effort merged view for deferred updates.
//!
//! The queue is replayed by [`UnitOfWork::commit`]. Units of work are
//! single-threaded (`!Send`); independent units of work can coexist.
//!
//! ```
//! use breakwater::{EntitySchema, MemoryStore, Repository, Row, UnitOfWork};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # fn main() -> breakwater::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let users = Repository::new(EntitySchema::new("users").column("name"), store)?;
//! let mut row = Row::new();
//! row.insert("name".into(), json!("ada"));
//! let ada = users.insert(row)?;
//!
//! let uow = UnitOfWork::new();
//! uow.run(|uow| {
//!     let users = users.bind(uow);
//!     let mut change = Row::new();
//!     change.insert("name".into(), json!("Ada"));
//!     users.update(ada.raw("id").unwrap_or_default(), change)?;
//!     Ok(())
//! })?;
//! assert_eq!(users.find_by_id(1)?.and_then(|u| u.get("name")), Some(json!("Ada")));
//! # Ok(())
//! # }
//! ```

mod commit;
mod identity;
mod operation;

pub use operation::{Operation, OperationKind, Target};

use crate::config::EngineConfig;
use crate::connection::in_transaction;
use crate::entity::Entity;
use crate::error::{EngineError, Result};
use crate::events::{EventBus, EventPayload, AFTER_COMMIT, BEFORE_COMMIT};
use crate::repository::Repository;
use crate::value::{Row, Value};
use identity::{entity_key, IdentityMap};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Inactive,
    Active,
    Committing,
}

struct Context {
    state: Cell<State>,
    suspended: Cell<bool>,
    snapshots: Cell<bool>,
    identity: RefCell<IdentityMap>,
    queue: RefCell<Vec<Operation>>,
    events: RefCell<EventBus>,
}

/// Shared handle on one unit-of-work context; clones refer to the same context
#[derive(Clone)]
pub struct UnitOfWork {
    inner: Rc<Context>,
}

impl Default for UnitOfWork {
    fn default() -> Self {
        Self::new()
    }
}

/// Restores the previous suspension flag on drop
struct SuspendGuard<'a> {
    flag: &'a Cell<bool>,
    previous: bool,
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(self.previous);
    }
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(Context {
                state: Cell::new(State::Inactive),
                suspended: Cell::new(false),
                snapshots: Cell::new(false),
                identity: RefCell::new(IdentityMap::default()),
                queue: RefCell::new(Vec::new()),
                events: RefCell::new(EventBus::new()),
            }),
        }
    }

    /// Unit of work with snapshotting taken from `config.snapshots`
    pub fn from_config(config: &EngineConfig) -> Self {
        let uow = Self::new();
        uow.enable_snapshots(config.snapshots);
        uow
    }

    /// Publish commit events on `events`
    pub fn with_events(self, events: EventBus) -> Self {
        *self.inner.events.borrow_mut() = events;
        self
    }

    pub fn with_snapshots(self) -> Self {
        self.enable_snapshots(true);
        self
    }

    /// Record snapshots of entities attached from now on, and diff them at commit
    pub fn enable_snapshots(&self, enabled: bool) {
        self.inner.snapshots.set(enabled);
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.get() == State::Active
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.suspended.get()
    }

    /// Whether bound repositories currently queue mutations
    pub(crate) fn is_deferring(&self) -> bool {
        self.is_active() && !self.is_suspended()
    }

    /// Run `body` with deferral switched off; bound repositories write immediately
    pub fn suspended<T>(&self, body: impl FnOnce() -> T) -> T {
        let _guard = self.suspend();
        body()
    }

    fn suspend(&self) -> SuspendGuard<'_> {
        let previous = self.inner.suspended.replace(true);
        SuspendGuard {
            flag: &self.inner.suspended,
            previous,
        }
    }

    /// Activate the context.
    ///
    /// # Errors
    ///
    /// `EngineError::Transaction` when it is already active or committing.
    pub fn begin(&self) -> Result<()> {
        match self.inner.state.get() {
            State::Inactive => {
                self.inner.state.set(State::Active);
                log::debug!("unit of work started");
                Ok(())
            }
            state => Err(EngineError::Transaction(format!(
                "cannot begin unit of work: already {state:?}"
            ))),
        }
    }

    /// Run `body` inside this unit of work and commit afterwards.
    ///
    /// Nested calls on an already active unit of work just run `body`; only
    /// the outermost call commits. An error from `body` or from the commit
    /// rolls the unit of work back and is returned unchanged.
    pub fn run<T>(&self, body: impl FnOnce(&UnitOfWork) -> Result<T>) -> Result<T> {
        if self.inner.state.get() != State::Inactive {
            return body(self);
        }
        self.begin()?;
        match body(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                self.rollback();
                Err(err)
            }
        }
    }

    /// Replay every queued operation and close the context.
    ///
    /// Operations are grouped by connection and each group runs in its own
    /// transaction. Commits across different connections are not atomic: a
    /// failure in a later group does not undo groups that already committed.
    ///
    /// On error the unit of work is rolled back and the error returned.
    pub fn commit(&self) -> Result<()> {
        if !self.is_active() {
            return Err(EngineError::Transaction("no active unit of work to commit".into()));
        }
        let queued = self.inner.queue.take();
        let count = queued.len();
        #[cfg(feature = "tracing")]
        let _span = crate::metrics::tracing_helpers::unit_of_work_commit_span(count).entered();

        let mut before = EventPayload {
            affected: Some(count as u64),
            ..EventPayload::default()
        };
        self.inner.events.borrow().publish(BEFORE_COMMIT, &mut before);

        self.inner.state.set(State::Committing);
        let outcome = {
            let _guard = self.suspend();
            self.replay(queued)
        };

        #[cfg(feature = "metrics")]
        crate::metrics::METRICS.record_commit(outcome.as_ref().map_or(count, |n| *n), outcome.is_ok());

        match outcome {
            Ok(executed) => {
                let snapshots = self.inner.snapshots.get();
                self.inner.identity.borrow_mut().refresh_snapshots(snapshots);
                self.inner.state.set(State::Inactive);
                log::debug!("unit of work committed {executed} operations");
                let mut after = EventPayload {
                    affected: Some(executed as u64),
                    ..EventPayload::default()
                };
                self.inner.events.borrow().publish(AFTER_COMMIT, &mut after);
                Ok(())
            }
            Err(err) => {
                log::debug!("unit of work commit failed: {err}");
                self.rollback();
                Err(err)
            }
        }
    }

    /// Run the pipeline; returns the number of operations executed
    fn replay(&self, queued: Vec<Operation>) -> Result<usize> {
        let operations = commit::expand_cascades(queued)?;
        let operations = if self.inner.snapshots.get() {
            commit::inject_dirty(operations, &self.inner.identity.borrow())
        } else {
            operations
        };
        let operations = commit::coalesce(operations);
        let executed = operations.len();

        for (connection, group) in commit::group_by_connection(operations) {
            log::debug!("commit {} operations on {}", group.len(), connection.name());
            in_transaction(connection.as_ref(), || {
                for op in &group {
                    let fresh = op.execute()?;
                    if let (Some(key), Some(fresh)) = (op.entity_key(), fresh) {
                        if let Some(entry) = self.inner.identity.borrow().get(&key) {
                            entry.entity.merge_raw(&fresh.to_flat_view());
                        }
                    }
                }
                Ok(())
            })?;
        }
        Ok(executed)
    }

    /// Drop queued operations and the identity map, and close the context
    pub fn rollback(&self) {
        let dropped = self.inner.queue.take().len();
        self.inner.identity.borrow_mut().clear();
        self.inner.state.set(State::Inactive);
        log::debug!("unit of work rolled back, {dropped} operations dropped");
    }

    /// Attached entity for (`table`, `id`), if any
    pub fn lookup(&self, table: &str, id: &Value) -> Option<Entity> {
        self.inner
            .identity
            .borrow()
            .get(&entity_key(table, id))
            .map(|entry| entry.entity.clone())
    }

    /// Snapshot recorded when (`table`, `id`) was attached
    pub fn snapshot(&self, table: &str, id: &Value) -> Option<Row> {
        self.inner
            .identity
            .borrow()
            .get(&entity_key(table, id))
            .and_then(|entry| entry.snapshot.clone())
    }

    /// Attach `entity` unless the same row is already attached; returns the
    /// canonical instance
    pub(crate) fn register(&self, table: &str, id: &Value, entity: Entity, repository: Repository) -> Entity {
        let snapshots = self.inner.snapshots.get();
        self.inner
            .identity
            .borrow_mut()
            .attach(entity_key(table, id), id, entity, repository, snapshots)
    }

    /// Forget one attached entity; later finds return a fresh instance
    pub fn detach(&self, table: &str, id: &Value) -> bool {
        self.inner.identity.borrow_mut().detach(&entity_key(table, id))
    }

    /// Forget every attached entity; queued operations are kept
    pub fn clear(&self) {
        self.inner.identity.borrow_mut().clear();
    }

    pub fn attached_count(&self) -> usize {
        self.inner.identity.borrow().len()
    }

    pub(crate) fn enqueue(&self, operation: Operation) {
        log::debug!("deferred {:?} on {}", operation.kind, operation.table());
        self.inner.queue.borrow_mut().push(operation);
    }

    pub fn pending_operations(&self) -> usize {
        self.inner.queue.borrow().len()
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("state", &self.inner.state.get())
            .field("suspended", &self.inner.suspended.get())
            .field("snapshots", &self.inner.snapshots.get())
            .field("attached", &self.attached_count())
            .field("pending", &self.pending_operations())
            .finish()
    }
}
