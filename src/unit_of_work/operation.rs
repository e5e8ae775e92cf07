//! Queued mutations replayed at commit time.

use super::identity::{entity_key, EntityKey};
use crate::entity::Entity;
use crate::error::Result;
use crate::query::Criteria;
use crate::repository::Repository;
use crate::value::{Row, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    ById(Value),
    ByCriteria(Criteria),
}

/// One deferred `update`/`delete` call
#[derive(Clone)]
pub struct Operation {
    pub kind: OperationKind,
    pub target: Target,
    /// Filtered, mutated (not yet cast) update payload; empty for deletes
    pub payload: Row,
    pub(crate) repository: Repository,
    /// Whether replay should delete cascading dependents itself
    pub(crate) cascade: bool,
}

impl Operation {
    pub(crate) fn update_by_id(repository: Repository, id: Value, payload: Row) -> Self {
        Self {
            kind: OperationKind::Update,
            target: Target::ById(id),
            payload,
            repository,
            cascade: false,
        }
    }

    pub(crate) fn update_by(repository: Repository, criteria: Criteria, payload: Row) -> Self {
        Self {
            kind: OperationKind::Update,
            target: Target::ByCriteria(criteria),
            payload,
            repository,
            cascade: false,
        }
    }

    pub(crate) fn delete_by_id(repository: Repository, id: Value) -> Self {
        Self {
            kind: OperationKind::Delete,
            target: Target::ById(id),
            payload: Row::new(),
            repository,
            cascade: true,
        }
    }

    pub(crate) fn delete_by(repository: Repository, criteria: Criteria) -> Self {
        Self {
            kind: OperationKind::Delete,
            target: Target::ByCriteria(criteria),
            payload: Row::new(),
            repository,
            cascade: true,
        }
    }

    pub fn table(&self) -> &str {
        self.repository.table()
    }

    /// Identity of the addressed entity, for by-id operations
    pub(crate) fn entity_key(&self) -> Option<EntityKey> {
        match &self.target {
            Target::ById(id) => Some(entity_key(self.table(), id)),
            Target::ByCriteria(_) => None,
        }
    }

    pub(crate) fn is_update_by_id(&self) -> bool {
        self.kind == OperationKind::Update && matches!(self.target, Target::ById(_))
    }

    pub(crate) fn is_delete_by_id(&self) -> bool {
        self.kind == OperationKind::Delete && matches!(self.target, Target::ById(_))
    }

    /// Run the operation now; by-id updates return the refetched row
    pub(crate) fn execute(&self) -> Result<Option<Entity>> {
        let repo = &self.repository;
        match (&self.kind, &self.target) {
            (OperationKind::Update, Target::ById(id)) => repo.apply_update(id, self.payload.clone()),
            (OperationKind::Update, Target::ByCriteria(criteria)) => {
                repo.apply_update_by(criteria, self.payload.clone())?;
                Ok(None)
            }
            (OperationKind::Delete, Target::ById(id)) => {
                repo.apply_delete_by_id(id, self.cascade)?;
                Ok(None)
            }
            (OperationKind::Delete, Target::ByCriteria(criteria)) => {
                repo.apply_delete_by(criteria, self.cascade)?;
                Ok(None)
            }
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("kind", &self.kind)
            .field("table", &self.table())
            .field("target", &self.target)
            .field("payload", &self.payload)
            .field("cascade", &self.cascade)
            .finish()
    }
}
