//! Relation descriptors.
//!
//! A [`RelationDef`] is one case per relation kind, declared on the parent's
//! [`EntitySchema`] under a name. The related side is described by a schema
//! factory (usually `Related::schema`) so that two schemas may refer to each
//! other without building each other eagerly.

use crate::schema::EntitySchema;
use std::fmt;
use std::sync::Arc;

/// Produces the related entity's schema on demand
pub type SchemaFactory = Arc<dyn Fn() -> EntitySchema + Send + Sync>;

/// Cardinality and key ownership of a relation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationKind {
    /// hasOne: the related row holds the foreign key
    ToOne,
    /// hasMany: the related rows hold the foreign key
    ToMany,
    /// belongsTo: this row holds the foreign key
    ToOneOwning,
    /// belongsToMany: associations live in a junction table
    ManyToMany,
}

/// How two entity types relate
#[derive(Clone)]
pub enum RelationDef {
    HasOne {
        related: SchemaFactory,
        /// Column on the related table pointing back at this entity
        foreign_key: String,
        /// Column on this entity; the primary key when unset
        local_key: Option<String>,
        cascade_delete: bool,
    },
    HasMany {
        related: SchemaFactory,
        foreign_key: String,
        local_key: Option<String>,
        cascade_delete: bool,
    },
    BelongsTo {
        related: SchemaFactory,
        /// Column on this entity pointing at the owner
        foreign_key: String,
        /// Column on the owner; its primary key when unset
        owner_key: Option<String>,
    },
    BelongsToMany {
        related: SchemaFactory,
        junction_table: String,
        /// Junction column holding this entity's key
        junction_local_key: String,
        /// Junction column holding the related entity's key
        junction_foreign_key: String,
        local_key: Option<String>,
        related_key: Option<String>,
    },
}

fn factory<F>(f: F) -> SchemaFactory
where
    F: Fn() -> EntitySchema + Send + Sync + 'static,
{
    Arc::new(f)
}

impl RelationDef {
    pub fn has_one<F>(related: F, foreign_key: &str) -> Self
    where
        F: Fn() -> EntitySchema + Send + Sync + 'static,
    {
        RelationDef::HasOne {
            related: factory(related),
            foreign_key: foreign_key.to_string(),
            local_key: None,
            cascade_delete: false,
        }
    }

    pub fn has_many<F>(related: F, foreign_key: &str) -> Self
    where
        F: Fn() -> EntitySchema + Send + Sync + 'static,
    {
        RelationDef::HasMany {
            related: factory(related),
            foreign_key: foreign_key.to_string(),
            local_key: None,
            cascade_delete: false,
        }
    }

    pub fn belongs_to<F>(related: F, foreign_key: &str) -> Self
    where
        F: Fn() -> EntitySchema + Send + Sync + 'static,
    {
        RelationDef::BelongsTo {
            related: factory(related),
            foreign_key: foreign_key.to_string(),
            owner_key: None,
        }
    }

    pub fn belongs_to_many<F>(
        related: F,
        junction_table: &str,
        junction_local_key: &str,
        junction_foreign_key: &str,
    ) -> Self
    where
        F: Fn() -> EntitySchema + Send + Sync + 'static,
    {
        RelationDef::BelongsToMany {
            related: factory(related),
            junction_table: junction_table.to_string(),
            junction_local_key: junction_local_key.to_string(),
            junction_foreign_key: junction_foreign_key.to_string(),
            local_key: None,
            related_key: None,
        }
    }

    /// Override the parent-side key (hasOne, hasMany, belongsToMany)
    pub fn local_key(mut self, column: &str) -> Self {
        match &mut self {
            RelationDef::HasOne { local_key, .. }
            | RelationDef::HasMany { local_key, .. }
            | RelationDef::BelongsToMany { local_key, .. } => {
                *local_key = Some(column.to_string());
            }
            RelationDef::BelongsTo { .. } => {}
        }
        self
    }

    /// Override the owner-side key of a belongsTo relation
    pub fn owner_key(mut self, column: &str) -> Self {
        if let RelationDef::BelongsTo { owner_key, .. } = &mut self {
            *owner_key = Some(column.to_string());
        }
        self
    }

    /// Override the related-side key of a belongsToMany relation
    pub fn related_key(mut self, column: &str) -> Self {
        if let RelationDef::BelongsToMany { related_key, .. } = &mut self {
            *related_key = Some(column.to_string());
        }
        self
    }

    /// Delete dependents together with the parent (hasOne, hasMany)
    pub fn cascade_delete(mut self) -> Self {
        match &mut self {
            RelationDef::HasOne { cascade_delete, .. }
            | RelationDef::HasMany { cascade_delete, .. } => *cascade_delete = true,
            _ => {}
        }
        self
    }

    pub fn kind(&self) -> RelationKind {
        match self {
            RelationDef::HasOne { .. } => RelationKind::ToOne,
            RelationDef::HasMany { .. } => RelationKind::ToMany,
            RelationDef::BelongsTo { .. } => RelationKind::ToOneOwning,
            RelationDef::BelongsToMany { .. } => RelationKind::ManyToMany,
        }
    }

    pub fn is_to_many(&self) -> bool {
        matches!(self.kind(), RelationKind::ToMany | RelationKind::ManyToMany)
    }

    pub fn cascades(&self) -> bool {
        match self {
            RelationDef::HasOne { cascade_delete, .. }
            | RelationDef::HasMany { cascade_delete, .. } => *cascade_delete,
            _ => false,
        }
    }

    pub fn related_schema(&self) -> EntitySchema {
        match self {
            RelationDef::HasOne { related, .. }
            | RelationDef::HasMany { related, .. }
            | RelationDef::BelongsTo { related, .. }
            | RelationDef::BelongsToMany { related, .. } => related(),
        }
    }

    /// Column read from each parent to match related rows
    pub fn parent_key(&self, parent: &EntitySchema) -> String {
        match self {
            RelationDef::HasOne { local_key, .. }
            | RelationDef::HasMany { local_key, .. }
            | RelationDef::BelongsToMany { local_key, .. } => local_key
                .clone()
                .unwrap_or_else(|| parent.primary_key.clone()),
            RelationDef::BelongsTo { foreign_key, .. } => foreign_key.clone(),
        }
    }

    /// Column on the related table matched against parent keys
    pub fn child_key(&self, related: &EntitySchema) -> String {
        match self {
            RelationDef::HasOne { foreign_key, .. } | RelationDef::HasMany { foreign_key, .. } => {
                foreign_key.clone()
            }
            RelationDef::BelongsTo { owner_key, .. } => owner_key
                .clone()
                .unwrap_or_else(|| related.primary_key.clone()),
            RelationDef::BelongsToMany { related_key, .. } => related_key
                .clone()
                .unwrap_or_else(|| related.primary_key.clone()),
        }
    }

    /// Structural checks run when the declaring schema is validated
    pub(crate) fn check(&self) -> Result<(), String> {
        let nonempty = |label: &str, value: &str| {
            if value.trim().is_empty() {
                Err(format!("{label} is empty"))
            } else {
                Ok(())
            }
        };
        match self {
            RelationDef::HasOne { foreign_key, local_key, .. }
            | RelationDef::HasMany { foreign_key, local_key, .. } => {
                nonempty("foreign key", foreign_key)?;
                local_key.as_deref().map_or(Ok(()), |k| nonempty("local key", k))
            }
            RelationDef::BelongsTo { foreign_key, owner_key, .. } => {
                nonempty("foreign key", foreign_key)?;
                owner_key.as_deref().map_or(Ok(()), |k| nonempty("owner key", k))
            }
            RelationDef::BelongsToMany {
                junction_table,
                junction_local_key,
                junction_foreign_key,
                ..
            } => {
                nonempty("junction table", junction_table)?;
                nonempty("junction local key", junction_local_key)?;
                nonempty("junction foreign key", junction_foreign_key)?;
                if junction_local_key == junction_foreign_key {
                    return Err("junction keys must differ".to_string());
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for RelationDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelationDef::HasOne { foreign_key, local_key, cascade_delete, .. }
            | RelationDef::HasMany { foreign_key, local_key, cascade_delete, .. } => f
                .debug_struct(if self.kind() == RelationKind::ToOne { "HasOne" } else { "HasMany" })
                .field("foreign_key", foreign_key)
                .field("local_key", local_key)
                .field("cascade_delete", cascade_delete)
                .finish(),
            RelationDef::BelongsTo { foreign_key, owner_key, .. } => f
                .debug_struct("BelongsTo")
                .field("foreign_key", foreign_key)
                .field("owner_key", owner_key)
                .finish(),
            RelationDef::BelongsToMany {
                junction_table,
                junction_local_key,
                junction_foreign_key,
                ..
            } => f
                .debug_struct("BelongsToMany")
                .field("junction_table", junction_table)
                .field("junction_local_key", junction_local_key)
                .field("junction_foreign_key", junction_foreign_key)
                .finish(),
        }
    }
}
