//! Relations between entity types and the loaders that resolve them.
//!
//! - [`def`]: the [`RelationDef`] descriptor declared on a schema
//! - `eager`: path trees and the batched membership loader (default)
//! - `join`: the single-query LEFT JOIN loader (opt-in, single level)
//! - [`pivot`]: many-to-many loading plus attach / detach / sync
//! - [`lazy`]: loading relations onto already hydrated entities

pub mod def;
pub(crate) mod eager;
pub(crate) mod join;
pub mod lazy;
pub mod pivot;

pub use def::{RelationDef, RelationKind, SchemaFactory};
pub use pivot::SyncResult;

use crate::error::{EngineError, Result};
use crate::repository::Repository;

/// Look up `name` on the repository's schema.
///
/// Unknown names are skipped with a warning, or rejected when
/// `strict_relations` is configured.
pub(crate) fn resolve(repo: &Repository, name: &str) -> Result<Option<RelationDef>> {
    match repo.schema().find_relation(name) {
        Some(def) => Ok(Some(def.clone())),
        None if repo.config().strict_relations => Err(EngineError::UnknownRelation {
            table: repo.table().to_string(),
            relation: name.to_string(),
        }),
        None => {
            log::warn!("ignoring unknown relation `{name}` on {}", repo.table());
            Ok(None)
        }
    }
}
