//! Lazy loading: resolve a relation onto entities that were fetched without it.
//!
//! Uses the same batched membership loader as `with(...)`, so loading a
//! relation for a list of entities costs one query per path segment.

use super::eager;
use crate::entity::Entity;
use crate::error::Result;
use crate::repository::Repository;

pub fn load(repo: &Repository, entity: &Entity, relation: &str) -> Result<()> {
    load_many(repo, std::slice::from_ref(entity), relation)
}

pub fn load_many(repo: &Repository, entities: &[Entity], relation: &str) -> Result<()> {
    eager::load(repo, entities, &[(relation.to_string(), None)], &[])
}

#[cfg(test)]
mod tests {
    use crate::connection::memory::{MemoryStore, StatementKind};
    use crate::query::Criteria;
    use crate::relation::RelationDef;
    use crate::repository::Repository;
    use crate::schema::EntitySchema;
    use crate::value::Row;
    use serde_json::json;
    use std::sync::Arc;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap_or_default()
    }

    fn authors() -> EntitySchema {
        EntitySchema::new("authors").column("name")
    }

    fn books() -> EntitySchema {
        EntitySchema::new("books")
            .column("title")
            .column("author_id")
            .relation("author", RelationDef::belongs_to(authors, "author_id"))
    }

    #[test]
    fn test_load_many_issues_one_query() {
        let store = Arc::new(MemoryStore::new());
        let authors_repo = Repository::new(authors(), store.clone()).unwrap();
        let books_repo = Repository::new(books(), store.clone()).unwrap();
        authors_repo.insert(row(json!({"name": "Le Guin"}))).unwrap();
        books_repo.insert(row(json!({"title": "Dispossessed", "author_id": 1}))).unwrap();
        books_repo.insert(row(json!({"title": "Lathe", "author_id": 1}))).unwrap();
        books_repo.insert(row(json!({"title": "Anon", "author_id": null}))).unwrap();

        let books = books_repo.find_all_by(Criteria::new()).unwrap();
        store.clear_statements().unwrap();
        books_repo.load_many(&books, "author").unwrap();

        assert_eq!(store.count_statements(StatementKind::Select, "authors").unwrap(), 1);
        assert_eq!(books[0].one("author").and_then(|a| a.get("name")), Some(json!("Le Guin")));
        assert!(books[2].has_relation("author"));
        assert!(books[2].one("author").is_none());
    }

    #[test]
    fn test_load_single_entity() {
        let store = Arc::new(MemoryStore::new());
        let authors_repo = Repository::new(authors(), store.clone()).unwrap();
        let books_repo = Repository::new(books(), store).unwrap();
        authors_repo.insert(row(json!({"name": "Butler"}))).unwrap();
        let book = books_repo
            .insert(row(json!({"title": "Kindred", "author_id": 1})))
            .unwrap();
        books_repo.load(&book, "author").unwrap();
        assert_eq!(book.to_deep_view()["author"]["name"], json!("Butler"));
    }
}
