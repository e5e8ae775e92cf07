//! Shared schemas and fixtures for the integration tests.
#![allow(dead_code)]

use breakwater::{Cast, EntitySchema, MemoryStore, RelationDef, Repository, Row};
use serde_json::{json, Value};
use std::sync::Arc;

pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

pub fn users() -> EntitySchema {
    EntitySchema::new("users")
        .column("name")
        .column("email")
        .cast("active", Cast::Bool)
        .relation("posts", RelationDef::has_many(posts, "user_id"))
        .relation("profile", RelationDef::has_one(profiles, "user_id"))
}

pub fn profiles() -> EntitySchema {
    EntitySchema::new("profiles").column("user_id").column("bio")
}

pub fn posts() -> EntitySchema {
    EntitySchema::new("posts")
        .column("title")
        .column("user_id")
        .timestamps()
        .soft_deletes()
        .relation("author", RelationDef::belongs_to(users, "user_id"))
        .relation(
            "comments",
            RelationDef::has_many(comments, "post_id").cascade_delete(),
        )
        .relation(
            "tags",
            RelationDef::belongs_to_many(tags, "post_tag", "post_id", "tag_id"),
        )
}

pub fn comments() -> EntitySchema {
    EntitySchema::new("comments")
        .column("post_id")
        .column("body")
        .soft_deletes()
}

pub fn tags() -> EntitySchema {
    EntitySchema::new("tags").column("label")
}

pub fn accounts() -> EntitySchema {
    EntitySchema::new("accounts")
        .column("owner")
        .cast("balance", Cast::Int)
        .version_column("version")
}

pub struct Blog {
    pub store: Arc<MemoryStore>,
    pub users: Repository,
    pub posts: Repository,
    pub comments: Repository,
    pub tags: Repository,
}

/// Two users, three posts, three comments (one soft-deleted), three tags
pub fn blog() -> Blog {
    let store = Arc::new(MemoryStore::new());
    let users = Repository::new(users(), store.clone()).unwrap();
    let posts = Repository::new(posts(), store.clone()).unwrap();
    let comments = Repository::new(comments(), store.clone()).unwrap();
    let tags = Repository::new(tags(), store.clone()).unwrap();

    users.insert(row(json!({"name": "ada", "email": "ada@example.com"}))).unwrap();
    users.insert(row(json!({"name": "bob", "email": "bob@example.com"}))).unwrap();
    posts.insert(row(json!({"title": "first", "user_id": 1}))).unwrap();
    posts.insert(row(json!({"title": "second", "user_id": 1}))).unwrap();
    posts.insert(row(json!({"title": "third", "user_id": 2}))).unwrap();
    comments.insert(row(json!({"post_id": 1, "body": "nice"}))).unwrap();
    comments.insert(row(json!({"post_id": 1, "body": "spam"}))).unwrap();
    comments.insert(row(json!({"post_id": 3, "body": "late"}))).unwrap();
    comments.delete_by_id(2).unwrap();
    for label in ["rust", "sql", "orm"] {
        tags.insert(row(json!({ "label": label }))).unwrap();
    }
    store.clear_statements().unwrap();

    Blog {
        store,
        users,
        posts,
        comments,
        tags,
    }
}
