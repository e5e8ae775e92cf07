//! Eager, nested, joined and many-to-many relation loading.

mod common;

use breakwater::connection::memory::StatementKind;
use breakwater::{Criteria, EagerStrategy, EngineConfig, EngineError, Entity, Finder, SyncResult};
use common::blog;
use serde_json::{json, Value};

fn titles_and_bodies(posts: &[Entity]) -> Vec<(Option<Value>, Vec<Option<Value>>)> {
    posts
        .iter()
        .map(|post| {
            let bodies = post.many("comments").iter().map(|c| c.get("body")).collect();
            (post.get("title"), bodies)
        })
        .collect()
}

#[test]
fn test_batched_and_join_strategies_agree() {
    let blog = blog();
    let batched = blog
        .posts
        .with(&["comments"])
        .fields(&["title", "comments.body"])
        .find_all_by(Criteria::new())
        .unwrap();
    assert_eq!(blog.store.count_statements(StatementKind::Select, "posts").unwrap(), 1);
    assert_eq!(blog.store.count_statements(StatementKind::Select, "comments").unwrap(), 1);

    blog.store.clear_statements().unwrap();
    let joined = blog
        .posts
        .with(&["comments"])
        .fields(&["title", "comments.body"])
        .join_eager(true)
        .find_all_by(Criteria::new())
        .unwrap();
    assert_eq!(blog.store.count_statements(StatementKind::Select, "posts").unwrap(), 1);
    assert_eq!(blog.store.count_statements(StatementKind::Select, "comments").unwrap(), 0);

    let expected = vec![
        (Some(json!("first")), vec![Some(json!("nice"))]),
        (Some(json!("second")), vec![]),
        (Some(json!("third")), vec![Some(json!("late"))]),
    ];
    assert_eq!(titles_and_bodies(&batched), expected);
    assert_eq!(titles_and_bodies(&joined), expected);
}

#[test]
fn test_join_strategy_from_config_falls_back_when_paged() {
    let blog = blog();
    let config = EngineConfig {
        eager_strategy: EagerStrategy::Join,
        ..EngineConfig::default()
    };
    let posts = blog.posts.clone().with_config(config);

    let paged = posts
        .with(&["comments"])
        .fields(&["title", "comments.body"])
        .limit(2)
        .find_all_by(Criteria::new())
        .unwrap();
    assert_eq!(paged.len(), 2);
    assert_eq!(blog.store.count_statements(StatementKind::Select, "comments").unwrap(), 1);
}

#[test]
fn test_nested_paths_load_each_level_once() {
    let blog = blog();
    let users = blog.users.with(&["posts.comments"]).find_all_by(Criteria::new()).unwrap();

    for table in ["users", "posts", "comments"] {
        assert_eq!(blog.store.count_statements(StatementKind::Select, table).unwrap(), 1);
    }
    let ada_posts = users[0].many("posts");
    assert_eq!(ada_posts.len(), 2);
    assert_eq!(ada_posts[0].many("comments").len(), 1);
    assert!(ada_posts[1].many("comments").is_empty());
    assert_eq!(
        users[1].many("posts")[0].many("comments")[0].get("body"),
        Some(json!("late"))
    );
}

#[test]
fn test_to_one_relations() {
    let blog = blog();
    let post = blog.posts.with(&["author"]).find_by_id(3).unwrap().unwrap();
    assert_eq!(post.one("author").and_then(|a| a.get("name")), Some(json!("bob")));

    let user = blog.users.with(&["profile"]).find_by_id(1).unwrap().unwrap();
    assert!(user.has_relation("profile"));
    assert!(user.one("profile").is_none());
    assert_eq!(user.to_deep_view()["profile"], Value::Null);
}

fn nice_only<'a>(finder: Finder<'a>) -> Finder<'a> {
    finder.scope(|criteria| criteria.set("body", json!("nice")))
}

#[test]
fn test_constrained_eager_load() {
    let blog = blog();
    let posts = blog
        .posts
        .query()
        .with_constrained("comments", nice_only)
        .find_all_by(Criteria::new())
        .unwrap();
    assert_eq!(posts[0].many("comments").len(), 1);
    assert!(posts[2].many("comments").is_empty());
}

#[test]
fn test_relation_projection_keeps_join_keys() {
    let blog = blog();
    let users = blog
        .users
        .with(&["posts"])
        .fields(&["name", "posts.title"])
        .find_all_by(Criteria::new())
        .unwrap();
    let view = users[0].to_flat_view();
    assert!(view.contains_key("id"));
    assert!(!view.contains_key("email"));
    let post = users[0].many("posts")[0].to_flat_view();
    assert!(post.contains_key("user_id"));
    assert!(!post.contains_key("created_at"));
}

#[test]
fn test_many_to_many_sync_and_load() {
    let blog = blog();
    blog.posts.attach("tags", json!(1), &[json!(1), json!(2)]).unwrap();

    let outcome = blog.posts.sync("tags", json!(1), &[json!(2), json!(3)]).unwrap();
    assert_eq!(outcome, SyncResult { attached: 1, detached: 1 });
    assert_eq!(
        blog.posts.sync("tags", json!(1), &[json!(2), json!(3)]).unwrap(),
        SyncResult::default()
    );

    let post = blog.posts.with(&["tags"]).find_by_id(1).unwrap().unwrap();
    let labels: Vec<_> = post.many("tags").iter().filter_map(|t| t.get("label")).collect();
    assert_eq!(labels, vec![json!("sql"), json!("orm")]);

    let untagged = blog.posts.with(&["tags"]).find_by_id(2).unwrap().unwrap();
    assert!(untagged.has_relation("tags"));
    assert!(untagged.many("tags").is_empty());
    assert!(blog.tags.find_by_id(1).unwrap().is_some());
}

#[test]
fn test_unknown_relations_ignored_unless_strict() {
    let blog = blog();
    let post = blog.posts.with(&["nope"]).find_by_id(1).unwrap().unwrap();
    assert!(!post.has_relation("nope"));

    let strict = blog.posts.clone().with_config(EngineConfig {
        strict_relations: true,
        ..EngineConfig::default()
    });
    let err = strict.with(&["nope"]).find_by_id(1).unwrap_err();
    assert!(matches!(err, EngineError::UnknownRelation { .. }));
}

#[test]
fn test_lazy_load_matches_eager() {
    let blog = blog();
    let posts = blog.posts.find_all_by(Criteria::new()).unwrap();
    blog.posts.load_many(&posts, "comments").unwrap();
    assert_eq!(posts[0].many("comments").len(), 1);
    assert!(blog.comments.find_by_id(2).unwrap().is_none());
}
