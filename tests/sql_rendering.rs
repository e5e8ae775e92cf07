//! Repository calls rendered through `SqlConnection` against a recording executor.

mod common;

use breakwater::query::sql::Dialect;
use breakwater::{Criteria, Repository, Result, Row, SqlConnection, SqlExecutor, UnitOfWork, Value};
use common::{posts, row};
use sea_query::Values;
use serde_json::json;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Recorder {
    statements: Mutex<Vec<String>>,
    rows: Mutex<Vec<Row>>,
}

impl Recorder {
    fn statements(&self) -> Vec<String> {
        self.statements.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn respond_with(&self, rows: Vec<Row>) {
        if let Ok(mut slot) = self.rows.lock() {
            *slot = rows;
        }
    }
}

impl SqlExecutor for Recorder {
    fn query_all(&self, sql: &str, _values: &Values) -> Result<Vec<Row>> {
        if let Ok(mut log) = self.statements.lock() {
            log.push(sql.to_string());
        }
        Ok(self.rows.lock().map(|r| r.clone()).unwrap_or_default())
    }

    fn execute(&self, sql: &str, _values: &Values) -> Result<u64> {
        if let Ok(mut log) = self.statements.lock() {
            log.push(sql.to_string());
        }
        Ok(1)
    }

    fn last_insert_id(&self) -> Result<Option<Value>> {
        Ok(None)
    }
}

fn setup(dialect: Dialect) -> (Arc<Recorder>, Repository) {
    let recorder = Arc::new(Recorder::default());
    let connection = SqlConnection::new("recorded", recorder.clone(), dialect);
    let repo = Repository::new(posts(), Arc::new(connection)).unwrap();
    (recorder, repo)
}

#[test]
fn test_soft_delete_filter_in_select() {
    let (recorder, posts) = setup(Dialect::Postgres);
    posts.find_all_by(Criteria::new().eq("user_id", 1)).unwrap();
    let sql = &recorder.statements()[0];
    assert!(sql.starts_with(r#"SELECT "posts".* FROM "posts""#), "{sql}");
    assert!(sql.contains(r#""user_id" = $1"#), "{sql}");
    assert!(sql.contains(r#""deleted_at" IS NULL"#), "{sql}");
}

#[test]
fn test_insert_returns_key_then_refetches() {
    let (recorder, posts) = setup(Dialect::Postgres);
    recorder.respond_with(vec![row(json!({"id": 7, "title": "hello", "user_id": 1}))]);
    let post = posts.insert(row(json!({"title": "hello", "user_id": 1}))).unwrap();
    assert_eq!(post.get("id"), Some(json!(7)));

    let statements = recorder.statements();
    assert!(statements[0].starts_with(r#"INSERT INTO "posts""#), "{}", statements[0]);
    assert!(statements[0].ends_with(r#"RETURNING "id""#), "{}", statements[0]);
    assert!(statements[1].starts_with("SELECT"), "{}", statements[1]);
}

#[test]
fn test_joined_eager_load_is_one_statement() {
    let (recorder, posts) = setup(Dialect::Postgres);
    posts
        .with(&["comments"])
        .fields(&["title", "comments.body"])
        .join_eager(true)
        .find_all_by(Criteria::new())
        .unwrap();
    let statements = recorder.statements();
    assert_eq!(statements.len(), 1);
    let sql = &statements[0];
    assert!(sql.contains(r#"LEFT JOIN "comments" AS "comments""#), "{sql}");
    assert!(sql.contains(r#""comments"."body" AS "comments__body""#), "{sql}");
    assert!(sql.contains(r#""comments"."deleted_at" IS NULL"#), "{sql}");
}

#[test]
fn test_commit_wraps_operations_in_transaction() {
    let (recorder, posts) = setup(Dialect::Sqlite);
    let uow = UnitOfWork::new();
    uow.run(|uow| {
        posts.bind(uow).update_by(Criteria::new().eq("user_id", 1), row(json!({"title": "x"})))?;
        Ok(())
    })
    .unwrap();
    let statements = recorder.statements();
    let begin = statements.iter().position(|s| s.starts_with("BEGIN"));
    let update = statements.iter().position(|s| s.starts_with(r#"UPDATE "posts""#));
    let commit = statements.iter().position(|s| s.starts_with("COMMIT"));
    assert!(begin.is_some() && update.is_some() && commit.is_some(), "{statements:?}");
    assert!(begin < update && update < commit, "{statements:?}");
}
