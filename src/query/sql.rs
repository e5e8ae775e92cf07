//! Rendering of [`crate::query`] statements to SQL via sea-query.
//!
//! Every value is bound as a parameter; identifiers are quoted by the
//! dialect's query builder. The result is the usual sea-query pair of SQL
//! text and [`Values`], ready for a [`SqlExecutor`](crate::executor::SqlExecutor).
//!
//! # Example
//!
//! ```
//! use breakwater::query::{sql::Dialect, Criteria, SelectQuery};
//!
//! let query = SelectQuery::new("users")
//!     .filters(Criteria::new().eq("status", "active").to_predicates());
//! let (sql, values) = Dialect::Postgres.select(&query).unwrap();
//! assert!(sql.starts_with("SELECT"));
//! assert_eq!(values.0.len(), 1);
//! ```

use crate::error::Result;
use crate::query::{
    ColumnRef, DeleteStatement, InsertStatement, Order, Predicate, SelectItem, SelectQuery,
    UpdateStatement,
};
use crate::value::Value;
use sea_query::{
    Asterisk, Condition, DynIden, Expr, ExprTrait, Func, JoinType, MysqlQueryBuilder,
    PostgresQueryBuilder, Query, SelectStatement, SqliteQueryBuilder, Values,
};
use serde::Deserialize;

/// Rendered SQL text plus its bound parameters
pub type Rendered = (String, Values);

/// Target SQL dialect
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    Postgres,
    Sqlite,
    MySql,
}

macro_rules! build_for {
    ($dialect:expr, $stmt:expr) => {
        match $dialect {
            Dialect::Postgres => $stmt.build(PostgresQueryBuilder),
            Dialect::Sqlite => $stmt.build(SqliteQueryBuilder),
            Dialect::MySql => $stmt.build(MysqlQueryBuilder),
        }
    };
}

impl Dialect {
    /// Whether INSERT can report the generated key with RETURNING
    pub fn supports_returning(self) -> bool {
        !matches!(self, Dialect::MySql)
    }

    pub fn select(self, query: &SelectQuery) -> Result<Rendered> {
        let stmt = select_statement(query);
        Ok(build_for!(self, stmt))
    }

    /// `SELECT COUNT(*)` with the query's joins and filters; ordering and paging are ignored
    pub fn count(self, query: &SelectQuery) -> Result<Rendered> {
        let mut stmt = Query::select();
        stmt.expr_as(Func::count(Expr::col(Asterisk)), iden("count"))
            .from(iden(&query.table));
        apply_joins_and_filter(&mut stmt, query);
        Ok(build_for!(self, stmt))
    }

    pub fn insert(self, insert: &InsertStatement) -> Result<Rendered> {
        let mut stmt = Query::insert();
        stmt.into_table(iden(&insert.table));
        stmt.columns(insert.values.keys().map(|k| iden(k)));
        stmt.values(insert.values.values().map(|v| Expr::val(to_sea_value(v))))?;
        if let Some(pk) = &insert.returning {
            if self.supports_returning() {
                stmt.returning_col(iden(pk));
            }
        }
        Ok(build_for!(self, stmt))
    }

    pub fn update(self, update: &UpdateStatement) -> Result<Rendered> {
        let mut stmt = Query::update();
        stmt.table(iden(&update.table));
        for (column, value) in &update.set {
            stmt.value(iden(column), Expr::val(to_sea_value(value)));
        }
        stmt.cond_where(condition(&update.filter));
        Ok(build_for!(self, stmt))
    }

    pub fn delete(self, delete: &DeleteStatement) -> Result<Rendered> {
        let mut stmt = Query::delete();
        stmt.from_table(iden(&delete.table));
        stmt.cond_where(condition(&delete.filter));
        Ok(build_for!(self, stmt))
    }
}

fn iden(name: &str) -> DynIden {
    DynIden::from(name.to_string())
}

fn column_expr(column: &ColumnRef) -> Expr {
    match &column.table {
        Some(table) => Expr::col((iden(table), iden(&column.column))),
        None => Expr::col(iden(&column.column)),
    }
}

fn predicate_expr(predicate: &Predicate) -> Expr {
    match predicate {
        Predicate::Eq(column, value) => column_expr(column).eq(Expr::val(to_sea_value(value))),
        Predicate::IsNull(column) => column_expr(column).is_null(),
        Predicate::IsNotNull(column) => column_expr(column).is_not_null(),
        Predicate::In(_, values) if values.is_empty() => Expr::cust("1 = 0"),
        Predicate::In(column, values) => {
            column_expr(column).is_in(values.iter().map(to_sea_value).collect::<Vec<_>>())
        }
        Predicate::ColumnsEq(left, right) => column_expr(left).eq(column_expr(right)),
    }
}

fn condition(predicates: &[Predicate]) -> Condition {
    predicates
        .iter()
        .fold(Condition::all(), |cond, p| cond.add(predicate_expr(p)))
}

fn apply_joins_and_filter(stmt: &mut SelectStatement, query: &SelectQuery) {
    for join in &query.joins {
        stmt.join_as(
            JoinType::LeftJoin,
            iden(&join.table),
            iden(&join.alias),
            condition(&join.on),
        );
    }
    if !query.filter.is_empty() {
        stmt.cond_where(condition(&query.filter));
    }
}

fn select_statement(query: &SelectQuery) -> SelectStatement {
    let mut stmt = Query::select();
    stmt.from(iden(&query.table));
    if query.items.is_empty() {
        stmt.column((iden(&query.table), Asterisk));
    }
    for item in &query.items {
        match item {
            SelectItem::AllOf(table) => {
                stmt.column((iden(table), Asterisk));
            }
            SelectItem::Column {
                column,
                alias: Some(alias),
            } => {
                stmt.expr_as(column_expr(column), iden(alias));
            }
            SelectItem::Column {
                column,
                alias: None,
            } => {
                stmt.expr(column_expr(column));
            }
        }
    }
    apply_joins_and_filter(&mut stmt, query);
    for (column, order) in &query.order_by {
        let order = match order {
            Order::Asc => sea_query::Order::Asc,
            Order::Desc => sea_query::Order::Desc,
        };
        stmt.order_by_expr(column_expr(column), order);
    }
    if let Some(limit) = query.limit {
        stmt.limit(limit);
    }
    if let Some(offset) = query.offset {
        stmt.offset(offset);
    }
    stmt
}

/// Convert an attribute value into a bindable sea-query value.
///
/// Arrays and objects are bound as JSON; scalars map to their natural SQL type.
pub fn to_sea_value(value: &Value) -> sea_query::Value {
    match value {
        Value::Null => Option::<String>::None.into(),
        Value::Bool(b) => (*b).into(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.into()
            } else if let Some(u) = n.as_u64() {
                u.into()
            } else {
                n.as_f64().unwrap_or_default().into()
            }
        }
        Value::String(s) => s.clone().into(),
        Value::Array(_) | Value::Object(_) => value.clone().into(),
    }
}
