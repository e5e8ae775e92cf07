//! Storage-neutral statements.
//!
//! Repositories describe what they want with these types; each
//! [`Connection`](crate::connection::Connection) decides how to run them.
//! The SQL backend renders them through sea-query (see [`sql`]), the memory
//! store evaluates them directly.
//!
//! Only what the engine needs is modelled: equality / IS NULL / IN filters
//! combined with AND, LEFT JOINs with aliased projections, ordering and paging.

pub mod sql;

use crate::value::{Row, Value};

/// Equality criteria: column → required value, `Value::Null` meaning IS NULL.
///
/// Order is preserved and a column appears at most once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Criteria {
    pairs: Vec<(String, Value)>,
}

impl Criteria {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `column = value` (or IS NULL for `Value::Null`)
    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.set(column, value.into());
        self
    }

    /// Require `column IS NULL`
    pub fn is_null(mut self, column: &str) -> Self {
        self.set(column, Value::Null);
        self
    }

    /// Insert or replace the requirement on `column`
    pub fn set(&mut self, column: &str, value: Value) {
        match self.pairs.iter_mut().find(|(c, _)| c == column) {
            Some(slot) => slot.1 = value,
            None => self.pairs.push((column.to_string(), value)),
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.pairs.iter().find(|(c, _)| c == column).map(|(_, v)| v)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.get(column).is_some()
    }

    pub fn remove(&mut self, column: &str) -> Option<Value> {
        let idx = self.pairs.iter().position(|(c, _)| c == column)?;
        Some(self.pairs.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.pairs.iter().map(|(c, v)| (c.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// AND-combined predicates for these criteria
    pub fn to_predicates(&self) -> Vec<Predicate> {
        self.pairs
            .iter()
            .map(|(column, value)| {
                if value.is_null() {
                    Predicate::IsNull(ColumnRef::new(column))
                } else {
                    Predicate::Eq(ColumnRef::new(column), value.clone())
                }
            })
            .collect()
    }

    /// Same criteria with every column qualified by `table`
    pub(crate) fn to_qualified_predicates(&self, table: &str) -> Vec<Predicate> {
        self.to_predicates()
            .into_iter()
            .map(|p| p.qualify(table))
            .collect()
    }
}

impl From<Row> for Criteria {
    fn from(row: Row) -> Self {
        Self {
            pairs: row.into_iter().collect(),
        }
    }
}

impl<const N: usize> From<[(&str, Value); N]> for Criteria {
    fn from(pairs: [(&str, Value); N]) -> Self {
        let mut criteria = Criteria::new();
        for (column, value) in pairs {
            criteria.set(column, value);
        }
        criteria
    }
}

/// A column, optionally qualified by a table name or join alias
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    pub table: Option<String>,
    pub column: String,
}

impl ColumnRef {
    pub fn new(column: &str) -> Self {
        Self {
            table: None,
            column: column.to_string(),
        }
    }

    pub fn qualified(table: &str, column: &str) -> Self {
        Self {
            table: Some(table.to_string()),
            column: column.to_string(),
        }
    }
}

/// A single filter term; terms in a list are AND-combined
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(ColumnRef, Value),
    IsNull(ColumnRef),
    IsNotNull(ColumnRef),
    /// Membership; an empty list matches nothing
    In(ColumnRef, Vec<Value>),
    /// Column-to-column equality (join conditions)
    ColumnsEq(ColumnRef, ColumnRef),
}

impl Predicate {
    /// Qualify unqualified column references with `table`
    pub fn qualify(self, table: &str) -> Self {
        let q = |c: ColumnRef| match c.table {
            Some(_) => c,
            None => ColumnRef::qualified(table, &c.column),
        };
        match self {
            Predicate::Eq(c, v) => Predicate::Eq(q(c), v),
            Predicate::IsNull(c) => Predicate::IsNull(q(c)),
            Predicate::IsNotNull(c) => Predicate::IsNotNull(q(c)),
            Predicate::In(c, vs) => Predicate::In(q(c), vs),
            Predicate::ColumnsEq(a, b) => Predicate::ColumnsEq(q(a), q(b)),
        }
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// One entry of a select list
#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    /// `table.*`
    AllOf(String),
    /// `column` or `table.column AS alias`
    Column {
        column: ColumnRef,
        alias: Option<String>,
    },
}

/// `LEFT JOIN table AS alias ON ...`
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub table: String,
    pub alias: String,
    pub on: Vec<Predicate>,
}

/// A SELECT against one table with optional LEFT JOINs
#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    pub table: String,
    /// Empty means every column of the base table
    pub items: Vec<SelectItem>,
    pub joins: Vec<Join>,
    pub filter: Vec<Predicate>,
    pub order_by: Vec<(ColumnRef, Order)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl SelectQuery {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            items: Vec::new(),
            joins: Vec::new(),
            filter: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    pub fn column(mut self, column: &str) -> Self {
        self.items.push(SelectItem::Column {
            column: ColumnRef::new(column),
            alias: None,
        });
        self
    }

    pub fn columns<S: AsRef<str>>(mut self, columns: &[S]) -> Self {
        for column in columns {
            self = self.column(column.as_ref());
        }
        self
    }

    pub fn item(mut self, item: SelectItem) -> Self {
        self.items.push(item);
        self
    }

    pub fn left_join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.filter.push(predicate);
        self
    }

    pub fn filters(mut self, predicates: impl IntoIterator<Item = Predicate>) -> Self {
        self.filter.extend(predicates);
        self
    }

    pub fn order_by(mut self, column: ColumnRef, order: Order) -> Self {
        self.order_by.push((column, order));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// `INSERT INTO table (...) VALUES (...)`, optionally reporting the generated key
#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub table: String,
    pub values: Row,
    /// Key column whose generated value should be returned
    pub returning: Option<String>,
}

/// `UPDATE table SET ... WHERE ...`
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    pub table: String,
    pub set: Row,
    pub filter: Vec<Predicate>,
}

/// `DELETE FROM table WHERE ...`
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStatement {
    pub table: String,
    pub filter: Vec<Predicate>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_criteria_null_means_is_null() {
        let criteria = Criteria::new().eq("status", "active").is_null("deleted_at");
        let predicates = criteria.to_predicates();
        assert_eq!(predicates.len(), 2);
        assert_eq!(
            predicates[0],
            Predicate::Eq(ColumnRef::new("status"), json!("active"))
        );
        assert_eq!(predicates[1], Predicate::IsNull(ColumnRef::new("deleted_at")));
    }

    #[test]
    fn test_criteria_set_replaces_in_place() {
        let mut criteria = Criteria::new().eq("a", 1).eq("b", 2);
        criteria.set("a", json!(3));
        let pairs: Vec<(&str, &Value)> = criteria.iter().collect();
        assert_eq!(pairs, vec![("a", &json!(3)), ("b", &json!(2))]);
        assert_eq!(criteria.remove("b"), Some(json!(2)));
        assert_eq!(criteria.len(), 1);
    }

    #[test]
    fn test_predicate_qualify_keeps_existing_table() {
        let p = Predicate::ColumnsEq(ColumnRef::qualified("posts", "user_id"), ColumnRef::new("id"))
            .qualify("users");
        assert_eq!(
            p,
            Predicate::ColumnsEq(
                ColumnRef::qualified("posts", "user_id"),
                ColumnRef::qualified("users", "id")
            )
        );
    }

    #[test]
    fn test_criteria_from_array() {
        let criteria = Criteria::from([("user_id", json!(1)), ("title", Value::Null)]);
        assert_eq!(criteria.get("user_id"), Some(&json!(1)));
        assert!(matches!(criteria.to_predicates()[1], Predicate::IsNull(_)));
    }
}
