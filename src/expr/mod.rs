//! Composable SQL expression tree.
//!
//! Expressions render to parameterized SQL text plus a positional parameter list. Parameters are
//! collected in the same left-to-right, depth-first order in which their `?` slots are written,
//! so the two can never drift apart:
//! ```rust
//! use sqlite_access::expr::{and, eq, gt, SqlField};
//!
//! let cond = and([
//!     eq(SqlField::new("name"), "Science"),
//!     gt(SqlField::parse("c.rank"), 3),
//! ])
//! .expect("two conditions");
//! let rendered = cond.render();
//! assert_eq!(rendered.sql, "((\"name\" = ?) AND (\"c\".\"rank\" > ?))");
//! assert_eq!(rendered.params.len(), 2);
//! ```

mod field;
mod render;

pub use field::{SqlField, quote_identifier};
pub use render::Rendered;

use crate::types::{EntityId, RowValues};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlOperator {
    And,
    Or,
    Not,
    Eq,
    Neq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    IsNull,
    IsNotNull,
    In,
    Assign,
    /// Raw SQL fragment with its own parameters, parenthesized.
    Custom,
    /// Raw SQL fragment rendered verbatim.
    Root,
}

impl SqlOperator {
    pub(crate) fn infix(self) -> &'static str {
        match self {
            SqlOperator::And => " AND ",
            SqlOperator::Or => " OR ",
            SqlOperator::Not => "NOT ",
            SqlOperator::Eq | SqlOperator::Assign => " = ",
            SqlOperator::Neq => " != ",
            SqlOperator::Lt => " < ",
            SqlOperator::LtEq => " <= ",
            SqlOperator::Gt => " > ",
            SqlOperator::GtEq => " >= ",
            SqlOperator::IsNull => " IS NULL",
            SqlOperator::IsNotNull => " IS NOT NULL",
            SqlOperator::In => " IN ",
            SqlOperator::Custom | SqlOperator::Root => "",
        }
    }
}

/// One side of an expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Empty,
    Field(SqlField),
    Expr(Box<SqlExpr>),
    Value(RowValues),
    Values(Vec<RowValues>),
    Raw(String),
}

impl Operand {
    fn is_null_value(&self) -> bool {
        matches!(self, Operand::Empty | Operand::Value(RowValues::Null))
    }
}

impl From<SqlField> for Operand {
    fn from(field: SqlField) -> Self {
        Operand::Field(field)
    }
}

impl From<&SqlField> for Operand {
    fn from(field: &SqlField) -> Self {
        Operand::Field(field.clone())
    }
}

impl From<SqlExpr> for Operand {
    fn from(expr: SqlExpr) -> Self {
        Operand::Expr(Box::new(expr))
    }
}

impl From<Vec<RowValues>> for Operand {
    fn from(values: Vec<RowValues>) -> Self {
        Operand::Values(values)
    }
}

impl From<&[EntityId]> for Operand {
    fn from(ids: &[EntityId]) -> Self {
        Operand::Values(ids.iter().map(RowValues::from).collect())
    }
}

impl<T: Into<RowValues>> From<Option<T>> for Operand {
    fn from(value: Option<T>) -> Self {
        Operand::Value(value.map_or(RowValues::Null, Into::into))
    }
}

macro_rules! value_operand {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Operand {
                fn from(value: $ty) -> Self {
                    Operand::Value(RowValues::from(value))
                }
            }
        )*
    };
}

value_operand!(RowValues, i64, i32, f64, bool, &str, String, EntityId, &EntityId);

/// A node of the expression tree: `left <op> right`.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlExpr {
    pub(crate) left: Operand,
    pub(crate) op: SqlOperator,
    pub(crate) right: Operand,
}

impl SqlExpr {
    #[must_use]
    pub fn new(left: impl Into<Operand>, op: SqlOperator, right: impl Into<Operand>) -> Self {
        Self {
            left: left.into(),
            op,
            right: right.into(),
        }
    }

    /// Raw fragment with its parameters; rendered inside parentheses.
    #[must_use]
    pub fn custom(sql: impl Into<String>, params: Vec<RowValues>) -> Self {
        Self {
            left: Operand::Raw(sql.into()),
            op: SqlOperator::Custom,
            right: Operand::Values(params),
        }
    }

    /// Raw fragment with its parameters; rendered as is.
    #[must_use]
    pub fn root(sql: impl Into<String>, params: Vec<RowValues>) -> Self {
        Self {
            left: Operand::Raw(sql.into()),
            op: SqlOperator::Root,
            right: Operand::Values(params),
        }
    }

    #[must_use]
    pub fn operator(&self) -> SqlOperator {
        self.op
    }

    #[must_use]
    pub fn left(&self) -> &Operand {
        &self.left
    }

    #[must_use]
    pub fn right(&self) -> &Operand {
        &self.right
    }

    /// The assigned column, for plain `Assign` nodes.
    #[must_use]
    pub fn assigned_field(&self) -> Option<&SqlField> {
        match (&self.op, &self.left) {
            (SqlOperator::Assign, Operand::Field(field)) => Some(field),
            _ => None,
        }
    }
}

/// Left fold of `conditions` with `AND`. `None` when empty.
pub fn and(conditions: impl IntoIterator<Item = SqlExpr>) -> Option<SqlExpr> {
    fold(conditions, SqlOperator::And)
}

/// Left fold of `conditions` with `OR`. `None` when empty.
pub fn or(conditions: impl IntoIterator<Item = SqlExpr>) -> Option<SqlExpr> {
    fold(conditions, SqlOperator::Or)
}

fn fold(conditions: impl IntoIterator<Item = SqlExpr>, op: SqlOperator) -> Option<SqlExpr> {
    conditions
        .into_iter()
        .reduce(|acc, next| SqlExpr::new(acc, op, next))
}

#[must_use]
pub fn not(operand: impl Into<Operand>) -> SqlExpr {
    SqlExpr::new(Operand::Empty, SqlOperator::Not, operand)
}

/// `left = right`, or `left IS NULL` when `right` is NULL.
#[must_use]
pub fn eq(left: impl Into<Operand>, right: impl Into<Operand>) -> SqlExpr {
    let right = right.into();
    if right.is_null_value() {
        is_null(left)
    } else {
        SqlExpr::new(left, SqlOperator::Eq, right)
    }
}

/// `left != right`, or `left IS NOT NULL` when `right` is NULL.
#[must_use]
pub fn neq(left: impl Into<Operand>, right: impl Into<Operand>) -> SqlExpr {
    let right = right.into();
    if right.is_null_value() {
        is_not_null(left)
    } else {
        SqlExpr::new(left, SqlOperator::Neq, right)
    }
}

#[must_use]
pub fn lt(left: impl Into<Operand>, right: impl Into<Operand>) -> SqlExpr {
    SqlExpr::new(left, SqlOperator::Lt, right)
}

#[must_use]
pub fn lt_eq(left: impl Into<Operand>, right: impl Into<Operand>) -> SqlExpr {
    SqlExpr::new(left, SqlOperator::LtEq, right)
}

#[must_use]
pub fn gt(left: impl Into<Operand>, right: impl Into<Operand>) -> SqlExpr {
    SqlExpr::new(left, SqlOperator::Gt, right)
}

#[must_use]
pub fn gt_eq(left: impl Into<Operand>, right: impl Into<Operand>) -> SqlExpr {
    SqlExpr::new(left, SqlOperator::GtEq, right)
}

#[must_use]
pub fn is_null(operand: impl Into<Operand>) -> SqlExpr {
    SqlExpr::new(operand, SqlOperator::IsNull, Operand::Empty)
}

#[must_use]
pub fn is_not_null(operand: impl Into<Operand>) -> SqlExpr {
    SqlExpr::new(operand, SqlOperator::IsNotNull, Operand::Empty)
}

/// `left IN (?, ?, ...)`.
#[must_use]
pub fn in_list<V: Into<RowValues>>(
    left: impl Into<Operand>,
    values: impl IntoIterator<Item = V>,
) -> SqlExpr {
    let values = values.into_iter().map(Into::into).collect::<Vec<_>>();
    SqlExpr::new(left, SqlOperator::In, Operand::Values(values))
}

/// `left IN (<sub-expression>)`.
#[must_use]
pub fn in_expr(left: impl Into<Operand>, sub: SqlExpr) -> SqlExpr {
    SqlExpr::new(left, SqlOperator::In, sub)
}

/// `"column" = value`, as used by INSERT/UPDATE.
#[must_use]
pub fn assign(field: impl Into<SqlField>, value: impl Into<Operand>) -> SqlExpr {
    SqlExpr::new(Operand::Field(field.into()), SqlOperator::Assign, value)
}

impl From<&str> for SqlField {
    fn from(path: &str) -> Self {
        SqlField::parse(path)
    }
}

impl From<&SqlField> for SqlField {
    fn from(field: &SqlField) -> Self {
        field.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f(name: &str) -> SqlField {
        SqlField::parse(name)
    }

    #[test]
    fn comparison_renders_parenthesized() {
        let r = eq(f("name"), "Science").render();
        assert_eq!(r.sql, "(\"name\" = ?)");
        assert_eq!(r.params, vec![RowValues::Text("Science".into())]);
    }

    #[test]
    fn null_comparisons_switch_operator() {
        assert_eq!(eq(f("a"), RowValues::Null).render().sql, "(\"a\" IS NULL)");
        assert_eq!(
            neq(f("a"), Option::<i64>::None).render().sql,
            "(\"a\" IS NOT NULL)"
        );
        assert!(eq(f("a"), RowValues::Null).render().params.is_empty());
    }

    #[test]
    fn and_or_are_left_folds() {
        let e = or([eq(f("a"), 1), eq(f("b"), 2), eq(f("c"), 3)]).expect("non-empty");
        let r = e.render();
        assert_eq!(
            r.sql,
            "(((\"a\" = ?) OR (\"b\" = ?)) OR (\"c\" = ?))"
        );
        assert_eq!(
            r.params,
            vec![RowValues::Int(1), RowValues::Int(2), RowValues::Int(3)]
        );
        assert!(and(Vec::new()).is_none());
    }

    #[test]
    fn in_list_and_not() {
        let r = not(in_list(f("t.id"), [1_i64, 2, 3])).render();
        assert_eq!(r.sql, "(NOT (\"t\".\"id\" IN (?,?,?)))");
        assert_eq!(r.params.len(), 3);
    }

    #[test]
    fn custom_keeps_its_parameters_in_place() {
        let e = and([
            eq(f("a"), 1),
            SqlExpr::custom("json_extract(data, '$.x') = ?", vec![RowValues::Int(2)]),
            eq(f("b"), 3),
        ])
        .expect("non-empty");
        let r = e.render();
        assert_eq!(
            r.sql,
            "(((\"a\" = ?) AND (json_extract(data, '$.x') = ?)) AND (\"b\" = ?))"
        );
        assert_eq!(
            r.params,
            vec![RowValues::Int(1), RowValues::Int(2), RowValues::Int(3)]
        );
    }

    #[test]
    fn field_to_field_comparison_has_no_params() {
        let r = eq(f("a.id"), f("b.a_id")).render();
        assert_eq!(r.sql, "(\"a\".\"id\" = \"b\".\"a_id\")");
        assert!(r.params.is_empty());
    }

    #[test]
    fn assign_renders_bare_column() {
        let r = assign(f("c.name"), "x").render();
        assert_eq!(r.sql, "\"name\" = ?");
    }

    #[test]
    fn rendering_is_deterministic() {
        let e = and([
            in_expr(
                f("id"),
                SqlExpr::custom("SELECT id FROM t WHERE v > ?", vec![RowValues::Int(5)]),
            ),
            lt_eq(f("x"), 1.5),
        ])
        .expect("non-empty");
        let first = e.render();
        let second = e.clone().render();
        assert_eq!(first, second);
        assert_eq!(
            first.sql,
            "((\"id\" IN (SELECT id FROM t WHERE v > ?)) AND (\"x\" <= ?))"
        );
        assert_eq!(
            crate::placeholders::count_placeholders(&first.sql),
            first.params.len()
        );
    }
}
