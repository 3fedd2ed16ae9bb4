//! Fluent statement builders.
//!
//! Builders accumulate expression fragments into a [`BuilderState`] and hand it to the pure
//! script generators in [`script`]. They never touch a connection; running the generated
//! [`Statement`] is up to an executor. Optional inputs (`None`) are no-ops, so conditional
//! filters compose without branching:
//! ```rust
//! use sqlite_access::prelude::*;
//!
//! let name: Option<&str> = None;
//! let stmt = Selector::new()
//!     .select(["id", "name"])
//!     .from("categories")
//!     .filter(name.map(|n| eq(SqlField::new("name"), n)))
//!     .filter(gt(SqlField::new("rank"), 2))
//!     .limit(10)
//!     .build()?;
//! assert_eq!(stmt.params.len(), 2);
//! # Ok::<(), BuildError>(())
//! ```

mod dml;
pub mod script;
mod select;

use std::fmt;

use thiserror::Error;

pub use dml::{Deleter, Inserter, OnConflict, Updater};
pub use script::Statement;
pub use select::{JoinBuilder, Selector};

use crate::expr::{Operand, SqlExpr, SqlField, quote_identifier};
use crate::types::RowValues;

/// Malformed builder state, detected when the statement is generated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("{statement} statement has no target table")]
    MissingTable { statement: &'static str },

    #[error("UPDATE statement has no assignments")]
    EmptyAssignments,

    #[error("upsert requires at least one column assignment")]
    EmptyUpsert,

    #[error("table {table} has no column {column}")]
    UnknownColumn { table: String, column: String },

    #[error("generated SQL has {placeholders} placeholders but {params} parameters")]
    PlaceholderMismatch { placeholders: usize, params: usize },

    #[error("unsupported assignment: {0}")]
    UnsupportedAssignment(String),
}

/// A selected column, table or sub-expression with an optional alias.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// Plain name; quoted when it is a simple identifier, verbatim otherwise (`*`, `count(*)`).
    Name(String),
    Field(SqlField),
    Expr(SqlExpr),
    Aliased(Box<Selection>, String),
}

impl Selection {
    /// A table name; always rendered as a quoted identifier.
    #[must_use]
    pub fn table(name: &str) -> Self {
        Selection::Field(SqlField::new(name))
    }

    #[must_use]
    pub fn aliased(self, alias: impl Into<String>) -> Self {
        Selection::Aliased(Box::new(self), alias.into())
    }

    #[must_use]
    pub fn alias(&self) -> Option<&str> {
        match self {
            Selection::Aliased(_, alias) => Some(alias),
            _ => None,
        }
    }

    pub(crate) fn render_into(&self, sql: &mut String, params: &mut Vec<RowValues>) {
        match self {
            Selection::Name(name) if is_simple_identifier(name) => {
                sql.push_str(&quote_identifier(name));
            }
            Selection::Name(name) => sql.push_str(name),
            Selection::Field(field) => sql.push_str(&field.to_string()),
            Selection::Expr(expr) => expr.render_into(sql, params),
            Selection::Aliased(inner, alias) => {
                inner.render_into(sql, params);
                sql.push_str(" AS ");
                sql.push_str(&quote_identifier(alias));
            }
        }
    }
}

fn is_simple_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl From<&str> for Selection {
    fn from(name: &str) -> Self {
        Selection::Name(name.to_owned())
    }
}

impl From<String> for Selection {
    fn from(name: String) -> Self {
        Selection::Name(name)
    }
}

impl From<SqlField> for Selection {
    fn from(field: SqlField) -> Self {
        Selection::Field(field)
    }
}

impl From<&SqlField> for Selection {
    fn from(field: &SqlField) -> Self {
        Selection::Field(field.clone())
    }
}

impl From<SqlExpr> for Selection {
    fn from(expr: SqlExpr) -> Self {
        Selection::Expr(expr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    Inner,
    Left,
    Cross,
}

impl fmt::Display for JoinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JoinMode::Inner => "INNER JOIN",
            JoinMode::Left => "LEFT JOIN",
            JoinMode::Cross => "CROSS JOIN",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinClause {
    pub table: Selection,
    pub condition: Option<SqlExpr>,
    pub mode: Option<JoinMode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nulls {
    First,
    Last,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderClause {
    /// A field or an expression; values are not allowed here.
    pub target: Operand,
    pub direction: Option<Direction>,
    pub nulls: Option<Nulls>,
}

/// Something that can be ordered by: a column or an expression.
pub struct OrderTarget(Operand);

impl From<&str> for OrderTarget {
    fn from(path: &str) -> Self {
        OrderTarget(Operand::Field(SqlField::parse(path)))
    }
}

impl From<SqlField> for OrderTarget {
    fn from(field: SqlField) -> Self {
        OrderTarget(Operand::Field(field))
    }
}

impl From<&SqlField> for OrderTarget {
    fn from(field: &SqlField) -> Self {
        OrderTarget(Operand::Field(field.clone()))
    }
}

impl From<SqlExpr> for OrderTarget {
    fn from(expr: SqlExpr) -> Self {
        OrderTarget(Operand::from(expr))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpsertMode {
    #[default]
    Disabled,
    Nothing,
    Merge,
}

/// Accumulated builder state; read-only once passed to a script generator.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BuilderState {
    pub table: Option<Selection>,
    pub fields: Vec<Selection>,
    pub joins: Vec<JoinClause>,
    pub assignments: Vec<SqlExpr>,
    pub conditions: Vec<SqlExpr>,
    pub groupings: Vec<SqlField>,
    pub grouping_conditions: Vec<SqlExpr>,
    pub ordering: Vec<OrderClause>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub upsert: UpsertMode,
    pub conflict_keys: Vec<SqlField>,
    pub returning: Vec<SqlField>,
    pub distinct: bool,
    /// First error recorded while composing (e.g. a failing sub-query); reported on build.
    pub(crate) deferred_error: Option<BuildError>,
}

impl BuilderState {
    pub(crate) fn defer(&mut self, err: BuildError) {
        if self.deferred_error.is_none() {
            self.deferred_error = Some(err);
        }
    }

    pub(crate) fn push_condition(&mut self, condition: impl Into<Option<SqlExpr>>) {
        if let Some(condition) = condition.into() {
            self.conditions.push(condition);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_quotes_identifiers_and_tables() {
        let render = |s: Selection| {
            let mut sql = String::new();
            s.render_into(&mut sql, &mut Vec::new());
            sql
        };
        assert_eq!(render("name".into()), "\"name\"");
        assert_eq!(render("count(*)".into()), "count(*)");
        assert_eq!(render("c.*".into()), "c.*");
        assert_eq!(render(Selection::from("id").aliased("key")), "\"id\" AS \"key\"");
        assert_eq!(render(Selection::table("trivia-categories")), "\"trivia-categories\"");
        assert_eq!(render(Selection::table("my table").aliased("t")), "\"my table\" AS \"t\"");
    }
}
