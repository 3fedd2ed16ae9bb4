//! SQLite script generators.
//!
//! Each generator walks a [`BuilderState`] once, writing SQL text and collecting parameters in
//! the same pass, then verifies that the number of placeholders matches the parameters.

use super::{BuildError, BuilderState, Direction, Nulls, Selection, UpsertMode};
use crate::expr::{Operand, SqlExpr, SqlOperator};
use crate::placeholders::count_placeholders;
use crate::types::RowValues;

/// Generated SQL text with its positional parameters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<RowValues>,
}

impl Statement {
    pub(crate) fn checked(self) -> Result<Self, BuildError> {
        let placeholders = count_placeholders(&self.sql);
        if placeholders == self.params.len() {
            Ok(self)
        } else {
            Err(BuildError::PlaceholderMismatch {
                placeholders,
                params: self.params.len(),
            })
        }
    }
}

/// Generate a SELECT.
///
/// # Errors
/// Returns the first deferred composition error, or a placeholder mismatch.
pub fn create_select_script(data: &BuilderState) -> Result<Statement, BuildError> {
    if let Some(err) = &data.deferred_error {
        return Err(err.clone());
    }
    let mut out = Statement::default();
    let sql = &mut out.sql;
    let params = &mut out.params;

    sql.push_str("SELECT");
    if data.distinct {
        sql.push_str(" DISTINCT");
    }

    if data.fields.is_empty() {
        let star = match data.table.as_ref().and_then(Selection::alias) {
            Some(alias) => format!("{}.*", crate::expr::quote_identifier(alias)),
            None => "*".to_owned(),
        };
        sql.push_str("\n  ");
        sql.push_str(&star);
    }
    for (i, field) in data.fields.iter().enumerate() {
        sql.push_str(if i == 0 { "\n  " } else { ",\n  " });
        field.render_into(sql, params);
    }

    if let Some(table) = &data.table {
        sql.push_str("\nFROM ");
        table.render_into(sql, params);
    }

    for join in &data.joins {
        sql.push('\n');
        match join.mode {
            Some(mode) => sql.push_str(&mode.to_string()),
            None => sql.push_str("JOIN"),
        }
        sql.push(' ');
        join.table.render_into(sql, params);
        if let Some(condition) = &join.condition {
            sql.push_str(" ON ");
            condition.render_into(sql, params);
        }
    }

    write_conditions(sql, params, "WHERE", &data.conditions);

    for (i, grouping) in data.groupings.iter().enumerate() {
        sql.push_str(if i == 0 { "\nGROUP BY\n  " } else { ",\n  " });
        sql.push_str(&grouping.to_string());
    }

    write_conditions(sql, params, "HAVING", &data.grouping_conditions);

    for (i, order) in data.ordering.iter().enumerate() {
        sql.push_str(if i == 0 { "\nORDER BY\n  " } else { ",\n  " });
        match &order.target {
            Operand::Field(field) => sql.push_str(&field.to_string()),
            Operand::Expr(expr) => expr.render_into(sql, params),
            Operand::Raw(text) => sql.push_str(text),
            _ => {
                return Err(BuildError::UnsupportedAssignment(
                    "ORDER BY accepts only fields and expressions".into(),
                ));
            }
        }
        match order.direction {
            Some(Direction::Asc) => sql.push_str(" ASC"),
            Some(Direction::Desc) => sql.push_str(" DESC"),
            None => {}
        }
        match order.nulls {
            Some(Nulls::First) => sql.push_str(" NULLS FIRST"),
            Some(Nulls::Last) => sql.push_str(" NULLS LAST"),
            None => {}
        }
    }

    if data.limit.is_some() || data.offset.is_some() {
        sql.push_str("\nLIMIT ?");
        params.push(RowValues::Int(data.limit.unwrap_or(-1)));
    }
    if let Some(offset) = data.offset {
        sql.push_str("\nOFFSET ?");
        params.push(RowValues::Int(offset));
    }

    out.checked()
}

/// Generate an INSERT, including the `ON CONFLICT` clause for upserts.
///
/// # Errors
/// Returns [`BuildError::MissingTable`], [`BuildError::EmptyUpsert`] or
/// [`BuildError::UnsupportedAssignment`] for malformed state.
pub fn create_insert_script(data: &BuilderState) -> Result<Statement, BuildError> {
    if let Some(err) = &data.deferred_error {
        return Err(err.clone());
    }
    let table = data
        .table
        .as_ref()
        .ok_or(BuildError::MissingTable { statement: "INSERT" })?;

    let mut columns = Vec::new();
    let mut customs = Vec::new();
    for assignment in &data.assignments {
        match assignment.operator() {
            SqlOperator::Assign if assignment.assigned_field().is_some() => {
                columns.push(assignment);
            }
            SqlOperator::Custom | SqlOperator::Root => customs.push(assignment),
            other => {
                return Err(BuildError::UnsupportedAssignment(format!(
                    "{other:?} expression in INSERT"
                )));
            }
        }
    }

    let mut out = Statement::default();
    let sql = &mut out.sql;
    let params = &mut out.params;

    sql.push_str("INSERT INTO ");
    table.render_into(sql, params);

    if columns.is_empty() {
        if data.upsert != UpsertMode::Disabled {
            return Err(BuildError::EmptyUpsert);
        }
        sql.push_str(" DEFAULT VALUES");
        return finish_insert(out, data);
    }

    sql.push_str(" (");
    for (i, assignment) in columns.iter().enumerate() {
        sql.push_str(if i == 0 { "\n  " } else { ",\n  " });
        assignment.render_left(sql, params);
    }
    sql.push_str("\n) VALUES (");
    for (i, assignment) in columns.iter().enumerate() {
        sql.push_str(if i == 0 { "\n  " } else { ",\n  " });
        assignment.render_right(sql, params);
    }
    sql.push_str("\n)");

    if data.upsert == UpsertMode::Disabled {
        return finish_insert(out, data);
    }

    sql.push_str("\nON CONFLICT");
    if !data.conflict_keys.is_empty() {
        let keys = data
            .conflict_keys
            .iter()
            .map(crate::expr::SqlField::quoted_name)
            .collect::<Vec<_>>();
        sql.push_str(&format!(" ({})", keys.join(", ")));
    }
    sql.push_str(" DO");

    let merged: Vec<MergeItem<'_>> = match data.upsert {
        UpsertMode::Merge => {
            let is_key = |name: &str| data.conflict_keys.iter().any(|k| k.name() == name);
            columns
                .iter()
                .filter_map(|a| a.assigned_field())
                .filter(|field| !is_key(field.name()))
                .map(|field| MergeItem::Excluded(field.quoted_name()))
                .chain(customs.iter().map(|expr| MergeItem::Custom(expr)))
                .collect()
        }
        _ => Vec::new(),
    };

    if merged.is_empty() {
        sql.push_str(" NOTHING");
    } else {
        sql.push_str(" UPDATE\nSET");
        for (i, item) in merged.iter().enumerate() {
            sql.push_str(if i == 0 { "\n  " } else { ",\n  " });
            match item {
                MergeItem::Excluded(column) => {
                    sql.push_str(&format!("{column} = EXCLUDED.{column}"));
                }
                MergeItem::Custom(expr) => write_assignment(sql, params, expr),
            }
        }
    }

    finish_insert(out, data)
}

fn finish_insert(mut out: Statement, data: &BuilderState) -> Result<Statement, BuildError> {
    if !data.returning.is_empty() {
        let fields = data
            .returning
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        out.sql.push_str("\nRETURNING ");
        out.sql.push_str(&fields.join(", "));
    }
    out.checked()
}

enum MergeItem<'a> {
    Excluded(String),
    Custom(&'a SqlExpr),
}

/// Generate an UPDATE.
///
/// # Errors
/// Returns [`BuildError::MissingTable`] or [`BuildError::EmptyAssignments`].
pub fn create_update_script(data: &BuilderState) -> Result<Statement, BuildError> {
    if let Some(err) = &data.deferred_error {
        return Err(err.clone());
    }
    let table = data
        .table
        .as_ref()
        .ok_or(BuildError::MissingTable { statement: "UPDATE" })?;
    if data.assignments.is_empty() {
        return Err(BuildError::EmptyAssignments);
    }

    let mut out = Statement::default();
    let sql = &mut out.sql;
    let params = &mut out.params;

    sql.push_str("UPDATE ");
    table.render_into(sql, params);
    sql.push_str("\nSET");
    for (i, assignment) in data.assignments.iter().enumerate() {
        match assignment.operator() {
            SqlOperator::Assign | SqlOperator::Custom | SqlOperator::Root => {}
            other => {
                return Err(BuildError::UnsupportedAssignment(format!(
                    "{other:?} expression in UPDATE"
                )));
            }
        }
        sql.push_str(if i == 0 { "\n  " } else { ",\n  " });
        write_assignment(sql, params, assignment);
    }

    write_conditions(sql, params, "WHERE", &data.conditions);

    out.checked()
}

/// Generate a DELETE.
///
/// # Errors
/// Returns [`BuildError::MissingTable`] when no table is set.
pub fn create_delete_script(data: &BuilderState) -> Result<Statement, BuildError> {
    if let Some(err) = &data.deferred_error {
        return Err(err.clone());
    }
    let table = data
        .table
        .as_ref()
        .ok_or(BuildError::MissingTable { statement: "DELETE" })?;

    let mut out = Statement::default();
    out.sql.push_str("DELETE FROM ");
    table.render_into(&mut out.sql, &mut out.params);
    write_conditions(&mut out.sql, &mut out.params, "WHERE", &data.conditions);

    out.checked()
}

/// Assignments render without the outer parentheses a custom fragment normally gets.
fn write_assignment(sql: &mut String, params: &mut Vec<RowValues>, assignment: &SqlExpr) {
    match assignment.operator() {
        SqlOperator::Custom => {
            assignment.render_left(sql, params);
            assignment.render_right(sql, params);
        }
        _ => assignment.render_into(sql, params),
    }
}

fn write_conditions(
    sql: &mut String,
    params: &mut Vec<RowValues>,
    keyword: &str,
    conditions: &[SqlExpr],
) {
    for (i, condition) in conditions.iter().enumerate() {
        if i == 0 {
            sql.push('\n');
            sql.push_str(keyword);
            sql.push_str("\n  ");
        } else {
            sql.push_str(" AND\n  ");
        }
        condition.render_into(sql, params);
    }
}
