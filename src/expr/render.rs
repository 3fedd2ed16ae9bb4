use super::{Operand, SqlExpr, SqlOperator};
use crate::types::RowValues;

/// Parameterized SQL text and its positional parameters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Rendered {
    pub sql: String,
    pub params: Vec<RowValues>,
}

impl SqlExpr {
    /// Render to SQL text and parameters.
    #[must_use]
    pub fn render(&self) -> Rendered {
        let mut out = Rendered::default();
        self.render_into(&mut out.sql, &mut out.params);
        out
    }

    pub(crate) fn render_into(&self, sql: &mut String, params: &mut Vec<RowValues>) {
        let wrap = !matches!(self.op, SqlOperator::Assign | SqlOperator::Root);
        if wrap {
            sql.push('(');
        }
        self.render_left(sql, params);
        sql.push_str(self.op.infix());
        self.render_right(sql, params);
        if wrap {
            sql.push(')');
        }
    }

    pub(crate) fn render_left(&self, sql: &mut String, params: &mut Vec<RowValues>) {
        match (&self.op, &self.left) {
            (SqlOperator::Not, _) => {}
            (SqlOperator::Assign, Operand::Field(field)) => sql.push_str(&field.quoted_name()),
            (_, operand) => render_operand(operand, sql, params),
        }
    }

    pub(crate) fn render_right(&self, sql: &mut String, params: &mut Vec<RowValues>) {
        match (&self.op, &self.right) {
            (SqlOperator::Custom | SqlOperator::Root, Operand::Values(values)) => {
                params.extend(values.iter().cloned());
            }
            (_, operand) => render_operand(operand, sql, params),
        }
    }
}

fn render_operand(operand: &Operand, sql: &mut String, params: &mut Vec<RowValues>) {
    match operand {
        Operand::Empty => {}
        Operand::Field(field) => sql.push_str(&field.to_string()),
        Operand::Expr(expr) => expr.render_into(sql, params),
        Operand::Raw(text) => sql.push_str(text),
        Operand::Value(value) => {
            sql.push('?');
            params.push(value.clone());
        }
        Operand::Values(values) => {
            sql.push('(');
            for (i, value) in values.iter().enumerate() {
                if i > 0 {
                    sql.push(',');
                }
                sql.push('?');
                params.push(value.clone());
            }
            sql.push(')');
        }
    }
}
