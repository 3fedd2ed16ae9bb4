use rusqlite::types::Value;
use rusqlite::{Statement, ToSql};

use crate::types::RowValues;

/// Convert a driver value read from a row.
#[must_use]
pub fn value_from_sqlite(value: Value) -> RowValues {
    match value {
        Value::Null => RowValues::Null,
        Value::Integer(i) => RowValues::Int(i),
        Value::Real(f) => RowValues::Float(f),
        Value::Text(s) => RowValues::Text(s),
        Value::Blob(b) => RowValues::Blob(b),
    }
}

/// Run a row-returning statement and collect its rows and column names.
///
/// # Errors
/// Returns the driver error if execution or value extraction fails.
pub fn collect_rows(
    stmt: &mut Statement<'_>,
    params: &[Value],
) -> Result<(Vec<Vec<RowValues>>, Vec<String>), rusqlite::Error> {
    let param_refs: Vec<&dyn ToSql> = params.iter().map(|v| v as &dyn ToSql).collect();
    let column_names: Vec<String> = stmt
        .column_names()
        .iter()
        .map(std::string::ToString::to_string)
        .collect();
    let col_count = column_names.len();

    let mut rows = Vec::new();
    let mut rows_iter = stmt.query(&param_refs[..])?;
    while let Some(row) = rows_iter.next()? {
        let mut row_values = Vec::with_capacity(col_count);
        for i in 0..col_count {
            row_values.push(value_from_sqlite(row.get(i)?));
        }
        rows.push(row_values);
    }

    Ok((rows, column_names))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::Params;

    #[test]
    fn collects_typed_rows() {
        let conn = rusqlite::Connection::open_in_memory().expect("open");
        let mut stmt = conn
            .prepare("SELECT ? AS n, 1.5 AS f, 'x' AS t, NULL AS z, x'00ff' AS b")
            .expect("prepare");
        let params = Params::convert(&[RowValues::Bool(true)]);
        let (rows, columns) = collect_rows(&mut stmt, &params.0).expect("rows");
        assert_eq!(columns, vec!["n", "f", "t", "z", "b"]);
        assert_eq!(
            rows,
            vec![vec![
                RowValues::Int(1),
                RowValues::Float(1.5),
                RowValues::Text("x".into()),
                RowValues::Null,
                RowValues::Blob(vec![0, 255]),
            ]]
        );
    }
}
