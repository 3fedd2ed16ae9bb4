use std::collections::HashMap;
use std::sync::Arc;

use super::row::{CustomDbRow, index_columns};
use crate::types::RowValues;

/// A result set from a database query
///
/// Column names and the name-to-index map are stored once and shared by every row.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    /// The rows returned by the query
    pub results: Vec<CustomDbRow>,
    /// Rows returned for queries, rows changed for DML
    pub rows_affected: usize,
    column_names: Option<Arc<Vec<String>>>,
    column_index: Option<Arc<HashMap<String, usize>>>,
}

impl ResultSet {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> ResultSet {
        ResultSet {
            results: Vec::with_capacity(capacity),
            ..ResultSet::default()
        }
    }

    /// Build a result set from the row/column lists carried by a worker reply.
    #[must_use]
    pub fn from_wire(rows: Vec<Vec<RowValues>>, columns: Vec<String>) -> ResultSet {
        let mut result_set = ResultSet::with_capacity(rows.len());
        result_set.set_column_names(Arc::new(columns));
        for row in rows {
            result_set.add_row_values(row);
        }
        result_set
    }

    /// Result of a statement that returned no rows.
    #[must_use]
    pub fn affected(rows_affected: usize) -> ResultSet {
        ResultSet {
            rows_affected,
            ..ResultSet::default()
        }
    }

    /// Set the column names for this result set (to be shared by all rows)
    pub fn set_column_names(&mut self, column_names: Arc<Vec<String>>) {
        self.column_index = Some(Arc::new(index_columns(&column_names)));
        self.column_names = Some(column_names);
    }

    #[must_use]
    pub fn get_column_names(&self) -> Option<&Arc<Vec<String>>> {
        self.column_names.as_ref()
    }

    /// Add a row to the result set. Ignored until column names are set.
    pub fn add_row_values(&mut self, row_values: Vec<RowValues>) {
        if let (Some(column_names), Some(column_index)) = (&self.column_names, &self.column_index)
        {
            self.results.push(CustomDbRow {
                column_names: column_names.clone(),
                rows: row_values,
                column_index: column_index.clone(),
            });
            self.rows_affected += 1;
        }
    }

    /// Add an already-built row
    pub fn add_row(&mut self, row: CustomDbRow) {
        if self.column_names.is_none() {
            self.column_names = Some(row.column_names.clone());
            self.column_index = Some(row.column_index.clone());
        }
        self.results.push(row);
        self.rows_affected += 1;
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// First column of the first row, if any.
    #[must_use]
    pub fn first_value(&self) -> Option<&RowValues> {
        self.results.first().and_then(|row| row.get_by_index(0))
    }

    /// Split back into the `(rows, columns)` lists used on the wire.
    #[must_use]
    pub fn into_wire(self) -> (Vec<Vec<RowValues>>, Vec<String>) {
        let columns = self
            .column_names
            .map(|names| names.as_ref().clone())
            .unwrap_or_default();
        let rows = self.results.into_iter().map(|row| row.rows).collect();
        (rows, columns)
    }
}

impl IntoIterator for ResultSet {
    type Item = CustomDbRow;
    type IntoIter = std::vec::IntoIter<CustomDbRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}
