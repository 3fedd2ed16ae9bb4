use std::fmt;

use indexmap::IndexMap;

use crate::error::SqlAccessError;
use crate::expr::SqlField;
use crate::query_builder::BuildError;
use crate::results::CustomDbRow;
use crate::types::RowValues;

/// Column name to value map, in insertion order. Used to save records.
pub type Record = IndexMap<String, RowValues>;

/// Converts a result row into a domain value.
pub type CoerceFn<T> = fn(&CustomDbRow) -> Result<T, SqlAccessError>;

/// How [`TableAccess::save`](crate::repository::TableAccess::save) fills in a missing `id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdStrategy {
    /// Generate a time-ordered text id before inserting.
    #[default]
    Generated,
    /// Leave the id out and let SQLite assign the rowid (`id INTEGER PRIMARY KEY`).
    Rowid,
}

/// Maps a domain type to its table and columns.
///
/// Built once per type and never mutated, typically in a `LazyLock` static:
/// ```rust
/// use std::sync::LazyLock;
/// use sqlite_access::prelude::*;
///
/// #[derive(Debug)]
/// struct Category {
///     id: String,
///     name: String,
/// }
///
/// static CATEGORY: LazyLock<SqlEntity<Category>> = LazyLock::new(|| {
///     SqlEntity::new("categories", ["id", "name"], |row| {
///         Ok(Category {
///             id: row.get("id").and_then(RowValues::as_text).unwrap_or_default().to_owned(),
///             name: row.get("name").and_then(RowValues::as_text).unwrap_or_default().to_owned(),
///         })
///     })
/// });
///
/// assert_eq!(CATEGORY.col("name").map(ToString::to_string).ok(), Some("\"name\"".to_owned()));
/// ```
pub struct SqlEntity<T> {
    table: String,
    columns: IndexMap<String, SqlField>,
    coerce: CoerceFn<T>,
    ids: IdStrategy,
}

impl<T> SqlEntity<T> {
    #[must_use]
    pub fn new<'a>(
        table: impl Into<String>,
        columns: impl IntoIterator<Item = &'a str>,
        coerce: CoerceFn<T>,
    ) -> Self {
        let columns = columns
            .into_iter()
            .map(|name| (name.to_owned(), SqlField::new(name)))
            .collect();
        Self {
            table: table.into(),
            columns,
            coerce,
            ids: IdStrategy::Generated,
        }
    }

    /// Use SQLite-assigned integer ids for new rows.
    #[must_use]
    pub fn with_rowid_ids(mut self) -> Self {
        self.ids = IdStrategy::Rowid;
        self
    }

    #[must_use]
    pub fn id_strategy(&self) -> IdStrategy {
        self.ids
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&SqlField> {
        self.columns.get(name)
    }

    /// Like [`field`](Self::field), but an unknown column is an error.
    ///
    /// # Errors
    /// Returns [`BuildError::UnknownColumn`] if `name` is not a column of this entity.
    pub fn col(&self, name: &str) -> Result<&SqlField, BuildError> {
        self.columns.get(name).ok_or_else(|| BuildError::UnknownColumn {
            table: self.table.clone(),
            column: name.to_owned(),
        })
    }

    pub fn all_columns(&self) -> impl Iterator<Item = &SqlField> {
        self.columns.values()
    }

    /// True when the column set is open, i.e. the entity was declared without columns.
    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.columns.is_empty()
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.is_dynamic() || self.columns.contains_key(name)
    }

    /// Convert a result row into `T`.
    ///
    /// # Errors
    /// Propagates the coercion function's error.
    pub fn coerce(&self, row: &CustomDbRow) -> Result<T, SqlAccessError> {
        (self.coerce)(row)
    }
}

impl SqlEntity<CustomDbRow> {
    /// Entity over an arbitrary table whose rows are returned as is.
    #[must_use]
    pub fn dynamic(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: IndexMap::new(),
            coerce: |row| Ok(row.clone()),
            ids: IdStrategy::Generated,
        }
    }
}

impl<T> fmt::Debug for SqlEntity<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlEntity")
            .field("table", &self.table)
            .field("columns", &self.columns.keys().collect::<Vec<_>>())
            .field("ids", &self.ids)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn columns_keep_declaration_order() {
        let entity = SqlEntity::dynamic("t");
        assert!(entity.has_column("anything"));

        let typed: SqlEntity<i64> = SqlEntity::new("t", ["b", "a", "c"], |_| Ok(0));
        let names: Vec<_> = typed.all_columns().map(SqlField::name).collect();
        assert_eq!(names, ["b", "a", "c"]);
        assert!(typed.col("missing").is_err());
        assert!(!typed.has_column("missing"));
    }
}
