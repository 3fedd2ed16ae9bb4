use super::script::{Statement, create_delete_script, create_insert_script, create_update_script};
use super::{BuildError, BuilderState, Selection, UpsertMode};
use crate::entity::{Record, SqlEntity};
use crate::expr::{Operand, SqlExpr, SqlField, assign};

/// INSERT builder with optional `ON CONFLICT` handling.
#[derive(Debug, Clone, Default)]
pub struct Inserter {
    pub(crate) state: BuilderState,
}

impl Inserter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn into(mut self, table: &str) -> Self {
        self.state.table = Some(Selection::table(table));
        self
    }

    #[must_use]
    pub fn into_entity<T>(self, entity: &SqlEntity<T>) -> Self {
        self.into(entity.table())
    }

    /// Assign a value (or expression) to a column.
    #[must_use]
    pub fn set(mut self, field: impl Into<SqlField>, value: impl Into<Operand>) -> Self {
        self.state.assignments.push(assign(field, value));
        self
    }

    /// Add a custom assignment. It is ignored by the VALUES list and written verbatim into the
    /// `DO UPDATE SET` clause of a merge.
    #[must_use]
    pub fn set_expr(mut self, assignment: impl Into<Option<SqlExpr>>) -> Self {
        if let Some(assignment) = assignment.into() {
            self.state.assignments.push(assignment);
        }
        self
    }

    /// Assign every entry of `record`.
    #[must_use]
    pub fn set_record(mut self, record: &Record) -> Self {
        for (column, value) in record {
            self.state
                .assignments
                .push(assign(SqlField::new(column.as_str()), value.clone()));
        }
        self
    }

    /// Start an `ON CONFLICT (keys)` clause.
    #[must_use]
    pub fn on_conflict<F: Into<SqlField>>(
        mut self,
        keys: impl IntoIterator<Item = F>,
    ) -> OnConflict {
        self.state.conflict_keys = keys.into_iter().map(Into::into).collect();
        OnConflict { inserter: self }
    }

    /// Return the given columns of the inserted (or merged) row.
    #[must_use]
    pub fn returning<F: Into<SqlField>>(mut self, fields: impl IntoIterator<Item = F>) -> Self {
        self.state.returning.extend(fields.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn state(&self) -> &BuilderState {
        &self.state
    }

    /// Generate the INSERT statement.
    ///
    /// # Errors
    /// Returns [`BuildError`] when no table is set or an assignment has an unsupported shape.
    pub fn build(&self) -> Result<Statement, BuildError> {
        create_insert_script(&self.state)
    }
}

/// Conflict resolution for [`Inserter::on_conflict`].
#[derive(Debug)]
pub struct OnConflict {
    inserter: Inserter,
}

impl OnConflict {
    #[must_use]
    pub fn do_nothing(mut self) -> Inserter {
        self.inserter.state.upsert = UpsertMode::Nothing;
        self.inserter
    }

    /// Update every non-key column from the conflicting row (`col = EXCLUDED.col`).
    #[must_use]
    pub fn do_merge(mut self) -> Inserter {
        self.inserter.state.upsert = UpsertMode::Merge;
        self.inserter
    }
}

/// UPDATE builder.
#[derive(Debug, Clone, Default)]
pub struct Updater {
    pub(crate) state: BuilderState,
}

impl Updater {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn table(mut self, table: &str) -> Self {
        self.state.table = Some(Selection::table(table));
        self
    }

    #[must_use]
    pub fn table_as(mut self, table: &str, alias: &str) -> Self {
        self.state.table = Some(Selection::table(table).aliased(alias));
        self
    }

    #[must_use]
    pub fn set(mut self, field: impl Into<SqlField>, value: impl Into<Operand>) -> Self {
        self.state.assignments.push(assign(field, value));
        self
    }

    #[must_use]
    pub fn set_expr(mut self, assignment: impl Into<Option<SqlExpr>>) -> Self {
        if let Some(assignment) = assignment.into() {
            self.state.assignments.push(assignment);
        }
        self
    }

    #[must_use]
    pub fn filter(mut self, condition: impl Into<Option<SqlExpr>>) -> Self {
        self.state.push_condition(condition);
        self
    }

    #[must_use]
    pub fn state(&self) -> &BuilderState {
        &self.state
    }

    /// Generate the UPDATE statement.
    ///
    /// # Errors
    /// Returns [`BuildError`] when the table or the assignments are missing.
    pub fn build(&self) -> Result<Statement, BuildError> {
        create_update_script(&self.state)
    }
}

/// DELETE builder.
#[derive(Debug, Clone, Default)]
pub struct Deleter {
    pub(crate) state: BuilderState,
}

impl Deleter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from(mut self, table: &str) -> Self {
        self.state.table = Some(Selection::table(table));
        self
    }

    #[must_use]
    pub fn filter(mut self, condition: impl Into<Option<SqlExpr>>) -> Self {
        self.state.push_condition(condition);
        self
    }

    #[must_use]
    pub fn state(&self) -> &BuilderState {
        &self.state
    }

    /// Generate the DELETE statement.
    ///
    /// # Errors
    /// Returns [`BuildError::MissingTable`] when no table is set.
    pub fn build(&self) -> Result<Statement, BuildError> {
        create_delete_script(&self.state)
    }
}
