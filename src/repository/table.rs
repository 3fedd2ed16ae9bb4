use crate::entity::{IdStrategy, Record, SqlEntity};
use crate::error::SqlAccessError;
use crate::expr::{SqlExpr, SqlField, eq, in_list};
use crate::query_builder::{BuildError, Deleter, Inserter, Selector, Updater};
use crate::results::CustomDbRow;
use crate::types::{EntityId, RowValues};

use super::{Executor, Repository};

const DEFAULT_PAGE_SIZE: i64 = 25;

/// Offset/limit window for [`TableAccess::find_many_paginated`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: i64,
    pub limit: i64,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    #[must_use]
    pub fn new(offset: i64, limit: i64) -> Self {
        Self { offset, limit }
    }
}

/// One page of rows with its position among all pages.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub slice: Vec<T>,
    pub page_index: i64,
    pub page_count: i64,
}

/// Access to one entity table through a [`Repository`].
///
/// Lookups by id go through a data loader registered in the executor's request cache, so
/// concurrent `find_one_by_id` calls become one `IN (...)` query. Every write invalidates the
/// table's cache entries before it returns.
pub struct TableAccess<'a, E: Executor + ?Sized, T> {
    repo: Repository<'a, E>,
    entity: &'a SqlEntity<T>,
}

impl<'a, E: Executor + ?Sized, T> TableAccess<'a, E, T> {
    pub(crate) fn new(repo: Repository<'a, E>, entity: &'a SqlEntity<T>) -> Self {
        Self { repo, entity }
    }

    #[must_use]
    pub fn entity(&self) -> &'a SqlEntity<T> {
        self.entity
    }

    fn table(&self) -> &'a str {
        self.entity.table()
    }

    fn id_field(&self) -> SqlField {
        SqlField::with_source(self.table(), "id")
    }

    /// `SELECT "table".* FROM "table"`, ready for further filters.
    #[must_use]
    pub fn select(&self) -> Selector {
        Selector::new().select_entity(self.entity).from_entity(self.entity)
    }

    fn coerce_all(&self, rows: &[CustomDbRow]) -> Result<Vec<T>, SqlAccessError> {
        rows.iter().map(|row| self.entity.coerce(row)).collect()
    }

    /// Number of rows matching `condition`, memoized until the table changes.
    ///
    /// # Errors
    /// Returns build or executor errors.
    pub async fn count(
        &self,
        condition: impl Into<Option<SqlExpr>>,
    ) -> Result<i64, SqlAccessError> {
        let statement = Selector::new()
            .select(["count(*)"])
            .from_entity(self.entity)
            .filter(condition)
            .build()?;
        let key = format!("count:{}:{:?}", statement.sql, statement.params);
        let cache = self.repo.cache();
        if let Some(value) = cache.memoized(&key) {
            return Ok(value.as_int().copied().unwrap_or(0));
        }

        let epoch = cache.epoch();
        let value = self
            .repo
            .run(statement)
            .await?
            .first_value()
            .cloned()
            .unwrap_or(RowValues::Int(0));
        let count = value.as_int().copied().unwrap_or(0);
        cache.memoize(&[self.table()], &key, value, epoch);
        Ok(count)
    }

    /// Id of the first row matching `condition`.
    ///
    /// # Errors
    /// Returns build or executor errors.
    pub async fn find_id(
        &self,
        condition: impl Into<Option<SqlExpr>>,
    ) -> Result<Option<EntityId>, SqlAccessError> {
        let selector = Selector::new()
            .select([self.id_field()])
            .from_entity(self.entity)
            .filter(condition);
        let value = self.repo.find_first_value(&selector).await?;
        Ok(value.as_ref().and_then(EntityId::from_value))
    }

    /// # Errors
    /// Returns build, executor or coercion errors.
    pub async fn find_many(
        &self,
        condition: impl Into<Option<SqlExpr>>,
    ) -> Result<Vec<T>, SqlAccessError> {
        let rows = self.repo.find_many(&self.select().filter(condition)).await?;
        self.coerce_all(&rows)
    }

    /// # Errors
    /// Returns build, executor or coercion errors.
    pub async fn find_one(
        &self,
        condition: impl Into<Option<SqlExpr>>,
    ) -> Result<Option<T>, SqlAccessError> {
        self.repo
            .find_one(&self.select().filter(condition))
            .await?
            .map(|row| self.entity.coerce(&row))
            .transpose()
    }

    /// Rows for `ids`, in the order of their first occurrence. Unknown ids are skipped.
    ///
    /// # Errors
    /// Returns build, executor or coercion errors.
    pub async fn find_many_by_id(&self, ids: &[EntityId]) -> Result<Vec<T>, SqlAccessError> {
        let found = self.load_rows(ids).await?;
        let mut seen = std::collections::HashSet::with_capacity(ids.len());
        ids.iter()
            .filter(|id| seen.insert(*id))
            .filter_map(|id| found.get(id))
            .map(|row| self.entity.coerce(row))
            .collect()
    }

    /// # Errors
    /// Returns build, executor or coercion errors.
    pub async fn find_one_by_id(
        &self,
        id: impl Into<EntityId>,
    ) -> Result<Option<T>, SqlAccessError> {
        let id = id.into();
        let mut found = self.load_rows(std::slice::from_ref(&id)).await?;
        found.remove(&id).map(|row| self.entity.coerce(&row)).transpose()
    }

    async fn load_rows(
        &self,
        ids: &[EntityId],
    ) -> Result<std::collections::HashMap<EntityId, CustomDbRow>, SqlAccessError> {
        let loader = self
            .repo
            .cache()
            .loader::<EntityId, CustomDbRow>(&format!("{}:id", self.table()), &[self.table()]);
        let repo = self.repo;
        let base = self.select();
        let id_field = self.id_field();
        loader
            .load_many(ids, |keys| {
                let selector = base.clone().filter(in_list(id_field.clone(), keys.iter()));
                async move {
                    let rows = repo.find_many(&selector).await?;
                    Ok(rows
                        .into_iter()
                        .filter_map(|row| {
                            let id = row.get("id").and_then(EntityId::from_value)?;
                            Some((id, row))
                        })
                        .collect())
                }
            })
            .await
    }

    /// # Errors
    /// Returns build or executor errors.
    pub async fn exists(
        &self,
        condition: impl Into<Option<SqlExpr>>,
    ) -> Result<bool, SqlAccessError> {
        let selector = Selector::new()
            .select(["1"])
            .from_entity(self.entity)
            .filter(condition);
        self.repo.exists(&selector).await
    }

    /// # Errors
    /// Returns build or executor errors.
    pub async fn exists_by_id(&self, id: impl Into<EntityId>) -> Result<bool, SqlAccessError> {
        let id = id.into();
        Ok(self.load_rows(std::slice::from_ref(&id)).await?.contains_key(&id))
    }

    /// Insert or merge `record` by id and return the stored row.
    ///
    /// Keys starting with `_` are ignored. A missing or NULL `id` is replaced by a generated one,
    /// or left to SQLite for entities built with [`SqlEntity::with_rowid_ids`]. An existing id
    /// updates every other given column and leaves the rest of the row alone.
    ///
    /// # Errors
    /// Returns [`BuildError::UnknownColumn`] for keys the entity does not declare, otherwise
    /// executor or coercion errors.
    pub async fn save(&self, record: &Record) -> Result<T, SqlAccessError> {
        let mut values = Record::with_capacity(record.len() + 1);
        for (column, value) in record {
            if column.starts_with('_') {
                continue;
            }
            if !self.entity.has_column(column) {
                return Err(BuildError::UnknownColumn {
                    table: self.table().to_owned(),
                    column: column.clone(),
                }
                .into());
            }
            values.insert(column.clone(), value.clone());
        }

        let id = match values.get("id").and_then(EntityId::from_value) {
            Some(id) => {
                let statement = Inserter::new()
                    .into_entity(self.entity)
                    .set_record(&values)
                    .on_conflict(["id"])
                    .do_merge()
                    .build()?;
                self.repo.run(statement).await?;
                id
            }
            None if self.entity.id_strategy() == IdStrategy::Rowid => {
                values.shift_remove("id");
                let statement = Inserter::new()
                    .into_entity(self.entity)
                    .set_record(&values)
                    .returning(["id"])
                    .build()?;
                let inserted = self.repo.run(statement).await?;
                inserted
                    .first_value()
                    .and_then(EntityId::from_value)
                    .ok_or_else(|| {
                        SqlAccessError::ExecutionError(format!(
                            "insert into {} returned no id",
                            self.table()
                        ))
                    })?
            }
            None => {
                let id = EntityId::generate();
                values.insert("id".to_owned(), RowValues::from(&id));
                values.move_index(values.len() - 1, 0);
                let statement = Inserter::new()
                    .into_entity(self.entity)
                    .set_record(&values)
                    .on_conflict(["id"])
                    .do_merge()
                    .build()?;
                self.repo.run(statement).await?;
                id
            }
        };

        self.find_one_by_id(id.clone()).await?.ok_or_else(|| {
            SqlAccessError::ExecutionError(format!(
                "row {id} of {} vanished after save",
                self.table()
            ))
        })
    }

    /// [`save`](Self::save) each record in turn.
    ///
    /// # Errors
    /// Stops at the first failing record.
    pub async fn save_many(&self, records: &[Record]) -> Result<Vec<T>, SqlAccessError> {
        let mut saved = Vec::with_capacity(records.len());
        for record in records {
            saved.push(self.save(record).await?);
        }
        Ok(saved)
    }

    /// Delete rows matching `condition`; returns the deleted count.
    ///
    /// # Errors
    /// Returns build or executor errors.
    pub async fn remove_many(
        &self,
        condition: impl Into<Option<SqlExpr>>,
    ) -> Result<usize, SqlAccessError> {
        let statement = Deleter::new().from(self.table()).filter(condition).build()?;
        Ok(self.repo.run(statement).await?.rows_affected)
    }

    /// # Errors
    /// Returns build or executor errors.
    pub async fn remove_many_by_id(&self, ids: &[EntityId]) -> Result<usize, SqlAccessError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.remove_many(in_list(SqlField::new("id"), ids.iter())).await
    }

    /// # Errors
    /// Returns build or executor errors.
    pub async fn remove_one_by_id(&self, id: impl Into<EntityId>) -> Result<usize, SqlAccessError> {
        self.remove_many(eq(SqlField::new("id"), RowValues::from(id.into()))).await
    }

    /// Delete the rows whose ids appear in `records`. Records without an id are skipped.
    ///
    /// # Errors
    /// Returns build or executor errors.
    pub async fn remove(&self, records: &[Record]) -> Result<usize, SqlAccessError> {
        self.remove_many_by_id(&record_ids(records)).await
    }

    fn flag_field(&self, field: &str) -> Result<SqlField, BuildError> {
        if self.entity.has_column(field) {
            Ok(SqlField::new(field))
        } else {
            Err(BuildError::UnknownColumn {
                table: self.table().to_owned(),
                column: field.to_owned(),
            })
        }
    }

    /// Set the boolean column `field` to true on rows matching `condition`.
    ///
    /// # Errors
    /// Returns [`BuildError::UnknownColumn`] for an undeclared field, otherwise executor errors.
    pub async fn enable_many(
        &self,
        field: &str,
        condition: impl Into<Option<SqlExpr>>,
    ) -> Result<usize, SqlAccessError> {
        let statement = Updater::new()
            .table(self.table())
            .set(self.flag_field(field)?, true)
            .filter(condition)
            .build()?;
        Ok(self.repo.run(statement).await?.rows_affected)
    }

    /// # Errors
    /// See [`enable_many`](Self::enable_many).
    pub async fn enable_many_by_id(
        &self,
        field: &str,
        ids: &[EntityId],
    ) -> Result<usize, SqlAccessError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.enable_many(field, in_list(SqlField::new("id"), ids.iter())).await
    }

    /// # Errors
    /// See [`enable_many`](Self::enable_many).
    pub async fn enable_one_by_id(
        &self,
        field: &str,
        id: impl Into<EntityId>,
    ) -> Result<usize, SqlAccessError> {
        self.enable_many(field, eq(SqlField::new("id"), RowValues::from(id.into()))).await
    }

    /// # Errors
    /// See [`enable_many`](Self::enable_many).
    pub async fn enable(&self, field: &str, records: &[Record]) -> Result<usize, SqlAccessError> {
        self.enable_many_by_id(field, &record_ids(records)).await
    }

    /// Rows of `selector` in the window `page`, plus the page position.
    ///
    /// `selector` is usually built from [`select`](Self::select). A non-positive limit falls back
    /// to 25.
    ///
    /// # Errors
    /// Returns build, executor or coercion errors.
    pub async fn find_many_paginated(
        &self,
        selector: Selector,
        page: PageRequest,
    ) -> Result<Page<T>, SqlAccessError> {
        let limit = if page.limit > 0 { page.limit } else { DEFAULT_PAGE_SIZE };
        let offset = page.offset.max(0);

        let total = self.repo.count(&selector).await?;
        let rows = self
            .repo
            .find_many(&selector.limit(limit).offset(offset))
            .await?;

        Ok(Page {
            slice: self.coerce_all(&rows)?,
            page_index: offset / limit,
            page_count: (total + limit - 1) / limit,
        })
    }
}

fn record_ids(records: &[Record]) -> Vec<EntityId> {
    records
        .iter()
        .filter_map(|record| record.get("id").and_then(EntityId::from_value))
        .collect()
}
