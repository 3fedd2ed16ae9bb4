//! Query API façade over any [`Executor`].
//!
//! [`Repository`] runs builder output and raw SQL; [`Repository::of`] narrows it to one entity
//! table with point lookups backed by the executor's request cache.

mod n2m;
mod table;

use async_trait::async_trait;

pub use n2m::{N2mLink, N2mLoader};
pub use table::{Page, PageRequest, TableAccess};

use crate::cache::RequestCache;
use crate::entity::SqlEntity;
use crate::error::SqlAccessError;
use crate::query_builder::{Selection, Selector, Statement};
use crate::results::{CustomDbRow, ResultSet};
use crate::types::RowValues;

/// Something that runs statements: the worker pool, a pinned transaction or a pooled connection.
///
/// Implementations publish (or, inside a transaction, buffer) the change event of every
/// mutation and clear the affected tables from their own cache before returning.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run(&self, sql: &str, params: Vec<RowValues>) -> Result<ResultSet, SqlAccessError>;

    async fn exec_batch(&self, sql: &str) -> Result<(), SqlAccessError>;

    fn cache(&self) -> &RequestCache;
}

/// Borrowing façade; cheap to create per call site.
pub struct Repository<'a, E: Executor + ?Sized> {
    executor: &'a E,
}

impl<E: Executor + ?Sized> Clone for Repository<'_, E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E: Executor + ?Sized> Copy for Repository<'_, E> {}

impl<'a, E: Executor + ?Sized> Repository<'a, E> {
    #[must_use]
    pub fn new(executor: &'a E) -> Self {
        Self { executor }
    }

    #[must_use]
    pub fn executor(&self) -> &'a E {
        self.executor
    }

    #[must_use]
    pub fn cache(&self) -> &'a RequestCache {
        self.executor.cache()
    }

    /// # Errors
    /// Returns the executor's error.
    pub async fn query(
        &self,
        sql: &str,
        params: Vec<RowValues>,
    ) -> Result<ResultSet, SqlAccessError> {
        self.executor.run(sql, params).await
    }

    /// # Errors
    /// Returns the executor's error.
    pub async fn execute(
        &self,
        sql: &str,
        params: Vec<RowValues>,
    ) -> Result<usize, SqlAccessError> {
        Ok(self.executor.run(sql, params).await?.rows_affected)
    }

    /// # Errors
    /// Returns the executor's error.
    pub async fn exec_batch(&self, sql: &str) -> Result<(), SqlAccessError> {
        self.executor.exec_batch(sql).await
    }

    /// Run a generated statement.
    ///
    /// # Errors
    /// Returns [`SqlAccessError::Build`] if the placeholder count does not match the
    /// parameters, otherwise the executor's error.
    pub async fn run(&self, statement: Statement) -> Result<ResultSet, SqlAccessError> {
        let Statement { sql, params } = statement.checked()?;
        self.executor.run(&sql, params).await
    }

    /// # Errors
    /// Returns build or executor errors.
    pub async fn find_many(&self, selector: &Selector) -> Result<Vec<CustomDbRow>, SqlAccessError> {
        Ok(self.run(selector.build()?).await?.results)
    }

    /// Rows of `selector` converted with the entity's coercion.
    ///
    /// # Errors
    /// Returns build, executor or coercion errors.
    pub async fn find_many_as<T>(
        &self,
        selector: &Selector,
        entity: &SqlEntity<T>,
    ) -> Result<Vec<T>, SqlAccessError> {
        self.find_many(selector)
            .await?
            .iter()
            .map(|row| entity.coerce(row))
            .collect()
    }

    /// First row of `selector`, fetched with `LIMIT 1`.
    ///
    /// # Errors
    /// Returns build or executor errors.
    pub async fn find_one(
        &self,
        selector: &Selector,
    ) -> Result<Option<CustomDbRow>, SqlAccessError> {
        let limited = selector.clone().limit(1);
        Ok(self.find_many(&limited).await?.into_iter().next())
    }

    /// First column of the first row.
    ///
    /// # Errors
    /// Returns build or executor errors.
    pub async fn find_first_value(
        &self,
        selector: &Selector,
    ) -> Result<Option<RowValues>, SqlAccessError> {
        let limited = selector.clone().limit(1);
        Ok(self.run(limited.build()?).await?.first_value().cloned())
    }

    /// `count(*)` over the selector's FROM/JOIN/WHERE. Limit and offset are ignored.
    ///
    /// # Errors
    /// Returns build or executor errors.
    pub async fn count(&self, selector: &Selector) -> Result<i64, SqlAccessError> {
        let counting = selector
            .clone()
            .replace_fields(vec![Selection::Name("count(*)".into())])
            .limit(None)
            .offset(None);
        let value = self.find_first_value(&counting).await?;
        Ok(value.as_ref().and_then(RowValues::as_int).copied().unwrap_or(0))
    }

    /// # Errors
    /// Returns build or executor errors.
    pub async fn exists(&self, selector: &Selector) -> Result<bool, SqlAccessError> {
        let Statement { sql, params } = selector.build()?;
        let result = self
            .run(Statement {
                sql: format!("SELECT EXISTS (\n{sql}\n)"),
                params,
            })
            .await?;
        Ok(result.first_value().and_then(RowValues::as_bool).unwrap_or(false))
    }

    /// Table-level access for one entity.
    #[must_use]
    pub fn of<T>(&self, entity: &'a SqlEntity<T>) -> TableAccess<'a, E, T> {
        TableAccess::new(*self, entity)
    }

    /// Batched loader for the children of a many-to-many link.
    #[must_use]
    pub fn n2m_loader<C>(&self, child: &'a SqlEntity<C>, link: N2mLink) -> N2mLoader<'a, E, C> {
        N2mLoader::new(*self, child, link)
    }
}
