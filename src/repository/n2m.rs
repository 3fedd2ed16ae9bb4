use std::collections::HashMap;

use crate::entity::SqlEntity;
use crate::error::SqlAccessError;
use crate::expr::{SqlField, eq, in_list};
use crate::query_builder::Selector;
use crate::results::CustomDbRow;
use crate::types::EntityId;

use super::{Executor, Repository};

const PARENT_ALIAS: &str = "__parent_id";

/// A many-to-many join table linking parent ids to child ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct N2mLink {
    pub n2m_table: String,
    pub parent_column: String,
    pub child_column: String,
}

impl N2mLink {
    #[must_use]
    pub fn new(
        n2m_table: impl Into<String>,
        parent_column: impl Into<String>,
        child_column: impl Into<String>,
    ) -> Self {
        Self {
            n2m_table: n2m_table.into(),
            parent_column: parent_column.into(),
            child_column: child_column.into(),
        }
    }
}

/// Loads the children of many parents with one batched join per chunk of parent ids.
///
/// Entries depend on both the join table and the child table.
pub struct N2mLoader<'a, E: Executor + ?Sized, C> {
    repo: Repository<'a, E>,
    child: &'a SqlEntity<C>,
    link: N2mLink,
}

impl<'a, E: Executor + ?Sized, C> N2mLoader<'a, E, C> {
    pub(crate) fn new(repo: Repository<'a, E>, child: &'a SqlEntity<C>, link: N2mLink) -> Self {
        Self { repo, child, link }
    }

    fn loader_name(&self) -> String {
        format!(
            "n2m:{}:{}:{}",
            self.link.n2m_table,
            self.link.parent_column,
            self.child.table()
        )
    }

    /// Children of one parent; an unknown parent has none.
    ///
    /// # Errors
    /// Returns build, executor or coercion errors.
    pub async fn load(&self, parent: impl Into<EntityId>) -> Result<Vec<C>, SqlAccessError> {
        let parent = parent.into();
        let mut all = self.load_many(std::slice::from_ref(&parent)).await?;
        Ok(all.remove(&parent).unwrap_or_default())
    }

    /// Children grouped by parent id. Parents without children are absent.
    ///
    /// # Errors
    /// Returns build, executor or coercion errors.
    pub async fn load_many(
        &self,
        parents: &[EntityId],
    ) -> Result<HashMap<EntityId, Vec<C>>, SqlAccessError> {
        let n2m = self.link.n2m_table.as_str();
        let loader = self
            .repo
            .cache()
            .loader::<EntityId, Vec<CustomDbRow>>(&self.loader_name(), &[n2m, self.child.table()]);

        let repo = self.repo;
        let child = self.child;
        let link = &self.link;
        let rows = loader
            .load_many(parents, |keys| async move { fetch_children(repo, child, link, keys).await })
            .await?;

        rows.into_iter()
            .map(|(parent, rows)| {
                let children = rows
                    .iter()
                    .map(|row| self.child.coerce(row))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((parent, children))
            })
            .collect()
    }
}

async fn fetch_children<E: Executor + ?Sized, C>(
    repo: Repository<'_, E>,
    child: &SqlEntity<C>,
    link: &N2mLink,
    parents: Vec<EntityId>,
) -> Result<Vec<(EntityId, Vec<CustomDbRow>)>, SqlAccessError> {
    let parent_field = SqlField::with_source(link.n2m_table.as_str(), link.parent_column.as_str());
    let selector = Selector::new()
        .select_entity(child)
        .select_as(parent_field.clone(), PARENT_ALIAS)
        .from(&link.n2m_table)
        .join(child.table(), None)
        .on(eq(
            SqlField::with_source(child.table(), "id"),
            SqlField::with_source(link.n2m_table.as_str(), link.child_column.as_str()),
        ))
        .filter(in_list(parent_field, parents.iter()));

    let mut grouped: HashMap<EntityId, Vec<CustomDbRow>> = HashMap::new();
    for row in repo.find_many(&selector).await? {
        if let Some(parent) = row.get(PARENT_ALIAS).and_then(EntityId::from_value) {
            grouped.entry(parent).or_default().push(row);
        }
    }
    Ok(grouped.into_iter().collect())
}
