use super::script::{Statement, create_select_script};
use super::{
    BuildError, BuilderState, Direction, JoinClause, JoinMode, Nulls, OrderClause, OrderTarget,
    Selection,
};
use crate::entity::SqlEntity;
use crate::expr::{SqlExpr, SqlField, in_expr, quote_identifier};

/// SELECT builder.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    pub(crate) state: BuilderState,
}

impl Selector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add selected columns or expressions.
    #[must_use]
    pub fn select<S: Into<Selection>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.state.fields.extend(fields.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn select_as(mut self, field: impl Into<Selection>, alias: impl Into<String>) -> Self {
        self.state.fields.push(field.into().aliased(alias));
        self
    }

    /// Select every column of the entity's table (`"table".*`).
    #[must_use]
    pub fn select_entity<T>(mut self, entity: &SqlEntity<T>) -> Self {
        self.state
            .fields
            .push(Selection::Name(format!("{}.*", quote_identifier(entity.table()))));
        self
    }

    #[must_use]
    pub fn distinct(mut self, distinct: bool) -> Self {
        self.state.distinct = distinct;
        self
    }

    #[must_use]
    pub fn from(mut self, table: &str) -> Self {
        self.state.table = Some(Selection::table(table));
        self
    }

    #[must_use]
    pub fn from_as(mut self, table: &str, alias: &str) -> Self {
        self.state.table = Some(Selection::table(table).aliased(alias));
        self
    }

    #[must_use]
    pub fn from_entity<T>(self, entity: &SqlEntity<T>) -> Self {
        self.from(entity.table())
    }

    /// Select from a sub-query or table-valued expression.
    #[must_use]
    pub fn from_expr(mut self, expr: SqlExpr, alias: &str) -> Self {
        self.state.table = Some(Selection::Expr(expr).aliased(alias));
        self
    }

    /// Start a join; finish it with [`JoinBuilder::on`] or [`JoinBuilder::always`].
    #[must_use]
    pub fn join(self, table: &str, alias: Option<&str>) -> JoinBuilder {
        let mut selection = Selection::table(table);
        if let Some(alias) = alias {
            selection = selection.aliased(alias);
        }
        JoinBuilder::new(self, selection)
    }

    #[must_use]
    pub fn join_expr(self, expr: SqlExpr, alias: &str) -> JoinBuilder {
        JoinBuilder::new(self, Selection::Expr(expr).aliased(alias))
    }

    /// Add a WHERE condition; conditions are AND-ed. `None` is ignored.
    #[must_use]
    pub fn filter(mut self, condition: impl Into<Option<SqlExpr>>) -> Self {
        self.state.push_condition(condition);
        self
    }

    /// `field IN (<sub-query>)`.
    #[must_use]
    pub fn filter_in(mut self, field: impl Into<SqlField>, sub: Selector) -> Self {
        match sub.as_expr() {
            Ok(expr) => self.state.conditions.push(in_expr(field.into(), expr)),
            Err(err) => self.state.defer(err),
        }
        self
    }

    /// `EXISTS (<sub-query>)`.
    #[must_use]
    pub fn filter_exists(mut self, sub: Selector) -> Self {
        match sub.as_exists() {
            Ok(expr) => self.state.conditions.push(expr),
            Err(err) => self.state.defer(err),
        }
        self
    }

    #[must_use]
    pub fn group_by(mut self, field: impl Into<SqlField>) -> Self {
        self.state.groupings.push(field.into());
        self
    }

    #[must_use]
    pub fn having(mut self, condition: impl Into<Option<SqlExpr>>) -> Self {
        if let Some(condition) = condition.into() {
            self.state.grouping_conditions.push(condition);
        }
        self
    }

    #[must_use]
    pub fn order_by(self, target: impl Into<OrderTarget>, direction: Direction) -> Self {
        self.push_order(target.into(), Some(direction), None)
    }

    #[must_use]
    pub fn order_by_nulls(
        self,
        target: impl Into<OrderTarget>,
        direction: Direction,
        nulls: Nulls,
    ) -> Self {
        self.push_order(target.into(), Some(direction), Some(nulls))
    }

    fn push_order(
        mut self,
        target: OrderTarget,
        direction: Option<Direction>,
        nulls: Option<Nulls>,
    ) -> Self {
        self.state.ordering.push(OrderClause {
            target: target.0,
            direction,
            nulls,
        });
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: impl Into<Option<i64>>) -> Self {
        self.state.limit = limit.into();
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: impl Into<Option<i64>>) -> Self {
        self.state.offset = offset.into();
        self
    }

    #[must_use]
    pub fn state(&self) -> &BuilderState {
        &self.state
    }

    /// Generate the SELECT statement.
    ///
    /// # Errors
    /// Returns [`BuildError`] when the accumulated state cannot form a valid statement.
    pub fn build(&self) -> Result<Statement, BuildError> {
        create_select_script(&self.state)
    }

    /// The whole query as a parenthesized sub-expression.
    ///
    /// # Errors
    /// Same as [`build`](Self::build).
    pub fn as_expr(&self) -> Result<SqlExpr, BuildError> {
        let Statement { sql, params } = self.build()?;
        Ok(SqlExpr::custom(sql, params))
    }

    /// `(SELECT count(*) ...)` as a sub-expression.
    ///
    /// # Errors
    /// Same as [`build`](Self::build).
    pub fn as_count(mut self) -> Result<SqlExpr, BuildError> {
        self.state.fields = vec![Selection::Name("count(*)".into())];
        self.as_expr()
    }

    /// `(EXISTS (SELECT 1 ...))` as a sub-expression.
    ///
    /// # Errors
    /// Same as [`build`](Self::build).
    pub fn as_exists(mut self) -> Result<SqlExpr, BuildError> {
        self.state.fields = vec![Selection::Name("1".into())];
        let Statement { sql, params } = self.build()?;
        Ok(SqlExpr::custom(format!("EXISTS ({sql})"), params))
    }

    pub(crate) fn replace_fields(mut self, fields: Vec<Selection>) -> Self {
        self.state.fields = fields;
        self
    }
}

/// Pending join clause of a [`Selector`].
#[derive(Debug)]
pub struct JoinBuilder {
    selector: Selector,
    clause: JoinClause,
}

impl JoinBuilder {
    fn new(selector: Selector, table: Selection) -> Self {
        Self {
            selector,
            clause: JoinClause {
                table,
                condition: None,
                mode: None,
            },
        }
    }

    #[must_use]
    pub fn inner(mut self) -> Self {
        self.clause.mode = Some(JoinMode::Inner);
        self
    }

    #[must_use]
    pub fn left(mut self) -> Self {
        self.clause.mode = Some(JoinMode::Left);
        self
    }

    #[must_use]
    pub fn cross(mut self) -> Self {
        self.clause.mode = Some(JoinMode::Cross);
        self
    }

    /// Finish the join with an ON condition. Joins without a mode default to INNER.
    #[must_use]
    pub fn on(mut self, condition: impl Into<Option<SqlExpr>>) -> Selector {
        if let Some(condition) = condition.into() {
            self.clause.condition = Some(condition);
            self.clause.mode.get_or_insert(JoinMode::Inner);
        }
        self.selector.state.joins.push(self.clause);
        self.selector
    }

    /// Finish the join with an always-true condition.
    #[must_use]
    pub fn always(self) -> Selector {
        self.on(SqlExpr::custom("1 = 1", Vec::new()))
    }
}
