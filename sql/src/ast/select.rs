use super::{ConditionTree, Expression, OrderDefinition, Ordering, Table};

/// A `SELECT` statement.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Select {
    pub table: Option<Table>,
    /// Projected expressions. Empty means `*`.
    pub columns: Vec<Expression>,
    pub conditions: Option<ConditionTree>,
    pub ordering: Ordering,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl Select {
    pub fn from_table(table: impl Into<Table>) -> Self {
        Self {
            table: Some(table.into()),
            ..Default::default()
        }
    }

    /// Projects a single expression, e.g. `COUNT(*)` or a constant.
    pub fn value(mut self, value: impl Into<Expression>) -> Self {
        self.columns.push(value.into());
        self
    }

    pub fn column(mut self, column: impl Into<super::Column>) -> Self {
        self.columns.push(Expression::column(column));
        self
    }

    pub fn columns<C>(mut self, columns: impl IntoIterator<Item = C>) -> Self
    where
        C: Into<super::Column>,
    {
        self.columns
            .extend(columns.into_iter().map(Expression::column));
        self
    }

    /// Sets the `WHERE` tree, replacing any previous one.
    pub fn so_that(mut self, conditions: impl Into<ConditionTree>) -> Self {
        self.conditions = Some(conditions.into());
        self
    }

    /// Conjoins a condition onto the existing tree.
    pub fn and_where(mut self, condition: impl Into<Expression>) -> Self {
        self.conditions = Some(self.conditions.take().unwrap_or_default().and_also(condition));
        self
    }

    pub fn order_by(mut self, value: impl Into<OrderDefinition>) -> Self {
        self.ordering = self.ordering.append(value.into());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }
}
