use super::{Column, Expression, Table};

/// An `INSERT` statement, single- or multi-row, with optional conflict
/// handling and `RETURNING`.
#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub table: Table,
    pub columns: Vec<String>,
    /// Row-major values; every row has `columns.len()` expressions.
    pub values: Vec<Vec<Expression>>,
    pub on_conflict: Option<OnConflict>,
    pub returning: Option<Vec<Column>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OnConflict {
    /// Skip conflicting rows.
    DoNothing { target: Vec<String> },
    /// Native upsert: on a conflict over `target`, apply the assignments.
    DoUpdate {
        target: Vec<String>,
        set: Vec<(String, Expression)>,
    },
}

impl Insert {
    pub fn single_into(table: impl Into<Table>) -> SingleRowInsert {
        SingleRowInsert {
            table: table.into(),
            columns: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn multi_into<C>(table: impl Into<Table>, columns: impl IntoIterator<Item = C>) -> MultiRowInsert
    where
        C: Into<String>,
    {
        MultiRowInsert {
            table: table.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            values: Vec::new(),
        }
    }

    pub fn on_conflict(mut self, on_conflict: OnConflict) -> Self {
        self.on_conflict = Some(on_conflict);
        self
    }

    pub fn returning<C>(mut self, columns: impl IntoIterator<Item = C>) -> Self
    where
        C: Into<Column>,
    {
        self.returning = Some(columns.into_iter().map(Into::into).collect());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SingleRowInsert {
    pub table: Table,
    pub columns: Vec<String>,
    pub values: Vec<Expression>,
}

impl SingleRowInsert {
    pub fn value(mut self, column: impl Into<String>, value: impl Into<Expression>) -> Self {
        self.columns.push(column.into());
        self.values.push(value.into());
        self
    }
}

impl From<SingleRowInsert> for Insert {
    fn from(insert: SingleRowInsert) -> Self {
        Insert {
            table: insert.table,
            columns: insert.columns,
            values: vec![insert.values],
            on_conflict: None,
            returning: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultiRowInsert {
    pub table: Table,
    pub columns: Vec<String>,
    pub values: Vec<Vec<Expression>>,
}

impl MultiRowInsert {
    pub fn values<V>(mut self, row: impl IntoIterator<Item = V>) -> Self
    where
        V: Into<Expression>,
    {
        self.values.push(row.into_iter().map(Into::into).collect());
        self
    }
}

impl From<MultiRowInsert> for Insert {
    fn from(insert: MultiRowInsert) -> Self {
        Insert {
            table: insert.table,
            columns: insert.columns,
            values: insert.values,
            on_conflict: None,
            returning: None,
        }
    }
}
