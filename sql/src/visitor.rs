//! Turning an [`ast`](crate::ast) tree into dialect SQL plus parameters.
//!
//! The shared trait carries the rendering logic; the dialect structs
//! override only what actually differs: placeholder style, quoting, limit
//! quirks, conflict clauses, regex operators.

mod mysql;
mod postgres;
mod sqlite;

pub use mysql::Mysql;
pub use postgres::Postgres;
pub use sqlite::Sqlite;

use crate::ast::*;
use crate::{Error, ErrorKind, Result, Value};

/// Mutable render state: the SQL text and the positional parameters
/// accumulated so far.
#[derive(Debug, Default)]
pub struct RenderedQuery {
    pub query: String,
    pub parameters: Vec<Value>,
}

pub trait Visitor: Sized {
    /// The identifier quote character.
    const C_QUOTE: &'static str;

    fn new() -> Self;

    fn dialect_name() -> &'static str;

    fn state(&mut self) -> &mut RenderedQuery;

    fn into_state(self) -> RenderedQuery;

    /// Renders a query into `(sql, parameters)`.
    fn build(query: impl Into<Query>) -> Result<(String, Vec<Value>)> {
        let mut visitor = Self::new();
        visitor.visit_query(query.into())?;

        let state = visitor.into_state();
        Ok((state.query, state.parameters))
    }

    fn write(&mut self, s: impl AsRef<str>) {
        self.state().query.push_str(s.as_ref());
    }

    fn add_parameter(&mut self, value: Value) {
        self.state().parameters.push(value);
    }

    /// Writes the placeholder for the most recently added parameter.
    fn parameter_substitution(&mut self) {
        self.write("?");
    }

    /// Quotes an identifier, re-checking the identifier grammar as a last
    /// line of defense. Identifiers are validated at registration time, so
    /// a failure here is an internal invariant breach, not user error.
    fn delimited_identifier(&mut self, identifier: &str) -> Result<()> {
        crate::validate::check_identifier(identifier)?;
        self.write(Self::C_QUOTE);
        self.write(identifier);
        self.write(Self::C_QUOTE);
        Ok(())
    }

    fn visit_query(&mut self, query: Query) -> Result<()> {
        match query {
            Query::Select(select) => self.visit_select(*select),
            Query::Insert(insert) => self.visit_insert(*insert),
            Query::Update(update) => self.visit_update(*update),
            Query::Delete(delete) => self.visit_delete(*delete),
        }
    }

    fn visit_table(&mut self, table: &Table) -> Result<()> {
        self.delimited_identifier(&table.name)
    }

    fn visit_column(&mut self, column: Column) -> Result<()> {
        if let Some(table) = column.table {
            self.delimited_identifier(&table)?;
            self.write(".");
        }
        self.delimited_identifier(&column.name)
    }

    fn visit_select(&mut self, select: Select) -> Result<()> {
        self.write("SELECT ");

        if select.columns.is_empty() {
            self.write("*");
        } else {
            let columns = select.columns;
            for (i, expression) in columns.into_iter().enumerate() {
                if i > 0 {
                    self.write(", ");
                }
                self.visit_expression(expression)?;
            }
        }

        if let Some(table) = select.table {
            self.write(" FROM ");
            self.visit_table(&table)?;
        }

        if let Some(conditions) = select.conditions {
            self.visit_where(conditions)?;
        }

        if !select.ordering.is_empty() {
            self.visit_ordering(select.ordering)?;
        }

        self.visit_limit_and_offset(select.limit, select.offset);
        Ok(())
    }

    fn visit_insert(&mut self, insert: Insert) -> Result<()> {
        self.write("INSERT ");
        self.visit_insert_flags(&insert);
        self.write("INTO ");
        self.visit_table(&insert.table)?;

        if insert.columns.is_empty() {
            self.visit_default_values();
        } else {
            self.write(" (");
            for (i, column) in insert.columns.iter().enumerate() {
                if i > 0 {
                    self.write(", ");
                }
                self.delimited_identifier(column)?;
            }
            self.write(") VALUES ");

            let column_count = insert.columns.len();
            let row_count = insert.values.len();

            for (i, row) in insert.values.into_iter().enumerate() {
                if row.len() != column_count {
                    return Err(Error::new(ErrorKind::QueryError(format!(
                        "insert row {i} has {} values for {column_count} columns",
                        row.len(),
                    ))));
                }

                if i > 0 {
                    self.write(", ");
                }

                self.write("(");
                for (j, value) in row.into_iter().enumerate() {
                    if j > 0 {
                        self.write(", ");
                    }
                    self.visit_expression(value)?;
                }
                self.write(")");
            }

            if row_count == 0 {
                return Err(Error::new(ErrorKind::QueryError(
                    "insert statement with no rows".to_owned(),
                )));
            }
        }

        if let Some(on_conflict) = insert.on_conflict {
            self.visit_on_conflict(on_conflict)?;
        }

        self.visit_returning(insert.returning)?;
        Ok(())
    }

    /// Extra keywords between `INSERT` and `INTO`. MySQL writes `IGNORE`.
    fn visit_insert_flags(&mut self, _insert: &Insert) {}

    fn visit_default_values(&mut self) {
        self.write(" DEFAULT VALUES");
    }

    fn visit_on_conflict(&mut self, on_conflict: OnConflict) -> Result<()> {
        match on_conflict {
            OnConflict::DoNothing { target } => {
                self.write(" ON CONFLICT");
                if !target.is_empty() {
                    self.write(" (");
                    for (i, column) in target.iter().enumerate() {
                        if i > 0 {
                            self.write(", ");
                        }
                        self.delimited_identifier(column)?;
                    }
                    self.write(")");
                }
                self.write(" DO NOTHING");
                Ok(())
            }
            OnConflict::DoUpdate { target, set } => {
                if target.is_empty() {
                    return Err(Error::new(ErrorKind::QueryError(
                        "a native upsert needs at least one conflict target column".to_owned(),
                    )));
                }

                self.write(" ON CONFLICT (");
                for (i, column) in target.iter().enumerate() {
                    if i > 0 {
                        self.write(", ");
                    }
                    self.delimited_identifier(column)?;
                }
                self.write(") DO UPDATE SET ");

                for (i, (column, value)) in set.into_iter().enumerate() {
                    if i > 0 {
                        self.write(", ");
                    }
                    self.delimited_identifier(&column)?;
                    self.write(" = ");
                    self.visit_expression(value)?;
                }
                Ok(())
            }
        }
    }

    /// The source column of an upsert assignment.
    fn visit_excluded(&mut self, column: Column) -> Result<()> {
        self.write("excluded.");
        self.delimited_identifier(&column.name)
    }

    fn visit_returning(&mut self, returning: Option<Vec<Column>>) -> Result<()> {
        if let Some(columns) = returning {
            self.write(" RETURNING ");
            for (i, column) in columns.into_iter().enumerate() {
                if i > 0 {
                    self.write(", ");
                }
                self.visit_column(column)?;
            }
        }
        Ok(())
    }

    fn visit_update(&mut self, update: Update) -> Result<()> {
        self.write("UPDATE ");
        self.visit_table(&update.table)?;
        self.write(" SET ");

        for (i, (column, value)) in update.set.into_iter().enumerate() {
            if i > 0 {
                self.write(", ");
            }
            self.delimited_identifier(&column)?;
            self.write(" = ");
            self.visit_expression(value)?;
        }

        if let Some(conditions) = update.conditions {
            self.visit_where(conditions)?;
        }

        self.visit_returning(update.returning)?;
        Ok(())
    }

    fn visit_delete(&mut self, delete: Delete) -> Result<()> {
        self.write("DELETE FROM ");
        self.visit_table(&delete.table)?;

        if let Some(conditions) = delete.conditions {
            self.visit_where(conditions)?;
        }

        self.visit_returning(delete.returning)?;
        Ok(())
    }

    fn visit_where(&mut self, conditions: ConditionTree) -> Result<()> {
        match conditions {
            ConditionTree::NoCondition => Ok(()),
            tree => {
                self.write(" WHERE ");
                self.visit_condition_tree(tree)
            }
        }
    }

    fn visit_condition_tree(&mut self, tree: ConditionTree) -> Result<()> {
        match tree {
            ConditionTree::And(expressions) => self.visit_logical(expressions, " AND ", "1=1"),
            ConditionTree::Or(expressions) => self.visit_logical(expressions, " OR ", "1=0"),
            ConditionTree::Not(expression) => {
                self.write("NOT (");
                self.visit_expression(*expression)?;
                self.write(")");
                Ok(())
            }
            ConditionTree::Single(expression) => self.visit_expression(*expression),
            ConditionTree::NoCondition => {
                self.write("1=1");
                Ok(())
            }
            ConditionTree::NegativeCondition => {
                self.write("1=0");
                Ok(())
            }
        }
    }

    fn visit_logical(&mut self, mut expressions: Vec<Expression>, separator: &str, empty: &str) -> Result<()> {
        match expressions.len() {
            0 => {
                self.write(empty);
                Ok(())
            }
            1 => self.visit_expression(expressions.remove(0)),
            _ => {
                for (i, expression) in expressions.into_iter().enumerate() {
                    if i > 0 {
                        self.write(separator);
                    }

                    let parenthesize = matches!(expression.kind, ExpressionKind::ConditionTree(_));
                    if parenthesize {
                        self.write("(");
                    }
                    self.visit_expression(expression)?;
                    if parenthesize {
                        self.write(")");
                    }
                }
                Ok(())
            }
        }
    }

    fn visit_expression(&mut self, expression: Expression) -> Result<()> {
        match expression.kind {
            ExpressionKind::Column(column) => self.visit_column(*column),
            ExpressionKind::Parameterized(value) => {
                self.add_parameter(value);
                self.parameter_substitution();
                Ok(())
            }
            ExpressionKind::ConditionTree(tree) => self.visit_condition_tree(*tree),
            ExpressionKind::Compare(compare) => self.visit_compare(*compare),
            ExpressionKind::Function(function) => self.visit_function(*function),
            ExpressionKind::Excluded(column) => self.visit_excluded(*column),
            ExpressionKind::Add(left, right) => self.visit_binary(*left, " + ", *right),
            ExpressionKind::Asterisk => {
                self.write("*");
                Ok(())
            }
        }
    }

    fn visit_compare(&mut self, compare: Compare) -> Result<()> {
        match compare {
            // Comparing against a typed NULL must become IS NULL, `= NULL`
            // never matches.
            Compare::Equals(left, right) if right.is_null_value() => {
                self.visit_expression(*left)?;
                self.write(" IS NULL");
                Ok(())
            }
            Compare::NotEquals(left, right) if right.is_null_value() => {
                self.visit_expression(*left)?;
                self.write(" IS NOT NULL");
                Ok(())
            }
            Compare::Equals(left, right) => self.visit_binary(*left, " = ", *right),
            Compare::NotEquals(left, right) => self.visit_binary(*left, " <> ", *right),
            Compare::LessThan(left, right) => self.visit_binary(*left, " < ", *right),
            Compare::LessThanOrEquals(left, right) => self.visit_binary(*left, " <= ", *right),
            Compare::GreaterThan(left, right) => self.visit_binary(*left, " > ", *right),
            Compare::GreaterThanOrEquals(left, right) => self.visit_binary(*left, " >= ", *right),
            Compare::In(left, selection) => {
                if selection.is_empty() {
                    self.write("1=0");
                    return Ok(());
                }

                self.visit_expression(*left)?;
                self.write(" IN (");
                for (i, value) in selection.into_iter().enumerate() {
                    if i > 0 {
                        self.write(", ");
                    }
                    self.visit_expression(value)?;
                }
                self.write(")");
                Ok(())
            }
            Compare::NotIn(left, selection) => {
                if selection.is_empty() {
                    self.write("1=1");
                    return Ok(());
                }

                self.visit_expression(*left)?;
                self.write(" NOT IN (");
                for (i, value) in selection.into_iter().enumerate() {
                    if i > 0 {
                        self.write(", ");
                    }
                    self.visit_expression(value)?;
                }
                self.write(")");
                Ok(())
            }
            Compare::Like(left, pattern) => self.visit_binary(*left, " LIKE ", *pattern),
            Compare::Regex(left, pattern) => self.visit_regex(*left, *pattern),
            Compare::Between(expression, low, high) => {
                self.visit_expression(*expression)?;
                self.write(" BETWEEN ");
                self.visit_expression(*low)?;
                self.write(" AND ");
                self.visit_expression(*high)?;
                Ok(())
            }
            Compare::IsNull(expression) => {
                self.visit_expression(*expression)?;
                self.write(" IS NULL");
                Ok(())
            }
            Compare::IsNotNull(expression) => {
                self.visit_expression(*expression)?;
                self.write(" IS NOT NULL");
                Ok(())
            }
        }
    }

    fn visit_binary(&mut self, left: Expression, op: &str, right: Expression) -> Result<()> {
        self.visit_expression(left)?;
        self.write(op);
        self.visit_expression(right)
    }

    fn visit_regex(&mut self, left: Expression, pattern: Expression) -> Result<()> {
        self.visit_binary(left, " REGEXP ", pattern)
    }

    fn visit_function(&mut self, function: Function) -> Result<()> {
        match function {
            Function::Count(None) => {
                self.write("COUNT(*)");
                Ok(())
            }
            Function::Count(Some(column)) => {
                self.write("COUNT(");
                self.visit_column(column)?;
                self.write(")");
                Ok(())
            }
        }
    }

    fn visit_ordering(&mut self, ordering: Ordering) -> Result<()> {
        self.write(" ORDER BY ");
        for (i, (column, order)) in ordering.0.into_iter().enumerate() {
            if i > 0 {
                self.write(", ");
            }
            self.visit_column(column)?;
            match order {
                Order::Asc => self.write(" ASC"),
                Order::Desc => self.write(" DESC"),
            }
        }
        Ok(())
    }

    fn visit_limit_and_offset(&mut self, limit: Option<u64>, offset: Option<u64>) {
        if let Some(limit) = limit {
            self.write(" LIMIT ");
            self.add_parameter(Value::int64(limit as i64));
            self.parameter_substitution();
        }

        if let Some(offset) = offset {
            self.write(" OFFSET ");
            self.add_parameter(Value::int64(offset as i64));
            self.parameter_substitution();
        }
    }
}
