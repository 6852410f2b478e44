use super::{RenderedQuery, Visitor};
use crate::ast::{Column, Insert, OnConflict};
use crate::{Error, ErrorKind, Result, Value};

/// MySQL rendering: `?` placeholders, backtick identifiers, `REGEXP`,
/// `INSERT IGNORE` / `ON DUPLICATE KEY UPDATE` for conflict handling and no
/// `RETURNING` clause.
#[derive(Debug, Default)]
pub struct Mysql {
    state: RenderedQuery,
}

impl Visitor for Mysql {
    const C_QUOTE: &'static str = "`";

    fn new() -> Self {
        Self::default()
    }

    fn dialect_name() -> &'static str {
        "mysql"
    }

    fn state(&mut self) -> &mut RenderedQuery {
        &mut self.state
    }

    fn into_state(self) -> RenderedQuery {
        self.state
    }

    fn visit_insert_flags(&mut self, insert: &Insert) {
        if matches!(insert.on_conflict, Some(OnConflict::DoNothing { .. })) {
            self.write("IGNORE ");
        }
    }

    fn visit_default_values(&mut self) {
        self.write(" () VALUES ()");
    }

    fn visit_on_conflict(&mut self, on_conflict: OnConflict) -> Result<()> {
        match on_conflict {
            // Handled by `INSERT IGNORE`; the conflict target is implicit in
            // the table's unique constraints.
            OnConflict::DoNothing { .. } => Ok(()),
            OnConflict::DoUpdate { set, .. } => {
                self.write(" ON DUPLICATE KEY UPDATE ");
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

    fn visit_excluded(&mut self, column: Column) -> Result<()> {
        self.write("VALUES(");
        self.delimited_identifier(&column.name)?;
        self.write(")");
        Ok(())
    }

    fn visit_returning(&mut self, returning: Option<Vec<Column>>) -> Result<()> {
        match returning {
            None => Ok(()),
            Some(_) => Err(Error::new(ErrorKind::UnsupportedByDialect(
                "mysql",
                "RETURNING is not available, read the row back by key".to_owned(),
            ))),
        }
    }

    // MySQL requires a limit whenever an offset is present.
    fn visit_limit_and_offset(&mut self, limit: Option<u64>, offset: Option<u64>) {
        match (limit, offset) {
            (None, Some(offset)) => {
                self.write(" LIMIT 18446744073709551615 OFFSET ");
                self.add_parameter(Value::int64(offset as i64));
                self.parameter_substitution();
            }
            (limit, offset) => {
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
    }
}
