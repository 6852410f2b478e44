use super::{RenderedQuery, Visitor};
use crate::Value;

/// SQLite rendering: `?` placeholders, backtick identifiers, `REGEXP`
/// (provided as a user function by the native connector), `ON CONFLICT`
/// upserts like PostgreSQL.
#[derive(Debug, Default)]
pub struct Sqlite {
    state: RenderedQuery,
}

impl Visitor for Sqlite {
    const C_QUOTE: &'static str = "`";

    fn new() -> Self {
        Self::default()
    }

    fn dialect_name() -> &'static str {
        "sqlite"
    }

    fn state(&mut self) -> &mut RenderedQuery {
        &mut self.state
    }

    fn into_state(self) -> RenderedQuery {
        self.state
    }

    // An offset without a limit needs `LIMIT -1` on SQLite.
    fn visit_limit_and_offset(&mut self, limit: Option<u64>, offset: Option<u64>) {
        match (limit, offset) {
            (None, Some(offset)) => {
                self.write(" LIMIT -1 OFFSET ");
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
