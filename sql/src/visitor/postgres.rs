use super::{RenderedQuery, Visitor};
use crate::ast::Expression;
use crate::Result;

/// PostgreSQL rendering: `$n` placeholders, double-quoted identifiers,
/// `~` for regular expressions, native `ON CONFLICT`.
#[derive(Debug, Default)]
pub struct Postgres {
    state: RenderedQuery,
}

impl Visitor for Postgres {
    const C_QUOTE: &'static str = "\"";

    fn new() -> Self {
        Self::default()
    }

    fn dialect_name() -> &'static str {
        "postgresql"
    }

    fn state(&mut self) -> &mut RenderedQuery {
        &mut self.state
    }

    fn into_state(self) -> RenderedQuery {
        self.state
    }

    fn parameter_substitution(&mut self) {
        let position = self.state.parameters.len();
        self.write(format!("${position}"));
    }

    fn visit_regex(&mut self, left: Expression, pattern: Expression) -> Result<()> {
        self.visit_binary(left, " ~ ", pattern)
    }
}
