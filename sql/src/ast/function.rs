use super::Column;

/// The small set of SQL functions the engine emits.
#[derive(Debug, Clone, PartialEq)]
pub enum Function {
    /// `COUNT(*)` or `COUNT("col")`.
    Count(Option<Column>),
}

pub fn count_star() -> Function {
    Function::Count(None)
}
