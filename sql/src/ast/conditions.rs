use super::{Compare, Expression};

/// A tree of logical conditions forming a `WHERE` clause.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ConditionTree {
    And(Vec<Expression>),
    Or(Vec<Expression>),
    Not(Box<Expression>),
    Single(Box<Expression>),
    /// Matches every row. The explicit empty filter.
    #[default]
    NoCondition,
    /// Matches no row.
    NegativeCondition,
}

impl ConditionTree {
    pub fn single(expression: impl Into<Expression>) -> Self {
        Self::Single(Box::new(expression.into()))
    }

    pub fn not(expression: impl Into<Expression>) -> Self {
        Self::Not(Box::new(expression.into()))
    }

    pub fn and(left: impl Into<Expression>, right: impl Into<Expression>) -> Self {
        Self::And(vec![left.into(), right.into()])
    }

    pub fn or(left: impl Into<Expression>, right: impl Into<Expression>) -> Self {
        Self::Or(vec![left.into(), right.into()])
    }

    /// Conjoins another condition onto this tree, flattening nested `AND`s.
    pub fn and_also(self, other: impl Into<Expression>) -> Self {
        match self {
            Self::NoCondition => match other.into() {
                Expression {
                    kind: super::ExpressionKind::ConditionTree(tree),
                } => *tree,
                expr => Self::Single(Box::new(expr)),
            },
            Self::And(mut expressions) => {
                expressions.push(other.into());
                Self::And(expressions)
            }
            Self::Single(expression) => Self::And(vec![*expression, other.into()]),
            tree => Self::And(vec![tree.into(), other.into()]),
        }
    }
}

impl From<Compare> for ConditionTree {
    fn from(compare: Compare) -> Self {
        Self::single(compare)
    }
}

impl From<Expression> for ConditionTree {
    fn from(expression: Expression) -> Self {
        Self::Single(Box::new(expression))
    }
}
