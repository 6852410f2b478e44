use super::{Column, Compare, ConditionTree, Function};
use crate::Value;

/// A node in the SQL expression tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    pub kind: ExpressionKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExpressionKind {
    /// A quoted column reference.
    Column(Box<Column>),
    /// A bound parameter. Never rendered inline.
    Parameterized(Value),
    /// A nested tree of logical conditions.
    ConditionTree(Box<ConditionTree>),
    /// A comparison between two expressions.
    Compare(Box<Compare>),
    /// An aggregate or scalar function.
    Function(Box<Function>),
    /// The would-be-inserted value of a column inside an upsert's update
    /// branch. Renders as `excluded."col"` or `VALUES(`col`)` per dialect.
    Excluded(Box<Column>),
    /// `a + b`; used for counter bumps like version columns.
    Add(Box<Expression>, Box<Expression>),
    /// `*`
    Asterisk,
}

impl Expression {
    pub fn column(column: impl Into<Column>) -> Self {
        ExpressionKind::Column(Box::new(column.into())).into()
    }

    pub fn parameterized(value: impl Into<Value>) -> Self {
        ExpressionKind::Parameterized(value.into()).into()
    }

    pub fn excluded(column: impl Into<Column>) -> Self {
        ExpressionKind::Excluded(Box::new(column.into())).into()
    }

    pub fn plus(self, other: impl Into<Expression>) -> Self {
        ExpressionKind::Add(Box::new(self), Box::new(other.into())).into()
    }

    pub const fn asterisk() -> Self {
        Self {
            kind: ExpressionKind::Asterisk,
        }
    }

    pub fn and(self, other: impl Into<Expression>) -> Expression {
        ConditionTree::And(vec![self, other.into()]).into()
    }

    pub fn or(self, other: impl Into<Expression>) -> Expression {
        ConditionTree::Or(vec![self, other.into()]).into()
    }

    pub fn not(self) -> Expression {
        ConditionTree::Not(Box::new(self)).into()
    }

    /// Whether this is a bound parameter holding a typed NULL.
    pub fn is_null_value(&self) -> bool {
        matches!(&self.kind, ExpressionKind::Parameterized(v) if v.is_null())
    }
}

impl From<ExpressionKind> for Expression {
    fn from(kind: ExpressionKind) -> Self {
        Self { kind }
    }
}

impl From<Value> for Expression {
    fn from(value: Value) -> Self {
        Expression::parameterized(value)
    }
}

impl From<Column> for Expression {
    fn from(column: Column) -> Self {
        Expression::column(column)
    }
}

impl From<Compare> for Expression {
    fn from(compare: Compare) -> Self {
        ExpressionKind::Compare(Box::new(compare)).into()
    }
}

impl From<ConditionTree> for Expression {
    fn from(tree: ConditionTree) -> Self {
        ExpressionKind::ConditionTree(Box::new(tree)).into()
    }
}

impl From<Function> for Expression {
    fn from(function: Function) -> Self {
        ExpressionKind::Function(Box::new(function)).into()
    }
}

// Bare literals in expression position are values, not columns. Columns are
// spelled through `Column` or the `Comparable` receiver.
impl From<&str> for Expression {
    fn from(s: &str) -> Self {
        Expression::parameterized(Value::text(s))
    }
}

impl From<String> for Expression {
    fn from(s: String) -> Self {
        Expression::parameterized(Value::text(s))
    }
}

impl From<i32> for Expression {
    fn from(i: i32) -> Self {
        Expression::parameterized(Value::int32(i))
    }
}

impl From<i64> for Expression {
    fn from(i: i64) -> Self {
        Expression::parameterized(Value::int64(i))
    }
}

impl From<bool> for Expression {
    fn from(b: bool) -> Self {
        Expression::parameterized(Value::boolean(b))
    }
}

impl From<f64> for Expression {
    fn from(f: f64) -> Self {
        Expression::parameterized(Value::float(f))
    }
}
