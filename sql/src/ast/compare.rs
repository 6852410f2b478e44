use super::{Column, Expression};

/// A comparison between expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Compare {
    Equals(Box<Expression>, Box<Expression>),
    NotEquals(Box<Expression>, Box<Expression>),
    LessThan(Box<Expression>, Box<Expression>),
    LessThanOrEquals(Box<Expression>, Box<Expression>),
    GreaterThan(Box<Expression>, Box<Expression>),
    GreaterThanOrEquals(Box<Expression>, Box<Expression>),
    /// `IN (…)`. An empty list renders as a match-nothing condition.
    In(Box<Expression>, Vec<Expression>),
    /// `NOT IN (…)`. An empty list renders as a match-all condition.
    NotIn(Box<Expression>, Vec<Expression>),
    Like(Box<Expression>, Box<Expression>),
    /// Dialect-specific regular expression match.
    Regex(Box<Expression>, Box<Expression>),
    Between(Box<Expression>, Box<Expression>, Box<Expression>),
    IsNull(Box<Expression>),
    IsNotNull(Box<Expression>),
}

/// Fluent comparison constructors, implemented for columns and column names.
pub trait Comparable {
    fn equals<T: Into<Expression>>(self, comparison: T) -> Compare;
    fn not_equals<T: Into<Expression>>(self, comparison: T) -> Compare;
    fn less_than<T: Into<Expression>>(self, comparison: T) -> Compare;
    fn less_than_or_equals<T: Into<Expression>>(self, comparison: T) -> Compare;
    fn greater_than<T: Into<Expression>>(self, comparison: T) -> Compare;
    fn greater_than_or_equals<T: Into<Expression>>(self, comparison: T) -> Compare;
    fn in_selection<T: Into<Expression>>(self, selection: Vec<T>) -> Compare;
    fn not_in_selection<T: Into<Expression>>(self, selection: Vec<T>) -> Compare;
    fn like<T: Into<Expression>>(self, pattern: T) -> Compare;
    fn matches_regex<T: Into<Expression>>(self, pattern: T) -> Compare;
    fn between<T: Into<Expression>, U: Into<Expression>>(self, low: T, high: U) -> Compare;
    fn is_null(self) -> Compare;
    fn is_not_null(self) -> Compare;
}

impl Comparable for Column {
    fn equals<T: Into<Expression>>(self, comparison: T) -> Compare {
        Compare::Equals(Box::new(self.into()), Box::new(comparison.into()))
    }

    fn not_equals<T: Into<Expression>>(self, comparison: T) -> Compare {
        Compare::NotEquals(Box::new(self.into()), Box::new(comparison.into()))
    }

    fn less_than<T: Into<Expression>>(self, comparison: T) -> Compare {
        Compare::LessThan(Box::new(self.into()), Box::new(comparison.into()))
    }

    fn less_than_or_equals<T: Into<Expression>>(self, comparison: T) -> Compare {
        Compare::LessThanOrEquals(Box::new(self.into()), Box::new(comparison.into()))
    }

    fn greater_than<T: Into<Expression>>(self, comparison: T) -> Compare {
        Compare::GreaterThan(Box::new(self.into()), Box::new(comparison.into()))
    }

    fn greater_than_or_equals<T: Into<Expression>>(self, comparison: T) -> Compare {
        Compare::GreaterThanOrEquals(Box::new(self.into()), Box::new(comparison.into()))
    }

    fn in_selection<T: Into<Expression>>(self, selection: Vec<T>) -> Compare {
        Compare::In(
            Box::new(self.into()),
            selection.into_iter().map(Into::into).collect(),
        )
    }

    fn not_in_selection<T: Into<Expression>>(self, selection: Vec<T>) -> Compare {
        Compare::NotIn(
            Box::new(self.into()),
            selection.into_iter().map(Into::into).collect(),
        )
    }

    fn like<T: Into<Expression>>(self, pattern: T) -> Compare {
        Compare::Like(Box::new(self.into()), Box::new(pattern.into()))
    }

    fn matches_regex<T: Into<Expression>>(self, pattern: T) -> Compare {
        Compare::Regex(Box::new(self.into()), Box::new(pattern.into()))
    }

    fn between<T: Into<Expression>, U: Into<Expression>>(self, low: T, high: U) -> Compare {
        Compare::Between(
            Box::new(self.into()),
            Box::new(low.into()),
            Box::new(high.into()),
        )
    }

    fn is_null(self) -> Compare {
        Compare::IsNull(Box::new(self.into()))
    }

    fn is_not_null(self) -> Compare {
        Compare::IsNotNull(Box::new(self.into()))
    }
}

impl Comparable for &str {
    fn equals<T: Into<Expression>>(self, comparison: T) -> Compare {
        Column::from(self).equals(comparison)
    }

    fn not_equals<T: Into<Expression>>(self, comparison: T) -> Compare {
        Column::from(self).not_equals(comparison)
    }

    fn less_than<T: Into<Expression>>(self, comparison: T) -> Compare {
        Column::from(self).less_than(comparison)
    }

    fn less_than_or_equals<T: Into<Expression>>(self, comparison: T) -> Compare {
        Column::from(self).less_than_or_equals(comparison)
    }

    fn greater_than<T: Into<Expression>>(self, comparison: T) -> Compare {
        Column::from(self).greater_than(comparison)
    }

    fn greater_than_or_equals<T: Into<Expression>>(self, comparison: T) -> Compare {
        Column::from(self).greater_than_or_equals(comparison)
    }

    fn in_selection<T: Into<Expression>>(self, selection: Vec<T>) -> Compare {
        Column::from(self).in_selection(selection)
    }

    fn not_in_selection<T: Into<Expression>>(self, selection: Vec<T>) -> Compare {
        Column::from(self).not_in_selection(selection)
    }

    fn like<T: Into<Expression>>(self, pattern: T) -> Compare {
        Column::from(self).like(pattern)
    }

    fn matches_regex<T: Into<Expression>>(self, pattern: T) -> Compare {
        Column::from(self).matches_regex(pattern)
    }

    fn between<T: Into<Expression>, U: Into<Expression>>(self, low: T, high: U) -> Compare {
        Column::from(self).between(low, high)
    }

    fn is_null(self) -> Compare {
        Column::from(self).is_null()
    }

    fn is_not_null(self) -> Compare {
        Column::from(self).is_not_null()
    }
}
