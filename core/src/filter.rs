//! MongoDB-style filter documents.
//!
//! Filters are a data language: they parse once, at `add_node` time, into a
//! tagged tree. Translation to a SQL condition tree happens per execution
//! with the model's field types in hand. Key traversal follows insertion
//! order everywhere, so the same document always produces the same SQL and
//! the same cache fingerprint.

use crate::{Error, ErrorKind, Result};
use dataflow_model::{FieldDescriptor, ModelDescriptor};
use dataflow_sql::ast::{Column, Comparable, ConditionTree, Expression};
use dataflow_value::{Value, ValueType};
use serde_json::Value as Json;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `{}` — matches every row, explicitly.
    All,
    Condition { field: String, ops: Vec<FilterOp> },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Nor(Vec<Filter>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterOp {
    Eq(Json),
    Ne(Json),
    Lt(Json),
    Lte(Json),
    Gt(Json),
    Gte(Json),
    In(Vec<Json>),
    Nin(Vec<Json>),
    Regex(String),
    Like(String),
    Exists(bool),
    Not(Vec<FilterOp>),
    Between(Json, Json),
}

impl Filter {
    /// Matches every row; the explicit empty filter.
    pub fn is_match_all(&self) -> bool {
        matches!(self, Self::All)
    }

    /// Parses a filter document. Unknown operators, wrong arities, empty
    /// `$in`/`$nin` lists and non-identifier field names are rejected here,
    /// never at execution time.
    pub fn parse(document: &Json) -> Result<Self> {
        let Json::Object(map) = document else {
            return Err(Error::invalid_filter("a filter must be a JSON object"));
        };

        if map.is_empty() {
            return Ok(Self::All);
        }

        let mut parts = Vec::with_capacity(map.len());

        for (key, value) in map {
            let part = match key.as_str() {
                "$and" => Self::And(Self::parse_logical_array(key, value)?),
                "$or" => Self::Or(Self::parse_logical_array(key, value)?),
                "$nor" => Self::Nor(Self::parse_logical_array(key, value)?),
                other if other.starts_with('$') => {
                    return Err(Error::invalid_filter(format!(
                        "unknown logical operator `{other}`"
                    )));
                }
                field => {
                    if !dataflow_sql::validate::is_valid_identifier(field) {
                        return Err(Error::invalid_filter(format!(
                            "`{field}` is not a valid field name"
                        )));
                    }
                    Self::Condition {
                        field: field.to_owned(),
                        ops: Self::parse_field_ops(field, value)?,
                    }
                }
            };
            parts.push(part);
        }

        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            Self::And(parts)
        })
    }

    fn parse_logical_array(op: &str, value: &Json) -> Result<Vec<Filter>> {
        let Json::Array(array) = value else {
            return Err(Error::invalid_filter(format!("`{op}` takes an array")));
        };

        if array.is_empty() {
            return Err(Error::invalid_filter(format!("`{op}` takes a non-empty array")));
        }

        array.iter().map(Self::parse).collect()
    }

    fn parse_field_ops(field: &str, value: &Json) -> Result<Vec<FilterOp>> {
        match value {
            // Operator subdocument: every key must be an operator.
            Json::Object(ops) if ops.keys().all(|k| k.starts_with('$')) && !ops.is_empty() => {
                ops.iter().map(|(op, v)| FilterOp::parse(field, op, v)).collect()
            }
            // Mixing operators and literal keys is ambiguous.
            Json::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                Err(Error::invalid_filter(format!(
                    "`{field}` mixes operators with literal object keys"
                )))
            }
            // Direct equality, including equality against an object.
            other => Ok(vec![FilterOp::Eq(other.clone())]),
        }
    }

    /// The stable textual form used in cache fingerprints.
    pub fn canonical(&self) -> String {
        dataflow_value::canonical_json(&self.to_canonical_json())
    }

    fn to_canonical_json(&self) -> Json {
        match self {
            Self::All => serde_json::json!({}),
            Self::Condition { field, ops } => {
                let mut op_map = serde_json::Map::new();
                for op in ops {
                    let (name, value) = op.canonical_parts();
                    op_map.insert(name.to_owned(), value);
                }

                let mut condition = serde_json::Map::new();
                condition.insert(field.clone(), Json::Object(op_map));
                Json::Object(condition)
            }
            Self::And(parts) => logical_json("$and", parts),
            Self::Or(parts) => logical_json("$or", parts),
            Self::Nor(parts) => logical_json("$nor", parts),
        }
    }

    /// Lowers into a SQL condition tree, coercing literals to the model's
    /// declared field types.
    pub fn to_conditions(&self, model: &ModelDescriptor) -> Result<ConditionTree> {
        match self {
            Self::All => Ok(ConditionTree::NoCondition),
            Self::Condition { field, ops } => {
                let descriptor = resolve_field(model, field)?;
                let mut expressions: Vec<Expression> = Vec::with_capacity(ops.len());
                for op in ops {
                    expressions.push(op.to_expression(field, &descriptor)?);
                }
                Ok(if expressions.len() == 1 {
                    ConditionTree::Single(Box::new(expressions.remove(0)))
                } else {
                    ConditionTree::And(expressions)
                })
            }
            Self::And(parts) => Ok(ConditionTree::And(subtrees(parts, model)?)),
            Self::Or(parts) => Ok(ConditionTree::Or(subtrees(parts, model)?)),
            Self::Nor(parts) => {
                // NOR is NOT (a OR b OR …).
                let inner: Expression = ConditionTree::Or(subtrees(parts, model)?).into();
                Ok(ConditionTree::Not(Box::new(inner)))
            }
        }
    }

    /// In-memory evaluation against a JSON row. This is the reference
    /// semantics the SQL translation is tested against.
    pub fn matches(&self, row: &serde_json::Map<String, Json>) -> bool {
        match self {
            Self::All => true,
            Self::Condition { field, ops } => {
                let cell = row.get(field).unwrap_or(&Json::Null);
                ops.iter().all(|op| op.matches(cell))
            }
            Self::And(parts) => parts.iter().all(|p| p.matches(row)),
            Self::Or(parts) => parts.iter().any(|p| p.matches(row)),
            Self::Nor(parts) => !parts.iter().any(|p| p.matches(row)),
        }
    }
}

fn logical_json(op: &str, parts: &[Filter]) -> Json {
    let mut map = serde_json::Map::new();
    map.insert(
        op.to_owned(),
        Json::Array(parts.iter().map(Filter::to_canonical_json).collect()),
    );
    Json::Object(map)
}

fn subtrees(parts: &[Filter], model: &ModelDescriptor) -> Result<Vec<Expression>> {
    parts
        .iter()
        .map(|part| {
            part.to_conditions(model).map(|tree| match tree {
                // Unwrapped single conditions render without extra parens.
                ConditionTree::Single(expression) => *expression,
                other => Expression::from(other),
            })
        })
        .collect()
}

fn resolve_field(model: &ModelDescriptor, field: &str) -> Result<FieldDescriptor> {
    model
        .all_fields()
        .into_iter()
        .find(|f| f.name == field)
        .ok_or_else(|| {
            Error::invalid_filter(format!("model `{}` has no field `{field}`", model.name))
        })
}

impl FilterOp {
    fn parse(field: &str, op: &str, value: &Json) -> Result<Self> {
        let array = |value: &Json| -> Result<Vec<Json>> {
            match value {
                Json::Array(items) if !items.is_empty() => Ok(items.clone()),
                Json::Array(_) => Err(Error::invalid_filter(format!(
                    "`{op}` on `{field}` with an empty set never matches; this is almost always a bug"
                ))),
                _ => Err(Error::invalid_filter(format!("`{op}` on `{field}` takes an array"))),
            }
        };

        match op {
            "$eq" => Ok(Self::Eq(value.clone())),
            "$ne" => Ok(Self::Ne(value.clone())),
            "$lt" => Ok(Self::Lt(value.clone())),
            "$lte" => Ok(Self::Lte(value.clone())),
            "$gt" => Ok(Self::Gt(value.clone())),
            "$gte" => Ok(Self::Gte(value.clone())),
            "$in" => Ok(Self::In(array(value)?)),
            "$nin" => Ok(Self::Nin(array(value)?)),
            "$regex" => match value {
                Json::String(pattern) => Ok(Self::Regex(pattern.clone())),
                _ => Err(Error::invalid_filter(format!("`$regex` on `{field}` takes a string"))),
            },
            "$like" => match value {
                Json::String(pattern) => Ok(Self::Like(pattern.clone())),
                _ => Err(Error::invalid_filter(format!("`$like` on `{field}` takes a string"))),
            },
            "$exists" => match value {
                Json::Bool(exists) => Ok(Self::Exists(*exists)),
                _ => Err(Error::invalid_filter(format!("`$exists` on `{field}` takes a bool"))),
            },
            "$not" => match value {
                Json::Object(_) => {
                    let ops = Filter::parse_field_ops(field, value)?;
                    Ok(Self::Not(ops))
                }
                _ => Err(Error::invalid_filter(format!(
                    "`$not` on `{field}` takes an operator object"
                ))),
            },
            "$between" => match value {
                Json::Array(bounds) if bounds.len() == 2 => {
                    Ok(Self::Between(bounds[0].clone(), bounds[1].clone()))
                }
                _ => Err(Error::invalid_filter(format!(
                    "`$between` on `{field}` takes a [low, high] pair"
                ))),
            },
            other => Err(Error::invalid_filter(format!(
                "unknown operator `{other}` on `{field}`"
            ))),
        }
    }

    fn canonical_parts(&self) -> (&'static str, Json) {
        match self {
            Self::Eq(v) => ("$eq", v.clone()),
            Self::Ne(v) => ("$ne", v.clone()),
            Self::Lt(v) => ("$lt", v.clone()),
            Self::Lte(v) => ("$lte", v.clone()),
            Self::Gt(v) => ("$gt", v.clone()),
            Self::Gte(v) => ("$gte", v.clone()),
            Self::In(vs) => ("$in", Json::Array(vs.clone())),
            Self::Nin(vs) => ("$nin", Json::Array(vs.clone())),
            Self::Regex(p) => ("$regex", Json::String(p.clone())),
            Self::Like(p) => ("$like", Json::String(p.clone())),
            Self::Exists(b) => ("$exists", Json::Bool(*b)),
            Self::Not(ops) => {
                let mut map = serde_json::Map::new();
                for op in ops {
                    let (name, value) = op.canonical_parts();
                    map.insert(name.to_owned(), value);
                }
                ("$not", Json::Object(map))
            }
            Self::Between(low, high) => ("$between", Json::Array(vec![low.clone(), high.clone()])),
        }
    }

    fn to_expression(&self, field: &str, descriptor: &FieldDescriptor) -> Result<Expression> {
        let column = Column::new(field);
        let coerce = |json: &Json| coerce_json(json, descriptor.tpe.value_type(), field);

        let expression: Expression = match self {
            Self::Eq(v) => column.equals(coerce(v)?).into(),
            Self::Ne(v) => column.not_equals(coerce(v)?).into(),
            Self::Lt(v) => column.less_than(coerce(v)?).into(),
            Self::Lte(v) => column.less_than_or_equals(coerce(v)?).into(),
            Self::Gt(v) => column.greater_than(coerce(v)?).into(),
            Self::Gte(v) => column.greater_than_or_equals(coerce(v)?).into(),
            Self::In(vs) => {
                let values: Result<Vec<Value>> = vs.iter().map(coerce).collect();
                column.in_selection(values?).into()
            }
            Self::Nin(vs) => {
                let values: Result<Vec<Value>> = vs.iter().map(coerce).collect();
                column.not_in_selection(values?).into()
            }
            Self::Regex(pattern) => column.matches_regex(Value::text(pattern.clone())).into(),
            Self::Like(pattern) => column.like(Value::text(pattern.clone())).into(),
            Self::Exists(true) => column.is_not_null().into(),
            Self::Exists(false) => column.is_null().into(),
            Self::Not(ops) => {
                let mut expressions = Vec::with_capacity(ops.len());
                for op in ops {
                    expressions.push(op.to_expression(field, descriptor)?);
                }
                let inner: Expression = if expressions.len() == 1 {
                    expressions.remove(0)
                } else {
                    ConditionTree::And(expressions).into()
                };
                ConditionTree::Not(Box::new(inner)).into()
            }
            Self::Between(low, high) => column.between(coerce(low)?, coerce(high)?).into(),
        };

        Ok(expression)
    }

    fn matches(&self, cell: &Json) -> bool {
        match self {
            Self::Eq(v) => json_eq(cell, v),
            Self::Ne(v) => !json_eq(cell, v),
            Self::Lt(v) => json_cmp(cell, v).map(|o| o.is_lt()).unwrap_or(false),
            Self::Lte(v) => json_cmp(cell, v).map(|o| o.is_le()).unwrap_or(false),
            Self::Gt(v) => json_cmp(cell, v).map(|o| o.is_gt()).unwrap_or(false),
            Self::Gte(v) => json_cmp(cell, v).map(|o| o.is_ge()).unwrap_or(false),
            Self::In(vs) => vs.iter().any(|v| json_eq(cell, v)),
            Self::Nin(vs) => !vs.iter().any(|v| json_eq(cell, v)),
            Self::Regex(pattern) => match (cell.as_str(), regex::Regex::new(pattern)) {
                (Some(text), Ok(re)) => re.is_match(text),
                _ => false,
            },
            Self::Like(pattern) => match cell.as_str() {
                Some(text) => like_matches(pattern, text),
                None => false,
            },
            Self::Exists(expected) => (!cell.is_null()) == *expected,
            Self::Not(ops) => !ops.iter().all(|op| op.matches(cell)),
            Self::Between(low, high) => {
                json_cmp(cell, low).map(|o| o.is_ge()).unwrap_or(false)
                    && json_cmp(cell, high).map(|o| o.is_le()).unwrap_or(false)
            }
        }
    }
}

/// SQL `LIKE` with `%` and `_`, case-sensitive.
fn like_matches(pattern: &str, text: &str) -> bool {
    let mut regex_pattern = String::with_capacity(pattern.len() + 2);
    regex_pattern.push('^');
    for c in pattern.chars() {
        match c {
            '%' => regex_pattern.push_str(".*"),
            '_' => regex_pattern.push('.'),
            other => regex_pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex_pattern.push('$');

    regex::Regex::new(&regex_pattern)
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}

fn json_eq(a: &Json, b: &Json) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => a == b,
    }
}

fn json_cmp(a: &Json, b: &Json) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Json::Number(_), Json::Number(_)) => a.as_f64().partial_cmp(&b.as_f64()),
        (Json::String(a), Json::String(b)) => Some(a.cmp(b)),
        (Json::Bool(a), Json::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Coerces a JSON literal into the field's typed [`Value`].
pub fn coerce_json(json: &Json, target: ValueType, field: &str) -> crate::Result<Value> {
    use chrono::{DateTime, NaiveDate};

    if json.is_null() {
        return Ok(Value::null_of(target));
    }

    let mismatch = || {
        Error::new(ErrorKind::Validation(format!(
            "value for `{field}` does not fit declared type {target}: {json}"
        )))
    };

    let value = match target {
        ValueType::Int32 => Value::Int32(Some(
            json.as_i64()
                .and_then(|i| i32::try_from(i).ok())
                .ok_or_else(mismatch)?,
        )),
        ValueType::Int64 => Value::Int64(Some(json.as_i64().ok_or_else(mismatch)?)),
        ValueType::Float => Value::Float(Some(json.as_f64().ok_or_else(mismatch)?)),
        ValueType::Text => Value::Text(Some(json.as_str().ok_or_else(mismatch)?.to_owned())),
        ValueType::Boolean => Value::Boolean(Some(json.as_bool().ok_or_else(mismatch)?)),
        ValueType::Bytes => {
            use base64::Engine as _;
            let text = json.as_str().ok_or_else(mismatch)?;
            Value::Bytes(Some(
                base64::engine::general_purpose::STANDARD
                    .decode(text)
                    .map_err(|_| mismatch())?,
            ))
        }
        ValueType::DateTime => {
            let text = json.as_str().ok_or_else(mismatch)?;
            let parsed = DateTime::parse_from_rfc3339(text).map_err(|_| mismatch())?;
            Value::datetime(parsed.with_timezone(&chrono::Utc))
        }
        ValueType::Date => {
            let text = json.as_str().ok_or_else(mismatch)?;
            Value::date(NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|_| mismatch())?)
        }
        ValueType::Uuid => {
            let text = json.as_str().ok_or_else(mismatch)?;
            Value::uuid(uuid::Uuid::parse_str(text).map_err(|_| mismatch())?)
        }
        ValueType::Json => Value::json(json.clone()),
        ValueType::Numeric => {
            use std::str::FromStr;
            let decimal = match json {
                Json::String(s) => bigdecimal::BigDecimal::from_str(s).map_err(|_| mismatch())?,
                Json::Number(n) => {
                    bigdecimal::BigDecimal::from_str(&n.to_string()).map_err(|_| mismatch())?
                }
                _ => return Err(mismatch()),
            };
            Value::numeric(decimal)
        }
        ValueType::Array => match json {
            Json::Array(items) => Value::array(
                items
                    .iter()
                    .map(|item| item.as_f64().map(Value::float).ok_or_else(mismatch))
                    .collect::<crate::Result<Vec<Value>>>()?,
            ),
            _ => return Err(mismatch()),
        },
    };

    Ok(value)
}

#[cfg(test)]
mod tests;
