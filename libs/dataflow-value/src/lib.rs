//! The runtime value type shared by every DataFlow crate.
//!
//! A [`Value`] carries one cell of data on its way into or out of the
//! database. Each variant wraps an `Option` so a typed `NULL` stays typed:
//! `Value::Int64(None)` is a null bigint, not a generic null.

mod masking;

pub use masking::{is_sensitive_field, mask_sensitive, MaskedParams, MaskedValue};

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The closed set of column type families a model field may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Int32,
    Int64,
    Float,
    Text,
    Boolean,
    Bytes,
    DateTime,
    Date,
    Uuid,
    Json,
    Numeric,
    Array,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Float => "float64",
            Self::Text => "string",
            Self::Boolean => "bool",
            Self::Bytes => "bytes",
            Self::DateTime => "timestamp",
            Self::Date => "date",
            Self::Uuid => "uuid",
            Self::Json => "json",
            Self::Numeric => "decimal",
            Self::Array => "vector",
        };
        f.write_str(s)
    }
}

/// A database value. The variant is the declared type, the inner `Option`
/// distinguishes `NULL` from a concrete value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int32(Option<i32>),
    Int64(Option<i64>),
    Float(Option<f64>),
    Text(Option<String>),
    Boolean(Option<bool>),
    Bytes(Option<Vec<u8>>),
    DateTime(Option<DateTime<Utc>>),
    Date(Option<NaiveDate>),
    Uuid(Option<Uuid>),
    Json(Option<serde_json::Value>),
    Numeric(Option<BigDecimal>),
    Array(Option<Vec<Value>>),
}

impl Value {
    pub fn int32(value: impl Into<i32>) -> Self {
        Self::Int32(Some(value.into()))
    }

    pub fn int64(value: impl Into<i64>) -> Self {
        Self::Int64(Some(value.into()))
    }

    pub fn float(value: f64) -> Self {
        Self::Float(Some(value))
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(Some(value.into()))
    }

    pub fn boolean(value: bool) -> Self {
        Self::Boolean(Some(value))
    }

    pub fn bytes(value: impl Into<Vec<u8>>) -> Self {
        Self::Bytes(Some(value.into()))
    }

    pub fn datetime(value: DateTime<Utc>) -> Self {
        Self::DateTime(Some(value))
    }

    pub fn date(value: NaiveDate) -> Self {
        Self::Date(Some(value))
    }

    pub fn uuid(value: Uuid) -> Self {
        Self::Uuid(Some(value))
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self::Json(Some(value))
    }

    pub fn numeric(value: BigDecimal) -> Self {
        Self::Numeric(Some(value))
    }

    pub fn array(values: impl Into<Vec<Value>>) -> Self {
        Self::Array(Some(values.into()))
    }

    pub const fn null_int32() -> Self {
        Self::Int32(None)
    }

    pub const fn null_int64() -> Self {
        Self::Int64(None)
    }

    pub const fn null_float() -> Self {
        Self::Float(None)
    }

    pub const fn null_text() -> Self {
        Self::Text(None)
    }

    pub const fn null_boolean() -> Self {
        Self::Boolean(None)
    }

    pub const fn null_bytes() -> Self {
        Self::Bytes(None)
    }

    pub const fn null_datetime() -> Self {
        Self::DateTime(None)
    }

    pub const fn null_date() -> Self {
        Self::Date(None)
    }

    pub const fn null_uuid() -> Self {
        Self::Uuid(None)
    }

    pub const fn null_json() -> Self {
        Self::Json(None)
    }

    pub const fn null_numeric() -> Self {
        Self::Numeric(None)
    }

    pub const fn null_array() -> Self {
        Self::Array(None)
    }

    /// A typed null of the given family.
    pub const fn null_of(tpe: ValueType) -> Self {
        match tpe {
            ValueType::Int32 => Self::null_int32(),
            ValueType::Int64 => Self::null_int64(),
            ValueType::Float => Self::null_float(),
            ValueType::Text => Self::null_text(),
            ValueType::Boolean => Self::null_boolean(),
            ValueType::Bytes => Self::null_bytes(),
            ValueType::DateTime => Self::null_datetime(),
            ValueType::Date => Self::null_date(),
            ValueType::Uuid => Self::null_uuid(),
            ValueType::Json => Self::null_json(),
            ValueType::Numeric => Self::null_numeric(),
            ValueType::Array => Self::null_array(),
        }
    }

    pub const fn value_type(&self) -> ValueType {
        match self {
            Self::Int32(_) => ValueType::Int32,
            Self::Int64(_) => ValueType::Int64,
            Self::Float(_) => ValueType::Float,
            Self::Text(_) => ValueType::Text,
            Self::Boolean(_) => ValueType::Boolean,
            Self::Bytes(_) => ValueType::Bytes,
            Self::DateTime(_) => ValueType::DateTime,
            Self::Date(_) => ValueType::Date,
            Self::Uuid(_) => ValueType::Uuid,
            Self::Json(_) => ValueType::Json,
            Self::Numeric(_) => ValueType::Numeric,
            Self::Array(_) => ValueType::Array,
        }
    }

    pub const fn is_null(&self) -> bool {
        match self {
            Self::Int32(v) => v.is_none(),
            Self::Int64(v) => v.is_none(),
            Self::Float(v) => v.is_none(),
            Self::Text(v) => v.is_none(),
            Self::Boolean(v) => v.is_none(),
            Self::Bytes(v) => v.is_none(),
            Self::DateTime(v) => v.is_none(),
            Self::Date(v) => v.is_none(),
            Self::Uuid(v) => v.is_none(),
            Self::Json(v) => v.is_none(),
            Self::Numeric(v) => v.is_none(),
            Self::Array(v) => v.is_none(),
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::Int32(v) => *v,
            Self::Int64(v) => v.and_then(|v| i32::try_from(v).ok()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int32(v) => v.map(i64::from),
            Self::Int64(v) => *v,
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => *v,
            Self::Int32(v) => v.map(f64::from),
            Self::Int64(v) => v.map(|v| v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => v.as_deref(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(v) => *v,
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(v) => v.as_deref(),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::DateTime(v) => *v,
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(v) => *v,
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(v) => *v,
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(v) => v.as_ref(),
            _ => None,
        }
    }

    pub fn as_numeric(&self) -> Option<&BigDecimal> {
        match self {
            Self::Numeric(v) => v.as_ref(),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(v) => v.as_deref(),
            _ => None,
        }
    }

    /// Converts into a JSON representation suitable for result payloads and
    /// cache entries. Bytes become base64, decimals and dates become strings.
    pub fn to_json(&self) -> serde_json::Value {
        use base64::Engine as _;
        use serde_json::Value as J;

        match self {
            Self::Int32(v) => v.map(J::from).unwrap_or(J::Null),
            Self::Int64(v) => v.map(J::from).unwrap_or(J::Null),
            Self::Float(v) => v.map(J::from).unwrap_or(J::Null),
            Self::Text(v) => v.clone().map(J::String).unwrap_or(J::Null),
            Self::Boolean(v) => v.map(J::from).unwrap_or(J::Null),
            Self::Bytes(v) => v
                .as_ref()
                .map(|b| J::String(base64::engine::general_purpose::STANDARD.encode(b)))
                .unwrap_or(J::Null),
            Self::DateTime(v) => v.map(|dt| J::String(dt.to_rfc3339())).unwrap_or(J::Null),
            Self::Date(v) => v.map(|d| J::String(d.to_string())).unwrap_or(J::Null),
            Self::Uuid(v) => v.map(|u| J::String(u.to_string())).unwrap_or(J::Null),
            Self::Json(v) => v.clone().unwrap_or(J::Null),
            Self::Numeric(v) => v
                .as_ref()
                .map(|d| J::String(d.to_string()))
                .unwrap_or(J::Null),
            Self::Array(v) => v
                .as_ref()
                .map(|vs| J::Array(vs.iter().map(Value::to_json).collect()))
                .unwrap_or(J::Null),
        }
    }
}

/// Canonical JSON encoding used when binding values into json-typed columns
/// and when fingerprinting filters. `serde_json` keeps map insertion order
/// (the `preserve_order` feature), so the output is stable per input.
pub fn canonical_json(value: &serde_json::Value) -> String {
    serde_json::to_string(value).expect("serializing an in-memory JSON value cannot fail")
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return f.write_str("NULL");
        }

        match self {
            Self::Int32(Some(v)) => write!(f, "{v}"),
            Self::Int64(Some(v)) => write!(f, "{v}"),
            Self::Float(Some(v)) => write!(f, "{v}"),
            Self::Text(Some(v)) => write!(f, "{v:?}"),
            Self::Boolean(Some(v)) => write!(f, "{v}"),
            Self::Bytes(Some(v)) => write!(f, "<{} bytes>", v.len()),
            Self::DateTime(Some(v)) => write!(f, "{}", v.to_rfc3339()),
            Self::Date(Some(v)) => write!(f, "{v}"),
            Self::Uuid(Some(v)) => write!(f, "{v}"),
            Self::Json(Some(v)) => write!(f, "{v}"),
            Self::Numeric(Some(v)) => write!(f, "{v}"),
            Self::Array(Some(vs)) => {
                f.write_str("[")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str("]")
            }
            _ => unreachable!("null handled above"),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::text(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::text(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::boolean(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Self::uuid(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::datetime(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn typed_nulls_keep_their_family() {
        assert!(Value::null_int64().is_null());
        assert_eq!(Value::null_int64().value_type(), ValueType::Int64);
        assert_ne!(Value::null_int64(), Value::null_int32());
    }

    #[test]
    fn integer_accessors_widen_but_do_not_lie() {
        assert_eq!(Value::int32(42).as_i64(), Some(42));
        assert_eq!(Value::int64(42i64).as_i32(), Some(42));
        assert_eq!(Value::int64(i64::MAX).as_i32(), None);
        assert_eq!(Value::text("42").as_i64(), None);
    }

    #[test]
    fn json_round_trip_is_canonical() {
        let v: serde_json::Value =
            serde_json::from_str(r#"{"b":1,"a":2,"nested":{"z":true,"y":null}}"#).unwrap();
        // Insertion order preserved, not alphabetized.
        assert_eq!(canonical_json(&v), r#"{"b":1,"a":2,"nested":{"z":true,"y":null}}"#);
    }

    #[test]
    fn to_json_renders_special_types_as_strings() {
        let dec = BigDecimal::from_str("12.345").unwrap();
        assert_eq!(Value::numeric(dec).to_json(), serde_json::json!("12.345"));
        assert_eq!(Value::bytes(vec![1u8, 2, 3]).to_json(), serde_json::json!("AQID"));
        assert_eq!(Value::null_text().to_json(), serde_json::Value::Null);
    }

    #[test]
    fn display_truncates_bytes() {
        assert_eq!(Value::bytes(vec![0u8; 16]).to_string(), "<16 bytes>");
        assert_eq!(Value::null_bytes().to_string(), "NULL");
    }
}
