//! Value conversion between DataFlow values and SQLite storage classes.
//!
//! SQLite stores five storage classes; the declared column type decides how
//! a stored integer or string comes back out (booleans, timestamps, uuids,
//! json and decimals all live in storage classes that need the decltype to
//! disambiguate).

use crate::{Error, ErrorKind, Result, Value};
use bigdecimal::{BigDecimal, FromPrimitive};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use dataflow_value::canonical_json;
use rusqlite::types::ValueRef;
use std::str::FromStr;

pub(super) fn value_to_sqlite(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as S;

    match value {
        Value::Int32(i) => i.map(|i| S::Integer(i64::from(i))).unwrap_or(S::Null),
        Value::Int64(i) => i.map(S::Integer).unwrap_or(S::Null),
        Value::Float(f) => f.map(S::Real).unwrap_or(S::Null),
        Value::Text(s) => s.clone().map(S::Text).unwrap_or(S::Null),
        Value::Boolean(b) => b.map(|b| S::Integer(i64::from(b))).unwrap_or(S::Null),
        Value::Bytes(b) => b.clone().map(S::Blob).unwrap_or(S::Null),
        Value::DateTime(dt) => dt.map(|dt| S::Text(dt.to_rfc3339())).unwrap_or(S::Null),
        Value::Date(d) => d.map(|d| S::Text(d.to_string())).unwrap_or(S::Null),
        Value::Uuid(u) => u.map(|u| S::Text(u.to_string())).unwrap_or(S::Null),
        Value::Json(j) => j.as_ref().map(|j| S::Text(canonical_json(j))).unwrap_or(S::Null),
        Value::Numeric(d) => d.as_ref().map(|d| S::Text(d.to_string())).unwrap_or(S::Null),
        Value::Array(values) => values
            .as_ref()
            .map(|vs| {
                let json: Vec<serde_json::Value> = vs.iter().map(Value::to_json).collect();
                S::Text(canonical_json(&serde_json::Value::Array(json)))
            })
            .unwrap_or(S::Null),
    }
}

/// The column-type families a SQLite decltype can announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeclFamily {
    Integer,
    Real,
    Text,
    Blob,
    Boolean,
    DateTime,
    Date,
    Uuid,
    Json,
    Decimal,
}

fn decl_family(decltype: Option<&str>) -> Option<DeclFamily> {
    let decl = decltype?.to_ascii_uppercase();

    let family = if decl.contains("BOOL") {
        DeclFamily::Boolean
    } else if decl.contains("DATETIME") || decl.contains("TIMESTAMP") {
        DeclFamily::DateTime
    } else if decl.contains("DATE") {
        DeclFamily::Date
    } else if decl.contains("UUID") {
        DeclFamily::Uuid
    } else if decl.contains("JSON") {
        DeclFamily::Json
    } else if decl.contains("DECIMAL") || decl.contains("NUMERIC") {
        DeclFamily::Decimal
    } else if decl.contains("INT") {
        DeclFamily::Integer
    } else if decl.contains("REAL") || decl.contains("FLOAT") || decl.contains("DOUBLE") {
        DeclFamily::Real
    } else if decl.contains("BLOB") {
        DeclFamily::Blob
    } else {
        DeclFamily::Text
    };

    Some(family)
}

pub(super) fn sqlite_to_value(
    row: &rusqlite::Row<'_>,
    index: usize,
    column: &str,
    decltype: Option<&str>,
) -> Result<Value> {
    let family = decl_family(decltype);
    let conversion_error = |reason: String| {
        Error::new(ErrorKind::ConversionError {
            column: column.to_owned(),
            reason,
        })
    };

    let value = match row.get_ref(index)? {
        ValueRef::Null => match family {
            Some(DeclFamily::Integer) => Value::null_int64(),
            Some(DeclFamily::Real) => Value::null_float(),
            Some(DeclFamily::Blob) => Value::null_bytes(),
            Some(DeclFamily::Boolean) => Value::null_boolean(),
            Some(DeclFamily::DateTime) => Value::null_datetime(),
            Some(DeclFamily::Date) => Value::null_date(),
            Some(DeclFamily::Uuid) => Value::null_uuid(),
            Some(DeclFamily::Json) => Value::null_json(),
            Some(DeclFamily::Decimal) => Value::null_numeric(),
            _ => Value::null_text(),
        },
        ValueRef::Integer(i) => match family {
            Some(DeclFamily::Boolean) => Value::boolean(i != 0),
            // Epoch seconds are accepted for time columns fed from outside.
            Some(DeclFamily::DateTime) => {
                let dt = Utc
                    .timestamp_opt(i, 0)
                    .single()
                    .ok_or_else(|| conversion_error(format!("{i} is out of timestamp range")))?;
                Value::datetime(dt)
            }
            Some(DeclFamily::Real) => Value::float(i as f64),
            Some(DeclFamily::Decimal) => Value::Numeric(BigDecimal::from_i64(i)),
            _ => Value::int64(i),
        },
        ValueRef::Real(f) => match family {
            Some(DeclFamily::Decimal) => Value::Numeric(BigDecimal::from_f64(f)),
            _ => Value::float(f),
        },
        ValueRef::Text(bytes) => {
            let s = std::str::from_utf8(bytes)
                .map_err(|e| conversion_error(format!("invalid UTF-8: {e}")))?;

            match family {
                Some(DeclFamily::DateTime) => Value::datetime(parse_datetime(s, &conversion_error)?),
                Some(DeclFamily::Date) => {
                    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
                        .map_err(|e| conversion_error(format!("not a date: {e}")))?;
                    Value::date(date)
                }
                Some(DeclFamily::Uuid) => {
                    let uuid = uuid::Uuid::parse_str(s)
                        .map_err(|e| conversion_error(format!("not a uuid: {e}")))?;
                    Value::uuid(uuid)
                }
                Some(DeclFamily::Json) => {
                    let json = serde_json::from_str(s)
                        .map_err(|e| conversion_error(format!("not valid json: {e}")))?;
                    Value::json(json)
                }
                Some(DeclFamily::Decimal) => {
                    let decimal = BigDecimal::from_str(s)
                        .map_err(|e| conversion_error(format!("not a decimal: {e}")))?;
                    Value::numeric(decimal)
                }
                _ => Value::text(s),
            }
        }
        ValueRef::Blob(bytes) => Value::bytes(bytes.to_vec()),
    };

    Ok(value)
}

fn parse_datetime(
    s: &str,
    conversion_error: &impl Fn(String) -> Error,
) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|e| conversion_error(format!("not a timestamp: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decltype_families() {
        assert_eq!(decl_family(Some("INTEGER")), Some(DeclFamily::Integer));
        assert_eq!(decl_family(Some("BIGINT")), Some(DeclFamily::Integer));
        assert_eq!(decl_family(Some("BOOLEAN")), Some(DeclFamily::Boolean));
        assert_eq!(decl_family(Some("DATETIME")), Some(DeclFamily::DateTime));
        assert_eq!(decl_family(Some("TIMESTAMP")), Some(DeclFamily::DateTime));
        assert_eq!(decl_family(Some("DATE")), Some(DeclFamily::Date));
        assert_eq!(decl_family(Some("DECIMAL(10,2)")), Some(DeclFamily::Decimal));
        assert_eq!(decl_family(Some("VARCHAR(255)")), Some(DeclFamily::Text));
        assert_eq!(decl_family(None), None);
    }

    #[test]
    fn datetime_parsing_accepts_rfc3339_and_sql_format() {
        let err = |m: String| Error::new(ErrorKind::ConversionError {
            column: "c".to_owned(),
            reason: m,
        });

        assert!(parse_datetime("2026-01-02T03:04:05+00:00", &err).is_ok());
        assert!(parse_datetime("2026-01-02 03:04:05", &err).is_ok());
        assert!(parse_datetime("not a date", &err).is_err());
    }
}
