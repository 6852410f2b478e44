//! Value conversion between DataFlow values and the PostgreSQL wire format.

mod decimal;

use crate::{Error, ErrorKind, Result, Value};
use bigdecimal::BigDecimal;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::error::Error as StdError;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, ToSql, Type};

/// Wraps a borrowed [`Value`] for parameter binding.
pub(super) struct PgParam<'a>(pub &'a Value);

pub(super) fn params(values: &[Value]) -> Vec<PgParam<'_>> {
    values.iter().map(PgParam).collect()
}

impl std::fmt::Debug for PgParam<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PgParam({})", self.0.value_type())
    }
}

type BoxError = Box<dyn StdError + Sync + Send>;

impl ToSql for PgParam<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
        if self.0.is_null() {
            return Ok(IsNull::Yes);
        }

        match self.0 {
            // Integers follow the column's width, not the value's.
            Value::Int32(Some(i)) => {
                if *ty == Type::INT2 {
                    i16::try_from(*i)?.to_sql(ty, out)
                } else if *ty == Type::INT8 {
                    i64::from(*i).to_sql(ty, out)
                } else {
                    i.to_sql(ty, out)
                }
            }
            Value::Int64(Some(i)) => {
                if *ty == Type::INT4 {
                    i32::try_from(*i)?.to_sql(ty, out)
                } else if *ty == Type::INT2 {
                    i16::try_from(*i)?.to_sql(ty, out)
                } else {
                    i.to_sql(ty, out)
                }
            }
            Value::Float(Some(f)) => {
                if *ty == Type::FLOAT4 {
                    (*f as f32).to_sql(ty, out)
                } else {
                    f.to_sql(ty, out)
                }
            }
            Value::Text(Some(s)) => s.to_sql(ty, out),
            Value::Boolean(Some(b)) => b.to_sql(ty, out),
            Value::Bytes(Some(b)) => b.as_slice().to_sql(ty, out),
            Value::DateTime(Some(dt)) => {
                if *ty == Type::TIMESTAMP {
                    dt.naive_utc().to_sql(ty, out)
                } else {
                    dt.to_sql(ty, out)
                }
            }
            Value::Date(Some(d)) => d.to_sql(ty, out),
            Value::Uuid(Some(u)) => u.to_sql(ty, out),
            Value::Json(Some(j)) => j.to_sql(ty, out),
            Value::Numeric(Some(d)) => {
                decimal::encode(d, out)?;
                Ok(IsNull::No)
            }
            Value::Array(Some(values)) => {
                // Vector columns travel as their JSON encoding.
                let json: Vec<serde_json::Value> = values.iter().map(Value::to_json).collect();
                serde_json::Value::Array(json).to_sql(ty, out)
            }
            _ => unreachable!("null handled above"),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// A `NUMERIC` cell decoded through the binary protocol.
struct NumericCell(BigDecimal);

impl<'a> FromSql<'a> for NumericCell {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> std::result::Result<Self, BoxError> {
        decimal::decode(raw).map(NumericCell)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

pub(super) fn row_to_values(row: &tokio_postgres::Row) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(row.len());

    for (i, column) in row.columns().iter().enumerate() {
        values.push(column_to_value(row, i, column.name(), column.type_())?);
    }

    Ok(values)
}

fn column_to_value(row: &tokio_postgres::Row, i: usize, name: &str, ty: &Type) -> Result<Value> {
    let conversion_error = |e: tokio_postgres::Error| {
        Error::new(ErrorKind::ConversionError {
            column: name.to_owned(),
            reason: e.to_string(),
        })
    };

    let value = if *ty == Type::BOOL {
        Value::Boolean(row.try_get(i).map_err(conversion_error)?)
    } else if *ty == Type::INT2 {
        Value::Int32(
            row.try_get::<_, Option<i16>>(i)
                .map_err(conversion_error)?
                .map(i32::from),
        )
    } else if *ty == Type::INT4 {
        Value::Int32(row.try_get(i).map_err(conversion_error)?)
    } else if *ty == Type::INT8 {
        Value::Int64(row.try_get(i).map_err(conversion_error)?)
    } else if *ty == Type::OID {
        Value::Int64(
            row.try_get::<_, Option<u32>>(i)
                .map_err(conversion_error)?
                .map(i64::from),
        )
    } else if *ty == Type::FLOAT4 {
        Value::Float(
            row.try_get::<_, Option<f32>>(i)
                .map_err(conversion_error)?
                .map(f64::from),
        )
    } else if *ty == Type::FLOAT8 {
        Value::Float(row.try_get(i).map_err(conversion_error)?)
    } else if *ty == Type::NUMERIC {
        Value::Numeric(
            row.try_get::<_, Option<NumericCell>>(i)
                .map_err(conversion_error)?
                .map(|cell| cell.0),
        )
    } else if *ty == Type::BYTEA {
        Value::Bytes(row.try_get(i).map_err(conversion_error)?)
    } else if *ty == Type::TIMESTAMP {
        Value::DateTime(
            row.try_get::<_, Option<NaiveDateTime>>(i)
                .map_err(conversion_error)?
                .map(|naive| Utc.from_utc_datetime(&naive)),
        )
    } else if *ty == Type::TIMESTAMPTZ {
        Value::DateTime(row.try_get::<_, Option<DateTime<Utc>>>(i).map_err(conversion_error)?)
    } else if *ty == Type::DATE {
        Value::Date(row.try_get::<_, Option<NaiveDate>>(i).map_err(conversion_error)?)
    } else if *ty == Type::UUID {
        Value::Uuid(row.try_get(i).map_err(conversion_error)?)
    } else if *ty == Type::JSON || *ty == Type::JSONB {
        Value::Json(row.try_get::<_, Option<serde_json::Value>>(i).map_err(conversion_error)?)
    } else if *ty == Type::TEXT || *ty == Type::VARCHAR || *ty == Type::BPCHAR || *ty == Type::NAME {
        Value::Text(row.try_get(i).map_err(conversion_error)?)
    } else {
        return Err(Error::new(ErrorKind::ConversionError {
            column: name.to_owned(),
            reason: format!("unhandled PostgreSQL type `{ty}`"),
        }));
    };

    Ok(value)
}
