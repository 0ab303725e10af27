//! Scalar coercion
//!
//! Converts a driver-returned [`Value`] into the caller-requested type.
//! Null handling is uniform: `Option<T>` yields `None`, plain types yield
//! their zero value. Everything else goes through [`FromScalar::from_value`]
//! with invariant (locale-independent) parsing and checked narrowing.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::value::Value;

/// A type a scalar result can be coerced into.
///
/// Enumeration types implement this themselves: parse string values
/// case-insensitively and convert numeric values through the underlying
/// primitive (see the enum round-trip test for a worked example).
pub trait FromScalar: Sized {
    /// Value produced for a database NULL (the type's zero/absent value)
    fn from_null() -> Result<Self>;

    /// Convert a non-null value; fails with `InvalidConversion` on mismatch
    fn from_value(value: Value) -> Result<Self>;
}

/// Coerce a raw scalar into the requested type.
pub fn coerce<T: FromScalar>(value: Value) -> Result<T> {
    if value.is_null() {
        T::from_null()
    } else {
        T::from_value(value)
    }
}

fn mismatch(value: &Value, target: &str) -> Error {
    Error::invalid_conversion(format!(
        "cannot convert {} to {}",
        value.type_name(),
        target
    ))
}

impl<T: FromScalar> FromScalar for Option<T> {
    fn from_null() -> Result<Self> {
        Ok(None)
    }

    fn from_value(value: Value) -> Result<Self> {
        T::from_value(value).map(Some)
    }
}

impl FromScalar for Value {
    fn from_null() -> Result<Self> {
        Ok(Value::Null)
    }

    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl FromScalar for bool {
    fn from_null() -> Result<Self> {
        Ok(false)
    }

    fn from_value(value: Value) -> Result<Self> {
        value.as_bool().ok_or_else(|| mismatch(&value, "bool"))
    }
}

impl FromScalar for i16 {
    fn from_null() -> Result<Self> {
        Ok(0)
    }

    fn from_value(value: Value) -> Result<Self> {
        let wide = value.as_i64().ok_or_else(|| mismatch(&value, "i16"))?;
        i16::try_from(wide).map_err(|_| {
            Error::invalid_conversion(format!("value {} out of range for i16", wide))
        })
    }
}

impl FromScalar for i32 {
    fn from_null() -> Result<Self> {
        Ok(0)
    }

    fn from_value(value: Value) -> Result<Self> {
        let wide = value.as_i64().ok_or_else(|| mismatch(&value, "i32"))?;
        i32::try_from(wide).map_err(|_| {
            Error::invalid_conversion(format!("value {} out of range for i32", wide))
        })
    }
}

impl FromScalar for i64 {
    fn from_null() -> Result<Self> {
        Ok(0)
    }

    fn from_value(value: Value) -> Result<Self> {
        value.as_i64().ok_or_else(|| mismatch(&value, "i64"))
    }
}

impl FromScalar for f32 {
    fn from_null() -> Result<Self> {
        Ok(0.0)
    }

    fn from_value(value: Value) -> Result<Self> {
        value
            .as_f64()
            .map(|v| v as f32)
            .ok_or_else(|| mismatch(&value, "f32"))
    }
}

impl FromScalar for f64 {
    fn from_null() -> Result<Self> {
        Ok(0.0)
    }

    fn from_value(value: Value) -> Result<Self> {
        value.as_f64().ok_or_else(|| mismatch(&value, "f64"))
    }
}

impl FromScalar for Decimal {
    fn from_null() -> Result<Self> {
        Ok(Decimal::ZERO)
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Decimal(d) => Ok(d),
            Value::Int16(n) => Ok(Decimal::from(n)),
            Value::Int32(n) => Ok(Decimal::from(n)),
            Value::Int64(n) => Ok(Decimal::from(n)),
            Value::Float32(n) => Decimal::try_from(n)
                .map_err(|_| Error::invalid_conversion(format!("{} is not a valid decimal", n))),
            Value::Float64(n) => Decimal::try_from(n)
                .map_err(|_| Error::invalid_conversion(format!("{} is not a valid decimal", n))),
            Value::String(ref s) => s
                .trim()
                .parse()
                .map_err(|_| Error::invalid_conversion(format!("{:?} is not a valid decimal", s))),
            other => Err(mismatch(&other, "Decimal")),
        }
    }
}

impl FromScalar for String {
    fn from_null() -> Result<Self> {
        Ok(String::new())
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(s),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Int16(n) => Ok(n.to_string()),
            Value::Int32(n) => Ok(n.to_string()),
            Value::Int64(n) => Ok(n.to_string()),
            Value::Float32(n) => Ok(n.to_string()),
            Value::Float64(n) => Ok(n.to_string()),
            Value::Decimal(d) => Ok(d.to_string()),
            Value::Uuid(u) => Ok(u.to_string()),
            Value::Date(d) => Ok(d.to_string()),
            Value::Time(t) => Ok(t.to_string()),
            Value::DateTime(dt) => Ok(dt.to_string()),
            Value::DateTimeTz(dt) => Ok(dt.to_rfc3339()),
            Value::Json(j) => Ok(j.to_string()),
            other => Err(mismatch(&other, "String")),
        }
    }
}

impl FromScalar for Vec<u8> {
    fn from_null() -> Result<Self> {
        Ok(Vec::new())
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Bytes(b) => Ok(b),
            other => Err(mismatch(&other, "Vec<u8>")),
        }
    }
}

impl FromScalar for Uuid {
    fn from_null() -> Result<Self> {
        Ok(Uuid::nil())
    }

    fn from_value(value: Value) -> Result<Self> {
        value.as_uuid().ok_or_else(|| mismatch(&value, "Uuid"))
    }
}

impl FromScalar for NaiveDate {
    fn from_null() -> Result<Self> {
        Ok(NaiveDate::default())
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Date(d) => Ok(d),
            Value::DateTime(dt) => Ok(dt.date()),
            Value::String(ref s) => s
                .trim()
                .parse()
                .map_err(|_| Error::invalid_conversion(format!("{:?} is not a valid date", s))),
            other => Err(mismatch(&other, "NaiveDate")),
        }
    }
}

impl FromScalar for NaiveTime {
    fn from_null() -> Result<Self> {
        Ok(NaiveTime::default())
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Time(t) => Ok(t),
            Value::DateTime(dt) => Ok(dt.time()),
            Value::String(ref s) => s
                .trim()
                .parse()
                .map_err(|_| Error::invalid_conversion(format!("{:?} is not a valid time", s))),
            other => Err(mismatch(&other, "NaiveTime")),
        }
    }
}

impl FromScalar for NaiveDateTime {
    fn from_null() -> Result<Self> {
        Ok(NaiveDateTime::default())
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::DateTime(dt) => Ok(dt),
            Value::DateTimeTz(dt) => Ok(dt.naive_utc()),
            Value::String(ref s) => s.trim().parse().map_err(|_| {
                Error::invalid_conversion(format!("{:?} is not a valid timestamp", s))
            }),
            other => Err(mismatch(&other, "NaiveDateTime")),
        }
    }
}

impl FromScalar for DateTime<Utc> {
    fn from_null() -> Result<Self> {
        Ok(DateTime::<Utc>::default())
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::DateTimeTz(dt) => Ok(dt),
            Value::DateTime(dt) => Ok(dt.and_utc()),
            Value::String(ref s) => DateTime::parse_from_rfc3339(s.trim())
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| {
                    Error::invalid_conversion(format!("{:?} is not a valid timestamp", s))
                }),
            other => Err(mismatch(&other, "DateTime<Utc>")),
        }
    }
}

impl FromScalar for serde_json::Value {
    fn from_null() -> Result<Self> {
        Ok(serde_json::Value::Null)
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Json(j) => Ok(j),
            other => Err(mismatch(&other, "serde_json::Value")),
        }
    }
}
