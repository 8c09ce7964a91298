//! Conversion of driver values into application types.
//!
//! Every function is pure: it looks at one [`PgValue`] and either produces the
//! requested type or explains why it can't. NULL always converts to the
//! target's zero value. [`Query`](crate::Query) accessors turn an `Err` into a
//! panic; call these directly to handle the failure instead.

use chrono::{DateTime, NaiveDateTime, NaiveTime, TimeZone, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::pg::types::decode_hex;
use crate::pg::{Oid, PgValue};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("can't convert {from} to {target}")]
    Unsupported {
        from: &'static str,
        target: &'static str,
    },

    #[error("can't parse {text:?} as {target}")]
    Parse { text: String, target: &'static str },

    #[error("can't convert a column of type {declared} to duration")]
    NotATimeColumn { declared: Oid },
}

pub type DecodeResult<T> = Result<T, DecodeError>;

fn unsupported(value: &PgValue, target: &'static str) -> DecodeError {
    DecodeError::Unsupported {
        from: value.kind(),
        target,
    }
}

fn unparsable(text: &str, target: &'static str) -> DecodeError {
    DecodeError::Parse {
        text: text.to_string(),
        target,
    }
}

/// `0001-01-01 00:00:00 UTC`, the zero value of [`time`].
pub fn zero_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

// ============================================================================
// Numbers
// ============================================================================

fn integer(value: &PgValue, target: &'static str) -> DecodeResult<i64> {
    match value {
        PgValue::Null => Ok(0),
        PgValue::Bool(b) => Ok(*b as i64),
        PgValue::Int2(v) => Ok(*v as i64),
        PgValue::Int4(v) => Ok(*v as i64),
        PgValue::Int8(v) => Ok(*v),
        PgValue::Oid(v) => Ok(*v as i64),
        PgValue::Float4(v) => Ok(*v as i64),
        PgValue::Float8(v) => Ok(*v as i64),
        PgValue::Time(micros) => Ok(*micros),
        PgValue::Text(s) | PgValue::Numeric(s) => s.parse().map_err(|_| unparsable(s, target)),
        other => Err(unsupported(other, target)),
    }
}

/// Integer conversion; wider values wrap as a numeric cast does.
pub fn int(value: &PgValue) -> DecodeResult<i32> {
    integer(value, "int").map(|v| v as i32)
}

pub fn int64(value: &PgValue) -> DecodeResult<i64> {
    integer(value, "int64")
}

/// Negative values wrap as a numeric cast does.
pub fn uint64(value: &PgValue) -> DecodeResult<u64> {
    integer(value, "uint64").map(|v| v as u64)
}

pub fn float64(value: &PgValue) -> DecodeResult<f64> {
    match value {
        PgValue::Null => Ok(0.0),
        PgValue::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        PgValue::Int2(v) => Ok(*v as f64),
        PgValue::Int4(v) => Ok(*v as f64),
        PgValue::Int8(v) => Ok(*v as f64),
        PgValue::Oid(v) => Ok(*v as f64),
        PgValue::Float4(v) => Ok(*v as f64),
        PgValue::Float8(v) => Ok(*v),
        PgValue::Time(micros) => Ok(*micros as f64),
        PgValue::Text(s) | PgValue::Numeric(s) => {
            s.parse().map_err(|_| unparsable(s, "float64"))
        }
        other => Err(unsupported(other, "float64")),
    }
}

pub fn float32(value: &PgValue) -> DecodeResult<f32> {
    float64(value).map(|v| v as f32)
}

/// Booleans, numbers (`> 0` is true) and `true`/`yes`/`false`/`no`.
pub fn bool(value: &PgValue) -> DecodeResult<bool> {
    match value {
        PgValue::Null => Ok(false),
        PgValue::Bool(b) => Ok(*b),
        PgValue::Text(s) => match s.to_lowercase().as_str() {
            "true" | "yes" => Ok(true),
            "false" | "no" => Ok(false),
            _ => Err(unparsable(s, "bool")),
        },
        PgValue::Numeric(_)
        | PgValue::Int2(_)
        | PgValue::Int4(_)
        | PgValue::Int8(_)
        | PgValue::Oid(_)
        | PgValue::Float4(_)
        | PgValue::Float8(_) => float64(value)
            .map(|v| v > 0.0)
            .map_err(|_| unsupported(value, "bool")),
        other => Err(unsupported(other, "bool")),
    }
}

// ============================================================================
// Time
// ============================================================================

fn parse_time_text(text: &str) -> Option<DateTime<Utc>> {
    const PLAIN: &str = "%Y-%m-%d %H:%M:%S";
    const MILLIS: &str = "%Y-%m-%d %H:%M:%S%.f";
    const ZONED: &str = "%Y-%m-%d %H:%M:%S%.f %z";

    // Layout is chosen by length: 19 chars plain, 23 with milliseconds,
    // anything longer carries a zone offset.
    match text.len() {
        0..=19 => NaiveDateTime::parse_from_str(text, PLAIN)
            .ok()
            .map(|t| t.and_utc()),
        20..=23 => NaiveDateTime::parse_from_str(text, MILLIS)
            .ok()
            .map(|t| t.and_utc()),
        _ => DateTime::parse_from_str(text, ZONED)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
    }
}

/// Timestamps pass through (naive ones are taken as UTC), dates become
/// midnight, strings are parsed, and integers or times of day are read as
/// microseconds added to [`zero_time`].
pub fn time(value: &PgValue) -> DecodeResult<DateTime<Utc>> {
    let from_micros = |micros: i64| {
        zero_time()
            .checked_add_signed(chrono::Duration::microseconds(micros))
            .ok_or_else(|| unsupported(value, "time"))
    };

    match value {
        PgValue::Null => Ok(zero_time()),
        PgValue::Timestamptz(t) => Ok(*t),
        PgValue::Timestamp(t) => Ok(t.and_utc()),
        PgValue::Date(d) => Ok(d.and_time(NaiveTime::MIN).and_utc()),
        PgValue::Time(micros) => from_micros(*micros),
        PgValue::Int2(_) | PgValue::Int4(_) | PgValue::Int8(_) | PgValue::Oid(_) => {
            from_micros(integer(value, "time")?)
        }
        PgValue::Text(s) => parse_time_text(s).ok_or_else(|| unparsable(s, "time")),
        other => Err(unsupported(other, "time")),
    }
}

/// Only columns declared as `time` convert. An undeclared type yields zero.
pub fn duration(value: &PgValue, declared: Option<Oid>) -> DecodeResult<chrono::Duration> {
    match declared {
        None => Ok(chrono::Duration::zero()),
        Some(Oid::TIME) => integer(value, "duration").map(chrono::Duration::microseconds),
        Some(declared) => Err(DecodeError::NotATimeColumn { declared }),
    }
}

// ============================================================================
// Bytes and text
// ============================================================================

pub fn bytes(value: &PgValue) -> DecodeResult<Vec<u8>> {
    match value {
        PgValue::Null => Ok(Vec::new()),
        PgValue::Bytea(b) => Ok(b.clone()),
        PgValue::Text(s) => Ok(s.as_bytes().to_vec()),
        other => Err(unsupported(other, "bytes")),
    }
}

/// Never fails: text passes through, bytea holding hex text is decoded, and
/// everything else uses its display form.
pub fn string(value: &PgValue) -> String {
    match value {
        PgValue::Null => String::new(),
        PgValue::Text(s) => s.clone(),
        PgValue::Bytea(b) => match decode_hex(b) {
            Some(decoded) => String::from_utf8_lossy(&decoded).into_owned(),
            None => String::from_utf8_lossy(b).into_owned(),
        },
        other => other.to_string(),
    }
}

pub fn json(value: &PgValue) -> DecodeResult<serde_json::Value> {
    use serde_json::Value;

    match value {
        PgValue::Null => Ok(Value::Null),
        PgValue::Json(s) => serde_json::from_str(s).map_err(|_| unparsable(s, "json")),
        PgValue::Text(s) => Ok(serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone()))),
        PgValue::Bool(b) => Ok(Value::Bool(*b)),
        PgValue::Int2(_) | PgValue::Int4(_) | PgValue::Int8(_) | PgValue::Oid(_) => {
            Ok(Value::from(integer(value, "json")?))
        }
        PgValue::Float4(_) | PgValue::Float8(_) => Ok(Value::from(float64(value)?)),
        PgValue::Array { items, .. } => items
            .iter()
            .map(json)
            .collect::<DecodeResult<Vec<_>>>()
            .map(Value::Array),
        other => Ok(Value::String(other.to_string())),
    }
}

pub fn uuid(value: &PgValue) -> DecodeResult<Uuid> {
    match value {
        PgValue::Null => Ok(Uuid::nil()),
        PgValue::Uuid(u) => Ok(*u),
        PgValue::Text(s) => Uuid::parse_str(s).map_err(|_| unparsable(s, "uuid")),
        PgValue::Bytea(b) => Uuid::from_slice(b).map_err(|_| unsupported(value, "uuid")),
        other => Err(unsupported(other, "uuid")),
    }
}

// ============================================================================
// Arrays
// ============================================================================

/// Convert every element of an array, or promote a scalar to one element.
fn array<T>(value: &PgValue, convert: impl Fn(&PgValue) -> DecodeResult<T>) -> DecodeResult<Vec<T>> {
    match value {
        PgValue::Null => Ok(Vec::new()),
        PgValue::Array { items, .. } => items.iter().map(convert).collect(),
        scalar => Ok(vec![convert(scalar)?]),
    }
}

pub fn string_array(value: &PgValue) -> DecodeResult<Vec<String>> {
    array(value, |v| Ok(string(v)))
}

pub fn time_array(value: &PgValue) -> DecodeResult<Vec<DateTime<Utc>>> {
    array(value, time)
}

pub fn int_array(value: &PgValue) -> DecodeResult<Vec<i32>> {
    array(value, int)
}

pub fn int_array64(value: &PgValue) -> DecodeResult<Vec<i64>> {
    array(value, int64)
}
