//! Row and value model.
//!
//! A [`Row`] is a fixed-length positional vector of [`Value`]s keyed by the
//! current schema's column order. Rows are plain data: they carry no identity,
//! may be mutated in place inside a single-threaded transformer step, and are
//! owned by whichever stage currently holds them.
//!
//! Values either match their column's logical type, are the neutral
//! [`Value::Null`] marker, or ride as a string carrier (sources like CSV yield
//! strings and typing happens at the sink).

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PipeError, Result};

/// Logical column types understood by every reader, transformer and writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogicalType {
    Bool,
    Int32,
    Int64,
    Float32,
    Float64,
    Decimal,
    String,
    Bytes,
    Date,
    Timestamp,
    TimestampTz,
    Guid,
    Unknown,
}

impl LogicalType {
    /// Position in the lossless numeric upcast chain, or `None` when the
    /// type is not numeric. Int32 < Int64 < Float32 < Float64 < Decimal.
    pub fn numeric_rank(self) -> Option<u8> {
        match self {
            LogicalType::Int32 => Some(0),
            LogicalType::Int64 => Some(1),
            LogicalType::Float32 => Some(2),
            LogicalType::Float64 => Some(3),
            LogicalType::Decimal => Some(4),
            _ => None,
        }
    }
}

/// A single cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Decimal(Decimal),
    String(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Guid(Uuid),
}

impl Value {
    pub fn logical_type(&self) -> LogicalType {
        match self {
            Value::Null => LogicalType::Unknown,
            Value::Bool(_) => LogicalType::Bool,
            Value::Int32(_) => LogicalType::Int32,
            Value::Int64(_) => LogicalType::Int64,
            Value::Float32(_) => LogicalType::Float32,
            Value::Float64(_) => LogicalType::Float64,
            Value::Decimal(_) => LogicalType::Decimal,
            Value::String(_) => LogicalType::String,
            Value::Bytes(_) => LogicalType::Bytes,
            Value::Date(_) => LogicalType::Date,
            Value::Timestamp(_) => LogicalType::Timestamp,
            Value::TimestampTz(_) => LogicalType::TimestampTz,
            Value::Guid(_) => LogicalType::Guid,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Culture-invariant string form. Null renders as `NULL`; timestamps use
    /// `yyyy-MM-dd HH:mm:ss.fff`; floats use shortest round-trip notation.
    ///
    /// This is the canonical form shared by checksum chaining and upsert key
    /// construction, so its output must stay stable across platforms.
    pub fn canonical_text(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int32(v) => v.to_string(),
            Value::Int64(v) => v.to_string(),
            Value::Float32(v) => v.to_string(),
            Value::Float64(v) => v.to_string(),
            Value::Decimal(v) => v.to_string(),
            Value::String(s) => s.clone(),
            Value::Bytes(b) => hex_lower(b),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::Timestamp(t) => t.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            Value::TimestampTz(t) => t.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            Value::Guid(g) => g.to_string(),
        }
    }
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// A fixed-length positional row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row(pub Vec<Value>);

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Row(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, idx: usize) -> &Value {
        &self.0[idx]
    }

    pub fn set(&mut self, idx: usize, value: Value) {
        self.0[idx] = value;
    }
}

/// Contiguous rows sharing one schema, moved between stages as a unit.
pub type Batch = Vec<Row>;

/// Default number of rows per batch.
pub const DEFAULT_BATCH_SIZE: usize = 50_000;

/// Convert `value` into `target`, or fail with `TypeMismatch`.
///
/// Nulls and exact-type values pass through. Strings parse with
/// culture-invariant rules (ISO-8601 dates, dot decimal separator,
/// `true`/`false` booleans). Numeric conversions are allowed only upward
/// along Int32 < Int64 < Float32 < Float64 < Decimal.
pub fn coerce(value: Value, target: LogicalType) -> Result<Value> {
    if value.is_null() || target == LogicalType::Unknown {
        return Ok(value);
    }
    let from = value.logical_type();
    if from == target {
        return Ok(value);
    }

    if from == LogicalType::String {
        let s = match &value {
            Value::String(s) => s.as_str(),
            _ => unreachable!(),
        };
        return parse_string(s, target);
    }

    if let (Some(from_rank), Some(to_rank)) = (from.numeric_rank(), target.numeric_rank()) {
        if from_rank < to_rank {
            return upcast_numeric(value, target);
        }
        return Err(PipeError::TypeMismatch(format!(
            "narrowing conversion {from:?} -> {target:?} is not allowed"
        )));
    }

    // Timestamp widening to the zoned form is the only non-numeric upcast.
    if let (Value::Timestamp(t), LogicalType::TimestampTz) = (&value, target) {
        return Ok(Value::TimestampTz(Utc.from_utc_datetime(t)));
    }
    if target == LogicalType::String {
        return Ok(Value::String(value.canonical_text()));
    }

    Err(PipeError::TypeMismatch(format!(
        "cannot convert {from:?} to {target:?}"
    )))
}

fn upcast_numeric(value: Value, target: LogicalType) -> Result<Value> {
    let no_fit = |text: String| {
        PipeError::TypeMismatch(format!("value '{text}' does not fit {target:?}"))
    };
    Ok(match (value, target) {
        (Value::Int32(v), LogicalType::Int64) => Value::Int64(v as i64),
        (Value::Int32(v), LogicalType::Float32) => Value::Float32(v as f32),
        (Value::Int32(v), LogicalType::Float64) => Value::Float64(v as f64),
        (Value::Int32(v), LogicalType::Decimal) => Value::Decimal(Decimal::from(v)),
        (Value::Int64(v), LogicalType::Float32) => Value::Float32(v as f32),
        (Value::Int64(v), LogicalType::Float64) => Value::Float64(v as f64),
        (Value::Int64(v), LogicalType::Decimal) => Value::Decimal(Decimal::from(v)),
        (Value::Float32(v), LogicalType::Float64) => Value::Float64(v as f64),
        (Value::Float32(v), LogicalType::Decimal) => Decimal::from_f32(v)
            .map(Value::Decimal)
            .ok_or_else(|| no_fit(v.to_string()))?,
        (Value::Float64(v), LogicalType::Decimal) => Decimal::from_f64(v)
            .map(Value::Decimal)
            .ok_or_else(|| no_fit(v.to_string()))?,
        (v, t) => {
            return Err(PipeError::TypeMismatch(format!(
                "cannot upcast {:?} to {t:?}",
                v.logical_type()
            )))
        }
    })
}

fn parse_string(s: &str, target: LogicalType) -> Result<Value> {
    let bad = || {
        PipeError::TypeMismatch(format!(
            "cannot parse '{s}' as {target:?}"
        ))
    };
    Ok(match target {
        LogicalType::Bool => match s.to_ascii_lowercase().as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => return Err(bad()),
        },
        LogicalType::Int32 => Value::Int32(s.trim().parse().map_err(|_| bad())?),
        LogicalType::Int64 => Value::Int64(s.trim().parse().map_err(|_| bad())?),
        LogicalType::Float32 => Value::Float32(s.trim().parse().map_err(|_| bad())?),
        LogicalType::Float64 => Value::Float64(s.trim().parse().map_err(|_| bad())?),
        LogicalType::Decimal => Value::Decimal(s.trim().parse().map_err(|_| bad())?),
        LogicalType::String => Value::String(s.to_string()),
        LogicalType::Bytes => Value::Bytes(s.as_bytes().to_vec()),
        LogicalType::Date => Value::Date(
            NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| bad())?,
        ),
        LogicalType::Timestamp => Value::Timestamp(parse_naive_timestamp(s.trim()).ok_or_else(bad)?),
        LogicalType::TimestampTz => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s.trim()) {
                Value::TimestampTz(dt.with_timezone(&Utc))
            } else {
                let naive = parse_naive_timestamp(s.trim()).ok_or_else(bad)?;
                Value::TimestampTz(Utc.from_utc_datetime(&naive))
            }
        }
        LogicalType::Guid => Value::Guid(Uuid::parse_str(s.trim()).map_err(|_| bad())?),
        LogicalType::Unknown => Value::String(s.to_string()),
    })
}

fn parse_naive_timestamp(s: &str) -> Option<NaiveDateTime> {
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(t);
        }
    }
    // A bare date is a midnight timestamp.
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Derive the most specific logical type a raw value exhibits.
pub fn logical_type_of(value: &Value) -> LogicalType {
    value.logical_type()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nulls_pass_through_any_target() {
        for t in [LogicalType::Int64, LogicalType::Date, LogicalType::Guid] {
            assert_eq!(coerce(Value::Null, t).unwrap(), Value::Null);
        }
    }

    #[test]
    fn string_parsing_is_culture_invariant() {
        assert_eq!(
            coerce(Value::String("3.25".into()), LogicalType::Float64).unwrap(),
            Value::Float64(3.25)
        );
        assert_eq!(
            coerce(Value::String("TRUE".into()), LogicalType::Bool).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            coerce(Value::String("2024-02-29".into()), LogicalType::Date).unwrap(),
            Value::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap())
        );
        assert!(coerce(Value::String("1,5".into()), LogicalType::Float64).is_err());
    }

    #[test]
    fn numeric_upcasts_are_allowed_narrowing_fails() {
        assert_eq!(
            coerce(Value::Int32(7), LogicalType::Int64).unwrap(),
            Value::Int64(7)
        );
        assert_eq!(
            coerce(Value::Int64(7), LogicalType::Decimal).unwrap(),
            Value::Decimal(Decimal::from(7))
        );
        let err = coerce(Value::Int64(7), LogicalType::Int32).unwrap_err();
        assert!(matches!(err, PipeError::TypeMismatch(_)));
        let err = coerce(Value::Float64(1.5), LogicalType::Int64).unwrap_err();
        assert!(matches!(err, PipeError::TypeMismatch(_)));
    }

    #[test]
    fn canonical_text_forms() {
        assert_eq!(Value::Null.canonical_text(), "NULL");
        assert_eq!(Value::Float64(0.1).canonical_text(), "0.1");
        let ts = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_milli_opt(3, 4, 5, 60)
            .unwrap();
        assert_eq!(Value::Timestamp(ts).canonical_text(), "2024-01-02 03:04:05.060");
    }

    #[test]
    fn iso_timestamp_with_t_or_space() {
        let a = coerce(Value::String("2024-01-02T03:04:05".into()), LogicalType::Timestamp).unwrap();
        let b = coerce(Value::String("2024-01-02 03:04:05".into()), LogicalType::Timestamp).unwrap();
        assert_eq!(a, b);
    }
}
