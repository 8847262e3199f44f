//! Row/Arrow interchange for the columnar file connectors.

use std::sync::Arc;

use arrow_array::builder::{
    BinaryBuilder, BooleanBuilder, Date32Builder, Float32Builder, Float64Builder, Int32Builder,
    Int64Builder, StringBuilder, TimestampMicrosecondBuilder,
};
use arrow_array::{
    Array, ArrayRef, BinaryArray, BooleanArray, Date32Array, Date64Array, Decimal128Array,
    Float32Array, Float64Array, Int16Array, Int32Array, Int64Array, Int8Array, LargeStringArray,
    RecordBatch, StringArray, TimestampMicrosecondArray, TimestampMillisecondArray,
    TimestampNanosecondArray, TimestampSecondArray, UInt32Array,
};
use arrow_schema::{DataType, Field, Schema as ArrowSchema, TimeUnit};
use chrono::{DateTime, Duration, NaiveDate};

use rowpipe_core::error::{PipeError, Result};
use rowpipe_core::row::{coerce, Batch, LogicalType, Row, Value};
use rowpipe_core::schema::Column;

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).expect("unix epoch")
}

pub fn to_arrow_field(column: &Column) -> Field {
    let data_type = match column.logical_type {
        LogicalType::Bool => DataType::Boolean,
        LogicalType::Int32 => DataType::Int32,
        LogicalType::Int64 => DataType::Int64,
        LogicalType::Float32 => DataType::Float32,
        LogicalType::Float64 => DataType::Float64,
        LogicalType::Date => DataType::Date32,
        LogicalType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, None),
        LogicalType::TimestampTz => {
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
        }
        LogicalType::Bytes => DataType::Binary,
        // Decimals, guids and string carriers travel as text.
        LogicalType::Decimal
        | LogicalType::String
        | LogicalType::Guid
        | LogicalType::Unknown => DataType::Utf8,
    };
    Field::new(&column.name, data_type, column.nullable)
}

pub fn to_arrow_schema(columns: &[Column]) -> ArrowSchema {
    ArrowSchema::new(columns.iter().map(to_arrow_field).collect::<Vec<_>>())
}

pub fn columns_from_arrow(schema: &ArrowSchema) -> Vec<Column> {
    schema
        .fields()
        .iter()
        .map(|field| {
            let logical_type = match field.data_type() {
                DataType::Boolean => LogicalType::Bool,
                DataType::Int8 | DataType::Int16 | DataType::Int32 => LogicalType::Int32,
                DataType::Int64 | DataType::UInt32 => LogicalType::Int64,
                DataType::Float32 => LogicalType::Float32,
                DataType::Float64 => LogicalType::Float64,
                DataType::Decimal128(_, _) => LogicalType::Decimal,
                DataType::Utf8 | DataType::LargeUtf8 => LogicalType::String,
                DataType::Binary => LogicalType::Bytes,
                DataType::Date32 | DataType::Date64 => LogicalType::Date,
                DataType::Timestamp(_, None) => LogicalType::Timestamp,
                DataType::Timestamp(_, Some(_)) => LogicalType::TimestampTz,
                _ => LogicalType::Unknown,
            };
            let mut column = Column::new(field.name(), logical_type);
            column.nullable = field.is_nullable();
            column
        })
        .collect()
}

/// Build one Arrow record batch from rows, coercing each cell to its
/// column's logical type.
pub fn rows_to_batch(columns: &[Column], rows: &[Row]) -> Result<RecordBatch> {
    let schema = Arc::new(to_arrow_schema(columns));
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.len());
    for (idx, column) in columns.iter().enumerate() {
        arrays.push(build_array(column, rows, idx)?);
    }
    RecordBatch::try_new(schema, arrays)
        .map_err(|e| PipeError::Other(anyhow::anyhow!("record batch assembly failed: {e}")))
}

fn build_array(column: &Column, rows: &[Row], idx: usize) -> Result<ArrayRef> {
    let cell = |row: &Row| -> Result<Value> { coerce(row.get(idx).clone(), column.logical_type) };

    Ok(match column.logical_type {
        LogicalType::Bool => {
            let mut b = BooleanBuilder::with_capacity(rows.len());
            for row in rows {
                match cell(row)? {
                    Value::Null => b.append_null(),
                    Value::Bool(v) => b.append_value(v),
                    other => return Err(unexpected(column, &other)),
                }
            }
            Arc::new(b.finish())
        }
        LogicalType::Int32 => {
            let mut b = Int32Builder::with_capacity(rows.len());
            for row in rows {
                match cell(row)? {
                    Value::Null => b.append_null(),
                    Value::Int32(v) => b.append_value(v),
                    other => return Err(unexpected(column, &other)),
                }
            }
            Arc::new(b.finish())
        }
        LogicalType::Int64 => {
            let mut b = Int64Builder::with_capacity(rows.len());
            for row in rows {
                match cell(row)? {
                    Value::Null => b.append_null(),
                    Value::Int64(v) => b.append_value(v),
                    other => return Err(unexpected(column, &other)),
                }
            }
            Arc::new(b.finish())
        }
        LogicalType::Float32 => {
            let mut b = Float32Builder::with_capacity(rows.len());
            for row in rows {
                match cell(row)? {
                    Value::Null => b.append_null(),
                    Value::Float32(v) => b.append_value(v),
                    other => return Err(unexpected(column, &other)),
                }
            }
            Arc::new(b.finish())
        }
        LogicalType::Float64 => {
            let mut b = Float64Builder::with_capacity(rows.len());
            for row in rows {
                match cell(row)? {
                    Value::Null => b.append_null(),
                    Value::Float64(v) => b.append_value(v),
                    other => return Err(unexpected(column, &other)),
                }
            }
            Arc::new(b.finish())
        }
        LogicalType::Date => {
            let mut b = Date32Builder::with_capacity(rows.len());
            for row in rows {
                match cell(row)? {
                    Value::Null => b.append_null(),
                    Value::Date(d) => {
                        b.append_value((d - epoch()).num_days() as i32);
                    }
                    other => return Err(unexpected(column, &other)),
                }
            }
            Arc::new(b.finish())
        }
        LogicalType::Timestamp => {
            let mut b = TimestampMicrosecondBuilder::with_capacity(rows.len());
            for row in rows {
                match cell(row)? {
                    Value::Null => b.append_null(),
                    Value::Timestamp(t) => b.append_value(t.and_utc().timestamp_micros()),
                    other => return Err(unexpected(column, &other)),
                }
            }
            Arc::new(b.finish())
        }
        LogicalType::TimestampTz => {
            let mut b =
                TimestampMicrosecondBuilder::with_capacity(rows.len()).with_timezone("UTC");
            for row in rows {
                match cell(row)? {
                    Value::Null => b.append_null(),
                    Value::TimestampTz(t) => b.append_value(t.timestamp_micros()),
                    other => return Err(unexpected(column, &other)),
                }
            }
            Arc::new(b.finish())
        }
        LogicalType::Bytes => {
            let mut b = BinaryBuilder::new();
            for row in rows {
                match cell(row)? {
                    Value::Null => b.append_null(),
                    Value::Bytes(v) => b.append_value(&v),
                    other => return Err(unexpected(column, &other)),
                }
            }
            Arc::new(b.finish())
        }
        LogicalType::Decimal | LogicalType::String | LogicalType::Guid | LogicalType::Unknown => {
            let mut b = StringBuilder::new();
            for row in rows {
                let value = row.get(idx);
                if value.is_null() {
                    b.append_null();
                } else {
                    b.append_value(value.canonical_text());
                }
            }
            Arc::new(b.finish())
        }
    })
}

fn unexpected(column: &Column, value: &Value) -> PipeError {
    PipeError::TypeMismatch(format!(
        "column '{}': coercion produced {:?} instead of {:?}",
        column.name,
        value.logical_type(),
        column.logical_type
    ))
}

/// Flatten an Arrow record batch back into rows.
pub fn batch_to_rows(batch: &RecordBatch) -> Result<Batch> {
    let mut rows: Batch = (0..batch.num_rows())
        .map(|_| Row::new(Vec::with_capacity(batch.num_columns())))
        .collect();
    for column in batch.columns() {
        append_column(column, &mut rows)?;
    }
    Ok(rows)
}

fn append_column(array: &ArrayRef, rows: &mut Batch) -> Result<()> {
    macro_rules! push_all {
        ($arr:expr, $wrap:expr) => {{
            let arr = $arr;
            for (i, row) in rows.iter_mut().enumerate() {
                if arr.is_null(i) {
                    row.0.push(Value::Null);
                } else {
                    row.0.push($wrap(arr.value(i)));
                }
            }
        }};
    }

    match array.data_type() {
        DataType::Boolean => {
            push_all!(as_typed::<BooleanArray>(array)?, Value::Bool)
        }
        DataType::Int8 => {
            push_all!(as_typed::<Int8Array>(array)?, |v: i8| Value::Int32(v as i32))
        }
        DataType::Int16 => {
            push_all!(as_typed::<Int16Array>(array)?, |v: i16| Value::Int32(v as i32))
        }
        DataType::Int32 => push_all!(as_typed::<Int32Array>(array)?, Value::Int32),
        DataType::Int64 => push_all!(as_typed::<Int64Array>(array)?, Value::Int64),
        DataType::UInt32 => {
            push_all!(as_typed::<UInt32Array>(array)?, |v: u32| Value::Int64(v as i64))
        }
        DataType::Float32 => push_all!(as_typed::<Float32Array>(array)?, Value::Float32),
        DataType::Float64 => push_all!(as_typed::<Float64Array>(array)?, Value::Float64),
        DataType::Utf8 => {
            push_all!(as_typed::<StringArray>(array)?, |v: &str| Value::String(v.to_string()))
        }
        DataType::LargeUtf8 => {
            push_all!(as_typed::<LargeStringArray>(array)?, |v: &str| Value::String(
                v.to_string()
            ))
        }
        DataType::Binary => {
            push_all!(as_typed::<BinaryArray>(array)?, |v: &[u8]| Value::Bytes(v.to_vec()))
        }
        DataType::Decimal128(_, _) => {
            let arr = as_typed::<Decimal128Array>(array)?;
            for (i, row) in rows.iter_mut().enumerate() {
                if arr.is_null(i) {
                    row.0.push(Value::Null);
                } else {
                    let text = arr.value_as_string(i);
                    row.0.push(
                        text.parse()
                            .map(Value::Decimal)
                            .unwrap_or(Value::String(text)),
                    );
                }
            }
        }
        DataType::Date32 => {
            push_all!(as_typed::<Date32Array>(array)?, |v: i32| Value::Date(
                epoch() + Duration::days(v as i64)
            ))
        }
        DataType::Date64 => {
            push_all!(as_typed::<Date64Array>(array)?, |v: i64| Value::Date(
                epoch() + Duration::days(v / 86_400_000)
            ))
        }
        DataType::Timestamp(unit, tz) => {
            let micros: Vec<Option<i64>> = match unit {
                TimeUnit::Second => {
                    let arr = as_typed::<TimestampSecondArray>(array)?;
                    (0..arr.len())
                        .map(|i| (!arr.is_null(i)).then(|| arr.value(i).saturating_mul(1_000_000)))
                        .collect()
                }
                TimeUnit::Millisecond => {
                    let arr = as_typed::<TimestampMillisecondArray>(array)?;
                    (0..arr.len())
                        .map(|i| (!arr.is_null(i)).then(|| arr.value(i).saturating_mul(1_000)))
                        .collect()
                }
                TimeUnit::Microsecond => {
                    let arr = as_typed::<TimestampMicrosecondArray>(array)?;
                    (0..arr.len())
                        .map(|i| (!arr.is_null(i)).then(|| arr.value(i)))
                        .collect()
                }
                TimeUnit::Nanosecond => {
                    let arr = as_typed::<TimestampNanosecondArray>(array)?;
                    (0..arr.len())
                        .map(|i| (!arr.is_null(i)).then(|| arr.value(i) / 1_000))
                        .collect()
                }
            };
            let zoned = tz.is_some();
            for (row, value) in rows.iter_mut().zip(micros) {
                row.0.push(match value.and_then(DateTime::from_timestamp_micros) {
                    None => Value::Null,
                    Some(dt) if zoned => Value::TimestampTz(dt),
                    Some(dt) => Value::Timestamp(dt.naive_utc()),
                });
            }
        }
        other => {
            return Err(PipeError::Unsupported(format!(
                "arrow type {other:?} has no row representation"
            )))
        }
    }
    Ok(())
}

fn as_typed<'a, A: 'static>(array: &'a ArrayRef) -> Result<&'a A> {
    array
        .as_any()
        .downcast_ref::<A>()
        .ok_or_else(|| PipeError::Corrupt("arrow array type mismatch".into()))
}
