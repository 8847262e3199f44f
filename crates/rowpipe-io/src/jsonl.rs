//! JSON-lines source and sink.
//!
//! One JSON object per line. On write, property order follows schema order.
//! On read, the schema is inferred from the first line: numbers become
//! Float64, booleans Bool, strings String, and null leaves the type Unknown.

use std::io::{BufRead, BufReader, Read, Write};

use async_trait::async_trait;
use serde_json::{json, Map, Value as Json};

use rowpipe_core::contract::{Reader, RunContext, WriteStrategy, Writer};
use rowpipe_core::error::{PipeError, Result};
use rowpipe_core::row::{Batch, LogicalType, Row, Value};
use rowpipe_core::schema::{Column, TargetSchema};

use crate::stdio;

pub struct JsonlSource {
    location: String,
    columns: Vec<Column>,
    reader: Option<BufReader<Box<dyn Read + Send>>>,
    /// The first line is consumed for inference and replayed as data.
    pending_first: Option<String>,
    done: bool,
}

impl JsonlSource {
    pub fn new(location: impl Into<String>) -> Self {
        JsonlSource {
            location: location.into(),
            columns: Vec::new(),
            reader: None,
            pending_first: None,
            done: false,
        }
    }

    fn parse_line(&self, line: &str) -> Result<Row> {
        let object: Map<String, Json> = serde_json::from_str(line)
            .map_err(|e| PipeError::Corrupt(format!("malformed json line: {e}")))?;
        let values = self
            .columns
            .iter()
            .map(|col| match object.get(&col.name) {
                None | Some(Json::Null) => Value::Null,
                Some(Json::Bool(b)) => Value::Bool(*b),
                Some(Json::Number(n)) => Value::Float64(n.as_f64().unwrap_or(f64::NAN)),
                Some(Json::String(s)) => Value::String(s.clone()),
                Some(nested) => Value::String(nested.to_string()),
            })
            .collect();
        Ok(Row::new(values))
    }
}

#[async_trait]
impl Reader for JsonlSource {
    async fn open(&mut self, _ctx: &RunContext) -> Result<()> {
        let mut reader = BufReader::new(stdio::open_input(&self.location)?);
        let mut first = String::new();
        let n = reader
            .read_line(&mut first)
            .map_err(|e| PipeError::Transient(e.to_string()))?;
        if n == 0 {
            // An empty source has no columns and no rows.
            self.done = true;
            self.reader = Some(reader);
            return Ok(());
        }

        let object: Map<String, Json> = serde_json::from_str(first.trim_end())
            .map_err(|e| PipeError::Corrupt(format!("first line is not a json object: {e}")))?;
        self.columns = object
            .iter()
            .map(|(name, value)| {
                let logical_type = match value {
                    Json::Number(_) => LogicalType::Float64,
                    Json::Bool(_) => LogicalType::Bool,
                    Json::String(_) => LogicalType::String,
                    _ => LogicalType::Unknown,
                };
                Column::new(name.clone(), logical_type)
            })
            .collect();
        self.pending_first = Some(first.trim_end().to_string());
        self.reader = Some(reader);
        Ok(())
    }

    fn columns(&self) -> &[Column] {
        &self.columns
    }

    async fn next_batch(&mut self, batch_size: usize, ctx: &RunContext) -> Result<Option<Batch>> {
        ctx.ensure_active()?;
        if self.done {
            return Ok(None);
        }
        let mut batch: Batch = Vec::with_capacity(batch_size.min(8_192));

        if let Some(first) = self.pending_first.take() {
            batch.push(self.parse_line(&first)?);
        }

        while batch.len() < batch_size {
            let reader = self
                .reader
                .as_mut()
                .ok_or_else(|| PipeError::InvalidArgument("reader is not open".into()))?;
            let mut line = String::new();
            let n = reader
                .read_line(&mut line)
                .map_err(|e| PipeError::Transient(e.to_string()))?;
            if n == 0 {
                self.done = true;
                break;
            }
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                continue;
            }
            batch.push(self.parse_line(trimmed)?);
        }

        if batch.is_empty() {
            Ok(None)
        } else {
            Ok(Some(batch))
        }
    }

    async fn dispose(&mut self) -> Result<()> {
        self.reader = None;
        Ok(())
    }
}

pub struct JsonlSink {
    location: String,
    strategy: WriteStrategy,
    columns: Vec<Column>,
    writer: Option<Box<dyn Write + Send>>,
}

impl JsonlSink {
    pub fn new(location: impl Into<String>, strategy: WriteStrategy) -> Self {
        JsonlSink {
            location: location.into(),
            strategy,
            columns: Vec::new(),
            writer: None,
        }
    }
}

fn to_json(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => json!(b),
        Value::Int32(v) => json!(v),
        Value::Int64(v) => json!(v),
        Value::Float32(v) => json!(v),
        Value::Float64(v) => json!(v),
        Value::String(s) => json!(s),
        other => json!(other.canonical_text()),
    }
}

#[async_trait]
impl Writer for JsonlSink {
    async fn inspect_target(&mut self, _ctx: &RunContext) -> Result<Option<TargetSchema>> {
        if self.location != "-" && std::path::Path::new(&self.location).exists() {
            Ok(Some(TargetSchema {
                exists: true,
                columns: Vec::new(),
                row_count: None,
                size_bytes: std::fs::metadata(&self.location).ok().map(|m| m.len()),
                primary_key: Vec::new(),
            }))
        } else {
            Ok(Some(TargetSchema::missing()))
        }
    }

    async fn initialize(&mut self, columns: &[Column], _ctx: &RunContext) -> Result<()> {
        if self.strategy != WriteStrategy::Append {
            return Err(PipeError::Unsupported(format!(
                "jsonl sinks only append; strategy {:?} needs a transactional target",
                self.strategy
            )));
        }
        self.columns = columns.to_vec();
        self.writer = Some(stdio::open_output(&self.location, false)?);
        Ok(())
    }

    async fn write_batch(&mut self, batch: &Batch, ctx: &RunContext) -> Result<()> {
        ctx.ensure_active()?;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| PipeError::InvalidArgument("writer is not initialized".into()))?;
        for row in batch {
            let mut object = Map::with_capacity(self.columns.len());
            for (idx, column) in self.columns.iter().enumerate() {
                object.insert(column.name.clone(), to_json(row.get(idx)));
            }
            serde_json::to_writer(&mut *writer, &Json::Object(object))
                .map_err(|e| PipeError::Transient(format!("jsonl write failed: {e}")))?;
            writer
                .write_all(b"\n")
                .map_err(|e| PipeError::Transient(e.to_string()))?;
        }
        Ok(())
    }

    async fn complete(&mut self, _ctx: &RunContext) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer
                .flush()
                .map_err(|e| PipeError::Transient(e.to_string()))?;
        }
        self.writer = None;
        Ok(())
    }

    async fn dispose(&mut self) -> Result<()> {
        self.writer = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_objects_in_schema_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let mut sink = JsonlSink::new(path.to_str().unwrap(), WriteStrategy::Append);
        let ctx = RunContext::new();
        sink.initialize(
            &[
                Column::new("a", LogicalType::String),
                Column::new("b", LogicalType::String),
            ],
            &ctx,
        )
        .await
        .unwrap();
        sink.write_batch(
            &vec![
                Row::new(vec![Value::String("1".into()), Value::String("hello".into())]),
                Row::new(vec![Value::String("2".into()), Value::String("world".into())]),
            ],
            &ctx,
        )
        .await
        .unwrap();
        sink.complete(&ctx).await.unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            written,
            "{\"a\":\"1\",\"b\":\"hello\"}\n{\"a\":\"2\",\"b\":\"world\"}\n"
        );
    }

    #[tokio::test]
    async fn infers_schema_from_first_line_and_replays_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.jsonl");
        std::fs::write(
            &path,
            "{\"n\":1.5,\"flag\":true,\"s\":\"x\",\"gone\":null}\n{\"n\":2,\"flag\":false,\"s\":\"y\"}\n",
        )
        .unwrap();

        let mut source = JsonlSource::new(path.to_str().unwrap());
        let ctx = RunContext::new();
        source.open(&ctx).await.unwrap();
        let types: Vec<_> = source.columns().iter().map(|c| c.logical_type).collect();
        assert_eq!(
            types,
            vec![
                LogicalType::Float64,
                LogicalType::Bool,
                LogicalType::String,
                LogicalType::Unknown
            ]
        );
        let batch = source.next_batch(10, &ctx).await.unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].get(0), &Value::Float64(1.5));
        assert_eq!(batch[1].get(1), &Value::Bool(false));
        assert_eq!(batch[0].get(3), &Value::Null);
        assert!(source.next_batch(10, &ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_source_yields_no_columns_and_no_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.jsonl");
        std::fs::write(&path, "").unwrap();
        let mut source = JsonlSource::new(path.to_str().unwrap());
        let ctx = RunContext::new();
        source.open(&ctx).await.unwrap();
        assert!(source.columns().is_empty());
        assert!(source.next_batch(10, &ctx).await.unwrap().is_none());
    }
}
