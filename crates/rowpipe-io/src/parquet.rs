//! Parquet source and sink.

use std::fs::File;
use std::sync::Arc;

use async_trait::async_trait;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use rowpipe_core::contract::{Reader, RunContext, WriteStrategy, Writer};
use rowpipe_core::error::{PipeError, Result};
use rowpipe_core::row::{Batch, Row};
use rowpipe_core::schema::{Column, TargetColumn, TargetSchema};

use crate::convert;
use crate::stdio;

pub struct ParquetSource {
    location: String,
    columns: Vec<Column>,
    builder: Option<ParquetRecordBatchReaderBuilder<File>>,
    reader: Option<ParquetRecordBatchReader>,
    /// Rows decoded but not yet handed out.
    pending: Vec<Row>,
    done: bool,
}

impl ParquetSource {
    pub fn new(location: impl Into<String>) -> Self {
        ParquetSource {
            location: location.into(),
            columns: Vec::new(),
            builder: None,
            reader: None,
            pending: Vec::new(),
            done: false,
        }
    }
}

#[async_trait]
impl Reader for ParquetSource {
    async fn open(&mut self, _ctx: &RunContext) -> Result<()> {
        let file = File::open(&self.location).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                PipeError::NotFound(format!("no such file: {}", self.location))
            }
            _ => PipeError::Transient(e.to_string()),
        })?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|e| PipeError::Corrupt(format!("not a parquet file: {e}")))?;
        self.columns = convert::columns_from_arrow(builder.schema());
        self.builder = Some(builder);
        Ok(())
    }

    fn columns(&self) -> &[Column] {
        &self.columns
    }

    async fn next_batch(&mut self, batch_size: usize, ctx: &RunContext) -> Result<Option<Batch>> {
        ctx.ensure_active()?;
        if self.reader.is_none() {
            let Some(builder) = self.builder.take() else {
                return Ok(None);
            };
            self.reader = Some(
                builder
                    .with_batch_size(batch_size.max(1))
                    .build()
                    .map_err(|e| PipeError::Corrupt(format!("parquet read failed: {e}")))?,
            );
        }

        while self.pending.len() < batch_size && !self.done {
            match self.reader.as_mut().expect("reader built above").next() {
                Some(Ok(record_batch)) => {
                    self.pending.extend(convert::batch_to_rows(&record_batch)?);
                }
                Some(Err(e)) => {
                    return Err(PipeError::Corrupt(format!("parquet read failed: {e}")))
                }
                None => self.done = true,
            }
        }

        if self.pending.is_empty() {
            return Ok(None);
        }
        let take = self.pending.len().min(batch_size);
        Ok(Some(self.pending.drain(..take).collect()))
    }

    async fn dispose(&mut self) -> Result<()> {
        self.reader = None;
        self.builder = None;
        Ok(())
    }
}

pub struct ParquetSink {
    location: String,
    strategy: WriteStrategy,
    columns: Vec<Column>,
    writer: Option<ArrowWriter<Box<dyn std::io::Write + Send>>>,
}

impl ParquetSink {
    pub fn new(location: impl Into<String>, strategy: WriteStrategy) -> Self {
        ParquetSink {
            location: location.into(),
            strategy,
            columns: Vec::new(),
            writer: None,
        }
    }
}

#[async_trait]
impl Writer for ParquetSink {
    async fn inspect_target(&mut self, _ctx: &RunContext) -> Result<Option<TargetSchema>> {
        if self.location == "-" || !std::path::Path::new(&self.location).exists() {
            return Ok(Some(TargetSchema::missing()));
        }
        let file = match File::open(&self.location) {
            Ok(f) => f,
            Err(_) => return Ok(None),
        };
        let builder = match ParquetRecordBatchReaderBuilder::try_new(file) {
            Ok(b) => b,
            // Present but unreadable as parquet.
            Err(_) => return Ok(None),
        };
        let row_count = builder.metadata().file_metadata().num_rows().max(0) as u64;
        let columns = convert::columns_from_arrow(builder.schema())
            .into_iter()
            .map(|c| {
                let native = format!("{:?}", convert::to_arrow_field(&c).data_type());
                TargetColumn::new(c, native)
            })
            .collect();
        Ok(Some(TargetSchema {
            exists: true,
            columns,
            row_count: Some(row_count),
            size_bytes: std::fs::metadata(&self.location).ok().map(|m| m.len()),
            primary_key: Vec::new(),
        }))
    }

    async fn initialize(&mut self, columns: &[Column], _ctx: &RunContext) -> Result<()> {
        if self.strategy != WriteStrategy::Append {
            return Err(PipeError::Unsupported(format!(
                "parquet sinks only append; strategy {:?} needs a transactional target",
                self.strategy
            )));
        }
        self.columns = columns.to_vec();
        let output = stdio::open_output(&self.location, true)?;
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let schema = Arc::new(convert::to_arrow_schema(columns));
        self.writer = Some(
            ArrowWriter::try_new(output, schema, Some(props))
                .map_err(|e| PipeError::Other(anyhow::anyhow!("parquet writer setup: {e}")))?,
        );
        Ok(())
    }

    async fn write_batch(&mut self, batch: &Batch, ctx: &RunContext) -> Result<()> {
        ctx.ensure_active()?;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| PipeError::InvalidArgument("writer is not initialized".into()))?;
        let record_batch = convert::rows_to_batch(&self.columns, batch)?;
        writer
            .write(&record_batch)
            .map_err(|e| PipeError::Transient(format!("parquet write failed: {e}")))?;
        // One row group per incoming batch.
        writer
            .flush()
            .map_err(|e| PipeError::Transient(format!("parquet flush failed: {e}")))?;
        Ok(())
    }

    async fn complete(&mut self, _ctx: &RunContext) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer
                .close()
                .map_err(|e| PipeError::Transient(format!("parquet close failed: {e}")))?;
        }
        Ok(())
    }

    async fn dispose(&mut self) -> Result<()> {
        self.writer = None;
        Ok(())
    }
}
