//! Arrow IPC source and sink.
//!
//! Paths ending in `.arrow`/`.arrowfile` use the random-access file format;
//! `-` streams the IPC stream format to stdout (pipes and sockets cannot
//! seek back to patch a file footer).

use std::fs::File;
use std::io::Write;
use std::sync::Arc;

use arrow_ipc::reader::FileReader;
use arrow_ipc::writer::{FileWriter, StreamWriter};
use async_trait::async_trait;

use rowpipe_core::contract::{Reader, RunContext, WriteStrategy, Writer};
use rowpipe_core::error::{PipeError, Result};
use rowpipe_core::row::{Batch, Row};
use rowpipe_core::schema::{Column, TargetSchema};

use crate::convert;
use crate::stdio;

pub struct ArrowSource {
    location: String,
    columns: Vec<Column>,
    reader: Option<FileReader<File>>,
    pending: Vec<Row>,
    done: bool,
}

impl ArrowSource {
    pub fn new(location: impl Into<String>) -> Self {
        ArrowSource {
            location: location.into(),
            columns: Vec::new(),
            reader: None,
            pending: Vec::new(),
            done: false,
        }
    }
}

#[async_trait]
impl Reader for ArrowSource {
    async fn open(&mut self, _ctx: &RunContext) -> Result<()> {
        let file = File::open(&self.location).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                PipeError::NotFound(format!("no such file: {}", self.location))
            }
            _ => PipeError::Transient(e.to_string()),
        })?;
        let reader = FileReader::try_new(file, None)
            .map_err(|e| PipeError::Corrupt(format!("not an arrow file: {e}")))?;
        self.columns = convert::columns_from_arrow(&reader.schema());
        self.reader = Some(reader);
        Ok(())
    }

    fn columns(&self) -> &[Column] {
        &self.columns
    }

    async fn next_batch(&mut self, batch_size: usize, ctx: &RunContext) -> Result<Option<Batch>> {
        ctx.ensure_active()?;
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| PipeError::InvalidArgument("reader is not open".into()))?;

        while self.pending.len() < batch_size && !self.done {
            match reader.next() {
                Some(Ok(record_batch)) => {
                    self.pending.extend(convert::batch_to_rows(&record_batch)?)
                }
                Some(Err(e)) => return Err(PipeError::Corrupt(format!("arrow read failed: {e}"))),
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
        Ok(())
    }
}

enum IpcWriter {
    File(FileWriter<Box<dyn Write + Send>>),
    Stream(StreamWriter<Box<dyn Write + Send>>),
}

pub struct ArrowSink {
    location: String,
    strategy: WriteStrategy,
    columns: Vec<Column>,
    writer: Option<IpcWriter>,
}

impl ArrowSink {
    pub fn new(location: impl Into<String>, strategy: WriteStrategy) -> Self {
        ArrowSink {
            location: location.into(),
            strategy,
            columns: Vec::new(),
            writer: None,
        }
    }
}

#[async_trait]
impl Writer for ArrowSink {
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
                "arrow sinks only append; strategy {:?} needs a transactional target",
                self.strategy
            )));
        }
        self.columns = columns.to_vec();
        let schema = Arc::new(convert::to_arrow_schema(columns));
        let output = stdio::open_output(&self.location, true)?;
        let setup = |e: arrow_schema::ArrowError| {
            PipeError::Other(anyhow::anyhow!("arrow writer setup: {e}"))
        };
        self.writer = Some(if self.location == "-" {
            IpcWriter::Stream(StreamWriter::try_new(output, &schema).map_err(setup)?)
        } else {
            IpcWriter::File(FileWriter::try_new(output, &schema).map_err(setup)?)
        });
        Ok(())
    }

    async fn write_batch(&mut self, batch: &Batch, ctx: &RunContext) -> Result<()> {
        ctx.ensure_active()?;
        let record_batch = convert::rows_to_batch(&self.columns, batch)?;
        let failed = |e: arrow_schema::ArrowError| {
            PipeError::Transient(format!("arrow write failed: {e}"))
        };
        match self
            .writer
            .as_mut()
            .ok_or_else(|| PipeError::InvalidArgument("writer is not initialized".into()))?
        {
            IpcWriter::File(w) => w.write(&record_batch).map_err(failed)?,
            IpcWriter::Stream(w) => w.write(&record_batch).map_err(failed)?,
        }
        Ok(())
    }

    async fn complete(&mut self, _ctx: &RunContext) -> Result<()> {
        let failed = |e: arrow_schema::ArrowError| {
            PipeError::Transient(format!("arrow finish failed: {e}"))
        };
        match self.writer.take() {
            Some(IpcWriter::File(mut w)) => w.finish().map_err(failed)?,
            Some(IpcWriter::Stream(mut w)) => w.finish().map_err(failed)?,
            None => {}
        }
        Ok(())
    }

    async fn dispose(&mut self) -> Result<()> {
        self.writer = None;
        Ok(())
    }
}
