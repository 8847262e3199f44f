//! CSV source and sink.
//!
//! CSV is read as a string carrier: every non-null cell is a string and
//! typing happens at the sink. Separator, quote, header handling, the null
//! literal and numeric/temporal rendering are all configurable through the
//! provider options.

use std::fs::File;
use std::io::{BufReader, Read, Write};

use async_trait::async_trait;

use rowpipe_core::contract::{Reader, RunContext, WriteStrategy, Writer};
use rowpipe_core::error::{PipeError, Result};
use rowpipe_core::options::{OptionField, OptionSchema, Options};
use rowpipe_core::row::{Batch, LogicalType, Row, Value};
use rowpipe_core::schema::{Column, TargetColumn, TargetSchema};

use crate::stdio;

/// Options shared by the CSV reader and writer.
#[derive(Debug, Clone)]
pub struct CsvOptions {
    pub separator: char,
    pub quote: char,
    pub header: bool,
    pub null_literal: String,
    pub decimal_separator: char,
    pub date_format: String,
    pub timestamp_format: String,
}

impl CsvOptions {
    pub fn schema() -> OptionSchema {
        OptionSchema {
            provider: "csv",
            fields: vec![
                OptionField::scalar("separator", "field separator character", Some(",")),
                OptionField::scalar("quote", "quote character", Some("\"")),
                OptionField::scalar("header", "first row carries column names", Some("true")),
                OptionField::scalar("null", "literal that stands for null", Some("")),
                OptionField::scalar("decimal_separator", "decimal separator on write", Some(".")),
                OptionField::scalar("date_format", "strftime pattern for dates", Some("%Y-%m-%d")),
                OptionField::scalar(
                    "timestamp_format",
                    "strftime pattern for timestamps",
                    Some("%Y-%m-%dT%H:%M:%S%.f"),
                ),
            ],
        }
    }

    pub fn from_options(options: &Options) -> Result<Self> {
        Ok(CsvOptions {
            separator: options.get_char("separator", ',')?,
            quote: options.get_char("quote", '"')?,
            header: options.get_bool("header", true)?,
            null_literal: options.get_or("null", ""),
            decimal_separator: options.get_char("decimal_separator", '.')?,
            date_format: options.get_or("date_format", "%Y-%m-%d"),
            timestamp_format: options.get_or("timestamp_format", "%Y-%m-%dT%H:%M:%S%.f"),
        })
    }
}

pub struct CsvSource {
    location: String,
    options: CsvOptions,
    columns: Vec<Column>,
    reader: Option<csv::Reader<Box<dyn Read + Send>>>,
    done: bool,
}

impl CsvSource {
    pub fn new(location: impl Into<String>, options: CsvOptions) -> Self {
        CsvSource {
            location: location.into(),
            options,
            columns: Vec::new(),
            reader: None,
            done: false,
        }
    }
}

#[async_trait]
impl Reader for CsvSource {
    async fn open(&mut self, _ctx: &RunContext) -> Result<()> {
        let input = stdio::open_input(&self.location)?;
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.options.separator as u8)
            .quote(self.options.quote as u8)
            .has_headers(self.options.header)
            .flexible(true)
            .from_reader(input);

        self.columns = if self.options.header {
            reader
                .headers()
                .map_err(corrupt)?
                .iter()
                .map(|name| Column::new(name, LogicalType::String))
                .collect()
        } else {
            // Peek the first record to size the schema; the record itself is
            // replayed because `has_headers` is off.
            let width = reader
                .headers()
                .map_err(corrupt)?
                .len();
            (0..width)
                .map(|i| Column::new(format!("col_{i}"), LogicalType::String))
                .collect()
        };
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
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| PipeError::InvalidArgument("reader is not open".into()))?;

        let width = self.columns.len();
        let null_literal = self.options.null_literal.as_str();
        let mut batch: Batch = Vec::with_capacity(batch_size.min(8_192));
        for record in reader.records() {
            let record = record.map_err(corrupt)?;
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                let field = record.get(i).unwrap_or_default();
                if field == null_literal {
                    values.push(Value::Null);
                } else {
                    values.push(Value::String(field.to_string()));
                }
            }
            batch.push(Row::new(values));
            if batch.len() >= batch_size {
                return Ok(Some(batch));
            }
        }
        self.done = true;
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

fn corrupt(e: csv::Error) -> PipeError {
    PipeError::Corrupt(format!("malformed csv: {e}"))
}

pub struct CsvSink {
    location: String,
    options: CsvOptions,
    strategy: WriteStrategy,
    columns: Vec<Column>,
    writer: Option<csv::Writer<Box<dyn Write + Send>>>,
}

impl CsvSink {
    pub fn new(location: impl Into<String>, options: CsvOptions, strategy: WriteStrategy) -> Self {
        CsvSink {
            location: location.into(),
            options,
            strategy,
            columns: Vec::new(),
            writer: None,
        }
    }

}

#[async_trait]
impl Writer for CsvSink {
    async fn inspect_target(&mut self, _ctx: &RunContext) -> Result<Option<TargetSchema>> {
        if self.location == "-" || !std::path::Path::new(&self.location).exists() {
            return Ok(Some(TargetSchema::missing()));
        }
        // A cheap look: the header row names existing columns.
        let file = File::open(&self.location).map_err(|e| PipeError::Transient(e.to_string()))?;
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.options.separator as u8)
            .quote(self.options.quote as u8)
            .has_headers(self.options.header)
            .from_reader(BufReader::new(file));
        let columns = if self.options.header {
            match reader.headers() {
                Ok(headers) => headers
                    .iter()
                    .map(|name| {
                        TargetColumn::new(Column::new(name, LogicalType::String), "text")
                    })
                    .collect(),
                Err(_) => return Ok(None),
            }
        } else {
            Vec::new()
        };
        Ok(Some(TargetSchema {
            exists: true,
            columns,
            row_count: None,
            size_bytes: std::fs::metadata(&self.location).ok().map(|m| m.len()),
            primary_key: Vec::new(),
        }))
    }

    async fn initialize(&mut self, columns: &[Column], _ctx: &RunContext) -> Result<()> {
        if self.strategy != WriteStrategy::Append {
            return Err(PipeError::Unsupported(format!(
                "csv sinks only append; strategy {:?} needs a transactional target",
                self.strategy
            )));
        }
        self.columns = columns.to_vec();
        let output = stdio::open_output(&self.location, false)?;
        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.options.separator as u8)
            .quote(self.options.quote as u8)
            .from_writer(output);
        if self.options.header {
            writer
                .write_record(self.columns.iter().map(|c| c.name.as_str()))
                .map_err(write_failed)?;
        }
        self.writer = Some(writer);
        Ok(())
    }

    async fn write_batch(&mut self, batch: &Batch, ctx: &RunContext) -> Result<()> {
        ctx.ensure_active()?;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| PipeError::InvalidArgument("writer is not initialized".into()))?;
        for row in batch {
            let record: Vec<String> = row.0.iter().map(|v| render_cell(&self.options, v)).collect();
            writer.write_record(&record).map_err(write_failed)?;
        }
        Ok(())
    }

    async fn complete(&mut self, _ctx: &RunContext) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().map_err(|e| PipeError::Transient(e.to_string()))?;
        }
        self.writer = None;
        Ok(())
    }

    async fn dispose(&mut self) -> Result<()> {
        self.writer = None;
        Ok(())
    }
}

// Free-standing so `write_batch` can render while the csv writer holds a
// mutable borrow of self.
fn render_cell(options: &CsvOptions, value: &Value) -> String {
    match value {
        Value::Null => options.null_literal.clone(),
        Value::Float32(_) | Value::Float64(_) | Value::Decimal(_) => {
            let text = value.canonical_text();
            if options.decimal_separator != '.' {
                text.replace('.', &options.decimal_separator.to_string())
            } else {
                text
            }
        }
        Value::Date(d) => d.format(&options.date_format).to_string(),
        Value::Timestamp(t) => t.format(&options.timestamp_format).to_string(),
        Value::TimestampTz(t) => t.format(&options.timestamp_format).to_string(),
        other => other.canonical_text(),
    }
}


fn write_failed(e: csv::Error) -> PipeError {
    PipeError::Transient(format!("csv write failed: {e}"))
}
