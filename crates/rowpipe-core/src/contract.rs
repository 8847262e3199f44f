//! Reader, writer and transformer contracts.
//!
//! The pipeline engine owns one reader, an ordered transformer chain and one
//! writer per run, and talks to them only through these traits. Concrete
//! drivers live in `rowpipe-io` and `rowpipe-tx`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{PipeError, Result};
use crate::row::{Batch, Row};
use crate::schema::{Column, Schema, TargetSchema};

/// Per-run context shared by every stage: the cancellation signal plus
/// caller-provided limits the drivers honor.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub cancel: CancellationToken,
    /// Honored by SQL readers for query execution.
    pub query_timeout: Option<Duration>,
}

impl RunContext {
    pub fn new() -> Self {
        RunContext::default()
    }

    pub fn with_cancel(cancel: CancellationToken) -> Self {
        RunContext {
            cancel,
            query_timeout: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail fast when the run has been cancelled.
    pub fn ensure_active(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(PipeError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// A context whose token is a child of this one.
    pub fn child(&self) -> RunContext {
        RunContext {
            cancel: self.cancel.child_token(),
            query_timeout: self.query_timeout,
        }
    }
}

/// A batch-producing data source.
///
/// Lifecycle: `open` (discovers columns, validates queries) -> repeated
/// `next_batch` until it returns `None` -> `dispose`.
#[async_trait]
pub trait Reader: Send {
    async fn open(&mut self, ctx: &RunContext) -> Result<()>;

    /// Columns discovered by `open`. Immutable afterwards.
    fn columns(&self) -> &[Column];

    /// The next batch of at most `batch_size` rows, or `None` when the
    /// source is exhausted. The final batch may be smaller. Must observe
    /// `ctx` cancellation.
    async fn next_batch(&mut self, batch_size: usize, ctx: &RunContext) -> Result<Option<Batch>>;

    async fn dispose(&mut self) -> Result<()>;
}

/// A batch-consuming data sink.
#[async_trait]
pub trait Writer: Send {
    /// Non-destructive look at the target. `Ok(None)` means the sink exists
    /// but is unreadable or corrupt; a `TargetSchema { exists: false, .. }`
    /// report means the sink is missing. May be called before `initialize`.
    async fn inspect_target(&mut self, ctx: &RunContext) -> Result<Option<TargetSchema>>;

    /// Bind the effective schema and apply the write strategy. No rows may
    /// be written before this resolves.
    async fn initialize(&mut self, columns: &[Column], ctx: &RunContext) -> Result<()>;

    async fn write_batch(&mut self, batch: &Batch, ctx: &RunContext) -> Result<()>;

    /// Flush buffers, write trailers, close the underlying resource.
    async fn complete(&mut self, ctx: &RunContext) -> Result<()>;

    /// Sink-specific DDL/DML hook. File sinks reject this.
    async fn execute_command(&mut self, text: &str, _ctx: &RunContext) -> Result<u64> {
        let _ = text;
        Err(PipeError::Unsupported(
            "this sink does not execute commands".into(),
        ))
    }

    /// Tolerant of repeated calls; safe after failure.
    async fn dispose(&mut self) -> Result<()>;
}

/// A single link in the transformer chain. Implementations are used from one
/// thread at a time; per-row methods may mutate the row in place.
pub trait Transformer: Send {
    /// Runs once with the upstream schema; returns the output schema that
    /// drives the next stage. Transformers may add virtual columns or drop
    /// columns here.
    fn initialize(&mut self, input: &Schema) -> Result<Schema>;

    /// 1:1 step. `None` drops the row.
    fn transform(&mut self, row: Row) -> Result<Option<Row>> {
        Ok(Some(row))
    }

    /// 1:N step; supersedes [`Transformer::transform`] when overridden.
    fn transform_many(&mut self, row: Row) -> Result<Vec<Row>> {
        Ok(self.transform(row)?.into_iter().collect())
    }

    /// Called exactly once at end-of-stream, after the reader reported done.
    fn flush(&mut self) -> Result<Vec<Row>> {
        Ok(Vec::new())
    }

    /// Release per-thread resources. Runs on the same thread that executed
    /// the per-row methods, after the last flush (also on the failure path).
    fn dispose(&mut self) {}
}

/// How an existing target is reconciled with incoming rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WriteStrategy {
    #[default]
    Append,
    Truncate,
    Recreate,
    DeleteThenInsert,
    Upsert,
    Ignore,
}

impl WriteStrategy {
    /// Strategies that partition batches against existing keys.
    pub fn requires_primary_key(self) -> bool {
        matches!(self, WriteStrategy::Upsert | WriteStrategy::Ignore)
    }

    /// Strategies that delete all existing rows before the first batch.
    pub fn clears_rows(self) -> bool {
        matches!(self, WriteStrategy::Truncate | WriteStrategy::DeleteThenInsert)
    }

    /// Recreate drops and rebuilds the target to match the source exactly.
    pub fn rebuilds_target(self) -> bool {
        matches!(self, WriteStrategy::Recreate)
    }
}

impl std::str::FromStr for WriteStrategy {
    type Err = PipeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "append" => Ok(WriteStrategy::Append),
            "truncate" => Ok(WriteStrategy::Truncate),
            "recreate" => Ok(WriteStrategy::Recreate),
            "delete-then-insert" | "deletetheninsert" => Ok(WriteStrategy::DeleteThenInsert),
            "upsert" => Ok(WriteStrategy::Upsert),
            "ignore" => Ok(WriteStrategy::Ignore),
            other => Err(PipeError::InvalidArgument(format!(
                "unknown write strategy '{other}'"
            ))),
        }
    }
}

/// What a registered provider can do; the dispatch layer uses these flags to
/// reject configurations a driver cannot honor.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderCapabilities {
    /// The reader side needs a query (or table name) to produce rows.
    pub requires_query: bool,
    /// The writer side understands the full write-strategy table; file sinks
    /// only accept append.
    pub supports_write_strategies: bool,
    /// The writer can partition batches into insert/update sets.
    pub supports_insert_mode: bool,
}
