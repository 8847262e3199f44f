//! End-to-end engine behavior against in-memory readers and writers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use rowpipe_core::contract::{Reader, RunContext, Transformer, Writer};
use rowpipe_core::engine::{EngineOptions, Pipeline};
use rowpipe_core::error::{PipeError, Result};
use rowpipe_core::retry::RetryPolicy;
use rowpipe_core::row::{Batch, LogicalType, Row, Value};
use rowpipe_core::schema::{Column, Schema, TargetSchema};

struct VecReader {
    columns: Vec<Column>,
    rows: Vec<Row>,
    cursor: usize,
}

impl VecReader {
    fn ints(n: i64) -> Self {
        VecReader {
            columns: vec![Column::new("v", LogicalType::Int64)],
            rows: (0..n).map(|i| Row::new(vec![Value::Int64(i)])).collect(),
            cursor: 0,
        }
    }
}

#[async_trait]
impl Reader for VecReader {
    async fn open(&mut self, _ctx: &RunContext) -> Result<()> {
        Ok(())
    }

    fn columns(&self) -> &[Column] {
        &self.columns
    }

    async fn next_batch(&mut self, batch_size: usize, ctx: &RunContext) -> Result<Option<Batch>> {
        ctx.ensure_active()?;
        if self.cursor >= self.rows.len() {
            return Ok(None);
        }
        let end = (self.cursor + batch_size).min(self.rows.len());
        let batch: Batch = self.rows[self.cursor..end].to_vec();
        self.cursor = end;
        Ok(Some(batch))
    }

    async fn dispose(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Default)]
struct Collected {
    rows: Arc<Mutex<Vec<Row>>>,
    completes: Arc<AtomicU32>,
    fail_first: Arc<AtomicU32>,
    write_delay: Option<Duration>,
}

struct VecWriter {
    state: Collected,
}

#[async_trait]
impl Writer for VecWriter {
    async fn inspect_target(&mut self, _ctx: &RunContext) -> Result<Option<TargetSchema>> {
        Ok(Some(TargetSchema::missing()))
    }

    async fn initialize(&mut self, _columns: &[Column], _ctx: &RunContext) -> Result<()> {
        Ok(())
    }

    async fn write_batch(&mut self, batch: &Batch, ctx: &RunContext) -> Result<()> {
        ctx.ensure_active()?;
        if let Some(delay) = self.state.write_delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.fail_first.load(Ordering::SeqCst) > 0 {
            self.state.fail_first.fetch_sub(1, Ordering::SeqCst);
            return Err(PipeError::Transient("simulated outage".into()));
        }
        self.state.rows.lock().unwrap().extend(batch.iter().cloned());
        Ok(())
    }

    async fn complete(&mut self, _ctx: &RunContext) -> Result<()> {
        self.state.completes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn dispose(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Drops odd values.
struct KeepEven;

impl Transformer for KeepEven {
    fn initialize(&mut self, input: &Schema) -> Result<Schema> {
        Ok(input.clone())
    }

    fn transform(&mut self, row: Row) -> Result<Option<Row>> {
        match row.get(0) {
            Value::Int64(v) if v % 2 == 0 => Ok(Some(row)),
            _ => Ok(None),
        }
    }
}

fn pipeline(
    rows: i64,
    transformers: Vec<Box<dyn Transformer>>,
    options: EngineOptions,
) -> (Pipeline, Collected) {
    let state = Collected::default();
    let p = Pipeline::new(
        Box::new(VecReader::ints(rows)),
        transformers,
        Box::new(VecWriter { state: state.clone() }),
    )
    .with_options(options);
    (p, state)
}

#[tokio::test]
async fn rows_written_equals_rows_read_without_drops() {
    let (p, state) = pipeline(500, Vec::new(), EngineOptions { batch_size: 64, ..Default::default() });
    let written = p.run(&RunContext::new()).await.unwrap();
    assert_eq!(written, 500);
    assert_eq!(state.rows.lock().unwrap().len(), 500);
    assert_eq!(state.completes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn transformer_drops_reduce_written_count() {
    let (p, state) = pipeline(
        100,
        vec![Box::new(KeepEven)],
        EngineOptions { batch_size: 7, ..Default::default() },
    );
    let written = p.run(&RunContext::new()).await.unwrap();
    assert_eq!(written, 50);
    assert!(state.rows.lock().unwrap().iter().all(|r| matches!(r.get(0), Value::Int64(v) if v % 2 == 0)));
}

#[tokio::test]
async fn batch_size_does_not_change_output() {
    let mut outputs = Vec::new();
    for batch_size in [1usize, 3, 100] {
        let (p, state) = pipeline(
            41,
            vec![Box::new(KeepEven)],
            EngineOptions { batch_size, ..Default::default() },
        );
        p.run(&RunContext::new()).await.unwrap();
        let rows = state.rows.lock().unwrap().clone();
        outputs.push(rows);
    }
    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[1], outputs[2]);
}

#[tokio::test]
async fn limit_stops_mid_batch() {
    let (p, state) = pipeline(
        1_000,
        Vec::new(),
        EngineOptions { batch_size: 64, limit: Some(10), ..Default::default() },
    );
    let written = p.run(&RunContext::new()).await.unwrap();
    assert_eq!(written, 10);
    assert_eq!(state.rows.lock().unwrap().len(), 10);
}

#[tokio::test]
async fn seeded_sampling_is_reproducible() {
    let opts = || EngineOptions {
        batch_size: 32,
        sampling_rate: Some(0.25),
        sample_seed: Some(7),
        ..Default::default()
    };
    let (p1, s1) = pipeline(400, Vec::new(), opts());
    let (p2, s2) = pipeline(400, Vec::new(), opts());
    let w1 = p1.run(&RunContext::new()).await.unwrap();
    let w2 = p2.run(&RunContext::new()).await.unwrap();
    assert_eq!(w1, w2);
    assert_eq!(*s1.rows.lock().unwrap(), *s2.rows.lock().unwrap());
    assert!(w1 > 0 && w1 < 400);
}

#[tokio::test]
async fn invalid_sampling_rate_is_configuration_error() {
    let (p, _) = pipeline(
        10,
        Vec::new(),
        EngineOptions { sampling_rate: Some(1.5), ..Default::default() },
    );
    let err = p.run(&RunContext::new()).await.unwrap_err();
    assert!(err.is_config());
}

#[tokio::test]
async fn transient_write_failures_are_retried_once_per_backoff() {
    let state = Collected {
        fail_first: Arc::new(AtomicU32::new(2)),
        ..Default::default()
    };
    let p = Pipeline::new(
        Box::new(VecReader::ints(5)),
        Vec::new(),
        Box::new(VecWriter { state: state.clone() }),
    )
    .with_options(EngineOptions {
        batch_size: 5,
        retry: RetryPolicy::new(3, Duration::from_millis(10)),
        ..Default::default()
    });
    let started = std::time::Instant::now();
    let written = p.run(&RunContext::new()).await.unwrap();
    assert_eq!(written, 5);
    // Two failures: 10ms + 20ms of backoff at minimum.
    assert!(started.elapsed() >= Duration::from_millis(30));
    assert_eq!(state.rows.lock().unwrap().len(), 5);
    assert_eq!(state.completes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn exhausted_retries_surface_the_error_and_skip_complete() {
    let state = Collected {
        fail_first: Arc::new(AtomicU32::new(100)),
        ..Default::default()
    };
    let p = Pipeline::new(
        Box::new(VecReader::ints(5)),
        Vec::new(),
        Box::new(VecWriter { state: state.clone() }),
    )
    .with_options(EngineOptions {
        batch_size: 5,
        retry: RetryPolicy::new(2, Duration::from_millis(1)),
        ..Default::default()
    });
    let err = p.run(&RunContext::new()).await.unwrap_err();
    assert!(matches!(err.root(), PipeError::Transient(_)));
    assert_eq!(state.completes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancellation_stops_the_run_quickly() {
    let state = Collected {
        write_delay: Some(Duration::from_millis(20)),
        ..Default::default()
    };
    let p = Pipeline::new(
        Box::new(VecReader::ints(100_000)),
        Vec::new(),
        Box::new(VecWriter { state: state.clone() }),
    )
    .with_options(EngineOptions { batch_size: 100, ..Default::default() });

    let cancel = CancellationToken::new();
    let ctx = RunContext::with_cancel(cancel.clone());
    let handle = tokio::spawn(async move { p.run(&ctx).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let written_at_cancel = state.rows.lock().unwrap().len();
    cancel.cancel();
    let err = handle.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(err.exit_code(), 130);
    // No completion, and only batches already in flight landed.
    assert_eq!(state.completes.load(Ordering::SeqCst), 0);
    assert!(state.rows.lock().unwrap().len() <= written_at_cancel + 200);
}

#[tokio::test]
async fn progress_reports_reach_subscribers() {
    let (p, _) = pipeline(50, Vec::new(), EngineOptions { batch_size: 10, ..Default::default() });
    let progress = p.progress();
    p.run(&RunContext::new()).await.unwrap();
    let snap = *progress.borrow();
    assert_eq!(snap.rows_read, 50);
    assert_eq!(snap.rows_written, 50);
    assert_eq!(snap.batches_written, 5);
}

/// Tracks disposal ordering across the three components.
struct OrderProbe {
    label: &'static str,
    order: Arc<Mutex<Vec<&'static str>>>,
    inner_rows: i64,
    cursor: usize,
    columns: Vec<Column>,
}

#[async_trait]
impl Reader for OrderProbe {
    async fn open(&mut self, _ctx: &RunContext) -> Result<()> {
        Ok(())
    }
    fn columns(&self) -> &[Column] {
        &self.columns
    }
    async fn next_batch(&mut self, batch_size: usize, _ctx: &RunContext) -> Result<Option<Batch>> {
        if self.cursor >= self.inner_rows as usize {
            return Ok(None);
        }
        let end = (self.cursor + batch_size).min(self.inner_rows as usize);
        let batch: Batch = (self.cursor..end)
            .map(|i| Row::new(vec![Value::Int64(i as i64)]))
            .collect();
        self.cursor = end;
        Ok(Some(batch))
    }
    async fn dispose(&mut self) -> Result<()> {
        self.order.lock().unwrap().push(self.label);
        Ok(())
    }
}

struct DisposingWriter {
    order: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl Writer for DisposingWriter {
    async fn inspect_target(&mut self, _ctx: &RunContext) -> Result<Option<TargetSchema>> {
        Ok(None)
    }
    async fn initialize(&mut self, _columns: &[Column], _ctx: &RunContext) -> Result<()> {
        Ok(())
    }
    async fn write_batch(&mut self, _batch: &Batch, _ctx: &RunContext) -> Result<()> {
        Ok(())
    }
    async fn complete(&mut self, _ctx: &RunContext) -> Result<()> {
        Ok(())
    }
    async fn dispose(&mut self) -> Result<()> {
        self.order.lock().unwrap().push("writer");
        Ok(())
    }
}

#[tokio::test]
async fn disposal_runs_writer_before_reader() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let reader = OrderProbe {
        label: "reader",
        order: order.clone(),
        inner_rows: 10,
        cursor: 0,
        columns: vec![Column::new("v", LogicalType::Int64)],
    };
    let writer = DisposingWriter { order: order.clone() };
    let p = Pipeline::new(Box::new(reader), Vec::new(), Box::new(writer));
    p.run(&RunContext::new()).await.unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["writer", "reader"]);
}

#[tokio::test]
async fn rows_read_is_an_upper_bound_for_rows_written() {
    let (p, _) = pipeline(
        333,
        vec![Box::new(KeepEven)],
        EngineOptions {
            batch_size: 16,
            sampling_rate: Some(0.5),
            sample_seed: Some(1),
            ..Default::default()
        },
    );
    let progress = p.progress();
    let written = p.run(&RunContext::new()).await.unwrap();
    let snap = *progress.borrow();
    assert_eq!(snap.rows_written, written);
    assert!(snap.rows_written <= snap.rows_read);
}
