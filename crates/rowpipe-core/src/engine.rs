//! The three-stage pipeline engine.
//!
//! ```text
//! Reader -> Q1 (rows, cap 1000) -> Transform chain -> Q2 (batches, cap 100) -> Writer
//! ```
//!
//! Producer and consumer run as tokio tasks; the transform chain runs on a
//! dedicated blocking thread so scripted transformers keep their engines
//! thread-local. Both queues are bounded with block-on-full semantics, so a
//! slow writer backpressures all the way to the reader. A single linked
//! cancellation token covers every stage: the first failure cancels the rest,
//! and every blocking call observes the token at its next suspension point.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::chain::TransformChain;
use crate::contract::{Reader, RunContext, Transformer, Writer};
use crate::diagnose::BatchFailureAnalyzer;
use crate::error::{PipeError, Result};
use crate::progress::{Progress, ProgressSnapshot};
use crate::retry::RetryPolicy;
use crate::row::{Batch, Row, DEFAULT_BATCH_SIZE};
use crate::schema::{Schema, TargetSchema};

/// Engine tuning; every field has a workable default.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub batch_size: usize,
    pub limit: Option<u64>,
    /// Bernoulli sampling probability in (0, 1]; `None` keeps every row.
    pub sampling_rate: Option<f64>,
    pub sample_seed: Option<u64>,
    pub queue_rows: usize,
    pub queue_batches: usize,
    pub retry: RetryPolicy,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            batch_size: DEFAULT_BATCH_SIZE,
            limit: None,
            sampling_rate: None,
            sample_seed: None,
            queue_rows: 1_000,
            queue_batches: 100,
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&crate::config::Tuning> for EngineOptions {
    fn from(t: &crate::config::Tuning) -> Self {
        EngineOptions {
            batch_size: t.batch_size.max(1),
            limit: t.limit,
            sampling_rate: t.sampling_rate,
            sample_seed: t.sample_seed,
            queue_rows: t.queue_rows.max(1),
            queue_batches: t.queue_batches.max(1),
            retry: RetryPolicy::new(
                t.max_attempts,
                std::time::Duration::from_millis(t.initial_delay_ms),
            ),
        }
    }
}

/// One pipeline run: a reader, an ordered transformer chain and a writer,
/// owned exclusively by the engine until they are disposed.
pub struct Pipeline {
    reader: Box<dyn Reader>,
    chain: TransformChain,
    writer: Box<dyn Writer>,
    options: EngineOptions,
    progress: Progress,
    progress_rx: watch::Receiver<ProgressSnapshot>,
}

impl Pipeline {
    pub fn new(
        reader: Box<dyn Reader>,
        transformers: Vec<Box<dyn Transformer>>,
        writer: Box<dyn Writer>,
    ) -> Self {
        let (progress, progress_rx) = Progress::new();
        Pipeline {
            reader,
            chain: TransformChain::new(transformers),
            writer,
            options: EngineOptions::default(),
            progress,
            progress_rx,
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Subscribe to progress snapshots.
    pub fn progress(&self) -> watch::Receiver<ProgressSnapshot> {
        self.progress_rx.clone()
    }

    /// Run to completion. Returns the total number of rows accepted by the
    /// writer. Reader, transformers and writer are disposed in reverse
    /// creation order even on failure.
    pub async fn run(mut self, caller_ctx: &RunContext) -> Result<u64> {
        if let Some(rate) = self.options.sampling_rate {
            if !(rate > 0.0 && rate <= 1.0) {
                return Err(PipeError::InvalidConfiguration(format!(
                    "sampling rate must be in (0, 1], got {rate}"
                )));
            }
        }

        // Engine-local token linked to the caller's: either side can cancel.
        let ctx = caller_ctx.child();

        let setup = self.setup(&ctx).await;
        let (out_schema, target) = match setup {
            Ok(pair) => pair,
            Err(err) => {
                self.dispose_after_setup_failure().await;
                return Err(err);
            }
        };

        let (q1_tx, q1_rx) = mpsc::channel::<Row>(self.options.queue_rows);
        let (q2_tx, q2_rx) = mpsc::channel::<Batch>(self.options.queue_batches);

        let producer = spawn_producer(
            self.reader,
            q1_tx,
            ctx.clone(),
            self.options.clone(),
            self.progress.clone(),
        );
        let transformer = spawn_transform_stage(
            self.chain,
            q1_rx,
            q2_tx,
            ctx.clone(),
            self.options.batch_size,
        );
        let consumer = spawn_consumer(
            self.writer,
            q2_rx,
            ctx.clone(),
            self.options.retry,
            out_schema,
            target,
            self.progress.clone(),
        );

        let (reader, produce_res) = await_stage(producer, &ctx).await;
        let (_chain, transform_res) = await_stage(transformer, &ctx).await;
        let (writer, consume_res) = await_stage(consumer, &ctx).await;

        // Reverse creation order: writer, transformers, reader.
        if let Some(mut writer) = writer {
            let _ = writer.dispose().await;
        }
        if let Some(mut reader) = reader {
            let _ = reader.dispose().await;
        }

        let rows_written = match (produce_res, transform_res, consume_res) {
            (Ok(read), Ok(()), Ok(written)) => {
                info!(rows_read = read, rows_written = written, "pipeline complete");
                written
            }
            (p, t, c) => {
                let errors: Vec<PipeError> = [p.err(), t.err(), c.err()]
                    .into_iter()
                    .flatten()
                    .collect();
                let chosen = errors
                    .into_iter()
                    .reduce(|a, b| if a.is_cancelled() && !b.is_cancelled() { b } else { a })
                    .unwrap_or(PipeError::Cancelled);
                return Err(chosen);
            }
        };
        Ok(rows_written)
    }

    /// Open the reader, initialize the chain and bind the writer.
    async fn setup(&mut self, ctx: &RunContext) -> Result<(Schema, Option<TargetSchema>)> {
        self.reader.open(ctx).await?;
        let schema = Schema::new(self.reader.columns().to_vec())?;
        let out_schema = self.chain.initialize(&schema)?;

        // A pre-initialize look at the target feeds the failure analyzer.
        let target = self.writer.inspect_target(ctx).await.ok().flatten();
        self.writer.initialize(out_schema.columns(), ctx).await?;
        debug!(columns = out_schema.len(), "writer bound to effective schema");
        Ok((out_schema, target))
    }

    async fn dispose_after_setup_failure(&mut self) {
        let _ = self.writer.dispose().await;
        self.chain.dispose_all();
        let _ = self.reader.dispose().await;
    }
}

/// Await a stage handle, cancelling peers on failure. Returns the component
/// the stage gave back (`None` if the task panicked).
async fn await_stage<C, T>(
    handle: JoinHandle<(C, Result<T>)>,
    ctx: &RunContext,
) -> (Option<C>, Result<T>) {
    match handle.await {
        Ok((component, Ok(value))) => (Some(component), Ok(value)),
        Ok((component, Err(err))) => {
            ctx.cancel.cancel();
            (Some(component), Err(err))
        }
        Err(join_err) => {
            ctx.cancel.cancel();
            (
                None,
                Err(PipeError::Other(anyhow::anyhow!(
                    "pipeline stage aborted: {join_err}"
                ))),
            )
        }
    }
}

fn spawn_producer(
    mut reader: Box<dyn Reader>,
    q1_tx: mpsc::Sender<Row>,
    ctx: RunContext,
    options: EngineOptions,
    progress: Progress,
) -> JoinHandle<(Box<dyn Reader>, Result<u64>)> {
    tokio::spawn(async move {
        let result = produce(&mut *reader, q1_tx, &ctx, &options, &progress).await;
        if result.is_err() {
            // Cancel immediately so peers stop at their next suspension
            // point instead of draining to completion.
            ctx.cancel.cancel();
        }
        (reader, result)
    })
}

async fn produce(
    reader: &mut dyn Reader,
    q1_tx: mpsc::Sender<Row>,
    ctx: &RunContext,
    options: &EngineOptions,
    progress: &Progress,
) -> Result<u64> {
    let mut rng = match options.sample_seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut produced: u64 = 0;

    'read: loop {
        ctx.ensure_active()?;
        let Some(batch) = reader.next_batch(options.batch_size, ctx).await? else {
            break;
        };
        progress.add_rows_read(batch.len() as u64);
        for row in batch {
            if let Some(rate) = options.sampling_rate {
                if rate < 1.0 && !rng.gen_bool(rate) {
                    continue;
                }
            }
            if let Some(limit) = options.limit {
                if produced >= limit {
                    // Close Q1 and ignore the rest of the source.
                    break 'read;
                }
            }
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(PipeError::Cancelled),
                sent = q1_tx.send(row) => {
                    if sent.is_err() {
                        // Downstream is gone; its error surfaces there.
                        break 'read;
                    }
                }
            }
            produced += 1;
        }
    }
    debug!(rows = produced, "producer finished");
    Ok(produced)
}

fn spawn_transform_stage(
    mut chain: TransformChain,
    q1_rx: mpsc::Receiver<Row>,
    q2_tx: mpsc::Sender<Batch>,
    ctx: RunContext,
    batch_size: usize,
) -> JoinHandle<(TransformChain, Result<()>)> {
    tokio::task::spawn_blocking(move || {
        let result = run_transform_stage(&mut chain, q1_rx, q2_tx, &ctx, batch_size);
        chain.dispose_all();
        if result.is_err() {
            ctx.cancel.cancel();
        }
        (chain, result)
    })
}

fn run_transform_stage(
    chain: &mut TransformChain,
    mut q1_rx: mpsc::Receiver<Row>,
    q2_tx: mpsc::Sender<Batch>,
    ctx: &RunContext,
    batch_size: usize,
) -> Result<()> {
    let mut buffer: Batch = Vec::with_capacity(batch_size.min(4_096));

    while let Some(row) = q1_rx.blocking_recv() {
        ctx.ensure_active()?;
        for out in chain.push_row(row)? {
            buffer.push(out);
            if buffer.len() >= batch_size {
                let full = std::mem::replace(&mut buffer, Vec::with_capacity(batch_size.min(4_096)));
                if q2_tx.blocking_send(full).is_err() {
                    return Ok(());
                }
            }
        }
    }

    ctx.ensure_active()?;
    for out in chain.flush_all()? {
        buffer.push(out);
        if buffer.len() >= batch_size {
            let full = std::mem::replace(&mut buffer, Vec::with_capacity(batch_size.min(4_096)));
            if q2_tx.blocking_send(full).is_err() {
                return Ok(());
            }
        }
    }
    if !buffer.is_empty() {
        let _ = q2_tx.blocking_send(buffer);
    }
    Ok(())
}

fn spawn_consumer(
    mut writer: Box<dyn Writer>,
    q2_rx: mpsc::Receiver<Batch>,
    ctx: RunContext,
    retry: RetryPolicy,
    schema: Schema,
    target: Option<TargetSchema>,
    progress: Progress,
) -> JoinHandle<(Box<dyn Writer>, Result<u64>)> {
    tokio::spawn(async move {
        let result =
            consume(&mut *writer, q2_rx, &ctx, retry, &schema, target.as_ref(), &progress).await;
        if result.is_err() {
            ctx.cancel.cancel();
        }
        (writer, result)
    })
}

async fn consume(
    writer: &mut dyn Writer,
    mut q2_rx: mpsc::Receiver<Batch>,
    ctx: &RunContext,
    retry: RetryPolicy,
    schema: &Schema,
    target: Option<&TargetSchema>,
    progress: &Progress,
) -> Result<u64> {
    let mut total: u64 = 0;

    loop {
        let batch = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(PipeError::Cancelled),
            batch = q2_rx.recv() => batch,
        };
        let Some(batch) = batch else { break };

        write_with_retry(writer, &batch, ctx, retry, schema, target).await?;
        total += batch.len() as u64;
        progress.add_rows_written(batch.len() as u64);
    }

    ctx.ensure_active()?;
    writer.complete(ctx).await?;
    Ok(total)
}

async fn write_with_retry(
    writer: &mut dyn Writer,
    batch: &Batch,
    ctx: &RunContext,
    retry: RetryPolicy,
    schema: &Schema,
    target: Option<&TargetSchema>,
) -> Result<()> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match writer.write_batch(batch, ctx).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) if attempt < retry.max_attempts && err.is_retryable() => {
                let delay = retry.backoff(attempt);
                tracing::warn!(
                    attempt,
                    max = retry.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "batch write failed, retrying: {err}"
                );
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return Err(PipeError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => {
                // Attach a per-row diagnostic when the batch content explains
                // the failure; keep the original error as the cause.
                let diag = BatchFailureAnalyzer::new(schema, target).analyze(batch);
                return Err(match diag {
                    Some(issue) => err.with_diagnostic(issue.render()),
                    None => err,
                });
            }
        }
    }
}
