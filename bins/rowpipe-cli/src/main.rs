//! # rowpipe — Streaming Data Movement CLI
//!
//! Moves tabular rows from a source, through an optional transformer chain,
//! into a target. Sources and targets are connection strings (file paths,
//! `provider:` prefixes, `generate:N`, or `-` for stdio); transformers come
//! from a YAML pipeline file.
//!
//! ## Usage
//!
//! ```bash
//! # File to file
//! rowpipe input.csv output.jsonl
//!
//! # Query a database into parquet, sampling 10%
//! rowpipe db.sqlite out.parquet --query "SELECT * FROM events" --sampling-rate 0.1
//!
//! # Full pipeline from YAML
//! rowpipe --pipeline nightly.yml
//!
//! # Upsert into an existing table
//! rowpipe staging.csv prod.sqlite --strategy upsert --set-target table=users
//! ```
//!
//! Exit codes: 0 success, 1 configuration error, 2 runtime error, 130 when
//! cancelled by ctrl-c.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rowpipe_core::config::{PipelineSpec, Tuning};
use rowpipe_core::contract::{RunContext, WriteStrategy};
use rowpipe_core::engine::{EngineOptions, Pipeline};
use rowpipe_core::error::{redact_connection_string, PipeError, Result};
use rowpipe_tx::create_transformer;

/// Command-line arguments for the pipeline runner
#[derive(Parser, Debug)]
#[command(name = "rowpipe")]
#[command(about = "Streaming tabular data movement")]
#[command(long_about = "
rowpipe reads rows from a source, threads them through an ordered chain of
transformers, and writes them to a target. Connection strings select the
provider by prefix, file extension, or content; `-` reads stdin / writes
stdout.

Examples:
  rowpipe input.csv output.jsonl
  rowpipe db.sqlite out.parquet --query 'SELECT * FROM events'
  rowpipe generate:100000 load.sqlite --set-target table=load_test
  rowpipe --pipeline nightly.yml
")]
struct Args {
    /// Source connection string (omit when --pipeline is given)
    source: Option<String>,

    /// Target connection string (omit when --pipeline is given)
    target: Option<String>,

    /// Pipeline YAML file with source, target, transforms and tuning
    #[arg(short, long)]
    pipeline: Option<PathBuf>,

    /// Query or table name for SQL sources
    #[arg(short, long)]
    query: Option<String>,

    /// Write strategy: append, truncate, recreate, delete-then-insert,
    /// upsert, ignore
    #[arg(long)]
    strategy: Option<String>,

    /// Rows per batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Stop after this many rows
    #[arg(long)]
    limit: Option<u64>,

    /// Bernoulli sampling probability in (0, 1]
    #[arg(long)]
    sampling_rate: Option<f64>,

    /// Seed for reproducible sampling
    #[arg(long)]
    sample_seed: Option<u64>,

    /// Query timeout in seconds for SQL sources
    #[arg(long)]
    query_timeout: Option<u64>,

    /// Source provider option, `key=value`; repeatable
    #[arg(long = "set", value_name = "KEY=VALUE")]
    source_options: Vec<String>,

    /// Target provider option, `key=value`; repeatable
    #[arg(long = "set-target", value_name = "KEY=VALUE")]
    target_options: Vec<String>,

    /// Run the query even when the read-only screen rejects it
    #[arg(long)]
    unsafe_query: bool,

    /// Inspect the target and report schema compatibility without writing
    #[arg(long)]
    check: bool,
}

fn parse_pairs(raw: &[String]) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for entry in raw {
        let (key, value) = entry.split_once('=').ok_or_else(|| {
            PipeError::InvalidArgument(format!("option '{entry}' is not key=value"))
        })?;
        map.insert(key.trim().to_string(), value.to_string());
    }
    Ok(map)
}

/// Merge CLI flags over the YAML pipeline (flags win).
fn build_spec(args: &Args) -> Result<PipelineSpec> {
    let mut spec: PipelineSpec = match &args.pipeline {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|e| {
                PipeError::NotFound(format!("cannot read pipeline file {}: {e}", path.display()))
            })?;
            serde_yaml::from_str(&text).map_err(|e| {
                PipeError::InvalidConfiguration(format!("pipeline file does not parse: {e}"))
            })?
        }
        None => {
            let (Some(source), Some(target)) = (&args.source, &args.target) else {
                return Err(PipeError::InvalidArgument(
                    "a source and a target (or --pipeline) are required".into(),
                ));
            };
            PipelineSpec {
                source: source.clone(),
                query: None,
                target: target.clone(),
                strategy: WriteStrategy::Append,
                transforms: Vec::new(),
                tuning: Tuning::default(),
                source_options: BTreeMap::new(),
                target_options: BTreeMap::new(),
                allow_unsafe_query: false,
            }
        }
    };

    if let Some(source) = &args.source {
        spec.source = source.clone();
    }
    if let Some(target) = &args.target {
        spec.target = target.clone();
    }
    if let Some(query) = &args.query {
        spec.query = Some(query.clone());
    }
    if let Some(strategy) = &args.strategy {
        spec.strategy = strategy.parse()?;
    }
    if let Some(batch_size) = args.batch_size {
        spec.tuning.batch_size = batch_size;
    }
    if let Some(limit) = args.limit {
        spec.tuning.limit = Some(limit);
    }
    if let Some(rate) = args.sampling_rate {
        spec.tuning.sampling_rate = Some(rate);
    }
    if let Some(seed) = args.sample_seed {
        spec.tuning.sample_seed = Some(seed);
    }
    spec.source_options.extend(parse_pairs(&args.source_options)?);
    spec.target_options.extend(parse_pairs(&args.target_options)?);
    spec.allow_unsafe_query |= args.unsafe_query;
    Ok(spec)
}

async fn check_target(spec: &PipelineSpec, ctx: &RunContext) -> Result<()> {
    let mut reader =
        rowpipe_io::open_reader(&spec.source, spec.query.as_deref(), &spec.source_options, spec.allow_unsafe_query)?;
    reader.open(ctx).await?;
    let schema = rowpipe_core::schema::Schema::new(reader.columns().to_vec())?;
    let _ = reader.dispose().await;

    let mut writer = rowpipe_io::open_writer(&spec.target, spec.strategy, &spec.target_options)?;
    let target = writer.inspect_target(ctx).await?;
    let _ = writer.dispose().await;

    match &target {
        None => {
            println!("target is unreadable or corrupt");
            return Err(PipeError::Corrupt("target is unreadable".into()));
        }
        Some(t) if !t.exists => println!("target does not exist and will be created"),
        Some(t) => {
            let report = rowpipe_core::compat::analyze(&schema, Some(t), None);
            for warning in &report.warnings {
                println!("warning: {warning}");
            }
            for err in &report.errors {
                println!("error: {err}");
            }
            if !report.is_acceptable() && !spec.strategy.rebuilds_target() {
                return Err(PipeError::SchemaIncompatible(
                    "target schema is incompatible; use recreate or fix the target".into(),
                ));
            }
            println!("{} columns checked", report.findings.len());
        }
    }
    Ok(())
}

async fn run(spec: PipelineSpec, ctx: &RunContext) -> Result<u64> {
    let reader = rowpipe_io::open_reader(
        &spec.source,
        spec.query.as_deref(),
        &spec.source_options,
        spec.allow_unsafe_query,
    )?;
    let writer = rowpipe_io::open_writer(&spec.target, spec.strategy, &spec.target_options)?;

    let mut transformers = Vec::with_capacity(spec.transforms.len());
    for transform_spec in &spec.transforms {
        transformers.push(create_transformer(transform_spec)?);
    }

    let pipeline = Pipeline::new(reader, transformers, writer)
        .with_options(EngineOptions::from(&spec.tuning));

    // Periodic progress lines; the watch channel costs the stages nothing.
    let mut progress = pipeline.progress();
    let reporter = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(2));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if progress.changed().await.is_err() {
                break;
            }
            let snapshot = *progress.borrow();
            info!(
                rows_read = snapshot.rows_read,
                rows_written = snapshot.rows_written,
                "progress"
            );
        }
    });

    let outcome = pipeline.run(ctx).await;
    reporter.abort();
    outcome
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let spec = match build_spec(&args) {
        Ok(spec) => spec,
        Err(err) => {
            error!("{err}");
            std::process::exit(err.exit_code());
        }
    };

    let cancel = CancellationToken::new();
    let mut ctx = RunContext::with_cancel(cancel.clone());
    ctx.query_timeout = args.query_timeout.map(Duration::from_secs);

    let source_label = redact_connection_string(&spec.source);
    let target_label = redact_connection_string(&spec.target);

    if args.check {
        match check_target(&spec, &ctx).await {
            Ok(()) => std::process::exit(0),
            Err(err) => {
                error!(source = %source_label, target = %target_label, "{err}");
                std::process::exit(err.exit_code());
            }
        }
    }

    info!(source = %source_label, target = %target_label, "pipeline starting");

    let mut work = tokio::spawn(async move { run(spec, &ctx).await });

    tokio::select! {
        _ = signal::ctrl_c() => {
            warn!("received ctrl-c, shutting down");
            cancel.cancel();
            match (&mut work).await {
                Ok(Ok(rows)) => {
                    info!(rows_written = rows, "pipeline finished during shutdown");
                    std::process::exit(0);
                }
                _ => std::process::exit(130),
            }
        }
        outcome = &mut work => {
            match outcome {
                Ok(Ok(rows)) => {
                    info!(rows_written = rows, "done");
                    std::process::exit(0);
                }
                Ok(Err(err)) => {
                    // The diagnostic line (if any) is the error display; the
                    // root cause follows it.
                    error!(source = %source_label, target = %target_label, "{err}");
                    if let PipeError::Diagnosed { source, .. } = &err {
                        error!("caused by: {source}");
                    }
                    std::process::exit(err.exit_code());
                }
                Err(join_err) => {
                    error!("pipeline aborted: {join_err}");
                    std::process::exit(2);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Args {
        Args::parse_from(std::iter::once("rowpipe").chain(list.iter().copied()))
    }

    #[test]
    fn flags_override_pipeline_defaults() {
        let a = args(&[
            "in.csv",
            "out.jsonl",
            "--strategy",
            "upsert",
            "--batch-size",
            "128",
            "--set",
            "separator=;",
        ]);
        let spec = build_spec(&a).unwrap();
        assert_eq!(spec.source, "in.csv");
        assert_eq!(spec.strategy, WriteStrategy::Upsert);
        assert_eq!(spec.tuning.batch_size, 128);
        assert_eq!(spec.source_options.get("separator").map(String::as_str), Some(";"));
    }

    #[test]
    fn missing_source_and_pipeline_is_invalid() {
        let a = args(&[]);
        assert!(matches!(
            build_spec(&a).unwrap_err(),
            PipeError::InvalidArgument(_)
        ));
    }

    #[test]
    fn bad_option_pair_is_invalid() {
        let a = args(&["in.csv", "out.csv", "--set", "notapair"]);
        assert!(build_spec(&a).is_err());
    }

    #[test]
    fn pipeline_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.yml");
        std::fs::write(
            &path,
            "source: a.csv\ntarget: b.sqlite\nstrategy: truncate\ntransforms:\n  - type: filter\n    expressions: ['row.x > 0']\n",
        )
        .unwrap();
        let a = args(&["--pipeline", path.to_str().unwrap()]);
        let spec = build_spec(&a).unwrap();
        assert_eq!(spec.strategy, WriteStrategy::Truncate);
        assert_eq!(spec.transforms.len(), 1);
    }
}
