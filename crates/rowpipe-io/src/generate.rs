//! Synthetic row source (`generate:N`).
//!
//! Emits `N` rows with a single `GenerateIndex` column, optionally paced to
//! a rows-per-second budget by sleeping up to the expected elapsed time at
//! each batch boundary.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use rowpipe_core::contract::{Reader, RunContext};
use rowpipe_core::error::{PipeError, Result};
use rowpipe_core::options::{OptionField, OptionSchema, Options};
use rowpipe_core::row::{Batch, LogicalType, Row, Value};
use rowpipe_core::schema::Column;

pub struct GenerateSource {
    total: u64,
    produced: u64,
    rows_per_second: Option<f64>,
    started: Option<Instant>,
    columns: Vec<Column>,
}

impl GenerateSource {
    pub fn options_schema() -> OptionSchema {
        OptionSchema {
            provider: "generate",
            fields: vec![OptionField::scalar(
                "rows_per_second",
                "throttle production to this rate",
                None,
            )],
        }
    }

    /// `spec` is the text after the provider prefix: the row count.
    pub fn from_spec(spec: &str, options: &Options) -> Result<Self> {
        let total: u64 = spec.trim().parse().map_err(|_| {
            PipeError::InvalidArgument(format!(
                "generate expects a row count, got '{spec}'"
            ))
        })?;
        let rows_per_second = options.get_f64("rows_per_second")?;
        if let Some(rate) = rows_per_second {
            if rate <= 0.0 {
                return Err(PipeError::InvalidConfiguration(
                    "rows_per_second must be positive".into(),
                ));
            }
        }
        Ok(GenerateSource {
            total,
            produced: 0,
            rows_per_second,
            started: None,
            columns: vec![Column::new("GenerateIndex", LogicalType::Int64).not_null()],
        })
    }
}

#[async_trait]
impl Reader for GenerateSource {
    async fn open(&mut self, _ctx: &RunContext) -> Result<()> {
        self.started = Some(Instant::now());
        Ok(())
    }

    fn columns(&self) -> &[Column] {
        &self.columns
    }

    async fn next_batch(&mut self, batch_size: usize, ctx: &RunContext) -> Result<Option<Batch>> {
        ctx.ensure_active()?;
        if self.produced >= self.total {
            return Ok(None);
        }
        let n = (self.total - self.produced).min(batch_size as u64);
        let batch: Batch = (self.produced..self.produced + n)
            .map(|i| Row::new(vec![Value::Int64(i as i64)]))
            .collect();
        self.produced += n;

        if let (Some(rate), Some(started)) = (self.rows_per_second, self.started) {
            let expected = Duration::from_secs_f64(self.produced as f64 / rate);
            let elapsed = started.elapsed();
            if expected > elapsed {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return Err(PipeError::Cancelled),
                    _ = tokio::time::sleep(expected - elapsed) => {}
                }
            }
        }
        Ok(Some(batch))
    }

    async fn dispose(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emits_exactly_n_indexed_rows() {
        let mut source = GenerateSource::from_spec("7", &Options::default()).unwrap();
        let ctx = RunContext::new();
        source.open(&ctx).await.unwrap();
        assert_eq!(source.columns()[0].name, "GenerateIndex");

        let first = source.next_batch(5, &ctx).await.unwrap().unwrap();
        let second = source.next_batch(5, &ctx).await.unwrap().unwrap();
        assert_eq!(first.len(), 5);
        assert_eq!(second.len(), 2);
        assert_eq!(second[1].get(0), &Value::Int64(6));
        assert!(source.next_batch(5, &ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn throttle_paces_batches() {
        let options = Options::from_pairs([(
            "rows_per_second".to_string(),
            "100".to_string(),
        )]);
        let mut source = GenerateSource::from_spec("20", &options).unwrap();
        let ctx = RunContext::new();
        source.open(&ctx).await.unwrap();
        let started = Instant::now();
        while source.next_batch(10, &ctx).await.unwrap().is_some() {}
        // 20 rows at 100 rows/s is at least 200ms of pacing.
        assert!(started.elapsed() >= Duration::from_millis(180));
    }

    #[test]
    fn bad_specs_fail() {
        assert!(GenerateSource::from_spec("abc", &Options::default()).is_err());
        let bad_rate =
            Options::from_pairs([("rows_per_second".to_string(), "-5".to_string())]);
        assert!(GenerateSource::from_spec("10", &bad_rate).is_err());
    }
}
