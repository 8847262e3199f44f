//! Checksum sink (`.sha256`).
//!
//! Rather than storing rows, this sink folds them into a running hash:
//!
//! ```text
//! H_0     = 0^32
//! H_{n+1} = SHA-256(H_n || SHA-256(canonicalize(row_n)))
//! ```
//!
//! The chain makes the digest order-sensitive, so two row streams with the
//! same content in different orders produce different digests. The final
//! digest is written in hex to the target on completion.

use std::io::Write;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use rowpipe_core::contract::{RunContext, WriteStrategy, Writer};
use rowpipe_core::error::{PipeError, Result};
use rowpipe_core::row::{Batch, Row};
use rowpipe_core::schema::{Column, TargetSchema};

use crate::stdio;

pub struct ChecksumSink {
    location: String,
    strategy: WriteStrategy,
    state: [u8; 32],
    output: Option<Box<dyn Write + Send>>,
}

impl ChecksumSink {
    pub fn new(location: impl Into<String>, strategy: WriteStrategy) -> Self {
        ChecksumSink {
            location: location.into(),
            strategy,
            state: [0u8; 32],
            output: None,
        }
    }

    /// Pipe-joined culture-invariant fields; `canonical_text` renders null as
    /// `NULL` and timestamps as `yyyy-MM-dd HH:mm:ss.fff`.
    fn canonicalize(row: &Row) -> String {
        row.0
            .iter()
            .map(|v| v.canonical_text())
            .collect::<Vec<_>>()
            .join("|")
    }

    fn fold(&mut self, row: &Row) {
        let inner = Sha256::digest(Self::canonicalize(row).as_bytes());
        let mut outer = Sha256::new();
        outer.update(self.state);
        outer.update(inner);
        self.state = outer.finalize().into();
    }

    pub fn digest_hex(&self) -> String {
        self.state.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[async_trait]
impl Writer for ChecksumSink {
    async fn inspect_target(&mut self, _ctx: &RunContext) -> Result<Option<TargetSchema>> {
        Ok(Some(TargetSchema::missing()))
    }

    async fn initialize(&mut self, _columns: &[Column], _ctx: &RunContext) -> Result<()> {
        if self.strategy != WriteStrategy::Append {
            return Err(PipeError::Unsupported(
                "checksum sinks only accept append".into(),
            ));
        }
        self.state = [0u8; 32];
        self.output = Some(stdio::open_output(&self.location, false)?);
        Ok(())
    }

    async fn write_batch(&mut self, batch: &Batch, ctx: &RunContext) -> Result<()> {
        ctx.ensure_active()?;
        if self.output.is_none() {
            return Err(PipeError::InvalidArgument("writer is not initialized".into()));
        }
        for row in batch {
            self.fold(row);
        }
        Ok(())
    }

    async fn complete(&mut self, _ctx: &RunContext) -> Result<()> {
        let digest = self.digest_hex();
        if let Some(output) = self.output.as_mut() {
            writeln!(output, "{digest}").map_err(|e| PipeError::Transient(e.to_string()))?;
            output
                .flush()
                .map_err(|e| PipeError::Transient(e.to_string()))?;
        }
        self.output = None;
        Ok(())
    }

    async fn dispose(&mut self) -> Result<()> {
        self.output = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowpipe_core::row::Value;

    fn row(id: i64, s: &str) -> Row {
        Row::new(vec![Value::Int64(id), Value::String(s.into())])
    }

    fn digest_of(rows: &[Row]) -> String {
        let mut sink = ChecksumSink::new("-", WriteStrategy::Append);
        for r in rows {
            sink.fold(r);
        }
        sink.digest_hex()
    }

    #[test]
    fn reordering_rows_changes_the_digest() {
        let d1 = digest_of(&[row(1, "a"), row(2, "b")]);
        let d2 = digest_of(&[row(2, "b"), row(1, "a")]);
        assert_ne!(d1, d2);
        // Same order, same digest.
        assert_eq!(d1, digest_of(&[row(1, "a"), row(2, "b")]));
    }

    #[test]
    fn canonical_form_uses_pipes_and_null_literal() {
        let r = Row::new(vec![Value::Int64(1), Value::Null, Value::String("x".into())]);
        assert_eq!(ChecksumSink::canonicalize(&r), "1|NULL|x");
    }

    #[tokio::test]
    async fn writes_hex_digest_on_complete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.sha256");
        let ctx = RunContext::new();
        let mut sink = ChecksumSink::new(path.to_str().unwrap(), WriteStrategy::Append);
        sink.initialize(&[Column::new("v", rowpipe_core::row::LogicalType::Int64)], &ctx)
            .await
            .unwrap();
        sink.write_batch(&vec![row(1, "a")], &ctx).await.unwrap();
        sink.complete(&ctx).await.unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.trim().len(), 64);
        assert!(text.trim().chars().all(|c| c.is_ascii_hexdigit()));
    }
}
