//! Ordered transformer composition.
//!
//! Rows are threaded through the chain in order; a stage that emits no rows
//! drops the input and later stages never see it. At end-of-stream each
//! transformer's `flush` runs in pipeline order, and flush output at position
//! *i* is threaded through positions *i+1..n* as if freshly read — never back
//! into the flushing transformer itself.

use crate::contract::Transformer;
use crate::error::Result;
use crate::row::Row;
use crate::schema::Schema;

pub struct TransformChain {
    transformers: Vec<Box<dyn Transformer>>,
    output_schema: Schema,
}

impl TransformChain {
    pub fn new(transformers: Vec<Box<dyn Transformer>>) -> Self {
        TransformChain {
            transformers,
            output_schema: Schema::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.transformers.is_empty()
    }

    /// Initialize every transformer with its upstream schema and return the
    /// composed output schema.
    pub fn initialize(&mut self, input: &Schema) -> Result<Schema> {
        let mut schema = input.clone();
        for t in &mut self.transformers {
            schema = t.initialize(&schema)?;
        }
        self.output_schema = schema.clone();
        Ok(schema)
    }

    pub fn output_schema(&self) -> &Schema {
        &self.output_schema
    }

    /// Thread one input row through the whole chain.
    pub fn push_row(&mut self, row: Row) -> Result<Vec<Row>> {
        Self::thread_from(&mut self.transformers, 0, row)
    }

    /// Run all flushes in order, threading each flush's output through the
    /// downstream remainder of the chain.
    pub fn flush_all(&mut self) -> Result<Vec<Row>> {
        let mut out = Vec::new();
        for i in 0..self.transformers.len() {
            let flushed = self.transformers[i].flush()?;
            for row in flushed {
                out.extend(Self::thread_from(&mut self.transformers, i + 1, row)?);
            }
        }
        Ok(out)
    }

    /// Dispose every transformer, in pipeline order. Must run on the thread
    /// that executed the per-row methods.
    pub fn dispose_all(&mut self) {
        for t in &mut self.transformers {
            t.dispose();
        }
    }

    fn thread_from(
        transformers: &mut [Box<dyn Transformer>],
        start: usize,
        row: Row,
    ) -> Result<Vec<Row>> {
        let mut current = vec![row];
        for t in transformers[start..].iter_mut() {
            let mut next = Vec::with_capacity(current.len());
            for row in current {
                next.extend(t.transform_many(row)?);
            }
            if next.is_empty() {
                return Ok(next);
            }
            current = next;
        }
        Ok(current)
    }
}
