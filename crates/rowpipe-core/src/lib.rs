//! # rowpipe-core — Streaming ETL Core Library
//!
//! This crate provides the foundational types, contracts and machinery for
//! moving tabular data: the row/column/schema model, the reader and writer
//! contracts, the transformer chain, the three-stage pipeline engine and the
//! resilience layer (retries, cancellation, failure diagnostics).
//!
//! ## Key Components
//!
//! - **Row model**: positional rows of typed values with culture-invariant
//!   coercion ([`row`])
//! - **Contracts**: `Reader`, `Writer`, `Transformer` traits and the run
//!   context ([`contract`])
//! - **Engine**: bounded-channel producer/transform/consumer stages with
//!   coordinated cancellation ([`engine`])
//! - **Compatibility**: dialect-aware column matching and schema analysis
//!   ([`compat`], [`dialect`])
//! - **Resilience**: write retries and per-row batch diagnostics
//!   ([`retry`], [`diagnose`])
//!
//! ## Example
//!
//! ```no_run
//! use rowpipe_core::contract::RunContext;
//! use rowpipe_core::engine::Pipeline;
//!
//! # async fn example(reader: Box<dyn rowpipe_core::contract::Reader>,
//! #                  writer: Box<dyn rowpipe_core::contract::Writer>) -> rowpipe_core::error::Result<()> {
//! let pipeline = Pipeline::new(reader, Vec::new(), writer);
//! let rows_written = pipeline.run(&RunContext::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod chain;
pub mod compat;
pub mod config;
pub mod contract;
pub mod dialect;
pub mod diagnose;
pub mod engine;
pub mod error;
pub mod options;
pub mod progress;
pub mod retry;
pub mod row;
pub mod schema;

pub use contract::{Reader, RunContext, Transformer, WriteStrategy, Writer};
pub use error::{PipeError, Result};
pub use row::{Batch, LogicalType, Row, Value};
pub use schema::{Column, Schema, TargetColumn, TargetSchema};
