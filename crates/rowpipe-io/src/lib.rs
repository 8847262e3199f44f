//! # rowpipe-io — Data Source and Sink Implementations
//!
//! This crate provides the concrete readers and writers behind the pipeline
//! contracts, plus the connection-string dispatch that picks one.
//!
//! ## Sources
//! - **CSV / JSON lines**: line-oriented text, string-carrier rows
//! - **Parquet / Arrow IPC**: columnar files via the Arrow interchange
//! - **SQLite**: screened queries or bare table names
//! - **generate:N**: synthetic indexed rows with optional throttling
//!
//! ## Sinks
//! - **CSV / JSON lines**: append-style text output, `-` for stdout
//! - **Parquet** (row group per batch, Snappy) / **Arrow IPC**
//! - **SQLite**: the full write-strategy table with client-side diffing
//! - **Checksum** (`.sha256`): order-sensitive chained digest

/// Provider registry and connection-string dispatch
pub mod dispatch;

/// CSV source and sink
pub mod csv;

/// JSON-lines source and sink
pub mod jsonl;

/// Parquet source and sink
pub mod parquet;

/// Arrow IPC source and sink
pub mod arrow_ipc;

/// Chained-digest checksum sink
pub mod checksum;

/// SQLite dialect, source and sink
pub mod sqlite;

/// Synthetic row source
pub mod generate;

/// Read-only SQL screening
pub mod query_safety;

/// Row/Arrow conversion helpers
pub mod convert;

/// Stdin/stdout plumbing for `-` locations
pub mod stdio;

pub use dispatch::{open_reader, open_writer, registry, resolve};
