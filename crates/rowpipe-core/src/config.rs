//! Pipeline specification loaded from YAML.
//!
//! The CLI deserializes this with serde_yaml and hands the pieces to the
//! provider dispatch, the transformer factory and the engine. Transform
//! entries are a tagged enum so a pipeline file reads as a list of steps:
//!
//! ```yaml
//! source: input.csv
//! target: out.sqlite
//! strategy: upsert
//! transforms:
//!   - type: filter
//!     expressions: ["row.amount > 0"]
//!   - type: format
//!     mappings: ["FULL:{{FIRST}} {{LAST}}"]
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::contract::WriteStrategy;
use crate::row::DEFAULT_BATCH_SIZE;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Source connection string (provider prefix, file path, `generate:N`
    /// or `-` for stdin).
    pub source: String,

    /// Query or table name for SQL sources.
    #[serde(default)]
    pub query: Option<String>,

    /// Target connection string, or `-` for stdout.
    pub target: String,

    #[serde(default)]
    pub strategy: WriteStrategy,

    #[serde(default)]
    pub transforms: Vec<TransformSpec>,

    #[serde(default)]
    pub tuning: Tuning,

    /// Raw provider options for the source, validated by the provider's
    /// declared option schema.
    #[serde(default)]
    pub source_options: BTreeMap<String, String>,

    #[serde(default)]
    pub target_options: BTreeMap<String, String>,

    /// Skip the read-only screen on SQL queries; a warning is recorded
    /// instead of an error.
    #[serde(default)]
    pub allow_unsafe_query: bool,
}

/// Knobs with workable defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tuning {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Stop after producing this many rows.
    #[serde(default)]
    pub limit: Option<u64>,

    /// Bernoulli sampling probability in (0, 1].
    #[serde(default)]
    pub sampling_rate: Option<f64>,

    /// Seed for reproducible sampling.
    #[serde(default)]
    pub sample_seed: Option<u64>,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Capacity of the reader-to-transform row queue.
    #[serde(default = "default_queue_rows")]
    pub queue_rows: usize,

    /// Capacity of the transform-to-writer batch queue.
    #[serde(default = "default_queue_batches")]
    pub queue_batches: usize,
}

impl Default for Tuning {
    fn default() -> Self {
        Tuning {
            batch_size: default_batch_size(),
            limit: None,
            sampling_rate: None,
            sample_seed: None,
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            queue_rows: default_queue_rows(),
            queue_batches: default_queue_batches(),
        }
    }
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_queue_rows() -> usize {
    1_000
}

fn default_queue_batches() -> usize {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransformSpec {
    /// Blank out the named columns. Unknown names are ignored.
    #[serde(rename = "null")]
    Null { columns: Vec<String> },

    /// Write a fixed value per column; `COL:value` or `COL=value`.
    #[serde(rename = "overwrite")]
    Overwrite {
        mappings: Vec<String>,
        #[serde(default)]
        skip_null: bool,
    },

    /// Template substitution into target columns; `TARGET:template` with
    /// `{{COL}}` raw and `{COL:fmt}` formatted references.
    #[serde(rename = "format")]
    Format { mappings: Vec<String> },

    /// Drop rows whose first falsy expression fires.
    #[serde(rename = "filter")]
    Filter { expressions: Vec<String> },

    /// Scripts returning arrays of row objects; one output row per element.
    #[serde(rename = "expand")]
    Expand { scripts: Vec<String> },

    /// Buffer rows and hand the accumulated array to a script.
    #[serde(rename = "window")]
    Window {
        #[serde(default)]
        count: Option<usize>,
        #[serde(default)]
        key: Option<String>,
        script: String,
    },

    /// Evaluate `COL:expr` per row and write the result back.
    #[serde(rename = "script")]
    Script { mappings: Vec<String> },

    /// Synthetic or anonymized values; `COL:generator.path` or a template.
    #[serde(rename = "fake")]
    Fake {
        mappings: Vec<String>,
        #[serde(default)]
        deterministic: bool,
        #[serde(default)]
        seed_column: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_round_trip_with_defaults() {
        let yaml = r#"
source: data.csv
target: out.jsonl
transforms:
  - type: filter
    expressions: ["row.v > 0"]
  - type: window
    count: 100
    script: "rows"
"#;
        let spec: PipelineSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.strategy, WriteStrategy::Append);
        assert_eq!(spec.tuning.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(spec.transforms.len(), 2);
        match &spec.transforms[1] {
            TransformSpec::Window { count, key, .. } => {
                assert_eq!(*count, Some(100));
                assert!(key.is_none());
            }
            other => panic!("unexpected spec: {other:?}"),
        }
    }

    #[test]
    fn strategy_parses_kebab_case() {
        let spec: PipelineSpec = serde_yaml::from_str(
            "source: a.csv\ntarget: b.sqlite\nstrategy: delete-then-insert\n",
        )
        .unwrap();
        assert_eq!(spec.strategy, WriteStrategy::DeleteThenInsert);
    }
}
