//! # rowpipe-tx — Transformer Implementations
//!
//! This crate provides the transformer chain's building blocks: column-level
//! rewrites, template formatting, script-driven filtering/expansion/windowed
//! aggregation, and synthetic value generation. All scripted transformers
//! share the sandboxed expression engine in [`sandbox`].
//!
//! ## Available Transformers
//!
//! - **NullFill** — blank out columns
//! - **Overwrite** — static per-column values
//! - **Format** — `{{COL}}` / `{COL:fmt}` templates with dependency ordering
//! - **Filter** — boolean expressions, first falsy drops the row
//! - **Expand** — scripts returning arrays of row objects (1:N)
//! - **Window** — count/key-triggered buffered aggregation (N:M)
//! - **ScriptMap** — `COL:expr` rewrites (1:1)
//! - **Anonymize** — generator registry with deterministic seeding

pub mod basic;
pub mod fake;
pub mod format;
pub mod sandbox;
pub mod scripted;

pub use basic::{NullFill, Overwrite};
pub use fake::Anonymize;
pub use format::Format;
pub use scripted::{Expand, Filter, ScriptMap, Window};

use rowpipe_core::config::TransformSpec;
use rowpipe_core::contract::Transformer;
use rowpipe_core::error::Result;

/// Build a transformer from its configuration entry.
pub fn create_transformer(spec: &TransformSpec) -> Result<Box<dyn Transformer>> {
    Ok(match spec {
        TransformSpec::Null { columns } => Box::new(NullFill::new(columns.clone())),
        TransformSpec::Overwrite { mappings, skip_null } => {
            Box::new(Overwrite::parse(mappings, *skip_null)?)
        }
        TransformSpec::Format { mappings } => Box::new(Format::parse(mappings)?),
        TransformSpec::Filter { expressions } => Box::new(Filter::new(expressions.clone())),
        TransformSpec::Expand { scripts } => Box::new(Expand::new(scripts.clone())),
        TransformSpec::Window { count, key, script } => {
            Box::new(Window::new(*count, key.clone(), script.clone()))
        }
        TransformSpec::Script { mappings } => Box::new(ScriptMap::parse(mappings)?),
        TransformSpec::Fake {
            mappings,
            deterministic,
            seed_column,
        } => Box::new(Anonymize::parse(mappings, *deterministic, seed_column.clone())?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_builds_each_kind() {
        let specs: Vec<TransformSpec> = serde_yaml::from_str(
            r#"
- type: "null"
  columns: [a]
- type: overwrite
  mappings: ["a:x"]
- type: format
  mappings: ["b:{{a}}"]
- type: filter
  expressions: ["row.a"]
- type: expand
  scripts: ["[row]"]
- type: window
  count: 2
  script: "rows"
- type: script
  mappings: ["a:row.a"]
- type: fake
  mappings: ["a:name.firstname"]
"#,
        )
        .unwrap();
        for spec in &specs {
            create_transformer(spec).unwrap();
        }
    }
}
