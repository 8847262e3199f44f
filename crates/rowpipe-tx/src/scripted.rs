//! Transformers backed by the sandboxed expression engine.

use rowpipe_core::contract::Transformer;
use rowpipe_core::error::{PipeError, Result};
use rowpipe_core::row::{Row, Value};
use rowpipe_core::schema::Schema;

use crate::sandbox::{self, Invocation, ScriptValue};

/// Project a script-returned object onto `schema` by property name.
/// Missing properties stay null.
fn project_object(schema: &Schema, props: Vec<(String, ScriptValue)>) -> Row {
    let mut row = Row::new(vec![Value::Null; schema.len()]);
    for (key, sv) in props {
        if let Some(idx) = schema.find(&key) {
            let target = schema.column(idx).logical_type;
            row.set(idx, sv.into_value(target));
        }
    }
    row
}

/// Expect an array of row objects from a script.
fn expect_row_array(id: &str, row_index: usize, out: ScriptValue, schema: &Schema) -> Result<Vec<Row>> {
    let items = match out {
        ScriptValue::Array(items) => items,
        other => {
            return Err(PipeError::Script {
                id: id.to_string(),
                row: row_index,
                message: format!("expected an array of row objects, got {other:?}"),
            })
        }
    };
    items
        .into_iter()
        .map(|item| match item {
            ScriptValue::Object(props) => Ok(project_object(schema, props)),
            other => Err(PipeError::Script {
                id: id.to_string(),
                row: row_index,
                message: format!("expected a row object, got {other:?}"),
            }),
        })
        .collect()
}

/// Drops rows: expressions run left to right and the first falsy result
/// discards the row.
pub struct Filter {
    expressions: Vec<(String, String)>,
    schema: Schema,
    seen: usize,
}

impl Filter {
    pub fn new(expressions: Vec<String>) -> Self {
        Filter {
            expressions: expressions
                .into_iter()
                .map(|e| (sandbox::fresh_script_id("filter"), e))
                .collect(),
            schema: Schema::default(),
            seen: 0,
        }
    }
}

impl Transformer for Filter {
    fn initialize(&mut self, input: &Schema) -> Result<Schema> {
        if self.expressions.is_empty() {
            return Err(PipeError::InvalidConfiguration(
                "filter needs at least one expression".into(),
            ));
        }
        self.schema = input.clone();
        Ok(input.clone())
    }

    fn transform(&mut self, row: Row) -> Result<Option<Row>> {
        let index = self.seen;
        self.seen += 1;
        for (id, expr) in &self.expressions {
            let verdict = sandbox::with_host(|host| {
                host.ensure_function(id, "row", expr)?;
                host.call(id, index, Invocation::Row(&self.schema, &row))
            })?;
            if !verdict.is_truthy() {
                return Ok(None);
            }
        }
        Ok(Some(row))
    }

    fn dispose(&mut self) {
        for (id, _) in &self.expressions {
            sandbox::release_script(id);
        }
    }
}

/// Evaluates `COL:expr` mappings per row and writes results back. Later
/// mappings observe earlier results.
pub struct ScriptMap {
    mappings: Vec<(String, String, String)>, // (column, id, expr)
    resolved: Vec<usize>,
    schema: Schema,
    seen: usize,
}

impl ScriptMap {
    pub fn parse(raw: &[String]) -> Result<Self> {
        let mut mappings = Vec::with_capacity(raw.len());
        for entry in raw {
            let (column, expr) = crate::basic::split_mapping(entry)?;
            mappings.push((column, sandbox::fresh_script_id("script"), expr));
        }
        Ok(ScriptMap {
            mappings,
            resolved: Vec::new(),
            schema: Schema::default(),
            seen: 0,
        })
    }
}

impl Transformer for ScriptMap {
    fn initialize(&mut self, input: &Schema) -> Result<Schema> {
        self.resolved = self
            .mappings
            .iter()
            .map(|(column, _, _)| {
                input.find(column).ok_or_else(|| {
                    PipeError::InvalidConfiguration(format!(
                        "script mapping references unknown column '{column}'"
                    ))
                })
            })
            .collect::<Result<_>>()?;
        self.schema = input.clone();
        Ok(input.clone())
    }

    fn transform(&mut self, mut row: Row) -> Result<Option<Row>> {
        let index = self.seen;
        self.seen += 1;
        for ((_, id, expr), &target_idx) in self.mappings.iter().zip(&self.resolved) {
            let out = sandbox::with_host(|host| {
                host.ensure_function(id, "row", expr)?;
                host.call(id, index, Invocation::Row(&self.schema, &row))
            })?;
            let target_type = self.schema.column(target_idx).logical_type;
            row.set(target_idx, out.into_value(target_type));
        }
        Ok(Some(row))
    }

    fn dispose(&mut self) {
        for (_, id, _) in &self.mappings {
            sandbox::release_script(id);
        }
    }
}

/// Emits one row per element of each script's returned array. Multiple
/// scripts chain: the output of step *k* feeds step *k+1*. Expansions of one
/// input stay contiguous and in input order.
pub struct Expand {
    scripts: Vec<(String, String)>,
    schema: Schema,
    seen: usize,
}

impl Expand {
    pub fn new(scripts: Vec<String>) -> Self {
        Expand {
            scripts: scripts
                .into_iter()
                .map(|s| (sandbox::fresh_script_id("expand"), s))
                .collect(),
            schema: Schema::default(),
            seen: 0,
        }
    }
}

impl Transformer for Expand {
    fn initialize(&mut self, input: &Schema) -> Result<Schema> {
        if self.scripts.is_empty() {
            return Err(PipeError::InvalidConfiguration(
                "expand needs at least one script".into(),
            ));
        }
        self.schema = input.clone();
        Ok(input.clone())
    }

    fn transform_many(&mut self, row: Row) -> Result<Vec<Row>> {
        let index = self.seen;
        self.seen += 1;
        let mut current = vec![row];
        for (id, script) in &self.scripts {
            let mut next = Vec::with_capacity(current.len());
            for row in &current {
                let out = sandbox::with_host(|host| {
                    host.ensure_function(id, "row", script)?;
                    host.call(id, index, Invocation::Row(&self.schema, row))
                })?;
                next.extend(expect_row_array(id, index, out, &self.schema)?);
            }
            current = next;
            if current.is_empty() {
                break;
            }
        }
        Ok(current)
    }

    fn dispose(&mut self) {
        for (id, _) in &self.scripts {
            sandbox::release_script(id);
        }
    }
}

/// Accumulates rows and hands the buffered array to a script when a trigger
/// fires: a row-count threshold and/or a change in a key column. Whatever
/// remains at end-of-stream flushes once more.
pub struct Window {
    count: Option<usize>,
    key: Option<String>,
    key_idx: Option<usize>,
    script: String,
    id: String,
    buffer: Vec<Row>,
    schema: Schema,
    seen: usize,
}

impl Window {
    pub fn new(count: Option<usize>, key: Option<String>, script: String) -> Self {
        Window {
            count,
            key,
            key_idx: None,
            script,
            id: sandbox::fresh_script_id("window"),
            buffer: Vec::new(),
            schema: Schema::default(),
            seen: 0,
        }
    }

    fn run_buffer(&mut self) -> Result<Vec<Row>> {
        if self.buffer.is_empty() {
            return Ok(Vec::new());
        }
        let rows = std::mem::take(&mut self.buffer);
        tracing::debug!(rows = rows.len(), "window trigger fired");
        let out = sandbox::with_host(|host| {
            host.ensure_function(&self.id, "rows", &self.script)?;
            host.call(&self.id, self.seen, Invocation::Rows(&self.schema, &rows))
        })?;
        expect_row_array(&self.id, self.seen, out, &self.schema)
    }
}

impl Transformer for Window {
    fn initialize(&mut self, input: &Schema) -> Result<Schema> {
        if self.count.is_none() && self.key.is_none() {
            return Err(PipeError::InvalidConfiguration(
                "window needs a count and/or a key trigger".into(),
            ));
        }
        if matches!(self.count, Some(0)) {
            return Err(PipeError::InvalidConfiguration(
                "window count must be at least 1".into(),
            ));
        }
        if let Some(key) = &self.key {
            self.key_idx = Some(input.find(key).ok_or_else(|| {
                PipeError::InvalidConfiguration(format!(
                    "window key references unknown column '{key}'"
                ))
            })?);
        }
        self.schema = input.clone();
        Ok(input.clone())
    }

    fn transform_many(&mut self, row: Row) -> Result<Vec<Row>> {
        self.seen += 1;
        let mut out = Vec::new();

        if let Some(key_idx) = self.key_idx {
            let boundary = self
                .buffer
                .last()
                .map(|prev| prev.get(key_idx) != row.get(key_idx))
                .unwrap_or(false);
            if boundary {
                out.extend(self.run_buffer()?);
            }
        }

        self.buffer.push(row);

        if let Some(count) = self.count {
            if self.buffer.len() >= count {
                out.extend(self.run_buffer()?);
            }
        }
        Ok(out)
    }

    fn flush(&mut self) -> Result<Vec<Row>> {
        self.run_buffer()
    }

    fn dispose(&mut self) {
        sandbox::release_script(&self.id);
    }
}
