//! Template-driven column formatting and cloning.
//!
//! Each mapping is `TARGET:template`. A template mixes literal text with
//! `{{COL}}` (raw substitution) and `{COL:fmt}` (formatted substitution).
//! Targets may reference each other; computation follows a topological sort
//! of the dependency graph among target columns, so a target never reads a
//! cell that is overwritten later in the same row. A reference cycle fails
//! initialization.

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use regex::Regex;

use rowpipe_core::contract::Transformer;
use rowpipe_core::error::{PipeError, Result};
use rowpipe_core::row::{LogicalType, Row, Value};
use rowpipe_core::schema::{Column, Schema};

use crate::basic::split_mapping;

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    /// `{{COL}}`
    Raw(String),
    /// `{COL:fmt}`
    Formatted(String, String),
}

#[derive(Debug, Clone)]
struct Template {
    target: String,
    segments: Vec<Segment>,
}

impl Template {
    fn references(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Raw(name) | Segment::Formatted(name, _) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }
}

struct CompiledTemplate {
    target_idx: usize,
    segments: Vec<CompiledSegment>,
}

enum CompiledSegment {
    Literal(String),
    /// Source index; `None` renders as the empty string.
    Raw(Option<usize>),
    Formatted(Option<usize>, String),
}

pub struct Format {
    templates: Vec<Template>,
    compiled: Vec<CompiledTemplate>,
}

impl Format {
    pub fn parse(raw: &[String]) -> Result<Self> {
        let token = Regex::new(r"\{\{([^{}]+)\}\}|\{([^:{}]+):([^{}]*)\}")
            .expect("template token pattern");
        let mut templates = Vec::with_capacity(raw.len());
        for entry in raw {
            let (target, body) = split_mapping(entry)?;
            templates.push(Template {
                target,
                segments: scan_segments(&token, &body),
            });
        }
        Ok(Format {
            templates,
            compiled: Vec::new(),
        })
    }

    /// Order templates so referenced targets compute first.
    fn ordered(&self) -> Result<Vec<usize>> {
        let mut graph = DiGraph::<usize, ()>::new();
        let nodes: Vec<_> = (0..self.templates.len())
            .map(|i| graph.add_node(i))
            .collect();
        for (i, template) in self.templates.iter().enumerate() {
            for reference in template.references() {
                if let Some(j) = self
                    .templates
                    .iter()
                    .position(|t| t.target.eq_ignore_ascii_case(reference))
                {
                    if i != j {
                        graph.add_edge(nodes[j], nodes[i], ());
                    }
                }
            }
        }
        match toposort(&graph, None) {
            Ok(order) => Ok(order.into_iter().map(|n| graph[n]).collect()),
            Err(cycle) => {
                let name = &self.templates[graph[cycle.node_id()]].target;
                Err(PipeError::InvalidConfiguration(format!(
                    "format templates contain a reference cycle through '{name}'"
                )))
            }
        }
    }
}

impl Transformer for Format {
    fn initialize(&mut self, input: &Schema) -> Result<Schema> {
        let order = self.ordered()?;

        // Unknown targets become appended virtual string columns.
        let mut schema = input.clone();
        for template in &self.templates {
            if schema.find(&template.target).is_none() {
                schema = schema.with_column(
                    Column::new(template.target.clone(), LogicalType::String).virtual_col(),
                )?;
            }
        }

        self.compiled = order
            .into_iter()
            .map(|i| {
                let template = &self.templates[i];
                let target_idx = schema
                    .find(&template.target)
                    .expect("target resolved or appended above");
                let segments = template
                    .segments
                    .iter()
                    .map(|s| match s {
                        Segment::Literal(text) => CompiledSegment::Literal(text.clone()),
                        Segment::Raw(name) => CompiledSegment::Raw(schema.find(name)),
                        Segment::Formatted(name, fmt) => {
                            CompiledSegment::Formatted(schema.find(name), fmt.clone())
                        }
                    })
                    .collect();
                CompiledTemplate {
                    target_idx,
                    segments,
                }
            })
            .collect();
        Ok(schema)
    }

    fn transform(&mut self, mut row: Row) -> Result<Option<Row>> {
        // Appended virtual columns may not exist on the incoming row yet.
        let width = self
            .compiled
            .iter()
            .map(|c| c.target_idx + 1)
            .max()
            .unwrap_or(0);
        while row.len() < width {
            row.0.push(Value::Null);
        }

        for template in &self.compiled {
            let mut text = String::new();
            for segment in &template.segments {
                match segment {
                    CompiledSegment::Literal(lit) => text.push_str(lit),
                    CompiledSegment::Raw(idx) => {
                        if let Some(idx) = idx {
                            text.push_str(&render_raw(row.get(*idx)));
                        }
                    }
                    CompiledSegment::Formatted(idx, fmt) => {
                        if let Some(idx) = idx {
                            text.push_str(&render_formatted(row.get(*idx), fmt));
                        }
                    }
                }
            }
            row.set(template.target_idx, Value::String(text));
        }
        Ok(Some(row))
    }
}

fn scan_segments(token: &Regex, body: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut last = 0;
    for caps in token.captures_iter(body) {
        let whole = caps.get(0).expect("match has a range");
        if whole.start() > last {
            segments.push(Segment::Literal(body[last..whole.start()].to_string()));
        }
        if let Some(raw) = caps.get(1) {
            segments.push(Segment::Raw(raw.as_str().trim().to_string()));
        } else {
            let name = caps.get(2).expect("formatted reference name");
            let fmt = caps.get(3).expect("formatted reference spec");
            segments.push(Segment::Formatted(
                name.as_str().trim().to_string(),
                fmt.as_str().to_string(),
            ));
        }
        last = whole.end();
    }
    if last < body.len() {
        segments.push(Segment::Literal(body[last..].to_string()));
    }
    segments
}

fn render_raw(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        other => other.canonical_text(),
    }
}

/// Apply a format spec; anything malformed falls back to the raw value.
fn render_formatted(value: &Value, fmt: &str) -> String {
    if value.is_null() {
        return String::new();
    }

    // D6 — zero-padded integer
    if let Some(width) = fmt
        .strip_prefix('D')
        .and_then(|w| w.parse::<usize>().ok())
    {
        if let Some(int) = as_integer(value) {
            if int < 0 {
                return format!("-{:0width$}", -int);
            }
            return format!("{int:0width$}");
        }
        return render_raw(value);
    }

    // 0.00 — fixed number of decimals
    if !fmt.is_empty() && fmt.chars().all(|c| c == '0' || c == '.') {
        if let Some(f) = as_float(value) {
            let decimals = fmt.split('.').nth(1).map(|d| d.len()).unwrap_or(0);
            return format!("{f:.decimals$}");
        }
        return render_raw(value);
    }

    // Date patterns: dd/MM/yyyy HH:mm:ss.fff and friends
    if fmt.chars().any(|c| "yMdHmsf".contains(c)) {
        if let Some(text) = format_temporal(value, fmt) {
            return text;
        }
    }

    render_raw(value)
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Int32(v) => Some(*v as i64),
        Value::Int64(v) => Some(*v),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Int32(v) => Some(*v as f64),
        Value::Int64(v) => Some(*v as f64),
        Value::Float32(v) => Some(*v as f64),
        Value::Float64(v) => Some(*v),
        Value::Decimal(d) => d.to_string().parse().ok(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn format_temporal(value: &Value, fmt: &str) -> Option<String> {
    let strftime = fmt
        .replace("yyyy", "%Y")
        .replace("fff", "%3f")
        .replace("MM", "%m")
        .replace("dd", "%d")
        .replace("HH", "%H")
        .replace("mm", "%M")
        .replace("ss", "%S");
    match value {
        Value::Date(d) => Some(d.format(&strftime).to_string()),
        Value::Timestamp(t) => Some(t.format(&strftime).to_string()),
        Value::TimestampTz(t) => Some(t.format(&strftime).to_string()),
        _ => None,
    }
}
