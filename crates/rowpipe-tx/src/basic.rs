//! Column-level transformers with no scripting involved.

use rowpipe_core::contract::Transformer;
use rowpipe_core::error::{PipeError, Result};
use rowpipe_core::row::{Row, Value};
use rowpipe_core::schema::Schema;

/// Blanks out a set of columns. Names that do not resolve against the input
/// schema are ignored.
pub struct NullFill {
    names: Vec<String>,
    indices: Vec<usize>,
}

impl NullFill {
    pub fn new(names: Vec<String>) -> Self {
        NullFill {
            names,
            indices: Vec::new(),
        }
    }
}

impl Transformer for NullFill {
    fn initialize(&mut self, input: &Schema) -> Result<Schema> {
        self.indices = self
            .names
            .iter()
            .filter_map(|name| input.find(name))
            .collect();
        Ok(input.clone())
    }

    fn transform(&mut self, mut row: Row) -> Result<Option<Row>> {
        for &idx in &self.indices {
            row.set(idx, Value::Null);
        }
        Ok(Some(row))
    }
}

/// Writes a fixed value into each mapped column.
pub struct Overwrite {
    mappings: Vec<(String, String)>,
    skip_null: bool,
    resolved: Vec<(usize, String)>,
}

impl Overwrite {
    /// Mappings are `COL:value` or `COL=value`; the split happens at the
    /// first occurrence of either delimiter and the remainder is the value.
    pub fn parse(raw: &[String], skip_null: bool) -> Result<Self> {
        let mut mappings = Vec::with_capacity(raw.len());
        for entry in raw {
            let (name, value) = split_mapping(entry)?;
            mappings.push((name, value));
        }
        Ok(Overwrite {
            mappings,
            skip_null,
            resolved: Vec::new(),
        })
    }
}

impl Transformer for Overwrite {
    fn initialize(&mut self, input: &Schema) -> Result<Schema> {
        self.resolved.clear();
        for (name, value) in &self.mappings {
            let idx = input.find(name).ok_or_else(|| {
                PipeError::InvalidConfiguration(format!(
                    "overwrite references unknown column '{name}'"
                ))
            })?;
            self.resolved.push((idx, value.clone()));
        }
        Ok(input.clone())
    }

    fn transform(&mut self, mut row: Row) -> Result<Option<Row>> {
        for (idx, value) in &self.resolved {
            if self.skip_null && row.get(*idx).is_null() {
                continue;
            }
            row.set(*idx, Value::String(value.clone()));
        }
        Ok(Some(row))
    }
}

/// Split `COL:value` / `COL=value` at the first occurrence of either
/// delimiter. Values may contain both characters.
pub fn split_mapping(entry: &str) -> Result<(String, String)> {
    let colon = entry.find(':');
    let equals = entry.find('=');
    let at = match (colon, equals) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => {
            return Err(PipeError::InvalidConfiguration(format!(
                "mapping '{entry}' is missing a ':' or '=' delimiter"
            )))
        }
    };
    let name = entry[..at].trim();
    if name.is_empty() {
        return Err(PipeError::InvalidConfiguration(format!(
            "mapping '{entry}' has an empty column name"
        )));
    }
    Ok((name.to_string(), entry[at + 1..].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowpipe_core::row::LogicalType;
    use rowpipe_core::schema::Column;

    fn schema() -> Schema {
        Schema::new(vec![
            Column::new("a", LogicalType::String),
            Column::new("b", LogicalType::String),
        ])
        .unwrap()
    }

    #[test]
    fn null_fill_ignores_unknown_names() {
        let mut t = NullFill::new(vec!["b".into(), "missing".into()]);
        t.initialize(&schema()).unwrap();
        let out = t
            .transform(Row::new(vec![
                Value::String("x".into()),
                Value::String("y".into()),
            ]))
            .unwrap()
            .unwrap();
        assert_eq!(out.get(0), &Value::String("x".into()));
        assert_eq!(out.get(1), &Value::Null);
    }

    #[test]
    fn overwrite_split_takes_first_delimiter() {
        assert_eq!(
            split_mapping("a:x=1").unwrap(),
            ("a".to_string(), "x=1".to_string())
        );
        assert_eq!(
            split_mapping("a=x:1").unwrap(),
            ("a".to_string(), "x:1".to_string())
        );
        assert!(split_mapping("novalue").is_err());
    }

    #[test]
    fn overwrite_skip_null_leaves_nulls() {
        let mut t = Overwrite::parse(&["a:fixed".to_string()], true).unwrap();
        t.initialize(&schema()).unwrap();
        let kept = t
            .transform(Row::new(vec![Value::Null, Value::Null]))
            .unwrap()
            .unwrap();
        assert_eq!(kept.get(0), &Value::Null);

        let mut t = Overwrite::parse(&["a:fixed".to_string()], false).unwrap();
        t.initialize(&schema()).unwrap();
        let replaced = t
            .transform(Row::new(vec![Value::Null, Value::Null]))
            .unwrap()
            .unwrap();
        assert_eq!(replaced.get(0), &Value::String("fixed".into()));
    }

    #[test]
    fn overwrite_unknown_column_fails_initialize() {
        let mut t = Overwrite::parse(&["zzz:1".to_string()], false).unwrap();
        assert!(matches!(
            t.initialize(&schema()).unwrap_err(),
            PipeError::InvalidConfiguration(_)
        ));
    }
}
