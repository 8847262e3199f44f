//! Column and schema descriptors.
//!
//! Reader columns materialize when the reader opens and are immutable after
//! that. Each transformer receives the upstream schema at initialization and
//! returns its output schema; the writer binds the final composition once.

use serde::{Deserialize, Serialize};

use crate::error::{PipeError, Result};
use crate::row::LogicalType;

/// Immutable column descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub logical_type: LogicalType,
    pub nullable: bool,
    /// True iff the producing system required quoting to preserve this
    /// name's casing.
    #[serde(default)]
    pub case_sensitive: bool,
    /// True for columns produced by a transformer rather than the reader.
    #[serde(default)]
    pub virtual_: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, logical_type: LogicalType) -> Self {
        Column {
            name: name.into(),
            logical_type,
            nullable: true,
            case_sensitive: false,
            virtual_: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn case_sensitive(mut self) -> Self {
        self.case_sensitive = true;
        self
    }

    pub fn virtual_col(mut self) -> Self {
        self.virtual_ = true;
        self
    }
}

/// An ordered set of columns with unique names.
///
/// Uniqueness follows the producing system's identity rule: comparisons are
/// case-sensitive iff any column is case-sensitive, otherwise ASCII
/// case-insensitive.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        let case_sensitive = columns.iter().any(|c| c.case_sensitive);
        for (i, a) in columns.iter().enumerate() {
            for b in columns.iter().skip(i + 1) {
                let clash = if case_sensitive {
                    a.name == b.name
                } else {
                    a.name.eq_ignore_ascii_case(&b.name)
                };
                if clash {
                    return Err(PipeError::InvalidConfiguration(format!(
                        "duplicate column name '{}'",
                        b.name
                    )));
                }
            }
        }
        Ok(Schema { columns })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Whether name lookups in this schema are case-sensitive.
    pub fn case_sensitive(&self) -> bool {
        self.columns.iter().any(|c| c.case_sensitive)
    }

    /// Find a column index by name under this schema's identity rule.
    pub fn find(&self, name: &str) -> Option<usize> {
        let cs = self.case_sensitive();
        self.columns.iter().position(|c| {
            if cs {
                c.name == name
            } else {
                c.name.eq_ignore_ascii_case(name)
            }
        })
    }

    pub fn column(&self, idx: usize) -> &Column {
        &self.columns[idx]
    }

    /// A new schema with `column` appended. Fails on a name clash.
    pub fn with_column(&self, column: Column) -> Result<Schema> {
        let mut columns = self.columns.clone();
        columns.push(column);
        Schema::new(columns)
    }
}

/// The observed state of a sink before writing.
#[derive(Debug, Clone, Default)]
pub struct TargetSchema {
    pub exists: bool,
    pub columns: Vec<TargetColumn>,
    pub row_count: Option<u64>,
    pub size_bytes: Option<u64>,
    pub primary_key: Vec<String>,
}

impl TargetSchema {
    /// A report for a sink that does not exist yet.
    pub fn missing() -> Self {
        TargetSchema::default()
    }

    pub fn find(&self, physical_name: &str) -> Option<&TargetColumn> {
        self.columns.iter().find(|c| c.column.name == physical_name)
    }
}

/// A target column: the logical descriptor plus provider-side metadata.
#[derive(Debug, Clone)]
pub struct TargetColumn {
    pub column: Column,
    /// Provider-specific declared type, e.g. `VARCHAR(40)`.
    pub native_type: String,
    pub is_primary_key: bool,
    pub is_unique: bool,
    pub max_length: Option<u32>,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
}

impl TargetColumn {
    pub fn new(column: Column, native_type: impl Into<String>) -> Self {
        TargetColumn {
            column,
            native_type: native_type.into(),
            is_primary_key: false,
            is_unique: false,
            max_length: None,
            precision: None,
            scale: None,
        }
    }

    /// The logical type inferred from the provider's declared type.
    pub fn inferred_logical_type(&self) -> LogicalType {
        self.column.logical_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_names_rejected_case_insensitively() {
        let err = Schema::new(vec![
            Column::new("id", LogicalType::Int64),
            Column::new("ID", LogicalType::Int64),
        ])
        .unwrap_err();
        assert!(matches!(err, PipeError::InvalidConfiguration(_)));
    }

    #[test]
    fn case_sensitive_schemas_allow_casing_variants() {
        let schema = Schema::new(vec![
            Column::new("id", LogicalType::Int64).case_sensitive(),
            Column::new("ID", LogicalType::Int64),
        ])
        .unwrap();
        assert_eq!(schema.find("ID"), Some(1));
        assert_eq!(schema.find("id"), Some(0));
    }

    #[test]
    fn insensitive_lookup_by_default() {
        let schema = Schema::new(vec![Column::new("Amount", LogicalType::Float64)]).unwrap();
        assert_eq!(schema.find("amount"), Some(0));
        assert_eq!(schema.find("missing"), None);
    }
}
