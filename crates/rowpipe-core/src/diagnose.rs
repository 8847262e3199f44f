//! Per-row failure analysis for rejected batches.
//!
//! When a batch write fails, the consumer stage walks the batch against the
//! bound schema and the target's declared constraints to find the first row
//! and column that cannot be stored, and attaches a human-readable diagnostic
//! to the raised error. The analyzer never replaces the original cause.

use crate::row::{coerce, Batch, Value};
use crate::schema::{Schema, TargetSchema};

/// The first offending cell found in a failed batch.
#[derive(Debug, Clone, PartialEq)]
pub struct RowIssue {
    pub row: usize,
    pub column: String,
    pub value: String,
    pub reason: String,
}

impl RowIssue {
    pub fn render(&self) -> String {
        format!(
            "Issue detected at Row {}, Column '{}', Value: '{}', Reason: {}",
            self.row, self.column, self.value, self.reason
        )
    }
}

pub struct BatchFailureAnalyzer<'a> {
    schema: &'a Schema,
    target: Option<&'a TargetSchema>,
}

impl<'a> BatchFailureAnalyzer<'a> {
    pub fn new(schema: &'a Schema, target: Option<&'a TargetSchema>) -> Self {
        BatchFailureAnalyzer { schema, target }
    }

    /// Scan row by row, column by column, and report the first cell that
    /// violates a known constraint. Returns `None` when nothing in the batch
    /// explains the failure (e.g. a connection-level error).
    pub fn analyze(&self, batch: &Batch) -> Option<RowIssue> {
        for (row_idx, row) in batch.iter().enumerate() {
            for (col_idx, column) in self.schema.columns().iter().enumerate() {
                let value = row.get(col_idx);
                if let Some(reason) = self.check_cell(column, value) {
                    return Some(RowIssue {
                        row: row_idx,
                        column: column.name.clone(),
                        value: display_value(value),
                        reason,
                    });
                }
            }
        }
        None
    }

    fn check_cell(&self, column: &crate::schema::Column, value: &Value) -> Option<String> {
        let target_col = self.target.and_then(|t| {
            t.columns
                .iter()
                .find(|tc| tc.column.name.eq_ignore_ascii_case(&column.name))
        });

        if value.is_null() {
            let target_forbids = target_col.map(|tc| !tc.column.nullable).unwrap_or(false);
            if target_forbids || !column.nullable {
                return Some("null value in a NOT NULL column".to_string());
            }
            return None;
        }

        if let Some(tc) = target_col {
            if let Some(max) = tc.max_length {
                if let Value::String(s) = value {
                    if s.chars().count() as u32 > max {
                        return Some(format!(
                            "value length {} exceeds the column limit of {max}",
                            s.chars().count()
                        ));
                    }
                }
            }
            if coerce(value.clone(), tc.inferred_logical_type()).is_err() {
                return Some(format!(
                    "value cannot be stored as {} ({:?})",
                    tc.native_type,
                    tc.inferred_logical_type()
                ));
            }
        } else if coerce(value.clone(), column.logical_type).is_err() {
            return Some(format!("value does not match {:?}", column.logical_type));
        }

        None
    }
}

fn display_value(value: &Value) -> String {
    let text = value.canonical_text();
    if text.chars().count() > 64 {
        let prefix: String = text.chars().take(64).collect();
        format!("{prefix}…")
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{LogicalType, Row};
    use crate::schema::{Column, TargetColumn};

    #[test]
    fn finds_first_null_in_not_null_column() {
        let schema = Schema::new(vec![
            Column::new("id", LogicalType::Int64).not_null(),
            Column::new("name", LogicalType::String),
        ])
        .unwrap();
        let batch = vec![
            Row::new(vec![Value::Int64(1), Value::String("ok".into())]),
            Row::new(vec![Value::Null, Value::String("bad".into())]),
        ];
        let issue = BatchFailureAnalyzer::new(&schema, None)
            .analyze(&batch)
            .unwrap();
        assert_eq!(issue.row, 1);
        assert_eq!(issue.column, "id");
        assert!(issue.render().starts_with("Issue detected at Row 1, Column 'id'"));
    }

    #[test]
    fn length_limit_from_target_metadata() {
        let schema = Schema::new(vec![Column::new("code", LogicalType::String)]).unwrap();
        let mut tc = TargetColumn::new(Column::new("code", LogicalType::String), "VARCHAR(3)");
        tc.max_length = Some(3);
        let target = TargetSchema {
            exists: true,
            columns: vec![tc],
            row_count: None,
            size_bytes: None,
            primary_key: Vec::new(),
        };
        let batch = vec![Row::new(vec![Value::String("TOOLONG".into())])];
        let issue = BatchFailureAnalyzer::new(&schema, Some(&target))
            .analyze(&batch)
            .unwrap();
        assert!(issue.reason.contains("exceeds"));
    }

    #[test]
    fn clean_batch_yields_none() {
        let schema = Schema::new(vec![Column::new("id", LogicalType::Int64)]).unwrap();
        let batch = vec![Row::new(vec![Value::Int64(5)])];
        assert!(BatchFailureAnalyzer::new(&schema, None).analyze(&batch).is_none());
    }
}
