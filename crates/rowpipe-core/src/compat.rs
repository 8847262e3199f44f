//! Source/target schema compatibility analysis.
//!
//! Given the effective source schema and the inspected state of a target,
//! derive a per-column status plus aggregate errors and warnings. Writers run
//! this during `initialize`; the CLI runs it for dry-run checks.

use crate::dialect::{ColumnMatcher, Dialect};
use crate::row::LogicalType;
use crate::schema::{Schema, TargetSchema};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnStatus {
    Compatible,
    /// The target (or the column) does not exist yet and will be created.
    WillBeCreated,
    /// String-to-string write into a length-bounded column.
    PossibleTruncation,
    TypeMismatch,
    MissingInTarget,
    ExtraInTargetNullable,
    ExtraInTargetNotNull,
    NullabilityConflict,
}

#[derive(Debug, Clone)]
pub struct ColumnFinding {
    /// Source-side name, or target-side name for extra target columns.
    pub name: String,
    /// The physical name the matcher resolved, where applicable.
    pub physical_name: Option<String>,
    pub status: ColumnStatus,
    pub detail: String,
}

#[derive(Debug, Clone, Default)]
pub struct CompatibilityReport {
    pub findings: Vec<ColumnFinding>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl CompatibilityReport {
    pub fn is_acceptable(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, finding: ColumnFinding) {
        self.errors.push(finding.detail.clone());
        self.findings.push(finding);
    }

    fn warn(&mut self, finding: ColumnFinding) {
        self.warnings.push(finding.detail.clone());
        self.findings.push(finding);
    }

    fn ok(&mut self, finding: ColumnFinding) {
        self.findings.push(finding);
    }
}

/// Analyze `source` against an optionally existing `target`.
pub fn analyze(
    source: &Schema,
    target: Option<&TargetSchema>,
    dialect: Option<&dyn Dialect>,
) -> CompatibilityReport {
    let mut report = CompatibilityReport::default();

    let target = match target {
        Some(t) if t.exists => t,
        _ => {
            for col in source.columns() {
                report.ok(ColumnFinding {
                    name: col.name.clone(),
                    physical_name: Some(ColumnMatcher::resolve_physical_name(
                        &col.name,
                        col.case_sensitive,
                        dialect,
                    )),
                    status: ColumnStatus::WillBeCreated,
                    detail: format!("column '{}' will be created", col.name),
                });
            }
            return report;
        }
    };

    let mut matched_target: Vec<bool> = vec![false; target.columns.len()];

    for col in source.columns() {
        let physical =
            ColumnMatcher::resolve_physical_name(&col.name, col.case_sensitive, dialect);
        let hit = target
            .columns
            .iter()
            .position(|tc| tc.column.name == physical);
        let Some(idx) = hit else {
            report.error(ColumnFinding {
                name: col.name.clone(),
                physical_name: Some(physical.clone()),
                status: ColumnStatus::MissingInTarget,
                detail: format!("column '{}' ('{physical}') is missing in the target", col.name),
            });
            continue;
        };
        matched_target[idx] = true;
        let tc = &target.columns[idx];
        let src_t = col.logical_type;
        let dst_t = tc.inferred_logical_type();

        // Length-bounded text wins over the exact-match rule so the
        // truncation risk is surfaced.
        if src_t == LogicalType::String
            && dst_t == LogicalType::String
            && tc.max_length.is_some()
        {
            report.warn(ColumnFinding {
                name: col.name.clone(),
                physical_name: Some(physical),
                status: ColumnStatus::PossibleTruncation,
                detail: format!(
                    "column '{}' may truncate: target is {} (max {} chars)",
                    col.name,
                    tc.native_type,
                    tc.max_length.unwrap_or_default()
                ),
            });
            continue;
        }

        let upcast = matches!(
            (src_t.numeric_rank(), dst_t.numeric_rank()),
            (Some(a), Some(b)) if a <= b
        );
        if src_t == dst_t || upcast || dst_t == LogicalType::Unknown {
            report.ok(ColumnFinding {
                name: col.name.clone(),
                physical_name: Some(physical),
                status: ColumnStatus::Compatible,
                detail: String::new(),
            });
            continue;
        }

        if col.nullable && !tc.column.nullable && !tc.is_primary_key {
            report.error(ColumnFinding {
                name: col.name.clone(),
                physical_name: Some(physical),
                status: ColumnStatus::NullabilityConflict,
                detail: format!(
                    "column '{}' is nullable but target '{}' is NOT NULL",
                    col.name, tc.column.name
                ),
            });
            continue;
        }

        report.error(ColumnFinding {
            name: col.name.clone(),
            physical_name: Some(physical),
            status: ColumnStatus::TypeMismatch,
            detail: format!(
                "column '{}': {src_t:?} does not fit target {} ({dst_t:?})",
                col.name, tc.native_type
            ),
        });
    }

    for (idx, tc) in target.columns.iter().enumerate() {
        if matched_target[idx] {
            continue;
        }
        if tc.column.nullable || tc.is_primary_key {
            report.warn(ColumnFinding {
                name: tc.column.name.clone(),
                physical_name: None,
                status: ColumnStatus::ExtraInTargetNullable,
                detail: format!(
                    "target column '{}' receives no data and stays null",
                    tc.column.name
                ),
            });
        } else {
            report.error(ColumnFinding {
                name: tc.column.name.clone(),
                physical_name: None,
                status: ColumnStatus::ExtraInTargetNotNull,
                detail: format!(
                    "target column '{}' is NOT NULL and receives no data",
                    tc.column.name
                ),
            });
        }
    }

    if let Some(rows) = target.row_count {
        if rows > 0 {
            let size = target
                .size_bytes
                .map(|b| format!(" ({})", format_size(b)))
                .unwrap_or_default();
            report.warnings.push(format!(
                "target already contains {rows} rows{size}"
            ));
        }
    }

    report
}

/// `1536` -> `1.5 KiB`, etc.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
