//! Sink dialects: identifier folding, quoting and native type mapping.
//!
//! A dialect captures the identity rules of one sink family — how unquoted
//! names are folded, which words are reserved, and how logical types spell
//! in DDL. The matcher below is the single source of truth for turning a
//! source column name into the physical name the sink stores.

use crate::schema::Column;

/// Identity and type rules of a sink family.
pub trait Dialect: Send + Sync {
    fn name(&self) -> &str;

    /// Fold an unquoted identifier to the casing the sink stores internally.
    fn normalize(&self, ident: &str) -> String;

    fn is_reserved(&self, ident: &str) -> bool;

    /// Whether `ident` survives only when quoted.
    fn requires_quoting(&self, ident: &str) -> bool {
        !is_plain_identifier(ident) || self.is_reserved(ident)
    }

    /// Quote an identifier for DDL/DML. Double-quote doubling by default.
    fn quote(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// The provider-native type used when creating a column.
    fn map_to_provider_type(&self, column: &Column) -> String;

    /// Render a column name for SQL text: quoted iff the column is
    /// case-sensitive or the name would not survive unquoted.
    fn render_ident(&self, column: &Column) -> String {
        if column.case_sensitive || self.requires_quoting(&column.name) {
            self.quote(&column.name)
        } else {
            column.name.clone()
        }
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_plain_identifier(ident: &str) -> bool {
    let mut chars = ident.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Resolves the physical target-side name of a source column.
pub struct ColumnMatcher;

impl ColumnMatcher {
    /// Pure function of `(name, case_sensitive, dialect)`:
    ///
    /// 1. without a dialect the physical name is the source name (matching
    ///    elsewhere is ASCII case-insensitive);
    /// 2. a case-sensitive column, or a name the dialect would have to
    ///    quote, keeps its verbatim spelling;
    /// 3. otherwise the dialect's fold applies.
    pub fn resolve_physical_name(
        name: &str,
        case_sensitive: bool,
        dialect: Option<&dyn Dialect>,
    ) -> String {
        match dialect {
            None => name.to_string(),
            Some(d) => {
                if case_sensitive || d.requires_quoting(name) {
                    name.to_string()
                } else {
                    d.normalize(name)
                }
            }
        }
    }
}
