//! Read-only screening for user-supplied SQL.
//!
//! SQL readers run arbitrary queries against live databases, so before
//! execution the query text is screened: it must start like a read, must not
//! mention statement-level write verbs as standalone identifiers, and must
//! not smuggle in second statements or file exports. The screen is a token
//! scan, not a SQL parser; a caller who knows better can override it, which
//! downgrades the failure to a logged warning.

use regex::Regex;
use tracing::warn;

use rowpipe_core::error::{PipeError, Result};

const ALLOWED_LEADING: [&str; 4] = ["SELECT", "WITH", "PRAGMA", "DESCRIBE"];

const FORBIDDEN_IDENTIFIERS: [&str; 22] = [
    "INSERT", "UPDATE", "DELETE", "DROP", "TRUNCATE", "ALTER", "CREATE", "GRANT", "REVOKE",
    "MERGE", "CALL", "EXEC", "EXECUTE", "COPY", "ATTACH", "DETACH", "VACUUM", "SAVEPOINT",
    "ROLLBACK", "COMMIT", "RENAME", "REPLACE",
];

const FORBIDDEN_PREFIXES: [&str; 4] = ["DBMS_", "UTL_", "XP_", "SP_"];

const FORBIDDEN_FRAGMENTS: [&str; 6] = [";", "--", "/*", "INTO ", "OUTFILE", "DUMPFILE"];

/// Validate a query before execution. With `allow_unsafe`, violations are
/// logged instead of raised; an empty query always fails.
pub fn screen_query(query: &str, allow_unsafe: bool) -> Result<()> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(PipeError::InvalidArgument("query must not be empty".into()));
    }

    match violation(trimmed) {
        None => Ok(()),
        Some(reason) if allow_unsafe => {
            warn!("unsafe query allowed by override: {reason}");
            Ok(())
        }
        Some(reason) => Err(PipeError::InvalidArgument(format!(
            "query rejected by the read-only screen: {reason}"
        ))),
    }
}

fn violation(query: &str) -> Option<String> {
    let upper = query.to_ascii_uppercase();

    let leading = upper
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .find(|w| !w.is_empty())
        .unwrap_or_default();
    if !ALLOWED_LEADING.contains(&leading) {
        return Some(format!(
            "must start with one of {ALLOWED_LEADING:?}, found '{leading}'"
        ));
    }

    for fragment in FORBIDDEN_FRAGMENTS {
        if upper.contains(fragment) {
            return Some(format!("contains forbidden fragment '{}'", fragment.trim()));
        }
    }
    if upper.contains("LOAD_FILE") {
        return Some("contains forbidden fragment 'LOAD_FILE'".into());
    }

    let ident = Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").expect("identifier pattern");
    for m in ident.find_iter(&upper) {
        let word = m.as_str();
        if FORBIDDEN_IDENTIFIERS.contains(&word) {
            return Some(format!("contains forbidden identifier '{word}'"));
        }
        if FORBIDDEN_PREFIXES.iter().any(|p| word.starts_with(p)) {
            return Some(format!("contains forbidden identifier '{word}'"));
        }
    }
    None
}

/// A bare table name may stand in for a query.
pub fn is_bare_table_name(text: &str) -> bool {
    let mut chars = text.trim().chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_reads_pass() {
        for q in [
            "SELECT * FROM t",
            "  select a, b from t where a > 1",
            "WITH cte AS (SELECT 1 AS x) SELECT x FROM cte",
            "PRAGMA table_info(t)",
            "DESCRIBE t",
        ] {
            assert!(screen_query(q, false).is_ok(), "rejected: {q}");
        }
    }

    #[test]
    fn writes_and_smuggling_fail() {
        for q in [
            "DELETE FROM t",
            "SELECT 1; DROP TABLE t",
            "SELECT * FROM t -- tail",
            "SELECT /* c */ 1",
            "SELECT * INTO OUTFILE '/tmp/x' FROM t",
            "SELECT update_flag, update FROM t",
            "SELECT xp_cmdshell('dir')",
            "SELECT dbms_output.put_line('x') FROM dual",
        ] {
            assert!(screen_query(q, false).is_err(), "accepted: {q}");
        }
    }

    #[test]
    fn column_names_that_merely_resemble_verbs_pass() {
        // `updated_at` is not the standalone identifier `UPDATE`.
        assert!(screen_query("SELECT updated_at, created_by FROM t", false).is_ok());
        assert!(screen_query("SELECT insertion_order FROM t", false).is_ok());
    }

    #[test]
    fn empty_query_fails_even_with_override() {
        assert!(screen_query("", true).is_err());
        assert!(screen_query("   ", true).is_err());
    }

    #[test]
    fn override_downgrades_to_warning() {
        assert!(screen_query("SELECT 1; SELECT 2", true).is_ok());
    }

    #[test]
    fn bare_table_names() {
        assert!(is_bare_table_name("users"));
        assert!(is_bare_table_name("_staging2"));
        assert!(!is_bare_table_name("select *"));
        assert!(!is_bare_table_name("1abc"));
        assert!(!is_bare_table_name(""));
    }
}
