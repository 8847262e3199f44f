//! Provider registry and connection-string dispatch.
//!
//! A connection string picks its provider by (1) an exact `provider:` prefix,
//! (2) a known file extension, (3) a driver-supplied heuristic on the raw
//! string. `-` stands for stdin/stdout and routes to the line-oriented text
//! provider. The engine never sees a concrete driver, only the reader/writer
//! contracts this module hands back.

use std::collections::BTreeMap;
use std::path::Path;

use rowpipe_core::contract::{ProviderCapabilities, Reader, WriteStrategy, Writer};
use rowpipe_core::error::{PipeError, Result};
use rowpipe_core::options::{OptionSchema, Options};

use crate::arrow_ipc::{ArrowSink, ArrowSource};
use crate::checksum::ChecksumSink;
use crate::csv::{CsvOptions, CsvSink, CsvSource};
use crate::generate::GenerateSource;
use crate::jsonl::{JsonlSink, JsonlSource};
use crate::parquet::{ParquetSink, ParquetSource};
use crate::sqlite::{SqliteSink, SqliteSource};

/// Everything a driver constructor gets to see.
pub struct ProviderRequest {
    /// Connection string with any `provider:` prefix stripped.
    pub location: String,
    pub query: Option<String>,
    pub strategy: WriteStrategy,
    pub options: Options,
    pub allow_unsafe_query: bool,
}

type ReaderCtor = fn(&ProviderRequest) -> Result<Box<dyn Reader>>;
type WriterCtor = fn(&ProviderRequest) -> Result<Box<dyn Writer>>;

#[derive(Debug)]
pub struct ProviderEntry {
    pub name: &'static str,
    pub capabilities: ProviderCapabilities,
    pub extensions: &'static [&'static str],
    pub option_schema: fn() -> OptionSchema,
    pub open_reader: Option<ReaderCtor>,
    pub open_writer: Option<WriterCtor>,
    /// Last-resort match on the raw connection string.
    pub heuristic: Option<fn(&str) -> bool>,
}

fn no_options() -> OptionSchema {
    OptionSchema {
        provider: "none",
        fields: Vec::new(),
    }
}

fn csv_reader(req: &ProviderRequest) -> Result<Box<dyn Reader>> {
    Ok(Box::new(CsvSource::new(
        &req.location,
        CsvOptions::from_options(&req.options)?,
    )))
}

fn csv_writer(req: &ProviderRequest) -> Result<Box<dyn Writer>> {
    Ok(Box::new(CsvSink::new(
        &req.location,
        CsvOptions::from_options(&req.options)?,
        req.strategy,
    )))
}

fn jsonl_reader(req: &ProviderRequest) -> Result<Box<dyn Reader>> {
    Ok(Box::new(JsonlSource::new(&req.location)))
}

fn jsonl_writer(req: &ProviderRequest) -> Result<Box<dyn Writer>> {
    Ok(Box::new(JsonlSink::new(&req.location, req.strategy)))
}

fn parquet_reader(req: &ProviderRequest) -> Result<Box<dyn Reader>> {
    Ok(Box::new(ParquetSource::new(&req.location)))
}

fn parquet_writer(req: &ProviderRequest) -> Result<Box<dyn Writer>> {
    Ok(Box::new(ParquetSink::new(&req.location, req.strategy)))
}

fn arrow_reader(req: &ProviderRequest) -> Result<Box<dyn Reader>> {
    Ok(Box::new(ArrowSource::new(&req.location)))
}

fn arrow_writer(req: &ProviderRequest) -> Result<Box<dyn Writer>> {
    Ok(Box::new(ArrowSink::new(&req.location, req.strategy)))
}

fn checksum_writer(req: &ProviderRequest) -> Result<Box<dyn Writer>> {
    Ok(Box::new(ChecksumSink::new(&req.location, req.strategy)))
}

fn generate_reader(req: &ProviderRequest) -> Result<Box<dyn Reader>> {
    Ok(Box::new(GenerateSource::from_spec(
        &req.location,
        &req.options,
    )?))
}

fn sqlite_reader(req: &ProviderRequest) -> Result<Box<dyn Reader>> {
    let query = req.query.clone().ok_or_else(|| {
        PipeError::InvalidArgument("sqlite sources need a query or table name".into())
    })?;
    Ok(Box::new(SqliteSource::new(
        &req.location,
        query,
        req.allow_unsafe_query,
    )))
}

fn sqlite_writer(req: &ProviderRequest) -> Result<Box<dyn Writer>> {
    Ok(Box::new(SqliteSink::new(
        &req.location,
        &req.options,
        req.strategy,
    )))
}

/// SQLite database files start with a fixed magic string.
fn sqlite_magic(raw: &str) -> bool {
    let path = Path::new(raw);
    if !path.is_file() {
        return false;
    }
    let mut magic = [0u8; 16];
    match std::fs::File::open(path).and_then(|mut f| std::io::Read::read_exact(&mut f, &mut magic))
    {
        Ok(()) => magic.starts_with(b"SQLite format 3"),
        Err(_) => false,
    }
}

pub fn registry() -> &'static [ProviderEntry] {
    const FILE_CAPS: ProviderCapabilities = ProviderCapabilities {
        requires_query: false,
        supports_write_strategies: false,
        supports_insert_mode: false,
    };
    const DB_CAPS: ProviderCapabilities = ProviderCapabilities {
        requires_query: true,
        supports_write_strategies: true,
        supports_insert_mode: true,
    };

    static REGISTRY: &[ProviderEntry] = &[
        ProviderEntry {
            name: "csv",
            capabilities: FILE_CAPS,
            extensions: &["csv"],
            option_schema: CsvOptions::schema,
            open_reader: Some(csv_reader),
            open_writer: Some(csv_writer),
            heuristic: None,
        },
        ProviderEntry {
            name: "jsonl",
            capabilities: FILE_CAPS,
            extensions: &["jsonl"],
            option_schema: no_options,
            open_reader: Some(jsonl_reader),
            open_writer: Some(jsonl_writer),
            heuristic: None,
        },
        ProviderEntry {
            name: "parquet",
            capabilities: FILE_CAPS,
            extensions: &["parquet"],
            option_schema: no_options,
            open_reader: Some(parquet_reader),
            open_writer: Some(parquet_writer),
            heuristic: None,
        },
        ProviderEntry {
            name: "arrow",
            capabilities: FILE_CAPS,
            extensions: &["arrow", "arrowfile"],
            option_schema: no_options,
            open_reader: Some(arrow_reader),
            open_writer: Some(arrow_writer),
            heuristic: None,
        },
        ProviderEntry {
            name: "sha256",
            capabilities: FILE_CAPS,
            extensions: &["sha256"],
            option_schema: no_options,
            open_reader: None,
            open_writer: Some(checksum_writer),
            heuristic: None,
        },
        ProviderEntry {
            name: "sqlite",
            capabilities: DB_CAPS,
            extensions: &["sqlite", "sqlite3"],
            option_schema: SqliteSource::options_schema,
            open_reader: Some(sqlite_reader),
            open_writer: Some(sqlite_writer),
            heuristic: Some(sqlite_magic),
        },
        ProviderEntry {
            name: "duckdb",
            capabilities: DB_CAPS,
            extensions: &["duckdb"],
            option_schema: no_options,
            open_reader: None,
            open_writer: None,
            heuristic: None,
        },
        ProviderEntry {
            name: "generate",
            capabilities: FILE_CAPS,
            extensions: &[],
            option_schema: GenerateSource::options_schema,
            open_reader: Some(generate_reader),
            open_writer: None,
            heuristic: None,
        },
    ];
    REGISTRY
}

fn provider_names() -> Vec<&'static str> {
    registry().iter().map(|e| e.name).collect()
}

/// Resolve a connection string to its provider and the residual location.
pub fn resolve(conn: &str) -> Result<(&'static ProviderEntry, String)> {
    if conn.is_empty() {
        return Err(PipeError::InvalidArgument(
            "connection string must not be empty".into(),
        ));
    }
    if conn == "-" {
        let csv = registry().iter().find(|e| e.name == "csv").expect("csv registered");
        return Ok((csv, "-".to_string()));
    }

    if let Some((prefix, rest)) = conn.split_once(':') {
        if let Some(entry) = registry()
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(prefix))
        {
            return Ok((entry, rest.to_string()));
        }
    }

    if let Some(ext) = Path::new(conn).extension().and_then(|e| e.to_str()) {
        let ext = ext.to_ascii_lowercase();
        if let Some(entry) = registry()
            .iter()
            .find(|e| e.extensions.contains(&ext.as_str()))
        {
            return Ok((entry, conn.to_string()));
        }
    }

    if let Some(entry) = registry()
        .iter()
        .find(|e| e.heuristic.map(|h| h(conn)).unwrap_or(false))
    {
        return Ok((entry, conn.to_string()));
    }

    Err(PipeError::NotFound(format!(
        "no provider matches '{conn}'; known providers: {}",
        provider_names().join(", ")
    )))
}

fn bind_options(entry: &ProviderEntry, raw: &BTreeMap<String, String>) -> Result<Options> {
    let schema = (entry.option_schema)();
    if schema.fields.is_empty() && !raw.is_empty() {
        return Err(PipeError::InvalidConfiguration(format!(
            "provider '{}' takes no options",
            entry.name
        )));
    }
    if schema.fields.is_empty() {
        return Ok(Options::default());
    }
    schema.bind(raw)
}

pub fn open_reader(
    conn: &str,
    query: Option<&str>,
    raw_options: &BTreeMap<String, String>,
    allow_unsafe_query: bool,
) -> Result<Box<dyn Reader>> {
    let (entry, location) = resolve(conn)?;
    let ctor = entry.open_reader.ok_or_else(|| {
        PipeError::Unsupported(format!(
            "provider '{}' cannot read (known providers: {})",
            entry.name,
            provider_names().join(", ")
        ))
    })?;
    let request = ProviderRequest {
        location,
        query: query.map(str::to_string),
        strategy: WriteStrategy::Append,
        options: bind_options(entry, raw_options)?,
        allow_unsafe_query,
    };
    if entry.capabilities.requires_query && request.query.is_none() {
        return Err(PipeError::InvalidArgument(format!(
            "provider '{}' needs a query or table name",
            entry.name
        )));
    }
    ctor(&request)
}

pub fn open_writer(
    conn: &str,
    strategy: WriteStrategy,
    raw_options: &BTreeMap<String, String>,
) -> Result<Box<dyn Writer>> {
    let (entry, location) = resolve(conn)?;
    let ctor = entry.open_writer.ok_or_else(|| {
        PipeError::Unsupported(format!(
            "provider '{}' cannot write (known providers: {})",
            entry.name,
            provider_names().join(", ")
        ))
    })?;
    if strategy != WriteStrategy::Append && !entry.capabilities.supports_write_strategies {
        return Err(PipeError::Unsupported(format!(
            "provider '{}' only appends; strategy {strategy:?} needs a transactional sink",
            entry.name
        )));
    }
    let request = ProviderRequest {
        location,
        query: None,
        strategy,
        options: bind_options(entry, raw_options)?,
        allow_unsafe_query: false,
    };
    ctor(&request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_beats_extension() {
        let (entry, location) = resolve("csv:data.parquet").unwrap();
        assert_eq!(entry.name, "csv");
        assert_eq!(location, "data.parquet");
    }

    #[test]
    fn extension_match() {
        for (conn, name) in [
            ("out.csv", "csv"),
            ("x/y/z.jsonl", "jsonl"),
            ("data.parquet", "parquet"),
            ("t.arrow", "arrow"),
            ("t.arrowfile", "arrow"),
            ("sum.sha256", "sha256"),
            ("db.sqlite", "sqlite"),
            ("db.sqlite3", "sqlite"),
        ] {
            let (entry, location) = resolve(conn).unwrap();
            assert_eq!(entry.name, name, "conn: {conn}");
            assert_eq!(location, conn);
        }
    }

    #[test]
    fn dash_is_text_stdio() {
        let (entry, location) = resolve("-").unwrap();
        assert_eq!(entry.name, "csv");
        assert_eq!(location, "-");
    }

    #[test]
    fn generate_prefix() {
        let (entry, location) = resolve("generate:500").unwrap();
        assert_eq!(entry.name, "generate");
        assert_eq!(location, "500");
    }

    #[test]
    fn unknown_strings_are_not_found() {
        let err = resolve("mystery.blob").unwrap_err();
        assert!(matches!(err, PipeError::NotFound(_)));
        assert!(err.to_string().contains("known providers"));
    }

    #[test]
    fn duckdb_is_recognized_but_not_built() {
        let err = open_reader("warehouse.duckdb", Some("t"), &BTreeMap::new(), false).err().unwrap();
        assert!(matches!(err, PipeError::Unsupported(_)));
    }

    #[test]
    fn sqlite_magic_heuristic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("extensionless");
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute("CREATE TABLE t (x)", []).unwrap();
        drop(conn);
        let (entry, _) = resolve(path.to_str().unwrap()).unwrap();
        assert_eq!(entry.name, "sqlite");
    }

    #[test]
    fn checksum_cannot_read() {
        let err = open_reader("sum.sha256", None, &BTreeMap::new(), false).err().unwrap();
        assert!(matches!(err, PipeError::Unsupported(_)));
    }

    #[test]
    fn generate_rejects_unknown_options() {
        let mut raw = BTreeMap::new();
        raw.insert("warp".to_string(), "9".to_string());
        let err = open_reader("generate:10", None, &raw, false).err().unwrap();
        assert!(matches!(err, PipeError::InvalidConfiguration(_)));
    }
}
