//! SQLite provider: dialect, query-validated source, strategy-driven sink.
//!
//! The sink implements the full write-strategy table. Upsert and Ignore
//! partition every batch client-side: one probe query asks which keys
//! already exist, rows split into insert/update lists preserving source
//! order, and the whole batch executes inside one transaction that a retry
//! reopens from scratch.

use std::collections::HashSet;
use std::path::Path;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, Transaction};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use rowpipe_core::compat;
use rowpipe_core::contract::{Reader, RunContext, WriteStrategy, Writer};
use rowpipe_core::dialect::{ColumnMatcher, Dialect};
use rowpipe_core::error::{PipeError, Result};
use rowpipe_core::options::{OptionField, OptionSchema, Options};
use rowpipe_core::row::{Batch, LogicalType, Row, Value};
use rowpipe_core::schema::{Column, Schema, TargetColumn, TargetSchema};

use crate::query_safety::{is_bare_table_name, screen_query};

/// SQLite stores identifiers as written and compares case-insensitively, so
/// the fold is the identity.
pub struct SqliteDialect;

const RESERVED: &[&str] = &[
    "ABORT", "ACTION", "ADD", "AFTER", "ALL", "ALTER", "AND", "AS", "ASC", "BEFORE", "BEGIN",
    "BETWEEN", "BY", "CASCADE", "CASE", "CAST", "CHECK", "COLLATE", "COLUMN", "COMMIT",
    "CONSTRAINT", "CREATE", "CROSS", "DEFAULT", "DEFERRED", "DELETE", "DESC", "DISTINCT", "DROP",
    "EACH", "ELSE", "END", "ESCAPE", "EXCEPT", "EXISTS", "EXPLAIN", "FOREIGN", "FROM", "FULL",
    "GROUP", "HAVING", "IN", "INDEX", "INNER", "INSERT", "INTERSECT", "INTO", "IS", "ISNULL",
    "JOIN", "KEY", "LEFT", "LIKE", "LIMIT", "NOT", "NOTNULL", "NULL", "ON", "OR", "ORDER",
    "OUTER", "PRAGMA", "PRIMARY", "REFERENCES", "REPLACE", "RESTRICT", "RIGHT", "ROLLBACK",
    "ROW", "SELECT", "SET", "TABLE", "THEN", "TO", "TRANSACTION", "TRIGGER", "UNION", "UNIQUE",
    "UPDATE", "USING", "VALUES", "VIEW", "WHEN", "WHERE",
];

impl Dialect for SqliteDialect {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn normalize(&self, ident: &str) -> String {
        ident.to_string()
    }

    fn is_reserved(&self, ident: &str) -> bool {
        let upper = ident.to_ascii_uppercase();
        RESERVED.contains(&upper.as_str())
    }

    fn map_to_provider_type(&self, column: &Column) -> String {
        match column.logical_type {
            LogicalType::Bool => "BOOLEAN".into(),
            LogicalType::Int32 | LogicalType::Int64 => "INTEGER".into(),
            LogicalType::Float32 | LogicalType::Float64 => "REAL".into(),
            LogicalType::Decimal => "NUMERIC".into(),
            LogicalType::Bytes => "BLOB".into(),
            LogicalType::Date => "DATE".into(),
            LogicalType::Timestamp | LogicalType::TimestampTz => "DATETIME".into(),
            LogicalType::Guid => "GUID".into(),
            LogicalType::String | LogicalType::Unknown => "TEXT".into(),
        }
    }
}

/// Infer the logical type (and text length bound) from a declared type.
fn decl_to_logical(decl: &str) -> (LogicalType, Option<u32>) {
    let upper = decl.to_ascii_uppercase();
    let max_length = upper
        .find('(')
        .and_then(|at| upper[at + 1..].split(&[')', ','][..]).next()?.trim().parse().ok());
    let logical = if upper.contains("BOOL") {
        LogicalType::Bool
    } else if upper.contains("DATETIME") || upper.contains("TIMESTAMP") {
        LogicalType::Timestamp
    } else if upper.contains("DATE") {
        LogicalType::Date
    } else if upper.contains("GUID") || upper.contains("UUID") {
        LogicalType::Guid
    } else if upper.contains("INT") {
        LogicalType::Int64
    } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
        LogicalType::String
    } else if upper.contains("BLOB") {
        LogicalType::Bytes
    } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
        LogicalType::Float64
    } else if upper.contains("NUMERIC") || upper.contains("DEC") {
        LogicalType::Decimal
    } else {
        LogicalType::Unknown
    };
    let max_length = if logical == LogicalType::String { max_length } else { None };
    (logical, max_length)
}

fn map_sqlite_err(err: rusqlite::Error) -> PipeError {
    use rusqlite::ErrorCode;
    match &err {
        rusqlite::Error::SqliteFailure(f, msg) => {
            let text = msg.clone().unwrap_or_else(|| f.to_string());
            match f.code {
                ErrorCode::ConstraintViolation => PipeError::ConstraintViolation(text),
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => PipeError::Transient(text),
                ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt => PipeError::Corrupt(text),
                ErrorCode::CannotOpen => PipeError::NotFound(text),
                ErrorCode::PermissionDenied | ErrorCode::ReadOnly => {
                    PipeError::PermissionDenied(text)
                }
                _ => PipeError::Other(anyhow::anyhow!("sqlite error: {text}")),
            }
        }
        other => PipeError::Other(anyhow::anyhow!("sqlite error: {other}")),
    }
}

fn value_ref_to_value(v: ValueRef<'_>) -> Value {
    match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int64(i),
        ValueRef::Real(f) => Value::Float64(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

fn value_to_sql(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(*b as i64),
        Value::Int32(v) => Sql::Integer(*v as i64),
        Value::Int64(v) => Sql::Integer(*v),
        Value::Float32(v) => Sql::Real(*v as f64),
        Value::Float64(v) => Sql::Real(*v),
        Value::Bytes(b) => Sql::Blob(b.clone()),
        other => Sql::Text(other.canonical_text()),
    }
}

pub struct SqliteSource {
    path: String,
    query_input: String,
    allow_unsafe: bool,
    columns: Vec<Column>,
    rx: Option<Receiver<Result<Row>>>,
    done: bool,
}

impl SqliteSource {
    pub fn options_schema() -> OptionSchema {
        OptionSchema {
            provider: "sqlite",
            fields: vec![OptionField::scalar(
                "table",
                "target table name for the writer side",
                Some("data"),
            )],
        }
    }

    /// `query` is either full SQL or a bare table name.
    pub fn new(path: impl Into<String>, query: impl Into<String>, allow_unsafe: bool) -> Self {
        SqliteSource {
            path: path.into(),
            query_input: query.into(),
            allow_unsafe,
            columns: Vec::new(),
            rx: None,
            done: false,
        }
    }

    fn resolve_sql(&self) -> Result<String> {
        let input = self.query_input.trim();
        if input.is_empty() {
            return Err(PipeError::InvalidArgument(
                "sqlite sources need a query or table name".into(),
            ));
        }
        if is_bare_table_name(input) {
            return Ok(format!("SELECT * FROM \"{}\"", input.replace('"', "\"\"")));
        }
        screen_query(input, self.allow_unsafe)?;
        Ok(input.to_string())
    }
}

/// Pump rows from a prepared statement into the channel until the receiver
/// drops, the token cancels, or the source runs dry.
fn stream_rows(
    conn: Connection,
    sql: &str,
    cancel: &CancellationToken,
    tx: &SyncSender<Result<Row>>,
) -> Result<()> {
    let mut stmt = conn.prepare(sql).map_err(map_sqlite_err)?;
    let width = stmt.column_count();
    let mut rows = stmt.query([]).map_err(map_sqlite_err)?;
    while let Some(row) = rows.next().map_err(map_sqlite_err)? {
        if cancel.is_cancelled() {
            return Err(PipeError::Cancelled);
        }
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(value_ref_to_value(row.get_ref(i).map_err(map_sqlite_err)?));
        }
        let mut pending = Row::new(values);
        loop {
            match tx.try_send(Ok(pending)) {
                Ok(()) => break,
                Err(TrySendError::Full(item)) => {
                    if cancel.is_cancelled() {
                        return Err(PipeError::Cancelled);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                    pending = item.expect("only rows are re-queued");
                }
                Err(TrySendError::Disconnected(_)) => return Ok(()),
            }
        }
    }
    Ok(())
}

#[async_trait]
impl Reader for SqliteSource {
    async fn open(&mut self, ctx: &RunContext) -> Result<()> {
        let sql = self.resolve_sql()?;
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(map_sqlite_err)?;
        if let Some(timeout) = ctx.query_timeout {
            conn.busy_timeout(timeout).map_err(map_sqlite_err)?;
        }

        {
            let stmt = conn.prepare(&sql).map_err(|e| match map_sqlite_err(e) {
                PipeError::Other(inner) => PipeError::InvalidArgument(format!(
                    "query failed to prepare: {inner}"
                )),
                other => other,
            })?;
            self.columns = stmt
                .columns()
                .iter()
                .map(|c| {
                    let (logical, _) = c
                        .decl_type()
                        .map(decl_to_logical)
                        .unwrap_or((LogicalType::Unknown, None));
                    Column::new(c.name(), logical)
                })
                .collect();
        }

        let (tx, rx) = std::sync::mpsc::sync_channel::<Result<Row>>(1_024);
        let cancel = ctx.cancel.clone();
        std::thread::spawn(move || {
            if let Err(err) = stream_rows(conn, &sql, &cancel, &tx) {
                let _ = tx.send(Err(err));
            }
        });
        self.rx = Some(rx);
        Ok(())
    }

    fn columns(&self) -> &[Column] {
        &self.columns
    }

    async fn next_batch(&mut self, batch_size: usize, ctx: &RunContext) -> Result<Option<Batch>> {
        if self.done {
            return Ok(None);
        }
        let rx = self
            .rx
            .as_ref()
            .ok_or_else(|| PipeError::InvalidArgument("reader is not open".into()))?;

        let mut batch: Batch = Vec::with_capacity(batch_size.min(8_192));
        loop {
            ctx.ensure_active()?;
            match rx.recv_timeout(Duration::from_millis(25)) {
                Ok(item) => {
                    batch.push(item?);
                    if batch.len() >= batch_size {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !batch.is_empty() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.done = true;
                    break;
                }
            }
        }
        if batch.is_empty() {
            Ok(None)
        } else {
            Ok(Some(batch))
        }
    }

    async fn dispose(&mut self) -> Result<()> {
        // Dropping the receiver stops the pump thread at its next send.
        self.rx = None;
        Ok(())
    }
}

pub struct SqliteSink {
    path: String,
    table: String,
    strategy: WriteStrategy,
    dialect: SqliteDialect,
    columns: Vec<Column>,
    physical_names: Vec<String>,
    quoted_names: Vec<String>,
    key_indices: Vec<usize>,
    non_key_indices: Vec<usize>,
    insert_sql: String,
    update_sql: Option<String>,
    conn: Option<Connection>,
}

impl SqliteSink {
    pub fn new(path: impl Into<String>, options: &Options, strategy: WriteStrategy) -> Self {
        SqliteSink {
            path: path.into(),
            table: options.get_or("table", "data"),
            strategy,
            dialect: SqliteDialect,
            columns: Vec::new(),
            physical_names: Vec::new(),
            quoted_names: Vec::new(),
            key_indices: Vec::new(),
            non_key_indices: Vec::new(),
            insert_sql: String::new(),
            update_sql: None,
            conn: None,
        }
    }

    fn quoted_table(&self) -> String {
        self.dialect.quote(&self.table)
    }

    fn connect(&mut self) -> Result<&mut Connection> {
        if self.conn.is_none() {
            self.conn = Some(Connection::open(&self.path).map_err(map_sqlite_err)?);
        }
        Ok(self.conn.as_mut().expect("connection opened above"))
    }

    /// Inspection that surfaces real errors; the trait method downgrades
    /// unreadable sinks to `None`.
    fn inspect_impl(&mut self) -> Result<TargetSchema> {
        if !Path::new(&self.path).exists() {
            return Ok(TargetSchema::missing());
        }
        let table = self.table.clone();
        let quoted = self.quoted_table();
        let conn = self.connect()?;

        let exists: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [&table],
                |r| r.get::<_, i64>(0),
            )
            .map_err(map_sqlite_err)?
            > 0;
        if !exists {
            return Ok(TargetSchema::missing());
        }

        struct Info {
            name: String,
            decl: String,
            notnull: bool,
            has_default: bool,
            pk_order: i64,
        }
        let mut infos: Vec<Info> = Vec::new();
        {
            let mut stmt = conn
                .prepare(&format!("PRAGMA table_info({quoted})"))
                .map_err(map_sqlite_err)?;
            let mut rows = stmt.query([]).map_err(map_sqlite_err)?;
            while let Some(row) = rows.next().map_err(map_sqlite_err)? {
                infos.push(Info {
                    name: row.get::<_, String>(1).map_err(map_sqlite_err)?,
                    decl: row.get::<_, String>(2).unwrap_or_default(),
                    notnull: row.get::<_, i64>(3).map_err(map_sqlite_err)? != 0,
                    has_default: row
                        .get::<_, Option<String>>(4)
                        .map_err(map_sqlite_err)?
                        .is_some(),
                    pk_order: row.get::<_, i64>(5).map_err(map_sqlite_err)?,
                });
            }
        }

        // Single-column unique indexes mark their column unique.
        let mut unique_columns: HashSet<String> = HashSet::new();
        {
            let mut index_names: Vec<String> = Vec::new();
            let mut stmt = conn
                .prepare(&format!("PRAGMA index_list({quoted})"))
                .map_err(map_sqlite_err)?;
            let mut rows = stmt.query([]).map_err(map_sqlite_err)?;
            while let Some(row) = rows.next().map_err(map_sqlite_err)? {
                let unique: i64 = row.get(2).map_err(map_sqlite_err)?;
                if unique != 0 {
                    index_names.push(row.get::<_, String>(1).map_err(map_sqlite_err)?);
                }
            }
            for index in index_names {
                let mut stmt = conn
                    .prepare(&format!("PRAGMA index_info({})", SqliteDialect.quote(&index)))
                    .map_err(map_sqlite_err)?;
                let cols: Vec<String> = stmt
                    .query_map([], |r| r.get::<_, String>(2))
                    .map_err(map_sqlite_err)?
                    .filter_map(|r| r.ok())
                    .collect();
                if cols.len() == 1 {
                    unique_columns.insert(cols[0].clone());
                }
            }
        }

        let row_count: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {quoted}"), [], |r| r.get(0))
            .map_err(map_sqlite_err)?;
        let page_count: i64 = conn
            .query_row("PRAGMA page_count", [], |r| r.get(0))
            .unwrap_or(0);
        let page_size: i64 = conn
            .query_row("PRAGMA page_size", [], |r| r.get(0))
            .unwrap_or(0);

        let mut pk: Vec<(i64, String)> = infos
            .iter()
            .filter(|i| i.pk_order > 0)
            .map(|i| (i.pk_order, i.name.clone()))
            .collect();
        pk.sort();

        let columns = infos
            .into_iter()
            .map(|info| {
                let (logical, max_length) = decl_to_logical(&info.decl);
                let mut column = Column::new(info.name.clone(), logical);
                // A NOT NULL column with a default can still be omitted on
                // insert, which is all the compatibility check cares about.
                column.nullable = (!info.notnull || info.has_default) && info.pk_order == 0;
                let mut tc = TargetColumn::new(column, info.decl);
                tc.is_primary_key = info.pk_order > 0;
                tc.is_unique = unique_columns.contains(&info.name);
                tc.max_length = max_length;
                tc
            })
            .collect();

        Ok(TargetSchema {
            exists: true,
            columns,
            row_count: Some(row_count.max(0) as u64),
            size_bytes: Some((page_count.max(0) as u64) * (page_size.max(0) as u64)),
            primary_key: pk.into_iter().map(|(_, name)| name).collect(),
        })
    }

    fn create_table(&mut self) -> Result<()> {
        let mut parts = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            let ident = self.dialect.render_ident(column);
            let ty = self.dialect.map_to_provider_type(column);
            let not_null = if column.nullable { "" } else { " NOT NULL" };
            parts.push(format!("{ident} {ty}{not_null}"));
        }
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.quoted_table(),
            parts.join(", ")
        );
        debug!(table = %self.table, "creating target table");
        self.connect()?
            .execute(&sql, [])
            .map_err(map_sqlite_err)?;
        Ok(())
    }

    fn build_statements(&mut self, target: &TargetSchema) -> Result<()> {
        let quoted_table = self.quoted_table();
        self.quoted_names = self
            .columns
            .iter()
            .map(|c| self.dialect.render_ident(c))
            .collect();

        let placeholders: Vec<String> =
            (1..=self.columns.len()).map(|i| format!("?{i}")).collect();
        self.insert_sql = format!(
            "INSERT INTO {quoted_table} ({}) VALUES ({})",
            self.quoted_names.join(", "),
            placeholders.join(", ")
        );

        if !self.strategy.requires_primary_key() {
            return Ok(());
        }
        if target.primary_key.is_empty() {
            return Err(PipeError::InvalidConfiguration(format!(
                "strategy {:?} needs a primary key on '{}'",
                self.strategy, self.table
            )));
        }
        self.key_indices = target
            .primary_key
            .iter()
            .map(|pk| {
                self.physical_names
                    .iter()
                    .position(|p| p.eq_ignore_ascii_case(pk))
                    .ok_or_else(|| {
                        PipeError::InvalidConfiguration(format!(
                            "primary key column '{pk}' is not produced by the source"
                        ))
                    })
            })
            .collect::<Result<_>>()?;
        self.non_key_indices = (0..self.columns.len())
            .filter(|i| !self.key_indices.contains(i))
            .collect();

        if self.strategy == WriteStrategy::Upsert && !self.non_key_indices.is_empty() {
            let sets: Vec<String> = self
                .non_key_indices
                .iter()
                .enumerate()
                .map(|(n, &i)| format!("{} = ?{}", self.quoted_names[i], n + 1))
                .collect();
            let wheres: Vec<String> = self
                .key_indices
                .iter()
                .enumerate()
                .map(|(n, &i)| {
                    format!("{} = ?{}", self.quoted_names[i], self.non_key_indices.len() + n + 1)
                })
                .collect();
            self.update_sql = Some(format!(
                "UPDATE {quoted_table} SET {} WHERE {}",
                sets.join(", "),
                wheres.join(" AND ")
            ));
        }
        Ok(())
    }

    fn key_of(&self, row: &Row) -> String {
        self.key_indices
            .iter()
            .map(|&i| row.get(i).canonical_text())
            .collect::<Vec<_>>()
            .join("|")
    }
}

/// Ask the sink which of the batch's keys already exist; one logical round
/// trip, chunked only to stay under the engine's bound-parameter limit.
fn probe_existing_keys(
    tx: &Transaction<'_>,
    quoted_table: &str,
    quoted_keys: &[String],
    key_indices: &[usize],
    batch: &[Row],
) -> Result<HashSet<String>> {
    let mut existing = HashSet::new();
    if batch.is_empty() {
        return Ok(existing);
    }
    let key_width = key_indices.len();
    let rows_per_chunk = (30_000 / key_width.max(1)).max(1);
    let key_list = quoted_keys.join(", ");

    for chunk in batch.chunks(rows_per_chunk) {
        let sql = if key_width == 1 {
            let marks = vec!["?"; chunk.len()].join(", ");
            format!("SELECT {key_list} FROM {quoted_table} WHERE {key_list} IN ({marks})")
        } else {
            let tuple = format!("({})", vec!["?"; key_width].join(", "));
            let values = vec![tuple; chunk.len()].join(", ");
            format!(
                "SELECT {key_list} FROM {quoted_table} WHERE ({key_list}) IN (VALUES {values})"
            )
        };
        let mut stmt = tx.prepare(&sql).map_err(map_sqlite_err)?;
        let params: Vec<rusqlite::types::Value> = chunk
            .iter()
            .flat_map(|row| key_indices.iter().map(|&i| value_to_sql(row.get(i))))
            .collect();
        let mut rows = stmt
            .query(rusqlite::params_from_iter(params))
            .map_err(map_sqlite_err)?;
        while let Some(row) = rows.next().map_err(map_sqlite_err)? {
            let key = (0..key_width)
                .map(|i| {
                    row.get_ref(i)
                        .map(value_ref_to_value)
                        .map(|v| v.canonical_text())
                })
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(map_sqlite_err)?
                .join("|");
            existing.insert(key);
        }
    }
    Ok(existing)
}

fn insert_rows(tx: &Transaction<'_>, sql: &str, rows: &[&Row]) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let mut stmt = tx.prepare_cached(sql).map_err(map_sqlite_err)?;
    for row in rows {
        let params: Vec<rusqlite::types::Value> = row.0.iter().map(value_to_sql).collect();
        stmt.execute(rusqlite::params_from_iter(params))
            .map_err(map_sqlite_err)?;
    }
    Ok(())
}

fn update_rows(
    tx: &Transaction<'_>,
    sql: &str,
    non_key: &[usize],
    key: &[usize],
    rows: &[&Row],
) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let mut stmt = tx.prepare_cached(sql).map_err(map_sqlite_err)?;
    for row in rows {
        let params: Vec<rusqlite::types::Value> = non_key
            .iter()
            .chain(key.iter())
            .map(|&i| value_to_sql(row.get(i)))
            .collect();
        stmt.execute(rusqlite::params_from_iter(params))
            .map_err(map_sqlite_err)?;
    }
    Ok(())
}

#[async_trait]
impl Writer for SqliteSink {
    async fn inspect_target(&mut self, _ctx: &RunContext) -> Result<Option<TargetSchema>> {
        match self.inspect_impl() {
            Ok(target) => Ok(Some(target)),
            Err(PipeError::Corrupt(_)) => Ok(None),
            Err(other) => Err(other),
        }
    }

    async fn initialize(&mut self, columns: &[Column], _ctx: &RunContext) -> Result<()> {
        self.columns = columns.to_vec();
        self.physical_names = columns
            .iter()
            .map(|c| {
                ColumnMatcher::resolve_physical_name(&c.name, c.case_sensitive, Some(&SqliteDialect))
            })
            .collect();

        let mut target = self.inspect_impl()?;

        if self.strategy.rebuilds_target() {
            if target.exists {
                let sql = format!("DROP TABLE IF EXISTS {}", self.quoted_table());
                self.connect()?.execute(&sql, []).map_err(map_sqlite_err)?;
            }
            self.create_table()?;
            target = self.inspect_impl()?;
        } else if !target.exists {
            self.create_table()?;
            target = self.inspect_impl()?;
        } else {
            let schema = Schema::new(columns.to_vec())?;
            let report = compat::analyze(&schema, Some(&target), Some(&self.dialect));
            for warning in &report.warnings {
                tracing::warn!("{warning}");
            }
            if !report.is_acceptable() {
                return Err(PipeError::SchemaIncompatible(report.errors.join("; ")));
            }
        }

        if self.strategy.clears_rows() {
            let sql = format!("DELETE FROM {}", self.quoted_table());
            self.connect()?.execute(&sql, []).map_err(map_sqlite_err)?;
        }

        self.build_statements(&target)
    }

    async fn write_batch(&mut self, batch: &Batch, ctx: &RunContext) -> Result<()> {
        ctx.ensure_active()?;
        let strategy = self.strategy;
        let quoted_table = self.quoted_table();
        let insert_sql = self.insert_sql.clone();
        let update_sql = self.update_sql.clone();
        let key_indices = self.key_indices.clone();
        let non_key_indices = self.non_key_indices.clone();
        let quoted_keys: Vec<String> = key_indices
            .iter()
            .map(|&i| self.quoted_names[i].clone())
            .collect();
        let keys_of: Vec<String> = if strategy.requires_primary_key() {
            batch.iter().map(|r| self.key_of(r)).collect()
        } else {
            Vec::new()
        };

        let conn = self.connect()?;
        let tx = conn.transaction().map_err(map_sqlite_err)?;

        if strategy.requires_primary_key() {
            let existing =
                probe_existing_keys(&tx, &quoted_table, &quoted_keys, &key_indices, batch)?;
            let mut inserted: HashSet<&str> = HashSet::new();
            let mut insert_list: Vec<&Row> = Vec::new();
            let mut existing_list: Vec<&Row> = Vec::new();
            for (row, key) in batch.iter().zip(&keys_of) {
                if existing.contains(key) || inserted.contains(key.as_str()) {
                    existing_list.push(row);
                } else {
                    inserted.insert(key);
                    insert_list.push(row);
                }
            }
            insert_rows(&tx, &insert_sql, &insert_list)?;
            match (strategy, &update_sql) {
                (WriteStrategy::Upsert, Some(update)) => {
                    update_rows(&tx, update, &non_key_indices, &key_indices, &existing_list)?;
                }
                // Ignore keeps the first write; Upsert over a key-only table
                // has nothing to update.
                _ => {}
            }
            debug!(
                inserted = insert_list.len(),
                existing = existing_list.len(),
                "batch partitioned"
            );
        } else {
            let all: Vec<&Row> = batch.iter().collect();
            insert_rows(&tx, &insert_sql, &all)?;
        }

        tx.commit().map_err(map_sqlite_err)?;
        Ok(())
    }

    async fn complete(&mut self, _ctx: &RunContext) -> Result<()> {
        Ok(())
    }

    async fn execute_command(&mut self, text: &str, _ctx: &RunContext) -> Result<u64> {
        let affected = self
            .connect()?
            .execute(text, [])
            .map_err(map_sqlite_err)?;
        Ok(affected as u64)
    }

    async fn dispose(&mut self) -> Result<()> {
        self.conn = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_pk(dir: &tempfile::TempDir) -> String {
        let path = dir.path().join("t.sqlite");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT);
             INSERT INTO items VALUES (1, 'a'), (2, 'b');",
        )
        .unwrap();
        path.to_str().unwrap().to_string()
    }

    fn items_options() -> Options {
        Options::from_pairs([("table".to_string(), "items".to_string())])
    }

    fn row(id: i64, name: &str) -> Row {
        Row::new(vec![Value::Int64(id), Value::String(name.into())])
    }

    fn item_columns() -> Vec<Column> {
        vec![
            Column::new("id", LogicalType::Int64),
            Column::new("name", LogicalType::String),
        ]
    }

    fn read_items(path: &str) -> Vec<(i64, String)> {
        let conn = Connection::open(path).unwrap();
        let mut stmt = conn
            .prepare("SELECT id, name FROM items ORDER BY id")
            .unwrap();
        let out = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        out
    }

    #[tokio::test]
    async fn source_reads_a_bare_table_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = db_with_pk(&dir);
        let mut source = SqliteSource::new(&path, "items", false);
        let ctx = RunContext::new();
        source.open(&ctx).await.unwrap();
        assert_eq!(source.columns()[0].logical_type, LogicalType::Int64);
        assert_eq!(source.columns()[1].logical_type, LogicalType::String);

        let mut rows = Vec::new();
        while let Some(batch) = source.next_batch(10, &ctx).await.unwrap() {
            rows.extend(batch);
        }
        assert_eq!(rows.len(), 2);
        source.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn source_rejects_write_queries() {
        let dir = tempfile::tempdir().unwrap();
        let path = db_with_pk(&dir);
        let mut source = SqliteSource::new(&path, "DELETE FROM items", false);
        let err = source.open(&RunContext::new()).await.unwrap_err();
        assert!(matches!(err, PipeError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn upsert_partitions_and_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = db_with_pk(&dir);
        let ctx = RunContext::new();
        let mut sink = SqliteSink::new(&path, &items_options(), WriteStrategy::Upsert);
        sink.initialize(&item_columns(), &ctx).await.unwrap();
        sink.write_batch(
            &vec![row(1, "A"), row(3, "C"), row(2, "B"), row(3, "C2")],
            &ctx,
        )
        .await
        .unwrap();
        sink.complete(&ctx).await.unwrap();
        sink.dispose().await.unwrap();

        assert_eq!(
            read_items(&path),
            vec![
                (1, "A".to_string()),
                (2, "B".to_string()),
                (3, "C2".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn ignore_keeps_existing_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = db_with_pk(&dir);
        let ctx = RunContext::new();
        let mut sink = SqliteSink::new(&path, &items_options(), WriteStrategy::Ignore);
        sink.initialize(&item_columns(), &ctx).await.unwrap();
        sink.write_batch(&vec![row(1, "SHOULD_NOT_LAND"), row(9, "new")], &ctx)
            .await
            .unwrap();
        sink.dispose().await.unwrap();

        let items = read_items(&path);
        assert!(items.contains(&(1, "a".to_string())));
        assert!(items.contains(&(9, "new".to_string())));
    }

    #[tokio::test]
    async fn upsert_without_primary_key_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sqlite");
        let conn = Connection::open(&path).unwrap();
        conn.execute("CREATE TABLE items (id INTEGER, name TEXT)", [])
            .unwrap();
        drop(conn);

        let mut sink = SqliteSink::new(
            path.to_str().unwrap(),
            &items_options(),
            WriteStrategy::Upsert,
        );
        let err = sink
            .initialize(&item_columns(), &RunContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipeError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn truncate_clears_then_inserts() {
        let dir = tempfile::tempdir().unwrap();
        let path = db_with_pk(&dir);
        let ctx = RunContext::new();
        let mut sink = SqliteSink::new(&path, &items_options(), WriteStrategy::Truncate);
        sink.initialize(&item_columns(), &ctx).await.unwrap();
        sink.write_batch(&vec![row(7, "seven")], &ctx).await.unwrap();
        sink.dispose().await.unwrap();

        assert_eq!(read_items(&path), vec![(7, "seven".to_string())]);
    }

    #[tokio::test]
    async fn recreate_rebuilds_to_match_the_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = db_with_pk(&dir);
        let ctx = RunContext::new();
        // A source column the old table does not have.
        let columns = vec![
            Column::new("id", LogicalType::Int64),
            Column::new("name", LogicalType::String),
            Column::new("extra", LogicalType::Float64),
        ];
        let mut sink = SqliteSink::new(&path, &items_options(), WriteStrategy::Recreate);
        sink.initialize(&columns, &ctx).await.unwrap();
        sink.write_batch(
            &vec![Row::new(vec![
                Value::Int64(1),
                Value::String("x".into()),
                Value::Float64(0.5),
            ])],
            &ctx,
        )
        .await
        .unwrap();
        sink.dispose().await.unwrap();

        let conn = Connection::open(&path).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM items", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
        let extra: f64 = conn
            .query_row("SELECT extra FROM items", [], |r| r.get(0))
            .unwrap();
        assert!((extra - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn append_into_missing_source_column_fails_initialize() {
        let dir = tempfile::tempdir().unwrap();
        let path = db_with_pk(&dir);
        let columns = vec![
            Column::new("id", LogicalType::Int64),
            Column::new("nope", LogicalType::String),
        ];
        let mut sink = SqliteSink::new(&path, &items_options(), WriteStrategy::Append);
        let err = sink
            .initialize(&columns, &RunContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipeError::SchemaIncompatible(_)));
    }

    #[tokio::test]
    async fn inspect_reports_pk_counts_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = db_with_pk(&dir);
        let mut sink = SqliteSink::new(&path, &items_options(), WriteStrategy::Append);
        let target = sink
            .inspect_target(&RunContext::new())
            .await
            .unwrap()
            .unwrap();
        assert!(target.exists);
        assert_eq!(target.primary_key, vec!["id".to_string()]);
        assert_eq!(target.row_count, Some(2));
        assert!(target.size_bytes.unwrap_or(0) > 0);
        let id = target.find("id").unwrap();
        assert!(id.is_primary_key);
        assert_eq!(id.inferred_logical_type(), LogicalType::Int64);
    }

    #[tokio::test]
    async fn inspect_missing_file_reports_absent_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.sqlite");
        let mut sink = SqliteSink::new(
            path.to_str().unwrap(),
            &items_options(),
            WriteStrategy::Append,
        );
        let target = sink
            .inspect_target(&RunContext::new())
            .await
            .unwrap()
            .unwrap();
        assert!(!target.exists);
    }

    #[test]
    fn decl_parsing() {
        assert_eq!(decl_to_logical("INTEGER"), (LogicalType::Int64, None));
        assert_eq!(decl_to_logical("VARCHAR(40)"), (LogicalType::String, Some(40)));
        assert_eq!(decl_to_logical("DATETIME"), (LogicalType::Timestamp, None));
        assert_eq!(decl_to_logical("BOOLEAN"), (LogicalType::Bool, None));
        assert_eq!(decl_to_logical(""), (LogicalType::Unknown, None));
        assert_eq!(decl_to_logical("DECIMAL(10,2)"), (LogicalType::Decimal, None));
    }

    #[test]
    fn dialect_rules() {
        let d = SqliteDialect;
        assert_eq!(d.normalize("MixedCase"), "MixedCase");
        assert!(d.is_reserved("order"));
        assert!(d.requires_quoting("two words"));
        assert!(!d.requires_quoting("plain_name"));
        assert_eq!(d.quote("a\"b"), "\"a\"\"b\"");
    }
}
