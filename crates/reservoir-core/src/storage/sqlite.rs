//! SQLite backing store
//!
//! The main database (`readings.db`) holds the reading stream, the snapshot
//! catalog and the schema registry. Each table schema lives in its own
//! database file (`<schema>.db`) which a session attaches under the schema
//! name the first time it touches one of its tables.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, DatabaseName, OptionalExtension, TransactionBehavior};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::codec::{
    decode_reading_batch, encode_readings, format_timestamp, from_sql_value, parse_timestamp,
    result_set,
};
use crate::config::Config;
use crate::connection::{Backend, Capabilities, Connection};
use crate::models::{quote_ident, Reading, TableName};
use crate::query::{DeleteRequest, InsertRequest, Query, UpdateRequest};
use crate::retention::{PurgeFlags, PurgeRequest, PurgeResult, ReadingStats};
use crate::storage::descriptor::SchemaDescriptor;
use crate::storage::schema::{init_schema, needs_init};
use crate::storage::{snapshot, StorageError, StorageResult};

/// File name of the main database inside the data directory
pub const MAIN_DATABASE: &str = "readings.db";

/// Default time a session waits on a locked database
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Schema databases one session keeps attached; SQLite allows 10
pub const MAX_ATTACHED_SCHEMAS: usize = 8;

/// File-backed SQLite store
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    path: PathBuf,
    data_dir: PathBuf,
    busy_timeout: Duration,
}

impl SqliteBackend {
    /// Open the store described by the configuration
    pub fn open(config: &Config) -> StorageResult<Self> {
        Ok(Self::new(&config.data_dir)?
            .with_busy_timeout(Duration::from_millis(config.busy_timeout_ms)))
    }

    /// Open (creating if needed) the store in `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)
            .map_err(|e| StorageError::from_io(e, data_dir.clone()))?;

        let path = data_dir.join(MAIN_DATABASE);
        let conn = rusqlite::Connection::open(&path)?;
        if needs_init(&conn) {
            init_schema(&conn)?;
            info!(path = ?path, "initialized main database");
        }

        Ok(Self {
            path,
            data_dir,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        })
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    /// Path of the main database
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Backend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    fn connect(&self) -> StorageResult<Box<dyn Connection>> {
        let conn = rusqlite::Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        debug!(path = ?self.path, "opened sqlite session");

        Ok(Box::new(SqliteConnection {
            conn,
            data_dir: self.data_dir.clone(),
            attached: VecDeque::new(),
        }))
    }
}

/// One SQLite session
pub struct SqliteConnection {
    conn: rusqlite::Connection,
    data_dir: PathBuf,
    /// Attached schemas, least recently used first
    attached: VecDeque<String>,
}

/// Reading as stored, before timestamp parsing
struct ReadingRow {
    id: i64,
    asset_code: String,
    reading: String,
    user_ts: String,
    ts: String,
}

impl ReadingRow {
    fn into_reading(self) -> StorageResult<Reading> {
        Ok(Reading {
            id: self.id as u64,
            asset_code: self.asset_code,
            reading: serde_json::from_str(&self.reading).unwrap_or(Value::String(self.reading)),
            user_ts: parse_timestamp(&self.user_ts)?,
            ts: parse_timestamp(&self.ts)?,
        })
    }
}

/// Reading ids are stored as signed 64-bit integers
fn sql_id(id: u64) -> i64 {
    i64::try_from(id).unwrap_or(i64::MAX)
}

/// Map a missing table onto `NotFound`
fn table_error(err: rusqlite::Error, table: &TableName) -> StorageError {
    if err.to_string().contains("no such table") {
        StorageError::NotFound {
            what: format!("table {}", table),
        }
    } else {
        err.into()
    }
}

fn query_rows(
    conn: &rusqlite::Connection,
    sql: &str,
    params: &[SqlValue],
) -> rusqlite::Result<Vec<Value>> {
    let mut stmt = conn.prepare(sql)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(params_from_iter(params.iter()))?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut obj = Map::new();
        for (i, name) in names.iter().enumerate() {
            obj.insert(name.clone(), from_sql_value(row.get::<_, SqlValue>(i)?));
        }
        out.push(Value::Object(obj));
    }
    Ok(out)
}

fn reading_stats(conn: &rusqlite::Connection) -> StorageResult<ReadingStats> {
    let (count, min_id, max_id): (i64, Option<i64>, Option<i64>) = conn.query_row(
        "SELECT COUNT(*), MIN(id), MAX(id) FROM main.readings",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    Ok(ReadingStats {
        count: count as u64,
        min_id: min_id.map(|id| id as u64),
        max_id: max_id.map(|id| id as u64),
    })
}

/// Id of the n-th newest reading (1-based)
fn nth_newest_id(conn: &rusqlite::Connection, n: u64) -> StorageResult<Option<u64>> {
    let id: Option<i64> = conn
        .query_row(
            "SELECT id FROM main.readings ORDER BY id DESC LIMIT 1 OFFSET ?1",
            params![sql_id(n.saturating_sub(1))],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id.map(|id| id as u64))
}

impl SqliteConnection {
    /// Attach the database holding `schema` unless already attached
    ///
    /// At most [`MAX_ATTACHED_SCHEMAS`] stay attached; the least recently
    /// used one is detached to make room.
    fn ensure_schema(&mut self, schema: &str) -> StorageResult<()> {
        if let Some(pos) = self.attached.iter().position(|s| s == schema) {
            if let Some(name) = self.attached.remove(pos) {
                self.attached.push_back(name);
            }
            return Ok(());
        }
        if schema.eq_ignore_ascii_case("main") || schema.eq_ignore_ascii_case("temp") {
            return Err(StorageError::invalid(format!(
                "schema name '{}' is reserved",
                schema
            )));
        }

        if self.attached.len() >= MAX_ATTACHED_SCHEMAS {
            self.detach_oldest()?;
        }

        let path = self.data_dir.join(format!("{}.db", schema));
        self.conn.execute(
            &format!("ATTACH DATABASE ?1 AS {}", quote_ident(schema)),
            params![path.to_string_lossy()],
        )?;
        self.conn.pragma_update_and_check(
            Some(DatabaseName::Attached(schema)),
            "journal_mode",
            "WAL",
            |row| row.get::<_, String>(0),
        )?;
        debug!(schema, path = ?path, "attached schema database");

        self.attached.push_back(schema.to_string());
        Ok(())
    }

    fn detach_oldest(&mut self) -> StorageResult<()> {
        let Some(oldest) = self.attached.front().cloned() else {
            return Ok(());
        };
        // Cached statements may still reference the schema
        self.conn.flush_prepared_statement_cache();
        self.conn
            .execute_batch(&format!("DETACH DATABASE {}", quote_ident(&oldest)))?;
        self.attached.pop_front();
        debug!(schema = %oldest, "detached schema database");
        Ok(())
    }

    fn purge(&mut self, request: PurgeRequest) -> StorageResult<Value> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let plan = request.plan(Utc::now(), |n| nth_newest_id(&tx, n))?;
        let removed = match plan {
            Some(plan) => match plan.older_than {
                Some(cutoff) => tx.execute(
                    "DELETE FROM main.readings WHERE id <= ?1 AND user_ts < ?2",
                    params![sql_id(plan.max_id), format_timestamp(&cutoff)],
                )?,
                None => tx.execute(
                    "DELETE FROM main.readings WHERE id <= ?1",
                    params![sql_id(plan.max_id)],
                )?,
            },
            None => 0,
        };

        let remaining = reading_stats(&tx)?;
        let unsent_retained: i64 = tx.query_row(
            "SELECT COUNT(*) FROM main.readings WHERE id > ?1",
            params![sql_id(request.sent_id)],
            |row| row.get(0),
        )?;
        tx.commit()?;

        let result = PurgeResult {
            removed: removed as u64,
            unsent_retained: unsent_retained as u64,
            remaining,
            method: request.strategy.method(),
        };
        info!(
            method = result.method,
            removed = result.removed,
            remaining = remaining.count,
            sent_id = request.sent_id,
            "purged readings"
        );
        Ok(result.to_document())
    }
}

impl Connection for SqliteConnection {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn insert(&mut self, table: &TableName, payload: &Value) -> StorageResult<usize> {
        let request = InsertRequest::decode(payload)?;
        self.ensure_schema(&table.schema)?;

        let tx = self.conn.transaction()?;
        let mut count = 0;
        for (sql, params) in request.to_sql(&table.quoted()) {
            count += tx
                .execute(&sql, params_from_iter(params.iter()))
                .map_err(|e| table_error(e, table))?;
        }
        tx.commit()?;
        Ok(count)
    }

    fn update(&mut self, table: &TableName, payload: &Value) -> StorageResult<usize> {
        let request = UpdateRequest::decode(payload)?;
        self.ensure_schema(&table.schema)?;

        let tx = self.conn.transaction()?;
        let mut count = 0;
        for update in &request.updates {
            let (sql, params) = update.to_sql(&table.quoted());
            count += tx
                .execute(&sql, params_from_iter(params.iter()))
                .map_err(|e| table_error(e, table))?;
        }
        tx.commit()?;
        Ok(count)
    }

    fn delete_rows(&mut self, table: &TableName, condition: &Value) -> StorageResult<usize> {
        let request = DeleteRequest::decode(condition)?;
        self.ensure_schema(&table.schema)?;

        let (sql, params) = request.to_sql(&table.quoted());
        let tx = self.conn.transaction()?;
        let count = tx
            .execute(&sql, params_from_iter(params.iter()))
            .map_err(|e| table_error(e, table))?;
        tx.commit()?;
        Ok(count)
    }

    fn retrieve(&mut self, table: &TableName, query: &Value) -> StorageResult<Value> {
        let query = Query::decode(query)?;
        self.ensure_schema(&table.schema)?;

        let mut params = Vec::new();
        let sql = query.to_sql(&table.quoted(), &mut params);
        let rows = query_rows(&self.conn, &sql, &params).map_err(|e| table_error(e, table))?;
        Ok(result_set(rows))
    }

    fn append_readings(&mut self, batch: &Value) -> StorageResult<usize> {
        let readings = decode_reading_batch(batch)?;
        let ts = format_timestamp(&Utc::now());

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO main.readings (asset_code, reading, user_ts, ts) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for reading in &readings {
                stmt.execute(params![
                    reading.asset_code,
                    reading.reading.to_string(),
                    format_timestamp(&reading.user_ts),
                    ts
                ])?;
            }
        }
        tx.commit()?;

        debug!(count = readings.len(), "appended readings");
        Ok(readings.len())
    }

    fn fetch_readings(&mut self, from_id: u64, block_size: u32) -> StorageResult<Value> {
        let rows: Vec<ReadingRow> = self
            .conn
            .prepare_cached(
                "SELECT id, asset_code, reading, user_ts, ts FROM main.readings
                 WHERE id >= ?1 ORDER BY id LIMIT ?2",
            )?
            .query_map(params![sql_id(from_id), block_size], |row| {
                Ok(ReadingRow {
                    id: row.get(0)?,
                    asset_code: row.get(1)?,
                    reading: row.get(2)?,
                    user_ts: row.get(3)?,
                    ts: row.get(4)?,
                })
            })?
            .collect::<Result<_, _>>()?;

        let readings = rows
            .into_iter()
            .map(ReadingRow::into_reading)
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(encode_readings(&readings))
    }

    fn retrieve_readings(&mut self, query: &Value) -> StorageResult<Value> {
        let query = Query::decode(query)?;
        let mut params = Vec::new();
        let sql = query.to_sql("main.readings", &mut params);
        Ok(result_set(query_rows(&self.conn, &sql, &params)?))
    }

    fn purge_readings(
        &mut self,
        age_hours: u64,
        flags: PurgeFlags,
        sent_id: u64,
    ) -> StorageResult<Value> {
        self.purge(PurgeRequest::by_age(age_hours, flags, sent_id))
    }

    fn purge_readings_by_rows(
        &mut self,
        row_limit: u64,
        flags: PurgeFlags,
        sent_id: u64,
    ) -> StorageResult<Value> {
        self.purge(PurgeRequest::by_rows(row_limit, flags, sent_id))
    }

    fn create_table_snapshot(&mut self, table: &TableName, id: &str) -> StorageResult<()> {
        self.ensure_schema(&table.schema)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        snapshot::create(&tx, table, id)?;
        tx.commit()?;
        Ok(())
    }

    fn load_table_snapshot(&mut self, table: &TableName, id: &str) -> StorageResult<()> {
        self.ensure_schema(&table.schema)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        snapshot::load(&tx, table, id)?;
        tx.commit()?;
        Ok(())
    }

    fn delete_table_snapshot(&mut self, table: &TableName, id: &str) -> StorageResult<()> {
        self.ensure_schema(&table.schema)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        snapshot::delete(&tx, table, id)?;
        tx.commit()?;
        Ok(())
    }

    fn get_table_snapshots(&mut self, table: &TableName) -> StorageResult<Value> {
        let rows = snapshot::list(&self.conn, table)?
            .into_iter()
            .map(|info| {
                serde_json::json!({
                    "table": info.table,
                    "id": info.id,
                    "created": format_timestamp(&info.created),
                })
            })
            .collect();
        Ok(result_set(rows))
    }

    fn create_schema(&mut self, descriptor: &Value) -> StorageResult<usize> {
        let descriptor = SchemaDescriptor::decode(descriptor)?;
        self.ensure_schema(&descriptor.schema)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = descriptor.apply(&tx)?;
        tx.commit()?;
        Ok(changed)
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        debug!(attached = self.attached.len(), "closed sqlite session");
    }
}
