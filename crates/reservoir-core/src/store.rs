//! Unified storage interface
//!
//! The `Store` is the handle the surrounding service holds: it owns one
//! connection pool over one backing store and exposes every operation as a
//! single call that borrows a session, performs the operation and hands the
//! session back.
//!
//! ## Usage
//!
//! ```ignore
//! let store = Store::open(&Config::load()?)?;
//!
//! store.reading_append(r#"{"readings": [...]}"#)?;
//! let block = store.reading_fetch(1, 100)?;
//!
//! // On failure the error is returned and also kept as the last error
//! if store.reading_purge(24, 0x1, 500).is_err() {
//!     eprintln!("{:?}", store.last_error());
//! }
//! ```
//!
//! Documents go in and come out as JSON text. Returned strings belong to
//! the caller.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::codec::{parse_document, render_document};
use crate::config::{BackendKind, Config};
use crate::connection::{Backend, Capabilities, Connection};
use crate::models::{validate_identifier, TableName};
use crate::pool::{ConnectionPool, PoolConfig, PoolStats};
use crate::retention::{PurgeRequest, PurgeStrategy};
use crate::storage::{ErrorRecord, MemoryBackend, SqliteBackend, StorageError, StorageResult};

/// Summary reported by `Store::info`
#[derive(Debug, Clone, Serialize)]
pub struct StoreInfo {
    pub backend: &'static str,
    pub default_schema: String,
    pub capabilities: Capabilities,
    pub pool: PoolStats,
}

/// Pooled storage engine handle
pub struct Store {
    pool: ConnectionPool,
    default_schema: String,
}

impl Store {
    /// Open the configured backend and pre-grow the pool
    pub fn open(config: &Config) -> StorageResult<Self> {
        let backend: Arc<dyn Backend> = match config.backend {
            BackendKind::Sqlite => Arc::new(SqliteBackend::open(config)?),
            BackendKind::Memory => Arc::new(MemoryBackend::new()),
        };
        Self::with_backend(backend, config.pool_config(), &config.default_schema)
    }

    /// Build a store over an explicit backend
    pub fn with_backend(
        backend: Arc<dyn Backend>,
        pool_config: PoolConfig,
        default_schema: &str,
    ) -> StorageResult<Self> {
        validate_identifier(default_schema)?;
        let pool = ConnectionPool::new(backend, pool_config)?;
        Ok(Self {
            pool,
            default_schema: default_schema.to_string(),
        })
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn default_schema(&self) -> &str {
        &self.default_schema
    }

    pub fn capabilities(&self) -> Capabilities {
        self.pool.capabilities()
    }

    /// Most recent failure of any operation on this store
    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.pool.last_error()
    }

    pub fn info(&self) -> StoreInfo {
        StoreInfo {
            backend: self.pool.backend_name(),
            default_schema: self.default_schema.clone(),
            capabilities: self.capabilities(),
            pool: self.pool.stats(),
        }
    }

    /// Close the pool; later calls fail with `PoolClosed`
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    // ==================== Generic tables ====================

    /// Insert rows, returning how many were inserted
    pub fn common_insert(
        &self,
        schema: Option<&str>,
        table: &str,
        payload: &str,
    ) -> StorageResult<usize> {
        self.run("common_insert", || {
            let table = self.table_name(schema, table)?;
            let doc = parse_document(payload)?;
            self.require(self.capabilities().supports_common_tables(), "common_insert")?;
            self.with_connection(|conn| conn.insert(&table, &doc))
        })
    }

    /// Run a query, returning `{"count", "rows"}`
    pub fn common_retrieve(
        &self,
        schema: Option<&str>,
        table: &str,
        query: &str,
    ) -> StorageResult<String> {
        self.run("common_retrieve", || {
            let table = self.table_name(schema, table)?;
            let doc = parse_document(query)?;
            self.require(self.capabilities().supports_common_tables(), "common_retrieve")?;
            self.with_connection(|conn| conn.retrieve(&table, &doc))
                .map(|result| render_document(&result))
        })
    }

    pub fn common_update(
        &self,
        schema: Option<&str>,
        table: &str,
        payload: &str,
    ) -> StorageResult<usize> {
        self.run("common_update", || {
            let table = self.table_name(schema, table)?;
            let doc = parse_document(payload)?;
            self.require(self.capabilities().supports_common_tables(), "common_update")?;
            self.with_connection(|conn| conn.update(&table, &doc))
        })
    }

    /// Delete matching rows; empty `condition` deletes every row
    pub fn common_delete(
        &self,
        schema: Option<&str>,
        table: &str,
        condition: &str,
    ) -> StorageResult<usize> {
        self.run("common_delete", || {
            let table = self.table_name(schema, table)?;
            let doc = parse_document(condition)?;
            self.require(self.capabilities().supports_common_tables(), "common_delete")?;
            self.with_connection(|conn| conn.delete_rows(&table, &doc))
        })
    }

    // ==================== Readings ====================

    pub fn reading_append(&self, batch: &str) -> StorageResult<usize> {
        self.run("reading_append", || {
            let doc = parse_document(batch)?;
            self.require(self.capabilities().supports_readings(), "reading_append")?;
            self.with_connection(|conn| conn.append_readings(&doc))
        })
    }

    /// Up to `count` readings with `id >= from_id`
    pub fn reading_fetch(&self, from_id: u64, count: u32) -> StorageResult<String> {
        self.run("reading_fetch", || {
            self.require(self.capabilities().supports_readings(), "reading_fetch")?;
            self.with_connection(|conn| conn.fetch_readings(from_id, count))
                .map(|result| render_document(&result))
        })
    }

    pub fn reading_retrieve(&self, query: &str) -> StorageResult<String> {
        self.run("reading_retrieve", || {
            let doc = parse_document(query)?;
            self.require(self.capabilities().supports_readings(), "reading_retrieve")?;
            self.with_connection(|conn| conn.retrieve_readings(&doc))
                .map(|result| render_document(&result))
        })
    }

    /// Purge readings: `param` is a row limit when `flags` has the size bit,
    /// an age in hours otherwise
    pub fn reading_purge(&self, param: u64, flags: u32, sent_id: u64) -> StorageResult<String> {
        self.run("reading_purge", || {
            let request = PurgeRequest::from_flags(param, flags, sent_id);
            let result: Value = match request.strategy {
                PurgeStrategy::Rows { limit } => {
                    self.require(
                        self.capabilities().supports_purge_by_rows(),
                        "purge_readings_by_rows",
                    )?;
                    self.with_connection(|conn| {
                        conn.purge_readings_by_rows(limit, request.flags, request.sent_id)
                    })?
                }
                PurgeStrategy::Age { hours } => {
                    self.require(self.capabilities().supports_readings(), "purge_readings")?;
                    self.with_connection(|conn| {
                        conn.purge_readings(hours, request.flags, request.sent_id)
                    })?
                }
            };
            Ok(render_document(&result))
        })
    }

    // ==================== Snapshots ====================

    pub fn create_table_snapshot(&self, table: &str, id: &str) -> StorageResult<()> {
        self.run("create_table_snapshot", || {
            let table = self.table_name(None, table)?;
            self.require(self.capabilities().supports_snapshots(), "create_table_snapshot")?;
            self.with_connection(|conn| conn.create_table_snapshot(&table, id))
        })
    }

    pub fn load_table_snapshot(&self, table: &str, id: &str) -> StorageResult<()> {
        self.run("load_table_snapshot", || {
            let table = self.table_name(None, table)?;
            self.require(self.capabilities().supports_snapshots(), "load_table_snapshot")?;
            self.with_connection(|conn| conn.load_table_snapshot(&table, id))
        })
    }

    pub fn delete_table_snapshot(&self, table: &str, id: &str) -> StorageResult<()> {
        self.run("delete_table_snapshot", || {
            let table = self.table_name(None, table)?;
            self.require(self.capabilities().supports_snapshots(), "delete_table_snapshot")?;
            self.with_connection(|conn| conn.delete_table_snapshot(&table, id))
        })
    }

    pub fn get_table_snapshots(&self, table: &str) -> StorageResult<String> {
        self.run("get_table_snapshots", || {
            let table = self.table_name(None, table)?;
            self.require(self.capabilities().supports_snapshots(), "get_table_snapshots")?;
            self.with_connection(|conn| conn.get_table_snapshots(&table))
                .map(|result| render_document(&result))
        })
    }

    // ==================== Schemas ====================

    /// Apply a schema descriptor, returning the number of tables changed
    pub fn create_schema(&self, descriptor: &str) -> StorageResult<usize> {
        self.run("create_schema", || {
            let doc = parse_document(descriptor)?;
            self.require(self.capabilities().supports_schemas(), "create_schema")?;
            self.with_connection(|conn| conn.create_schema(&doc))
        })
    }

    /// Apply a descriptor for the named schema
    pub fn schema_update(&self, schema: &str, descriptor: &str) -> StorageResult<usize> {
        self.run("schema_update", || {
            let mut doc = parse_document(descriptor)?;
            let obj = doc
                .as_object_mut()
                .ok_or_else(|| StorageError::invalid("schema descriptor must be an object"))?;
            match obj.get("schema").and_then(Value::as_str) {
                Some(named) if named != schema => {
                    return Err(StorageError::invalid(format!(
                        "descriptor is for schema '{}', not '{}'",
                        named, schema
                    )))
                }
                Some(_) => {}
                None => {
                    obj.insert("schema".to_string(), Value::String(schema.to_string()));
                }
            }
            self.require(self.capabilities().supports_schemas(), "schema_update")?;
            self.with_connection(|conn| conn.create_schema(&doc))
        })
    }

    // ==================== Helpers ====================

    /// Run one operation, keeping its failure as the last error
    fn run<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce() -> StorageResult<T>,
    ) -> StorageResult<T> {
        let result = f();
        match &result {
            Ok(_) => debug!(operation, "operation complete"),
            Err(err) => self.pool.record_error(operation, err),
        }
        result
    }

    /// Borrow one session for the duration of `f`
    fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut dyn Connection) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut conn = self.pool.allocate()?;
        f(&mut *conn)
    }

    fn require(&self, supported: bool, operation: &'static str) -> StorageResult<()> {
        if supported {
            Ok(())
        } else {
            Err(StorageError::NotSupported {
                operation,
                backend: self.pool.backend_name(),
            })
        }
    }

    fn table_name(&self, schema: Option<&str>, table: &str) -> StorageResult<TableName> {
        match schema {
            Some(schema) => TableName::new(schema, table),
            None => TableName::parse(table, &self.default_schema),
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if !self.pool.is_closed() {
            self.pool.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ErrorCode;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_config(temp_dir: &TempDir) -> Config {
        Config {
            data_dir: temp_dir.path().to_path_buf(),
            pool_size: 2,
            ..Config::default()
        }
    }

    fn parse(text: &str) -> Value {
        serde_json::from_str(text).unwrap()
    }

    const ASSETS: &str = r#"{
        "schema": "reservoir",
        "version": 1,
        "tables": [{
            "name": "assets",
            "columns": [
                {"column": "id", "type": "integer", "key": true},
                {"column": "name", "type": "text"}
            ]
        }]
    }"#;

    #[test]
    fn test_open_pre_grows_pool() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open(&test_config(&temp_dir)).unwrap();

        let info = store.info();
        assert_eq!(info.backend, "sqlite");
        assert_eq!(info.pool.total, 2);
        assert_eq!(info.pool.idle, 2);
        assert!(temp_dir.path().join("readings.db").exists());
    }

    #[test]
    fn test_common_operations_with_default_schema() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open(&test_config(&temp_dir)).unwrap();
        assert_eq!(store.create_schema(ASSETS).unwrap(), 1);

        store
            .common_insert(None, "assets", r#"{"id": 1, "name": "pump"}"#)
            .unwrap();
        store
            .common_insert(Some("reservoir"), "assets", r#"{"id": 2, "name": "fan"}"#)
            .unwrap();
        let updated = store
            .common_update(
                None,
                "reservoir.assets",
                r#"{"values": {"name": "valve"}, "where": {"column": "id", "condition": "=", "value": 2}}"#,
            )
            .unwrap();
        assert_eq!(updated, 1);

        let doc = parse(&store.common_retrieve(None, "assets", "").unwrap());
        assert_eq!(doc["count"], 2);
        assert_eq!(doc["rows"][1]["name"], "valve");

        assert_eq!(store.common_delete(None, "assets", "").unwrap(), 2);
        assert!(store.last_error().is_none());
    }

    #[test]
    fn test_failure_sets_last_error() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open(&test_config(&temp_dir)).unwrap();

        let err = store.reading_append("{not json").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPayload);

        let record = store.last_error().unwrap();
        assert_eq!(record.operation, "reading_append");
        assert_eq!(record.code, ErrorCode::InvalidPayload);
        assert!(!record.retryable);

        // Last write wins
        store.common_retrieve(None, "ghost", "{}").unwrap_err();
        assert_eq!(store.last_error().unwrap().code, ErrorCode::NotFound);
    }

    #[test]
    fn test_reading_round_trip_and_purge() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open(&test_config(&temp_dir)).unwrap();

        let batch = json!({"readings": (0..150)
            .map(|i| json!({"asset_code": "pump", "user_ts": "2024-01-01 00:00:00", "reading": {"i": i}}))
            .collect::<Vec<_>>()});
        assert_eq!(store.reading_append(&batch.to_string()).unwrap(), 150);

        let block = parse(&store.reading_fetch(149, 10).unwrap());
        assert_eq!(block["count"], 2);

        let result = parse(&store.reading_purge(100, 0x0002 | 0x0001, 500).unwrap());
        assert_eq!(result["removed"], 50);
        assert_eq!(result["readings"], 100);

        let query = r#"{"where": {"column": "id", "condition": "<", "value": 60}}"#;
        assert_eq!(parse(&store.reading_retrieve(query).unwrap())["count"], 9);
    }

    #[test]
    fn test_purge_with_huge_age_removes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open(&test_config(&temp_dir)).unwrap();
        store
            .reading_append(r#"{"readings": [{"asset_code": "a", "reading": {}}]}"#)
            .unwrap();

        let result = parse(&store.reading_purge(10_000_000_000, 0x0001, 5).unwrap());
        assert_eq!(result["removed"], 0);
        assert_eq!(result["readings"], 1);
    }

    #[test]
    fn test_memory_backend_reports_missing_capability() {
        let store = Store::with_backend(
            Arc::new(MemoryBackend::new()),
            PoolConfig {
                initial_size: 1,
                ..PoolConfig::default()
            },
            "reservoir",
        )
        .unwrap();

        assert!(!store.capabilities().supports_purge_by_rows());
        store
            .reading_append(r#"{"readings": [{"asset_code": "a", "reading": {}}]}"#)
            .unwrap();

        let err = store.reading_purge(100, 0x0002, 500).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotSupported);
        assert_eq!(store.last_error().unwrap().operation, "reading_purge");

        // Age purge still works and nothing was silently removed by the size call
        let result = parse(&store.reading_purge(1, 0, 500).unwrap());
        assert_eq!(result["readings"], 1);

        assert_eq!(
            store.common_insert(None, "t", r#"{"a": 1}"#).unwrap_err().code(),
            ErrorCode::NotSupported
        );
    }

    #[test]
    fn test_snapshots_through_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open(&test_config(&temp_dir)).unwrap();
        store.create_schema(ASSETS).unwrap();
        store
            .common_insert(None, "assets", r#"{"id": 1, "name": "pump"}"#)
            .unwrap();
        let before = store.common_retrieve(None, "assets", "{}").unwrap();

        store.create_table_snapshot("assets", "v1").unwrap();
        store.common_delete(None, "assets", "{}").unwrap();
        store.load_table_snapshot("assets", "v1").unwrap();
        assert_eq!(store.common_retrieve(None, "assets", "{}").unwrap(), before);

        let err = store.create_table_snapshot("assets", "v1").unwrap_err();
        assert_eq!(err.code(), ErrorCode::DuplicateSnapshot);

        let list = parse(&store.get_table_snapshots("assets").unwrap());
        assert_eq!(list["count"], 1);

        store.delete_table_snapshot("assets", "v1").unwrap();
        let err = store.load_table_snapshot("assets", "v1").unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_reapply_after_snapshot_load_migrates_live_table() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open(&test_config(&temp_dir)).unwrap();
        let v1 = r#"{"schema": "reservoir", "version": 1, "tables": [
            {"name": "t", "columns": [{"column": "a", "type": "integer"}]}]}"#;
        let v2 = r#"{"schema": "reservoir", "version": 2, "tables": [
            {"name": "t", "columns": [{"column": "a", "type": "integer"},
                                      {"column": "b", "type": "text"}]}]}"#;

        assert_eq!(store.create_schema(v1).unwrap(), 1);
        store.create_table_snapshot("t", "v1").unwrap();
        assert_eq!(store.create_schema(v2).unwrap(), 1);
        store.load_table_snapshot("t", "v1").unwrap();

        // The registry still holds v2, but the live table is back on v1
        assert_eq!(store.create_schema(v2).unwrap(), 1);
        store
            .common_insert(None, "t", r#"{"a": 1, "b": "x"}"#)
            .unwrap();
        assert_eq!(store.create_schema(v2).unwrap(), 0);
    }

    #[test]
    fn test_schema_update_checks_schema_name() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open(&test_config(&temp_dir)).unwrap();

        let err = store.schema_update("plant", ASSETS).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPayload);

        assert_eq!(store.schema_update("reservoir", ASSETS).unwrap(), 1);
        assert_eq!(store.schema_update("reservoir", ASSETS).unwrap(), 0);

        let unnamed = r#"{"tables": [{"name": "log", "columns": [{"column": "msg", "type": "text"}]}]}"#;
        assert_eq!(store.schema_update("plant", unnamed).unwrap(), 1);
        store.common_insert(Some("plant"), "log", r#"{"msg": "hi"}"#).unwrap();
    }

    #[test]
    fn test_concurrent_appends_get_unique_ids() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open(&test_config(&temp_dir)).unwrap();
        let batch = json!({"readings": (0..5)
            .map(|i| json!({"asset_code": "pump", "reading": {"i": i}}))
            .collect::<Vec<_>>()})
        .to_string();

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..10 {
                        store.reading_append(&batch).unwrap();
                    }
                });
            }
        });

        let doc = parse(&store.reading_fetch(1, 1000).unwrap());
        let ids: Vec<u64> = doc["rows"]
            .as_array()
            .unwrap()
            .iter()
            .map(|row| row["id"].as_u64().unwrap())
            .collect();
        assert_eq!(ids, (1..=200).collect::<Vec<u64>>());
        assert_eq!(store.info().pool.in_use, 0);
    }

    #[test]
    fn test_shutdown_rejects_calls() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open(&test_config(&temp_dir)).unwrap();
        store.shutdown();

        let err = store.reading_fetch(1, 10).unwrap_err();
        assert_eq!(err.code(), ErrorCode::PoolClosed);
        assert!(store.info().pool.closed);
    }

    #[test]
    fn test_invalid_table_name() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open(&test_config(&temp_dir)).unwrap();
        let err = store
            .common_insert(None, "assets; DROP TABLE x", r#"{"a": 1}"#)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPayload);
    }
}
