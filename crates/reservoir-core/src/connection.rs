//! Backing store seam
//!
//! A [`Backend`] opens sessions ([`Connection`]s) against one backing store.
//! Every connection offers the same operations; stores that lack a
//! capability keep the default method body, which answers `NotSupported`,
//! and advertise the gap through [`Capabilities`] so callers can ask first.

use serde::Serialize;
use serde_json::Value;

use crate::models::TableName;
use crate::retention::PurgeFlags;
use crate::storage::{StorageError, StorageResult};

/// Features a backing store implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// Generic table CRUD
    pub common_tables: bool,
    /// Reading append/fetch/retrieve and age-based purge
    pub readings: bool,
    /// Row-count-based purge
    pub purge_by_rows: bool,
    /// Table snapshots
    pub snapshots: bool,
    /// Schema descriptors (`create_schema`)
    pub schemas: bool,
}

impl Capabilities {
    pub fn all() -> Self {
        Self {
            common_tables: true,
            readings: true,
            purge_by_rows: true,
            snapshots: true,
            schemas: true,
        }
    }

    pub fn supports_readings(&self) -> bool {
        self.readings
    }

    pub fn supports_purge_by_rows(&self) -> bool {
        self.purge_by_rows
    }

    pub fn supports_common_tables(&self) -> bool {
        self.common_tables
    }

    pub fn supports_snapshots(&self) -> bool {
        self.snapshots
    }

    pub fn supports_schemas(&self) -> bool {
        self.schemas
    }
}

/// Factory for sessions against one backing store
pub trait Backend: Send + Sync {
    /// Short engine name used in messages (e.g. `sqlite`)
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Open a new session
    fn connect(&self) -> StorageResult<Box<dyn Connection>>;
}

/// One live session against a backing store
///
/// A connection is used by one caller at a time; each method is one
/// operation and either applies fully or not at all.
pub trait Connection: Send {
    /// Engine name, matching [`Backend::name`]
    fn backend_name(&self) -> &'static str;

    // ==================== Generic tables ====================

    /// Insert one row (`{column: value}`) or several (`{"inserts": [...]}`)
    fn insert(&mut self, table: &TableName, payload: &Value) -> StorageResult<usize> {
        let _ = (table, payload);
        Err(self.unsupported("insert"))
    }

    /// Apply `{"values", "expressions", "where"}` or `{"updates": [...]}`
    fn update(&mut self, table: &TableName, payload: &Value) -> StorageResult<usize> {
        let _ = (table, payload);
        Err(self.unsupported("update"))
    }

    /// Delete rows matching `{"where"}`; no condition deletes every row
    fn delete_rows(&mut self, table: &TableName, condition: &Value) -> StorageResult<usize> {
        let _ = (table, condition);
        Err(self.unsupported("delete"))
    }

    /// Run a query, returning `{"count", "rows"}`
    fn retrieve(&mut self, table: &TableName, query: &Value) -> StorageResult<Value> {
        let _ = (table, query);
        Err(self.unsupported("retrieve"))
    }

    // ==================== Readings ====================

    /// Append a batch atomically, returning how many readings were stored
    fn append_readings(&mut self, batch: &Value) -> StorageResult<usize> {
        let _ = batch;
        Err(self.unsupported("append_readings"))
    }

    /// Up to `block_size` readings with `id >= from_id`, ascending by id
    fn fetch_readings(&mut self, from_id: u64, block_size: u32) -> StorageResult<Value> {
        let _ = (from_id, block_size);
        Err(self.unsupported("fetch_readings"))
    }

    /// Readings matching an arbitrary query
    fn retrieve_readings(&mut self, query: &Value) -> StorageResult<Value> {
        let _ = query;
        Err(self.unsupported("retrieve_readings"))
    }

    /// Remove readings older than `age_hours` with `id <= sent_id`
    fn purge_readings(
        &mut self,
        age_hours: u64,
        flags: PurgeFlags,
        sent_id: u64,
    ) -> StorageResult<Value> {
        let _ = (age_hours, flags, sent_id);
        Err(self.unsupported("purge_readings"))
    }

    /// Keep at most `row_limit` newest readings, removing only `id <= sent_id`
    fn purge_readings_by_rows(
        &mut self,
        row_limit: u64,
        flags: PurgeFlags,
        sent_id: u64,
    ) -> StorageResult<Value> {
        let _ = (row_limit, flags, sent_id);
        Err(self.unsupported("purge_readings_by_rows"))
    }

    // ==================== Snapshots and schemas ====================

    fn create_table_snapshot(&mut self, table: &TableName, id: &str) -> StorageResult<()> {
        let _ = (table, id);
        Err(self.unsupported("create_table_snapshot"))
    }

    fn load_table_snapshot(&mut self, table: &TableName, id: &str) -> StorageResult<()> {
        let _ = (table, id);
        Err(self.unsupported("load_table_snapshot"))
    }

    fn delete_table_snapshot(&mut self, table: &TableName, id: &str) -> StorageResult<()> {
        let _ = (table, id);
        Err(self.unsupported("delete_table_snapshot"))
    }

    /// `{"count", "rows": [{"table", "id", "created"}]}`, oldest first
    fn get_table_snapshots(&mut self, table: &TableName) -> StorageResult<Value> {
        let _ = table;
        Err(self.unsupported("get_table_snapshots"))
    }

    /// Apply a schema descriptor, returning the number of tables changed
    fn create_schema(&mut self, descriptor: &Value) -> StorageResult<usize> {
        let _ = descriptor;
        Err(self.unsupported("create_schema"))
    }

    fn unsupported(&self, operation: &'static str) -> StorageError {
        StorageError::NotSupported {
            operation,
            backend: self.backend_name(),
        }
    }
}
