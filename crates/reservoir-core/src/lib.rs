//! Reservoir Core Library
//!
//! This crate provides the core of Reservoir, a pooled storage engine that
//! turns a backing store into a uniform service for generic table CRUD, an
//! append/fetch/purge path for time-ordered readings, and table snapshots.
//!
//! # Architecture
//!
//! - **Pool**: owns backing-store sessions and lends them one at a time
//! - **Connection**: one session; every operation is atomic
//! - **Retention**: age and row-count purge bounded by the sent watermark
//! - **Snapshots**: named copies of a table's schema and rows
//!
//! # Quick Start
//!
//! ```text
//! let store = Store::open(&Config::load()?)?;
//!
//! store.reading_append(r#"{"readings": [{"asset_code": "pump1", "reading": {"rpm": 1200}}]}"#)?;
//! let block = store.reading_fetch(1, 100)?;
//! let purged = store.reading_purge(24, 0x0001, last_sent_id)?;
//! ```
//!
//! # Modules
//!
//! - `store`: Unified storage interface (main entry point)
//! - `pool`: Connection pool
//! - `connection`: Backend and session traits, capability set
//! - `storage`: SQLite and in-memory backends, snapshots, schema descriptors
//! - `retention`: Purge policy
//! - `codec`: JSON document translation
//! - `query`: Conditions, queries and mutations
//! - `models`: Readings, table names, snapshot entries
//! - `config`: Application configuration

pub mod codec;
pub mod config;
pub mod connection;
pub mod models;
pub mod pool;
pub mod query;
pub mod retention;
pub mod storage;
pub mod store;

pub use config::{BackendKind, Config};
pub use connection::{Backend, Capabilities, Connection};
pub use models::{Reading, SnapshotInfo, TableName};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use retention::{PurgeFlags, PurgeRequest, PurgeResult, PurgeStrategy};
pub use storage::{
    ErrorCode, ErrorRecord, MemoryBackend, SchemaDescriptor, SqliteBackend, StorageError,
    StorageResult,
};
pub use store::{Store, StoreInfo};
