//! Storage layer
//!
//! Backing stores behind the [`crate::connection::Backend`] seam.
//!
//! ## Backends
//!
//! - **SQLite**: file-backed, supports every operation. Readings and the
//!   engine catalogs live in the main database; each table schema lives in
//!   its own attached database.
//! - **Memory**: in-process reading buffer shared by all sessions; readings
//!   only, no row-count purge.

pub mod descriptor;
pub mod error;
pub mod memory;
pub mod schema;
pub mod snapshot;
pub mod sqlite;

pub use descriptor::SchemaDescriptor;
pub use error::{ErrorCode, ErrorRecord, StorageError, StorageResult};
pub use memory::MemoryBackend;
pub use schema::{init_schema, needs_init, SCHEMA_VERSION};
pub use sqlite::SqliteBackend;
