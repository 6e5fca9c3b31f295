//! SQLite schema for the main database
//!
//! The main database holds the reading stream and the engine's own catalogs.
//! Generic tables live in per-schema databases attached by each connection.

use rusqlite::{Connection, Result};

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- Reading stream; AUTOINCREMENT keeps ids from ever being reused
        CREATE TABLE IF NOT EXISTS readings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            asset_code TEXT NOT NULL,
            reading TEXT NOT NULL DEFAULT '{}',
            user_ts TEXT NOT NULL,
            ts TEXT NOT NULL
        );

        -- Age-based purge scans by user_ts
        CREATE INDEX IF NOT EXISTS idx_readings_user_ts ON readings(user_ts);
        CREATE INDEX IF NOT EXISTS idx_readings_asset_code ON readings(asset_code, user_ts);

        -- Snapshot catalog: one row per (table, snapshot id)
        CREATE TABLE IF NOT EXISTS table_snapshots (
            table_name TEXT NOT NULL,
            snapshot_id TEXT NOT NULL,
            storage TEXT NOT NULL UNIQUE,
            table_sql TEXT NOT NULL,
            index_sql TEXT NOT NULL DEFAULT '[]',
            with_rowid INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            PRIMARY KEY (table_name, snapshot_id)
        );

        -- Last applied descriptor per table schema
        CREATE TABLE IF NOT EXISTS schema_registry (
            schema_name TEXT PRIMARY KEY,
            service TEXT,
            version INTEGER NOT NULL,
            definition TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )?;

    // Set schema version
    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_info WHERE key = 'version'")?;
    let result: Result<String> = stmt.query_row([], |row| row.get(0));

    match result {
        Ok(version_str) => Ok(version_str.parse().ok()),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check if schema needs initialization or migration
pub fn needs_init(conn: &Connection) -> bool {
    let table_exists: bool = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_info'")
        .and_then(|mut stmt| stmt.exists([]))
        .unwrap_or(false);

    if !table_exists {
        return true;
    }

    match get_schema_version(conn) {
        Ok(Some(v)) => v < SCHEMA_VERSION,
        _ => true,
    }
}
