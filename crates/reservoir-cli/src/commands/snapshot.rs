//! Snapshot command handlers

use anyhow::{Context, Result};
use serde_json::Value;

use reservoir_core::Store;

use super::describe;
use crate::output::Output;

pub fn create(store: &Store, table: &str, id: &str, output: &Output) -> Result<()> {
    store.create_table_snapshot(table, id).map_err(describe)?;
    output.success(&format!("Created snapshot '{}' of {}", id, table));
    Ok(())
}

/// Replace a table's schema and rows with a snapshot
pub fn load(store: &Store, table: &str, id: &str, output: &Output) -> Result<()> {
    store.load_table_snapshot(table, id).map_err(describe)?;
    output.success(&format!("Restored {} from snapshot '{}'", table, id));
    Ok(())
}

pub fn delete(store: &Store, table: &str, id: &str, output: &Output) -> Result<()> {
    store.delete_table_snapshot(table, id).map_err(describe)?;
    output.success(&format!("Deleted snapshot '{}' of {}", id, table));
    Ok(())
}

pub fn list(store: &Store, table: &str, output: &Output) -> Result<()> {
    let result = store.get_table_snapshots(table).map_err(describe)?;
    let doc: Value = serde_json::from_str(&result).context("Store returned malformed JSON")?;
    output.print_snapshots(&doc);
    Ok(())
}
