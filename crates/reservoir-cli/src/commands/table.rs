//! Generic table command handlers
//!
//! Table names may be qualified (`schema.table`); `--schema` applies to
//! unqualified names and falls back to the configured default schema.

use anyhow::{Context, Result};
use serde_json::Value;

use reservoir_core::Store;

use super::describe;
use crate::output::Output;

/// Insert one row or an `{"inserts": [...]}` batch
pub fn insert(
    store: &Store,
    schema: Option<&str>,
    table: &str,
    payload: &str,
    output: &Output,
) -> Result<()> {
    let count = store
        .common_insert(schema, table, payload)
        .map_err(describe)?;
    output.print_count("Inserted", count);
    Ok(())
}

/// Apply an update document
pub fn update(
    store: &Store,
    schema: Option<&str>,
    table: &str,
    payload: &str,
    output: &Output,
) -> Result<()> {
    let count = store
        .common_update(schema, table, payload)
        .map_err(describe)?;
    output.print_count("Updated", count);
    Ok(())
}

/// Delete rows matching a condition; no condition deletes every row
pub fn delete(
    store: &Store,
    schema: Option<&str>,
    table: &str,
    condition: &str,
    output: &Output,
) -> Result<()> {
    let count = store
        .common_delete(schema, table, condition)
        .map_err(describe)?;
    output.print_count("Deleted", count);
    Ok(())
}

/// Run a query document against a table
pub fn query(
    store: &Store,
    schema: Option<&str>,
    table: &str,
    query: &str,
    output: &Output,
) -> Result<()> {
    let result = store
        .common_retrieve(schema, table, query)
        .map_err(describe)?;
    let doc: Value = serde_json::from_str(&result).context("Store returned malformed JSON")?;
    output.print_result_set(&doc);
    Ok(())
}
