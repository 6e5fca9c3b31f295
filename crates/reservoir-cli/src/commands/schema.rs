//! Schema command handlers

use anyhow::Result;

use reservoir_core::Store;

use super::{describe, read_input};
use crate::output::Output;

/// Apply a schema descriptor from a file or stdin
///
/// With `schema` set the descriptor must name that schema (or none).
pub fn apply(store: &Store, source: &str, schema: Option<&str>, output: &Output) -> Result<()> {
    let descriptor = read_input(source)?;
    let changed = match schema {
        Some(schema) => store.schema_update(schema, &descriptor),
        None => store.create_schema(&descriptor),
    }
    .map_err(describe)?;

    if changed == 0 {
        output.message("Schema is up to date");
    } else {
        output.success(&format!("Applied schema ({} table(s) changed)", changed));
    }
    Ok(())
}
