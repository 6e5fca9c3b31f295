//! Reading command handlers

use anyhow::{Context, Result};
use serde_json::Value;

use reservoir_core::{PurgeFlags, Store};

use super::{describe, read_input};
use crate::output::Output;

/// Append a batch of readings from a file or stdin
pub fn append(store: &Store, source: &str, output: &Output) -> Result<()> {
    let batch = read_input(source)?;
    let count = store.reading_append(&batch).map_err(describe)?;
    output.print_count("Appended", count);
    Ok(())
}

/// Fetch a block of readings starting at an id
pub fn fetch(store: &Store, from_id: u64, count: u32, output: &Output) -> Result<()> {
    let block = store.reading_fetch(from_id, count).map_err(describe)?;
    output.print_result_set(&parse(&block)?);
    Ok(())
}

/// Query readings with a JSON query document
pub fn query(store: &Store, query: &str, output: &Output) -> Result<()> {
    let result = store.reading_retrieve(query).map_err(describe)?;
    output.print_result_set(&parse(&result)?);
    Ok(())
}

/// How a purge selects readings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeBy {
    Age(u64),
    Rows(u64),
}

/// Purge readings already forwarded up to `sent_id`
pub fn purge(store: &Store, by: PurgeBy, sent_id: u64, output: &Output) -> Result<()> {
    let (param, flags) = purge_args(by);
    let result = store
        .reading_purge(param, flags.bits(), sent_id)
        .map_err(describe)?;
    output.print_purge(&parse(&result)?);
    Ok(())
}

fn purge_args(by: PurgeBy) -> (u64, PurgeFlags) {
    match by {
        PurgeBy::Age(hours) => (hours, PurgeFlags::RETAIN_UNSENT),
        PurgeBy::Rows(limit) => (limit, PurgeFlags::RETAIN_UNSENT | PurgeFlags::SIZE),
    }
}

fn parse(text: &str) -> Result<Value> {
    serde_json::from_str(text).context("Store returned malformed JSON")
}
