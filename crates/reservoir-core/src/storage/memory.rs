//! Embedded in-process reading buffer
//!
//! Every connection opened by a [`MemoryBackend`] shares one reading buffer
//! behind a mutex. Only the reading stream is supported; row-count purge,
//! generic tables, snapshots and schemas answer `NotSupported`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};

use crate::codec::{decode_reading_batch, encode_reading, encode_readings, result_set};
use crate::connection::{Backend, Capabilities, Connection};
use crate::models::Reading;
use crate::query::Query;
use crate::retention::{PurgeFlags, PurgeRequest, PurgeResult, ReadingStats};
use crate::storage::StorageResult;

#[derive(Debug, Default)]
struct ReadingBuffer {
    readings: BTreeMap<u64, Reading>,
    last_id: u64,
}

impl ReadingBuffer {
    fn stats(&self) -> ReadingStats {
        ReadingStats {
            count: self.readings.len() as u64,
            min_id: self.readings.keys().next().copied(),
            max_id: self.readings.keys().next_back().copied(),
        }
    }
}

/// Backend keeping readings in process memory
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    buffer: Arc<Mutex<ReadingBuffer>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            common_tables: false,
            readings: true,
            purge_by_rows: false,
            snapshots: false,
            schemas: false,
        }
    }

    fn connect(&self) -> StorageResult<Box<dyn Connection>> {
        debug!("opened memory session");
        Ok(Box::new(MemoryConnection {
            buffer: Arc::clone(&self.buffer),
        }))
    }
}

/// Session over the shared reading buffer
pub struct MemoryConnection {
    buffer: Arc<Mutex<ReadingBuffer>>,
}

impl Connection for MemoryConnection {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn append_readings(&mut self, batch: &Value) -> StorageResult<usize> {
        let readings = decode_reading_batch(batch)?;
        let ts = Utc::now();

        let mut buffer = self.buffer.lock();
        let count = readings.len();
        for reading in readings {
            buffer.last_id += 1;
            let id = buffer.last_id;
            buffer.readings.insert(id, reading.into_reading(id, ts));
        }
        Ok(count)
    }

    fn fetch_readings(&mut self, from_id: u64, block_size: u32) -> StorageResult<Value> {
        let buffer = self.buffer.lock();
        let block: Vec<Reading> = buffer
            .readings
            .range(from_id..)
            .take(block_size as usize)
            .map(|(_, reading)| reading.clone())
            .collect();
        Ok(encode_readings(&block))
    }

    fn retrieve_readings(&mut self, query: &Value) -> StorageResult<Value> {
        let query = Query::decode(query)?;
        let rows: Vec<Value> = {
            let buffer = self.buffer.lock();
            buffer.readings.values().map(encode_reading).collect()
        };
        Ok(result_set(query.apply(rows)))
    }

    fn purge_readings(
        &mut self,
        age_hours: u64,
        flags: PurgeFlags,
        sent_id: u64,
    ) -> StorageResult<Value> {
        let request = PurgeRequest::by_age(age_hours, flags, sent_id);
        let plan = request.plan(Utc::now(), |_| Ok(None))?;

        let mut buffer = self.buffer.lock();
        let before = buffer.readings.len();
        if let Some(plan) = plan {
            buffer.readings.retain(|&id, reading| {
                let expired = plan.older_than.map_or(true, |cutoff| reading.user_ts < cutoff);
                !(id <= plan.max_id && expired)
            });
        }
        let removed = (before - buffer.readings.len()) as u64;
        let unsent_retained = buffer.readings.range(sent_id.saturating_add(1)..).count() as u64;
        let result = PurgeResult {
            removed,
            unsent_retained,
            remaining: buffer.stats(),
            method: request.strategy.method(),
        };
        drop(buffer);

        info!(removed, sent_id, remaining = result.remaining.count, "purged memory readings");
        Ok(result.to_document())
    }
}
