//! Record codec
//!
//! Translates between the JSON documents exchanged with callers and the
//! native forms used by the backing stores: reading batches, result sets,
//! timestamps and individual column values.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Value as SqlValue;
use serde_json::{json, Map, Value};

use crate::models::{NewReading, Reading};
use crate::storage::{StorageError, StorageResult};

/// Rendering used for every stored timestamp; sorts lexicographically
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Parse caller supplied text into a document
///
/// Empty (or all whitespace) text decodes to an empty object.
pub fn parse_document(text: &str) -> StorageResult<Value> {
    if text.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    Ok(serde_json::from_str(text)?)
}

/// Render a result document for the caller
pub fn render_document(doc: &Value) -> String {
    doc.to_string()
}

/// Parse a timestamp in RFC 3339 or `YYYY-MM-DD HH:MM:SS[.ffffff][±HH:MM]`
pub fn parse_timestamp(text: &str) -> StorageResult<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%#z"] {
        if let Ok(ts) = DateTime::parse_from_str(text, format) {
            return Ok(ts.with_timezone(&Utc));
        }
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| StorageError::invalid(format!("invalid timestamp '{}'", text)))
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Decode an append payload: `{"readings": [{asset_code, user_ts, reading}]}`
///
/// The whole batch is validated before anything is returned, so a bad
/// element anywhere rejects the batch.
pub fn decode_reading_batch(doc: &Value) -> StorageResult<Vec<NewReading>> {
    let items = doc
        .get("readings")
        .and_then(Value::as_array)
        .ok_or_else(|| StorageError::invalid("payload must contain a 'readings' array"))?;

    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            decode_reading(item)
                .map_err(|e| StorageError::invalid(format!("reading {}: {}", index, e)))
        })
        .collect()
}

fn decode_reading(item: &Value) -> StorageResult<NewReading> {
    let asset_code = item
        .get("asset_code")
        .and_then(Value::as_str)
        .filter(|code| !code.is_empty())
        .ok_or_else(|| StorageError::invalid("missing 'asset_code'"))?;

    let reading = match item.get("reading") {
        Some(value @ Value::Object(_)) => value.clone(),
        Some(_) => return Err(StorageError::invalid("'reading' must be an object")),
        None => return Err(StorageError::invalid("missing 'reading'")),
    };

    let mut new = NewReading::new(asset_code, reading);
    match item.get("user_ts") {
        Some(Value::String(text)) => new = new.at(parse_timestamp(text)?),
        Some(Value::Null) | None => {}
        Some(_) => return Err(StorageError::invalid("'user_ts' must be a string")),
    }
    Ok(new)
}

/// Encode one stored reading as a result row
pub fn encode_reading(reading: &Reading) -> Value {
    json!({
        "id": reading.id,
        "asset_code": reading.asset_code,
        "reading": reading.reading,
        "user_ts": format_timestamp(&reading.user_ts),
        "ts": format_timestamp(&reading.ts),
    })
}

/// Wrap rows in the `{"count", "rows"}` result document
pub fn result_set(rows: Vec<Value>) -> Value {
    json!({ "count": rows.len(), "rows": rows })
}

pub fn encode_readings(readings: &[Reading]) -> Value {
    result_set(readings.iter().map(encode_reading).collect())
}

/// Convert a document value to a column value
pub fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

/// Convert a column value back to a document value
///
/// Text holding a JSON object or array is decoded; blobs become base64.
pub fn from_sql_value(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::from(i),
        SqlValue::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        SqlValue::Text(text) => {
            let trimmed = text.trim_start();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                if let Ok(doc) = serde_json::from_str::<Value>(&text) {
                    return doc;
                }
            }
            Value::String(text)
        }
        SqlValue::Blob(bytes) => Value::String(BASE64.encode(bytes)),
    }
}
