//! Data models for Reservoir
//!
//! Defines the core data structures: readings, table names and snapshot
//! catalog entries.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::{StorageError, StorageResult};

/// A stored reading
///
/// `id` is assigned by the store on append and never changes afterwards,
/// and neither does `user_ts`.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Store-assigned, strictly increasing identifier
    pub id: u64,
    /// Asset the reading belongs to
    pub asset_code: String,
    /// Structured reading payload (always a JSON object)
    pub reading: Value,
    /// Instant the reading was taken
    pub user_ts: DateTime<Utc>,
    /// Instant the reading was stored
    pub ts: DateTime<Utc>,
}

/// A reading decoded from an append batch, not yet stored
#[derive(Debug, Clone, PartialEq)]
pub struct NewReading {
    pub asset_code: String,
    pub reading: Value,
    pub user_ts: DateTime<Utc>,
}

impl NewReading {
    pub fn new(asset_code: impl Into<String>, reading: Value) -> Self {
        Self {
            asset_code: asset_code.into(),
            reading,
            user_ts: Utc::now(),
        }
    }

    /// Set the instant the reading was taken
    pub fn at(mut self, user_ts: DateTime<Utc>) -> Self {
        self.user_ts = user_ts;
        self
    }

    /// Assign a store id, producing the stored form
    pub fn into_reading(self, id: u64, ts: DateTime<Utc>) -> Reading {
        Reading {
            id,
            asset_code: self.asset_code,
            reading: self.reading,
            user_ts: self.user_ts,
            ts,
        }
    }
}

/// Schema-qualified table name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    pub schema: String,
    pub table: String,
}

impl TableName {
    /// Parse `schema.table` or `table`, filling in `default_schema`
    pub fn parse(name: &str, default_schema: &str) -> StorageResult<Self> {
        let (schema, table) = match name.split_once('.') {
            Some((schema, table)) => (schema, table),
            None => (default_schema, name),
        };
        Self::new(schema, table)
    }

    pub fn new(schema: &str, table: &str) -> StorageResult<Self> {
        validate_identifier(schema)?;
        validate_identifier(table)?;
        Ok(Self {
            schema: schema.to_string(),
            table: table.to_string(),
        })
    }

    /// Quoted `"schema"."table"` form for SQL text
    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Check that a schema, table or column name is a plain identifier
pub fn validate_identifier(name: &str) -> StorageResult<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(StorageError::invalid(format!("invalid identifier '{}'", name)))
    }
}

/// Double-quote an identifier that already passed `validate_identifier`
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name)
}

/// One entry of a table's snapshot catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub table: String,
    pub id: String,
    pub created: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_table_name_default_schema() {
        let name = TableName::parse("assets", "reservoir").unwrap();
        assert_eq!(name.schema, "reservoir");
        assert_eq!(name.table, "assets");
        assert_eq!(name.to_string(), "reservoir.assets");
        assert_eq!(name.quoted(), "\"reservoir\".\"assets\"");
    }

    #[test]
    fn test_table_name_explicit_schema() {
        let name = TableName::parse("audit.log", "reservoir").unwrap();
        assert_eq!(name.schema, "audit");
        assert_eq!(name.table, "log");
    }

    #[test]
    fn test_table_name_rejects_injection() {
        assert!(TableName::parse("assets; DROP TABLE x", "reservoir").is_err());
        assert!(TableName::parse("a.b.c", "reservoir").is_err());
        assert!(TableName::parse("", "reservoir").is_err());
        assert!(TableName::parse("9lives", "reservoir").is_err());
    }

    #[test]
    fn test_new_reading_into_reading() {
        let ts = Utc::now();
        let reading = NewReading::new("pump1", json!({"rpm": 1200})).into_reading(7, ts);
        assert_eq!(reading.id, 7);
        assert_eq!(reading.asset_code, "pump1");
        assert_eq!(reading.ts, ts);
    }
}
