//! Schema descriptors
//!
//! A descriptor declares the tables and indexes of one table schema. Applying
//! it brings the attached schema database in line with the declaration:
//!
//! - unchanged descriptor (same canonical form as the registry): no-op
//! - missing tables are created
//! - purely additive column changes use `ALTER TABLE ... ADD COLUMN`
//! - any other column change rebuilds the table, keeping shared columns
//!
//! Tables dropped from a descriptor are left in place.

use std::collections::HashSet;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::codec::format_timestamp;
use crate::models::{quote_ident, validate_identifier};
use crate::storage::{StorageError, StorageResult};

/// Declaration of one table schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub schema: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub tables: Vec<TableDef>,
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub column: String,
    #[serde(rename = "type")]
    pub column_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    /// Part of the primary key
    #[serde(default)]
    pub key: bool,
    /// Nullable
    #[serde(default = "nullable_by_default")]
    pub null: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

fn nullable_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDef {
    pub table: String,
    pub index: Vec<String>,
}

/// Storage class for a declared column type
pub fn sql_type(declared: &str) -> StorageResult<&'static str> {
    let sql = match declared.trim().to_ascii_lowercase().as_str() {
        "integer" | "int" | "bigint" | "smallint" | "serial" | "boolean" | "bool" => "INTEGER",
        "varchar" | "character varying" | "char" | "character" | "text" | "timestamp" => "TEXT",
        "real" | "double" | "double precision" | "float" | "numeric" => "REAL",
        "json" | "jsonb" => "JSON",
        "bytea" | "blob" => "BLOB",
        other => {
            return Err(StorageError::invalid(format!(
                "unsupported column type '{}'",
                other
            )))
        }
    };
    Ok(sql)
}

impl ColumnDef {
    /// SQL expression for the column default, if any
    fn default_sql(&self) -> Option<String> {
        let value = self.default.as_ref()?;
        let sql = match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => i64::from(*b).to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) if s.eq_ignore_ascii_case("now()") => {
                "(strftime('%Y-%m-%d %H:%M:%f', 'now'))".to_string()
            }
            Value::String(s) => quote_literal(s),
            other => quote_literal(&other.to_string()),
        };
        Some(sql)
    }

    fn has_constant_default(&self) -> bool {
        self.default_sql().map_or(false, |sql| !sql.starts_with('('))
    }

    fn definition(&self) -> StorageResult<String> {
        let mut sql = format!("{} {}", quote_ident(&self.column), sql_type(&self.column_type)?);
        if !self.null {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = self.default_sql() {
            sql.push_str(" DEFAULT ");
            sql.push_str(&default);
        }
        Ok(sql)
    }

    /// Whether `ALTER TABLE ADD COLUMN` can add this column
    fn addable(&self) -> bool {
        let default_ok = self.default.is_none() || self.has_constant_default();
        let null_ok = self.null || self.default.as_ref().map_or(false, |v| !v.is_null());
        !self.key && default_ok && null_ok
    }
}

fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

impl TableDef {
    fn create_sql(&self, schema: &str, name: &str) -> StorageResult<String> {
        let mut parts = self
            .columns
            .iter()
            .map(ColumnDef::definition)
            .collect::<StorageResult<Vec<_>>>()?;
        let keys: Vec<String> = self
            .columns
            .iter()
            .filter(|c| c.key)
            .map(|c| quote_ident(&c.column))
            .collect();
        if !keys.is_empty() {
            parts.push(format!("PRIMARY KEY ({})", keys.join(", ")));
        }
        Ok(format!(
            "CREATE TABLE {}.{} ({})",
            quote_ident(schema),
            quote_ident(name),
            parts.join(", ")
        ))
    }

    fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.column == name)
    }
}

/// Column as the database currently has it
struct LiveColumn {
    name: String,
    declared: String,
    not_null: bool,
    key: bool,
    default: Option<String>,
}

fn live_columns(conn: &Connection, schema: &str, table: &str) -> StorageResult<Vec<LiveColumn>> {
    let columns = conn
        .prepare(
            "SELECT name, type, \"notnull\", pk, dflt_value FROM pragma_table_info(?1, ?2) ORDER BY cid",
        )?
        .query_map(params![table, schema], |row| {
            Ok(LiveColumn {
                name: row.get(0)?,
                declared: row.get(1)?,
                not_null: row.get(2)?,
                key: row.get::<_, i64>(3)? > 0,
                default: row.get(4)?,
            })
        })?
        .collect::<Result<_, _>>()?;
    Ok(columns)
}

/// Compare a live `dflt_value` with a declared default expression
///
/// SQLite may report a parenthesised expression with or without its
/// parentheses, and `DEFAULT NULL` is the same as no default.
fn same_default(live: Option<&str>, declared: Option<String>) -> bool {
    fn normalize(sql: Option<&str>) -> Option<&str> {
        let sql = sql?.trim();
        let sql = sql
            .strip_prefix('(')
            .and_then(|inner| inner.strip_suffix(')'))
            .map_or(sql, str::trim);
        (!sql.eq_ignore_ascii_case("NULL")).then_some(sql)
    }
    normalize(live) == normalize(declared.as_deref())
}

/// How a declared table differs from the live one
#[derive(Debug, PartialEq, Eq)]
enum TableChange {
    Unchanged,
    Missing,
    AddColumns(Vec<usize>),
    Rebuild,
}

impl SchemaDescriptor {
    pub fn decode(doc: &Value) -> StorageResult<Self> {
        let descriptor: SchemaDescriptor = serde_json::from_value(doc.clone())?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    fn validate(&self) -> StorageResult<()> {
        validate_identifier(&self.schema)?;
        if matches!(self.schema.to_ascii_lowercase().as_str(), "main" | "temp") {
            return Err(StorageError::invalid(format!(
                "schema name '{}' is reserved",
                self.schema
            )));
        }

        let mut tables = HashSet::new();
        for table in &self.tables {
            validate_identifier(&table.name)?;
            if table.name.starts_with("_snap_") || table.name.starts_with("_rebuild_") {
                return Err(StorageError::invalid(format!(
                    "table name '{}' is reserved",
                    table.name
                )));
            }
            if !tables.insert(table.name.as_str()) {
                return Err(StorageError::invalid(format!("table '{}' declared twice", table.name)));
            }
            if table.columns.is_empty() {
                return Err(StorageError::invalid(format!("table '{}' has no columns", table.name)));
            }
            let mut columns = HashSet::new();
            for column in &table.columns {
                validate_identifier(&column.column)?;
                sql_type(&column.column_type)?;
                if !columns.insert(column.column.as_str()) {
                    return Err(StorageError::invalid(format!(
                        "column '{}.{}' declared twice",
                        table.name, column.column
                    )));
                }
            }
        }

        for index in &self.indexes {
            let table = self
                .tables
                .iter()
                .find(|t| t.name == index.table)
                .ok_or_else(|| {
                    StorageError::invalid(format!("index on undeclared table '{}'", index.table))
                })?;
            if index.index.is_empty() {
                return Err(StorageError::invalid(format!("empty index on '{}'", index.table)));
            }
            for column in &index.index {
                if table.column(column).is_none() {
                    return Err(StorageError::invalid(format!(
                        "index on unknown column '{}.{}'",
                        index.table, column
                    )));
                }
            }
        }
        Ok(())
    }

    /// Canonical text stored in the registry
    pub fn canonical(&self) -> StorageResult<String> {
        serde_json::to_string(self).map_err(StorageError::from)
    }

    /// Bring the attached schema database in line with this descriptor
    ///
    /// Every table is compared with its live definition, so tables replaced
    /// behind the registry's back (e.g. by a snapshot load) are still
    /// migrated. Must run inside a transaction. Returns the number of
    /// tables created or altered.
    pub fn apply(&self, conn: &Connection) -> StorageResult<usize> {
        let canonical = self.canonical()?;
        let registered: Option<String> = conn
            .query_row(
                "SELECT definition FROM main.schema_registry WHERE schema_name = ?1",
                params![self.schema],
                |row| row.get(0),
            )
            .optional()?;

        let mut changed = 0;
        for table in &self.tables {
            let change = self.table_change(conn, table)?;
            debug!(schema = %self.schema, table = %table.name, ?change, "applying table");
            match change {
                TableChange::Unchanged => continue,
                TableChange::Missing => {
                    conn.execute_batch(&table.create_sql(&self.schema, &table.name)?)?;
                }
                TableChange::AddColumns(added) => {
                    for i in added {
                        conn.execute_batch(&format!(
                            "ALTER TABLE {}.{} ADD COLUMN {}",
                            quote_ident(&self.schema),
                            quote_ident(&table.name),
                            table.columns[i].definition()?
                        ))?;
                    }
                }
                TableChange::Rebuild => self.rebuild(conn, table)?,
            }
            changed += 1;
        }

        // Indexes are cheap to rebuild and may also have been replaced
        self.replace_indexes(conn)?;

        if changed == 0 && registered.as_deref() == Some(canonical.as_str()) {
            debug!(schema = %self.schema, "schema descriptor unchanged");
            return Ok(0);
        }

        conn.execute(
            "INSERT INTO main.schema_registry (schema_name, service, version, definition, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(schema_name) DO UPDATE SET
                service = excluded.service,
                version = excluded.version,
                definition = excluded.definition,
                updated_at = excluded.updated_at",
            params![
                self.schema,
                self.service,
                self.version,
                canonical,
                format_timestamp(&Utc::now())
            ],
        )?;

        info!(schema = %self.schema, version = self.version, changed, "applied schema descriptor");
        Ok(changed)
    }

    fn table_change(&self, conn: &Connection, table: &TableDef) -> StorageResult<TableChange> {
        let live = live_columns(conn, &self.schema, &table.name)?;
        if live.is_empty() {
            return Ok(TableChange::Missing);
        }

        for column in &live {
            let declared = match table.column(&column.name) {
                Some(declared) => declared,
                None => return Ok(TableChange::Rebuild),
            };
            let same_shape = column.declared.eq_ignore_ascii_case(sql_type(&declared.column_type)?)
                && column.not_null == !declared.null
                && column.key == declared.key;
            let same_default = same_default(column.default.as_deref(), declared.default_sql());
            if !same_shape || !same_default {
                return Ok(TableChange::Rebuild);
            }
        }

        let added: Vec<usize> = table
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| !live.iter().any(|l| l.name == c.column))
            .map(|(i, _)| i)
            .collect();
        if added.is_empty() {
            Ok(TableChange::Unchanged)
        } else if added.iter().all(|&i| table.columns[i].addable()) {
            Ok(TableChange::AddColumns(added))
        } else {
            Ok(TableChange::Rebuild)
        }
    }

    /// Recreate `table` with its new definition, keeping shared columns
    fn rebuild(&self, conn: &Connection, table: &TableDef) -> StorageResult<()> {
        let live = live_columns(conn, &self.schema, &table.name)?;
        let shared: Vec<String> = table
            .columns
            .iter()
            .filter(|c| live.iter().any(|l| l.name == c.column))
            .map(|c| quote_ident(&c.column))
            .collect();

        let schema = quote_ident(&self.schema);
        let scratch = format!("_rebuild_{}", table.name);
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {}.{}", schema, quote_ident(&scratch)))?;
        conn.execute_batch(&table.create_sql(&self.schema, &scratch)?)?;
        if !shared.is_empty() {
            let columns = shared.join(", ");
            conn.execute_batch(&format!(
                "INSERT INTO {schema}.{scratch} ({columns}) SELECT {columns} FROM {schema}.{table}",
                schema = schema,
                scratch = quote_ident(&scratch),
                columns = columns,
                table = quote_ident(&table.name),
            ))?;
        }
        conn.execute_batch(&format!(
            "DROP TABLE {}.{}; ALTER TABLE {}.{} RENAME TO {}",
            schema,
            quote_ident(&table.name),
            schema,
            quote_ident(&scratch),
            quote_ident(&table.name)
        ))?;
        Ok(())
    }

    /// Drop and recreate the descriptor-managed indexes (`<table>_ix<n>`)
    fn replace_indexes(&self, conn: &Connection) -> StorageResult<()> {
        let schema = quote_ident(&self.schema);
        for table in &self.tables {
            let existing: Vec<String> = conn
                .prepare(&format!(
                    "SELECT name FROM {}.sqlite_master WHERE type = 'index' AND tbl_name = ?1 AND name GLOB ?2",
                    schema
                ))?
                .query_map(params![table.name, format!("{}_ix[0-9]*", table.name)], |row| {
                    row.get(0)
                })?
                .collect::<Result<_, _>>()?;
            for name in existing {
                conn.execute_batch(&format!("DROP INDEX {}.{}", schema, quote_ident(&name)))?;
            }

            for (n, index) in self.indexes.iter().filter(|i| i.table == table.name).enumerate() {
                let columns: Vec<String> = index.index.iter().map(|c| quote_ident(c)).collect();
                conn.execute_batch(&format!(
                    "CREATE INDEX {}.{} ON {} ({})",
                    schema,
                    quote_ident(&format!("{}_ix{}", table.name, n)),
                    quote_ident(&table.name),
                    columns.join(", ")
                ))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::init_schema;
    use serde_json::json;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn.execute_batch(r#"ATTACH DATABASE ':memory:' AS "plant";"#).unwrap();
        conn
    }

    fn descriptor() -> Value {
        json!({
            "schema": "plant",
            "service": "pumps",
            "version": 1,
            "tables": [{
                "name": "assets",
                "columns": [
                    {"column": "id", "type": "integer", "key": true},
                    {"column": "name", "type": "varchar", "size": 80, "null": false},
                    {"column": "rating", "type": "double precision", "default": 1.0}
                ]
            }],
            "indexes": [{"table": "assets", "index": ["name"]}]
        })
    }

    fn columns(conn: &Connection) -> Vec<(String, String)> {
        conn.prepare("SELECT name, type FROM pragma_table_info('assets', 'plant') ORDER BY cid")
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn test_sql_type_mapping() {
        assert_eq!(sql_type("varchar").unwrap(), "TEXT");
        assert_eq!(sql_type("Double Precision").unwrap(), "REAL");
        assert_eq!(sql_type("jsonb").unwrap(), "JSON");
        assert_eq!(sql_type("boolean").unwrap(), "INTEGER");
        assert!(sql_type("geometry").is_err());
    }

    #[test]
    fn test_decode_rejects_bad_descriptors() {
        let mut doc = descriptor();
        doc["tables"][0]["columns"][1]["type"] = json!("geometry");
        assert!(SchemaDescriptor::decode(&doc).is_err());

        let mut doc = descriptor();
        doc["indexes"][0]["index"] = json!(["missing"]);
        assert!(SchemaDescriptor::decode(&doc).is_err());

        let mut doc = descriptor();
        doc["schema"] = json!("main");
        assert!(SchemaDescriptor::decode(&doc).is_err());

        assert!(SchemaDescriptor::decode(&json!({"tables": []})).is_err());
    }

    #[test]
    fn test_apply_creates_then_is_idempotent() {
        let conn = setup();
        let desc = SchemaDescriptor::decode(&descriptor()).unwrap();

        assert_eq!(desc.apply(&conn).unwrap(), 1);
        assert_eq!(columns(&conn).len(), 3);
        assert_eq!(desc.apply(&conn).unwrap(), 0);

        let index: Option<String> = conn
            .query_row(
                "SELECT name FROM \"plant\".sqlite_master WHERE type = 'index' AND name = 'assets_ix0'",
                [],
                |row| row.get(0),
            )
            .optional()
            .unwrap();
        assert!(index.is_some());
    }

    #[test]
    fn test_same_default_normalizes_sql() {
        assert!(same_default(None, None));
        assert!(same_default(Some("NULL"), None));
        assert!(same_default(Some("'north'"), Some("'north'".to_string())));
        assert!(same_default(
            Some("strftime('%Y-%m-%d %H:%M:%f', 'now')"),
            Some("(strftime('%Y-%m-%d %H:%M:%f', 'now'))".to_string())
        ));
        assert!(!same_default(Some("1.0"), Some("2.0".to_string())));
        assert!(!same_default(None, Some("'x'".to_string())));
    }

    #[test]
    fn test_apply_follows_live_table_not_registry() {
        let conn = setup();
        let desc = SchemaDescriptor::decode(&descriptor()).unwrap();
        desc.apply(&conn).unwrap();

        // Replace the live table behind the registry's back
        conn.execute_batch(
            r#"DROP TABLE "plant"."assets";
               CREATE TABLE "plant"."assets" (id INTEGER, PRIMARY KEY (id));"#,
        )
        .unwrap();
        assert_eq!(desc.apply(&conn).unwrap(), 1);
        assert_eq!(columns(&conn).len(), 3);
        assert_eq!(desc.apply(&conn).unwrap(), 0);
    }

    #[test]
    fn test_apply_rebuilds_on_default_change() {
        let conn = setup();
        SchemaDescriptor::decode(&descriptor()).unwrap().apply(&conn).unwrap();

        let mut doc = descriptor();
        doc["tables"][0]["columns"][2]["default"] = json!(2.5);
        assert_eq!(SchemaDescriptor::decode(&doc).unwrap().apply(&conn).unwrap(), 1);

        let default: String = conn
            .query_row(
                "SELECT dflt_value FROM pragma_table_info('assets', 'plant') WHERE name = 'rating'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(default, "2.5");
    }

    #[test]
    fn test_apply_adds_column_in_place() {
        let conn = setup();
        SchemaDescriptor::decode(&descriptor()).unwrap().apply(&conn).unwrap();
        conn.execute_batch(r#"INSERT INTO "plant"."assets" (id, name) VALUES (1, 'pump')"#)
            .unwrap();

        let mut doc = descriptor();
        doc["version"] = json!(2);
        doc["tables"][0]["columns"]
            .as_array_mut()
            .unwrap()
            .push(json!({"column": "site", "type": "text", "default": "north"}));
        assert_eq!(SchemaDescriptor::decode(&doc).unwrap().apply(&conn).unwrap(), 1);

        let site: String = conn
            .query_row(r#"SELECT site FROM "plant"."assets" WHERE id = 1"#, [], |row| row.get(0))
            .unwrap();
        assert_eq!(site, "north");
    }

    #[test]
    fn test_apply_rebuilds_on_type_change() {
        let conn = setup();
        SchemaDescriptor::decode(&descriptor()).unwrap().apply(&conn).unwrap();
        conn.execute_batch(r#"INSERT INTO "plant"."assets" (id, name, rating) VALUES (1, 'pump', 4.5)"#)
            .unwrap();

        let mut doc = descriptor();
        doc["tables"][0]["columns"] = json!([
            {"column": "id", "type": "integer", "key": true},
            {"column": "name", "type": "text", "null": false},
            {"column": "rating", "type": "varchar"}
        ]);
        assert_eq!(SchemaDescriptor::decode(&doc).unwrap().apply(&conn).unwrap(), 1);

        assert_eq!(
            columns(&conn),
            vec![
                ("id".to_string(), "INTEGER".to_string()),
                ("name".to_string(), "TEXT".to_string()),
                ("rating".to_string(), "TEXT".to_string()),
            ]
        );
        let name: String = conn
            .query_row(r#"SELECT name FROM "plant"."assets" WHERE id = 1"#, [], |row| row.get(0))
            .unwrap();
        assert_eq!(name, "pump");
    }

    #[test]
    fn test_apply_rebuild_drops_removed_column() {
        let conn = setup();
        SchemaDescriptor::decode(&descriptor()).unwrap().apply(&conn).unwrap();

        let mut doc = descriptor();
        doc["tables"][0]["columns"].as_array_mut().unwrap().pop();
        assert_eq!(SchemaDescriptor::decode(&doc).unwrap().apply(&conn).unwrap(), 1);
        assert_eq!(columns(&conn).len(), 2);
    }
}
