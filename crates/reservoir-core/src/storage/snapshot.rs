//! Table snapshots for the SQLite backend
//!
//! A snapshot copies a live table's rows (rowids included) into a
//! store-named table `_snap_<uuid>` in the same schema database, and records
//! the table and index DDL in `main.table_snapshots`. Loading drops the live
//! table, replays the captured DDL and copies the rows back.
//!
//! Every function expects to run inside a transaction owned by the caller
//! and the table's schema database to be attached under its schema name.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;
use uuid::Uuid;

use crate::codec::{format_timestamp, parse_timestamp};
use crate::models::{quote_ident, SnapshotInfo, TableName};
use crate::storage::{StorageError, StorageResult};

/// Longest accepted snapshot id
pub const MAX_SNAPSHOT_ID_LEN: usize = 64;

/// Column carrying the source rowid inside a snapshot table
const ROWID_COLUMN: &str = "__snap_rowid";

/// Check a caller supplied snapshot id
pub fn validate_snapshot_id(id: &str) -> StorageResult<()> {
    if id.is_empty() {
        return Err(StorageError::invalid("snapshot id must not be empty"));
    }
    if id.chars().count() > MAX_SNAPSHOT_ID_LEN {
        return Err(StorageError::invalid(format!(
            "snapshot id longer than {} characters",
            MAX_SNAPSHOT_ID_LEN
        )));
    }
    if id.chars().any(char::is_control) {
        return Err(StorageError::invalid("snapshot id contains control characters"));
    }
    Ok(())
}

struct CatalogEntry {
    storage: String,
    table_sql: String,
    index_sql: Vec<(String, String)>,
    with_rowid: bool,
}

fn catalog_entry(
    conn: &Connection,
    table: &TableName,
    id: &str,
) -> StorageResult<Option<CatalogEntry>> {
    let row = conn
        .query_row(
            "SELECT storage, table_sql, index_sql, with_rowid FROM main.table_snapshots
             WHERE table_name = ?1 AND snapshot_id = ?2",
            params![table.to_string(), id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                ))
            },
        )
        .optional()?;

    match row {
        Some((storage, table_sql, index_sql, with_rowid)) => Ok(Some(CatalogEntry {
            storage,
            table_sql,
            index_sql: serde_json::from_str(&index_sql).map_err(|e| StorageError::Backend {
                message: format!("corrupt snapshot catalog entry: {}", e),
                retryable: false,
            })?,
            with_rowid,
        })),
        None => Ok(None),
    }
}

/// Capture `table` under `id`
pub fn create(conn: &Connection, table: &TableName, id: &str) -> StorageResult<()> {
    validate_snapshot_id(id)?;

    if catalog_entry(conn, table, id)?.is_some() {
        return Err(StorageError::DuplicateSnapshot {
            table: table.to_string(),
            id: id.to_string(),
        });
    }

    let schema = quote_ident(&table.schema);
    let table_sql: String = conn
        .query_row(
            &format!(
                "SELECT sql FROM {}.sqlite_master WHERE type = 'table' AND name = ?1",
                schema
            ),
            params![table.table],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| StorageError::NotFound {
            what: format!("table {}", table),
        })?;

    let index_sql: Vec<(String, String)> = conn
        .prepare(&format!(
            "SELECT name, sql FROM {}.sqlite_master
             WHERE type = 'index' AND tbl_name = ?1 AND sql IS NOT NULL",
            schema
        ))?
        .query_map(params![table.table], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<_, _>>()?;

    let with_rowid = !table_sql.to_ascii_uppercase().contains("WITHOUT ROWID");
    let storage = format!("_snap_{}", Uuid::new_v4().simple());
    let copy = if with_rowid {
        format!(
            "CREATE TABLE {}.{} AS SELECT rowid AS {}, * FROM {}",
            schema,
            quote_ident(&storage),
            ROWID_COLUMN,
            table.quoted()
        )
    } else {
        format!(
            "CREATE TABLE {}.{} AS SELECT * FROM {}",
            schema,
            quote_ident(&storage),
            table.quoted()
        )
    };
    conn.execute_batch(&copy)?;

    let index_json = serde_json::to_string(&index_sql).map_err(|e| StorageError::Backend {
        message: e.to_string(),
        retryable: false,
    })?;
    conn.execute(
        "INSERT INTO main.table_snapshots
         (table_name, snapshot_id, storage, table_sql, index_sql, with_rowid, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            table.to_string(),
            id,
            storage,
            table_sql,
            index_json,
            with_rowid,
            format_timestamp(&Utc::now())
        ],
    )?;

    info!(table = %table, snapshot = id, "created table snapshot");
    Ok(())
}

/// Replace the live table with the snapshot `id`
pub fn load(conn: &Connection, table: &TableName, id: &str) -> StorageResult<()> {
    validate_snapshot_id(id)?;
    let entry = catalog_entry(conn, table, id)?.ok_or_else(|| StorageError::SnapshotNotFound {
        table: table.to_string(),
        id: id.to_string(),
    })?;

    let schema = quote_ident(&table.schema);
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", table.quoted()))?;
    conn.execute_batch(&qualify_table_sql(&entry.table_sql, table)?)?;
    for (name, sql) in &entry.index_sql {
        conn.execute_batch(&qualify_index_sql(sql, &table.schema, name)?)?;
    }

    let columns: Vec<String> = conn
        .prepare("SELECT name FROM pragma_table_info(?1, ?2) ORDER BY cid")?
        .query_map(params![table.table, table.schema], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    let mut targets: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let mut sources = targets.clone();
    if entry.with_rowid && !has_rowid_alias(conn, table)? {
        targets.insert(0, "rowid".to_string());
        sources.insert(0, ROWID_COLUMN.to_string());
    }

    let order = if entry.with_rowid {
        format!(" ORDER BY {}", ROWID_COLUMN)
    } else {
        String::new()
    };
    conn.execute_batch(&format!(
        "INSERT INTO {} ({}) SELECT {} FROM {}.{}{}",
        table.quoted(),
        targets.join(", "),
        sources.join(", "),
        schema,
        quote_ident(&entry.storage),
        order
    ))
    .map_err(|e| {
        if e.to_string().contains("no such table") {
            StorageError::NotFound {
                what: format!("snapshot data for {} '{}'", table, id),
            }
        } else {
            e.into()
        }
    })?;

    info!(table = %table, snapshot = id, "loaded table snapshot");
    Ok(())
}

/// Remove the snapshot `id`; the live table is untouched
pub fn delete(conn: &Connection, table: &TableName, id: &str) -> StorageResult<()> {
    validate_snapshot_id(id)?;
    let entry = catalog_entry(conn, table, id)?.ok_or_else(|| StorageError::SnapshotNotFound {
        table: table.to_string(),
        id: id.to_string(),
    })?;

    conn.execute_batch(&format!(
        "DROP TABLE IF EXISTS {}.{}",
        quote_ident(&table.schema),
        quote_ident(&entry.storage)
    ))?;
    conn.execute(
        "DELETE FROM main.table_snapshots WHERE table_name = ?1 AND snapshot_id = ?2",
        params![table.to_string(), id],
    )?;

    info!(table = %table, snapshot = id, "deleted table snapshot");
    Ok(())
}

/// Snapshots of `table`, oldest first
pub fn list(conn: &Connection, table: &TableName) -> StorageResult<Vec<SnapshotInfo>> {
    let rows: Vec<(String, String)> = conn
        .prepare(
            "SELECT snapshot_id, created_at FROM main.table_snapshots
             WHERE table_name = ?1 ORDER BY created_at, rowid",
        )?
        .query_map(params![table.to_string()], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<_, _>>()?;

    rows.into_iter()
        .map(|(id, created)| {
            Ok(SnapshotInfo {
                table: table.to_string(),
                id,
                created: parse_timestamp(&created)?,
            })
        })
        .collect()
}

/// True when the table declares an `INTEGER PRIMARY KEY` rowid alias
fn has_rowid_alias(conn: &Connection, table: &TableName) -> StorageResult<bool> {
    let keys: Vec<String> = conn
        .prepare("SELECT type FROM pragma_table_info(?1, ?2) WHERE pk > 0")?
        .query_map(params![table.table, table.schema], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    Ok(keys.len() == 1 && keys[0].eq_ignore_ascii_case("INTEGER"))
}

/// Point captured `CREATE TABLE` text at the schema-qualified table
fn qualify_table_sql(sql: &str, table: &TableName) -> StorageResult<String> {
    let body = sql
        .find('(')
        .map(|at| &sql[at..])
        .ok_or_else(|| StorageError::Backend {
            message: format!("unexpected table definition for {}", table),
            retryable: false,
        })?;
    Ok(format!("CREATE TABLE {} {}", table.quoted(), body))
}

/// Point captured `CREATE INDEX` text at the schema database
fn qualify_index_sql(sql: &str, schema: &str, name: &str) -> StorageResult<String> {
    let upper = sql.to_ascii_uppercase();
    let on = upper.find(" ON ").ok_or_else(|| StorageError::Backend {
        message: format!("unexpected index definition for {}", name),
        retryable: false,
    })?;
    let unique = if upper.starts_with("CREATE UNIQUE") {
        "UNIQUE "
    } else {
        ""
    };
    Ok(format!(
        "CREATE {}INDEX {}.{}{}",
        unique,
        quote_ident(schema),
        quote_ident(name),
        &sql[on..]
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::init_schema;
    use crate::storage::ErrorCode;

    fn setup() -> (Connection, TableName) {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn.execute_batch(
            r#"
            ATTACH DATABASE ':memory:' AS "plant";
            CREATE TABLE "plant"."assets" (name TEXT NOT NULL, rating REAL);
            CREATE UNIQUE INDEX "plant"."assets_ix0" ON "assets" (name);
            INSERT INTO "plant"."assets" (name, rating) VALUES ('pump', 1.5), ('fan', 2.5);
            "#,
        )
        .unwrap();
        (conn, TableName::new("plant", "assets").unwrap())
    }

    fn rows(conn: &Connection) -> Vec<(i64, String, f64)> {
        conn.prepare(r#"SELECT rowid, name, rating FROM "plant"."assets" ORDER BY rowid"#)
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn test_validate_snapshot_id() {
        assert!(validate_snapshot_id("v1").is_ok());
        assert!(validate_snapshot_id("").is_err());
        assert!(validate_snapshot_id("bad\nid").is_err());
        assert!(validate_snapshot_id(&"x".repeat(65)).is_err());
        assert!(validate_snapshot_id(&"x".repeat(64)).is_ok());
    }

    #[test]
    fn test_round_trip_restores_rows_and_rowids() {
        let (conn, table) = setup();
        let before = rows(&conn);

        create(&conn, &table, "v1").unwrap();
        conn.execute_batch(
            r#"
            DELETE FROM "plant"."assets" WHERE name = 'pump';
            INSERT INTO "plant"."assets" (name, rating) VALUES ('valve', 9.0);
            "#,
        )
        .unwrap();
        assert_ne!(rows(&conn), before);

        load(&conn, &table, "v1").unwrap();
        assert_eq!(rows(&conn), before);

        // The unique index came back with the table
        let err = conn
            .execute(r#"INSERT INTO "plant"."assets" (name) VALUES ('fan')"#, [])
            .unwrap_err();
        assert!(err.to_string().contains("UNIQUE"));
    }

    #[test]
    fn test_duplicate_snapshot_keeps_first() {
        let (conn, table) = setup();
        create(&conn, &table, "v1").unwrap();
        conn.execute_batch(r#"DELETE FROM "plant"."assets""#).unwrap();

        let err = create(&conn, &table, "v1").unwrap_err();
        assert_eq!(err.code(), ErrorCode::DuplicateSnapshot);

        load(&conn, &table, "v1").unwrap();
        assert_eq!(rows(&conn).len(), 2);
    }

    #[test]
    fn test_list_and_delete() {
        let (conn, table) = setup();
        assert!(list(&conn, &table).unwrap().is_empty());

        create(&conn, &table, "v1").unwrap();
        create(&conn, &table, "v2").unwrap();
        let ids: Vec<String> = list(&conn, &table).unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["v1", "v2"]);

        delete(&conn, &table, "v1").unwrap();
        let ids: Vec<String> = list(&conn, &table).unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["v2"]);
        assert_eq!(rows(&conn).len(), 2);

        let err = delete(&conn, &table, "v1").unwrap_err();
        assert!(matches!(err, StorageError::SnapshotNotFound { .. }));
    }

    #[test]
    fn test_missing_table_and_snapshot() {
        let (conn, _) = setup();
        let ghost = TableName::new("plant", "ghost").unwrap();
        assert_eq!(create(&conn, &ghost, "v1").unwrap_err().code(), ErrorCode::NotFound);

        let table = TableName::new("plant", "assets").unwrap();
        assert!(matches!(
            load(&conn, &table, "nope").unwrap_err(),
            StorageError::SnapshotNotFound { .. }
        ));
    }

    #[test]
    fn test_integer_primary_key_table() {
        let (conn, _) = setup();
        conn.execute_batch(
            r#"
            CREATE TABLE "plant"."counters" (id INTEGER PRIMARY KEY, hits INTEGER);
            INSERT INTO "plant"."counters" (id, hits) VALUES (5, 1), (9, 2);
            "#,
        )
        .unwrap();
        let table = TableName::new("plant", "counters").unwrap();

        create(&conn, &table, "v1").unwrap();
        conn.execute_batch(r#"UPDATE "plant"."counters" SET hits = hits + 10"#).unwrap();
        load(&conn, &table, "v1").unwrap();

        let restored: Vec<(i64, i64)> = conn
            .prepare(r#"SELECT id, hits FROM "plant"."counters" ORDER BY id"#)
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(restored, vec![(5, 1), (9, 2)]);
    }

    #[test]
    fn test_qualify_sql() {
        let table = TableName::new("plant", "assets").unwrap();
        assert_eq!(
            qualify_table_sql("CREATE TABLE assets (a TEXT)", &table).unwrap(),
            "CREATE TABLE \"plant\".\"assets\" (a TEXT)"
        );
        assert_eq!(
            qualify_index_sql("CREATE UNIQUE INDEX \"assets_ix0\" ON \"assets\" (name)", "plant", "assets_ix0")
                .unwrap(),
            "CREATE UNIQUE INDEX \"plant\".\"assets_ix0\" ON \"assets\" (name)"
        );
    }
}
