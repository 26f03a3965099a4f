//! # SQLite Layout for GNode
//!
//! This module opens the database and owns the DDL for every physical table
//! the engine creates.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Physical Layout                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  base table "sales"                          view "by_region"           │
//! │  ┌─────────────────┐   ┌──────────────────┐  ┌─────────────────┐        │
//! │  │ t_sales         │   │ t_sales__delta   │  │ v_by_region     │        │
//! │  │ (merged rows)   │◄──│ (recent flushes) │  │ (last refresh)  │        │
//! │  └─────────────────┘   └──────────────────┘  └─────────────────┘        │
//! │          merge ─────────────┘                                           │
//! │                                                                         │
//! │  gnode_metadata (key, value)                                            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delta Logs
//!
//! Flushes append to a small table instead of the main one, so a burst of
//! writes touches few index pages. The log is folded into the main table once
//! it grows past the merge threshold. Readers always look at both.
//!
//! ## Volatile Graph, Durable Rows
//!
//! The node graph is not persisted. Opening an existing file keeps its rows,
//! but `create_table` drops any stale physical tables of the same name so a
//! freshly created node always starts empty.

use std::path::Path;

use rusqlite::Connection;
use tracing::debug;

use crate::error::{Error, Result, SqlIntent};
use crate::sql::{delta_table_name, main_table_name, quote_ident, view_table_name};
use crate::types::{ColumnDef, NodeId, TableSchema};

// =============================================================================
// Layout Version
// =============================================================================

/// Version of the physical naming scheme. Files written with another scheme
/// are refused rather than misread.
const LAYOUT_VERSION: i32 = 1;

/// Key/value metadata for the database file.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS gnode_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Table Layout
// =============================================================================

/// Physical names and declared shape of one base table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    /// Merged rows
    pub main: String,
    /// Rows flushed since the last merge
    pub delta: String,
    pub schema: TableSchema,
}

impl TableLayout {
    pub fn new(id: &NodeId, schema: TableSchema) -> Self {
        Self {
            main: main_table_name(id),
            delta: delta_table_name(id),
            schema,
        }
    }

    /// Column definitions in declaration order.
    pub fn columns(&self) -> &[ColumnDef] {
        &self.schema.columns
    }

    pub fn primary_key(&self) -> Option<&str> {
        self.schema.primary_key.as_deref()
    }
}

/// Renders `CREATE TABLE` for the given columns.
fn create_table_sql(name: &str, columns: &[ColumnDef], primary_key: Option<&str>) -> String {
    let mut defs: Vec<String> = columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.col_type.to_sql()))
        .collect();
    if let Some(pk) = primary_key {
        defs.push(format!("PRIMARY KEY ({})", quote_ident(pk)));
    }
    format!("CREATE TABLE {} ({})", quote_ident(name), defs.join(", "))
}

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection prepared for GNode.
///
/// # Ownership
///
/// `Database` owns its `Connection`; dropping it closes the database. The
/// engine actor is the only owner, so no locking is involved.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens (or creates) a database file.
    ///
    /// Missing parent directories are created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).intent("open database")?;
        let mut db = Self { conn };
        db.initialize(true)?;
        Ok(db)
    }

    /// Creates a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().intent("open in-memory database")?;
        let mut db = Self { conn };
        db.initialize(false)?;
        Ok(db)
    }

    fn initialize(&mut self, file_backed: bool) -> Result<()> {
        if file_backed {
            // WAL: readers keep a consistent snapshot while a flush commits
            self.conn
                .execute_batch("PRAGMA journal_mode = WAL")
                .intent("enable WAL")?;
            self.conn
                .execute_batch("PRAGMA synchronous = NORMAL")
                .intent("set synchronous mode")?;
        }
        self.conn
            .execute_batch(CREATE_METADATA)
            .intent("create metadata table")?;
        self.verify_or_set_version()
    }

    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM gnode_metadata WHERE key = 'layout_version'",
                [],
                |row| row.get(0),
            )
            .ok();

        match existing {
            None => {
                self.conn
                    .execute(
                        "INSERT INTO gnode_metadata (key, value) VALUES ('layout_version', ?)",
                        [LAYOUT_VERSION.to_string()],
                    )
                    .intent("record layout version")?;
            }
            Some(v) if v == LAYOUT_VERSION.to_string() => {}
            Some(v) => {
                return Err(Error::InvalidConfig(format!(
                    "database layout version {v} is not supported (expected {LAYOUT_VERSION})"
                )));
            }
        }
        Ok(())
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    // =========================================================================
    // Node DDL
    // =========================================================================

    /// Creates the empty main table and delta log for a base table.
    pub fn create_table_storage(&mut self, layout: &TableLayout) -> Result<()> {
        let pk = layout.primary_key();
        let ddl = format!(
            "DROP TABLE IF EXISTS {main};\n\
             DROP TABLE IF EXISTS {delta};\n\
             {create_main};\n\
             {create_delta};",
            main = quote_ident(&layout.main),
            delta = quote_ident(&layout.delta),
            create_main = create_table_sql(&layout.main, layout.columns(), pk),
            create_delta = create_table_sql(&layout.delta, layout.columns(), pk),
        );
        let tx = self.conn.transaction().intent("begin create table")?;
        tx.execute_batch(&ddl).intent("create table storage")?;
        tx.commit().intent("commit create table")?;
        debug!(main = %layout.main, delta = %layout.delta, "created table storage");
        Ok(())
    }

    /// Creates the empty backing table for a view.
    pub fn create_view_storage(&mut self, id: &NodeId, columns: &[ColumnDef]) -> Result<String> {
        let name = view_table_name(id);
        let ddl = format!(
            "DROP TABLE IF EXISTS {};\n{};",
            quote_ident(&name),
            create_table_sql(&name, columns, None)
        );
        self.conn
            .execute_batch(&ddl)
            .intent("create view storage")?;
        debug!(table = %name, "created view storage");
        Ok(name)
    }

    /// Drops physical tables. Missing tables are ignored.
    pub fn drop_tables<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) -> Result<()> {
        let ddl: String = names
            .into_iter()
            .map(|n| format!("DROP TABLE IF EXISTS {};\n", quote_ident(n)))
            .collect();
        self.conn.execute_batch(&ddl).intent("drop node storage")
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ColumnType;

    fn user_tables(db: &Database) -> Vec<String> {
        let mut stmt = db
            .conn
            .prepare(
                "SELECT name FROM sqlite_master WHERE type = 'table' \
                 AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap()
    }

    fn sales_layout() -> TableLayout {
        let schema = TableSchema::new()
            .column("region", ColumnType::Text)
            .column("revenue", ColumnType::Integer);
        TableLayout::new(&NodeId::new("sales"), schema)
    }

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().expect("should create in-memory db");
        assert_eq!(user_tables(&db), vec!["gnode_metadata"]);
    }

    #[test]
    fn test_create_table_storage() {
        let mut db = Database::open_in_memory().unwrap();
        db.create_table_storage(&sales_layout()).unwrap();
        assert_eq!(
            user_tables(&db),
            vec!["gnode_metadata", "t_sales", "t_sales__delta"]
        );
    }

    /// Re-creating a table drops leftovers from a previous session.
    #[test]
    fn test_create_table_storage_starts_empty() {
        let mut db = Database::open_in_memory().unwrap();
        let layout = sales_layout();
        db.create_table_storage(&layout).unwrap();
        db.conn
            .execute("INSERT INTO t_sales VALUES ('N', 1)", [])
            .unwrap();

        db.create_table_storage(&layout).unwrap();
        let count: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM t_sales", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_primary_key_carried_to_delta_log() {
        let mut db = Database::open_in_memory().unwrap();
        let schema = TableSchema::new()
            .column("id", ColumnType::Text)
            .column("qty", ColumnType::Integer)
            .primary_key("id");
        let layout = TableLayout::new(&NodeId::new("stock"), schema);
        db.create_table_storage(&layout).unwrap();

        db.conn
            .execute_batch(
                "INSERT OR REPLACE INTO t_stock__delta VALUES ('a', 1);\
                 INSERT OR REPLACE INTO t_stock__delta VALUES ('a', 2);",
            )
            .unwrap();
        let count: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM t_stock__delta", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_quoted_identifiers() {
        let mut db = Database::open_in_memory().unwrap();
        let schema = TableSchema::new().column("we\"ird col", ColumnType::Real);
        let layout = TableLayout::new(&NodeId::new("odd name"), schema);
        db.create_table_storage(&layout).unwrap();
        db.drop_tables([layout.main.as_str(), layout.delta.as_str()])
            .unwrap();
        assert_eq!(user_tables(&db), vec!["gnode_metadata"]);
    }

    #[test]
    fn test_reopen_file() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("nested").join("graph.db");

        {
            let mut db = Database::open(&path).expect("first open should work");
            db.create_table_storage(&sales_layout()).unwrap();
        }

        let db = Database::open(&path).expect("second open should work");
        assert!(user_tables(&db).contains(&"t_sales".to_string()));
    }

    #[test]
    fn test_layout_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.db");
        {
            let db = Database::open(&path).unwrap();
            db.conn
                .execute(
                    "UPDATE gnode_metadata SET value = '99' WHERE key = 'layout_version'",
                    [],
                )
                .unwrap();
        }
        let err = Database::open(&path).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}
