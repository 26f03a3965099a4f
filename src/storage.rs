//! # Row Storage Primitives
//!
//! Synchronous reads and writes against the physical tables described in
//! [`crate::schema`]. Every function takes a `&Connection`; callers that need
//! atomicity pass a `rusqlite::Transaction`, which derefs to one.
//!
//! ## Visible Rows
//!
//! A base table's rows live in two places: the main table and the delta log.
//! Readers see their union:
//!
//! ```text
//! no primary key:   main ∪ delta
//! primary key:      delta ∪ (main rows whose key is not in delta)
//! ```
//!
//! The delta log always holds the newest version of a keyed row, so shadowing
//! main by delta gives upsert semantics without touching main on every flush.
//!
//! ## Invariant: Merge Is Invisible
//!
//! Moving the delta log into main (in insertion order, `INSERT OR REPLACE` for
//! keyed tables) yields exactly the visible set above, so a merge never
//! changes what readers or views see.

use std::collections::HashMap;

use rusqlite::types::ValueRef;
use rusqlite::Connection;

use crate::error::{Result, SqlIntent};
use crate::schema::TableLayout;
use crate::sql::{column_list, literal, quote_ident};
use crate::types::{ColumnDef, ColumnType, Row, Value};

/// Ordering columns appended to the visible-rows subquery.
const SRC_COL: &str = "__gnode_src";
const RID_COL: &str = "__gnode_rid";

// =============================================================================
// Decoding
// =============================================================================

/// Decodes one cell according to the declared column type.
fn decode_cell(row: &rusqlite::Row<'_>, idx: usize, col_type: ColumnType) -> rusqlite::Result<Value> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => match col_type {
            ColumnType::Boolean => Value::Bool(i != 0),
            ColumnType::Real => Value::Real(i as f64),
            ColumnType::Integer | ColumnType::Text => Value::Integer(i),
        },
        ValueRef::Real(f) => match col_type {
            ColumnType::Integer if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                Value::Integer(f as i64)
            }
            _ => Value::Real(f),
        },
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Value::Text(String::from_utf8_lossy(bytes).into_owned())
        }
    })
}

/// Runs a query whose leading result columns match `columns`.
pub fn select_rows(conn: &Connection, sql: &str, columns: &[ColumnDef]) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare(sql).intent("prepare row query")?;
    let rows = stmt
        .query_map([], |r| {
            let mut row = Row::new();
            for (i, col) in columns.iter().enumerate() {
                row.insert(col.name.clone(), decode_cell(r, i, col.col_type)?);
            }
            Ok(row)
        })
        .intent("run row query")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .intent("decode rows")?;
    Ok(rows)
}

// =============================================================================
// Visible Rows of a Base Table
// =============================================================================

/// Subquery over the visible rows of a table, usable as a `FROM` source.
///
/// Besides the declared columns it carries two ordering columns: which side
/// the row came from (main = 0, delta = 1) and its physical rowid.
pub fn visible_source(layout: &TableLayout) -> String {
    let cols = column_list(layout.schema.column_names());
    let main = quote_ident(&layout.main);
    let delta = quote_ident(&layout.delta);

    let main_filter = match layout.primary_key() {
        Some(pk) => {
            let pk = quote_ident(pk);
            format!(" WHERE NOT EXISTS (SELECT 1 FROM {delta} AS d WHERE d.{pk} = m.{pk})")
        }
        None => String::new(),
    };

    format!(
        "(SELECT {cols}, 0 AS {SRC_COL}, m.rowid AS {RID_COL} FROM {main} AS m{main_filter} \
         UNION ALL \
         SELECT {cols}, 1 AS {SRC_COL}, rowid AS {RID_COL} FROM {delta})"
    )
}

/// Reads every visible row: merged rows first, then the delta log, each in
/// insertion order.
pub fn read_visible(conn: &Connection, layout: &TableLayout) -> Result<Vec<Row>> {
    let sql = format!(
        "SELECT {} FROM {} ORDER BY {SRC_COL}, {RID_COL}",
        column_list(layout.schema.column_names()),
        visible_source(layout)
    );
    select_rows(conn, &sql, layout.columns())
}

/// Number of visible rows.
pub fn count_visible(conn: &Connection, layout: &TableLayout) -> Result<usize> {
    let sql = format!("SELECT COUNT(*) FROM {}", visible_source(layout));
    let n: i64 = conn
        .query_row(&sql, [], |r| r.get(0))
        .intent("count visible rows")?;
    Ok(n as usize)
}

/// Looks up visible rows by primary key.
///
/// Returns a map from [`key_string`] to the current row. Tables without a
/// primary key always yield an empty map.
pub fn lookup_by_keys(
    conn: &Connection,
    layout: &TableLayout,
    keys: &[&Value],
) -> Result<HashMap<String, Row>> {
    let Some(pk) = layout.primary_key() else {
        return Ok(HashMap::new());
    };
    let keys: Vec<String> = keys
        .iter()
        .filter(|k| !k.is_null())
        .map(|k| literal(k))
        .collect();
    if keys.is_empty() {
        return Ok(HashMap::new());
    }

    let sql = format!(
        "SELECT {} FROM {} WHERE {} IN ({})",
        column_list(layout.schema.column_names()),
        visible_source(layout),
        quote_ident(pk),
        keys.join(", ")
    );
    let rows = select_rows(conn, &sql, layout.columns())?;
    Ok(rows
        .into_iter()
        .map(|row| (key_string(row.get_or_null(pk)), row))
        .collect())
}

/// Stable string form of a key value, used as a `row_id`.
pub fn key_string(value: &Value) -> String {
    value.to_string()
}

// =============================================================================
// Writes
// =============================================================================

/// Renders a multi-row `INSERT`; columns missing from a row become `NULL`.
fn insert_sql(table: &str, columns: &[ColumnDef], rows: &[Row], or_replace: bool) -> String {
    let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
    let tuples: Vec<String> = rows
        .iter()
        .map(|row| {
            let values: Vec<String> = names.iter().map(|c| literal(row.get_or_null(c))).collect();
            format!("({})", values.join(", "))
        })
        .collect();
    format!(
        "INSERT {}INTO {} ({}) VALUES {}",
        if or_replace { "OR REPLACE " } else { "" },
        quote_ident(table),
        column_list(names.iter().copied()),
        tuples.join(", ")
    )
}

/// Appends a batch to the delta log in one statement.
///
/// Returns one `row_id` per input row: the primary-key value for keyed
/// tables, otherwise the delta-log rowid assigned to the row.
pub fn append_to_delta(conn: &Connection, layout: &TableLayout, rows: &[Row]) -> Result<Vec<String>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let pk = layout.primary_key();
    let sql = insert_sql(&layout.delta, layout.columns(), rows, pk.is_some());
    conn.execute(&sql, []).intent("insert rows into delta log")?;

    Ok(match pk {
        Some(pk) => rows.iter().map(|r| key_string(r.get_or_null(pk))).collect(),
        None => {
            // one statement into a rowid table: rowids are consecutive
            let last = conn.last_insert_rowid();
            let first = last - rows.len() as i64 + 1;
            (first..=last).map(|id| id.to_string()).collect()
        }
    })
}

/// Rows currently waiting in the delta log.
pub fn delta_len(conn: &Connection, layout: &TableLayout) -> Result<usize> {
    count_rows(conn, &layout.delta)
}

/// Moves the delta log into the main table, in insertion order.
///
/// Returns the number of rows moved. Call inside a transaction.
pub fn merge_delta(conn: &Connection, layout: &TableLayout) -> Result<usize> {
    let cols = column_list(layout.schema.column_names());
    let sql = format!(
        "INSERT {}INTO {main} ({cols}) SELECT {cols} FROM {delta} ORDER BY rowid;\n\
         DELETE FROM {delta};",
        if layout.primary_key().is_some() { "OR REPLACE " } else { "" },
        main = quote_ident(&layout.main),
        delta = quote_ident(&layout.delta),
    );
    let moved = delta_len(conn, layout)?;
    conn.execute_batch(&sql).intent("merge delta log")?;
    Ok(moved)
}

/// Deletes the oldest main-table rows beyond `max_rows`.
///
/// Age is `time_column` ascending, then insertion order. Expects the delta log
/// to be merged first. Returns `(row_id, row)` for every evicted row.
pub fn evict_oldest(
    conn: &Connection,
    layout: &TableLayout,
    max_rows: usize,
) -> Result<Vec<(String, Row)>> {
    let total = count_rows(conn, &layout.main)?;
    if total <= max_rows {
        return Ok(Vec::new());
    }
    let excess = total - max_rows;
    let main = quote_ident(&layout.main);
    let order = match &layout.schema.time_column {
        Some(tc) => format!("{} ASC, rowid ASC", quote_ident(tc)),
        None => "rowid ASC".to_string(),
    };

    let oldest = format!("SELECT rowid FROM {main} ORDER BY {order} LIMIT {excess}");
    let mut read_cols = vec![ColumnDef::new("rowid", ColumnType::Integer)];
    read_cols.extend(layout.columns().iter().cloned());
    let select = format!(
        "SELECT rowid, {} FROM {main} WHERE rowid IN ({oldest}) ORDER BY {order}",
        column_list(layout.schema.column_names()),
    );
    let victims = select_rows(conn, &select, &read_cols)?;

    conn.execute(&format!("DELETE FROM {main} WHERE rowid IN ({oldest})"), [])
        .intent("evict rows beyond retention")?;

    let pk = layout.primary_key();
    Ok(victims
        .into_iter()
        .map(|full| {
            let rowid = full.get_or_null("rowid").to_string();
            let row: Row = layout
                .schema
                .column_names()
                .map(|c| (c.to_string(), full.get_or_null(c).clone()))
                .collect();
            let id = match pk {
                Some(pk) => key_string(row.get_or_null(pk)),
                None => rowid,
            };
            (id, row)
        })
        .collect())
}

/// Row count of one physical table.
pub fn count_rows(conn: &Connection, table: &str) -> Result<usize> {
    let n: i64 = conn
        .query_row(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)), [], |r| r.get(0))
        .intent("count rows")?;
    Ok(n as usize)
}

/// Reads a physical table in insertion order.
pub fn read_table(conn: &Connection, table: &str, columns: &[ColumnDef]) -> Result<Vec<Row>> {
    let sql = format!(
        "SELECT {} FROM {} ORDER BY rowid",
        column_list(columns.iter().map(|c| c.name.as_str())),
        quote_ident(table)
    );
    select_rows(conn, &sql, columns)
}

/// Replaces every row of a physical table. Call inside a transaction.
pub fn replace_rows(conn: &Connection, table: &str, columns: &[ColumnDef], rows: &[Row]) -> Result<()> {
    conn.execute(&format!("DELETE FROM {}", quote_ident(table)), [])
        .intent("clear view rows")?;
    if !rows.is_empty() {
        conn.execute(&insert_sql(table, columns, rows, false), [])
            .intent("write view rows")?;
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Database;
    use crate::types::{NodeId, TableSchema};

    fn setup(schema: TableSchema) -> (Database, TableLayout) {
        let mut db = Database::open_in_memory().unwrap();
        let layout = TableLayout::new(&NodeId::new("t"), schema);
        db.create_table_storage(&layout).unwrap();
        (db, layout)
    }

    fn plain() -> TableSchema {
        TableSchema::new()
            .column("region", ColumnType::Text)
            .column("revenue", ColumnType::Integer)
            .column("ts", ColumnType::Integer)
    }

    fn keyed() -> TableSchema {
        TableSchema::new()
            .column("id", ColumnType::Text)
            .column("qty", ColumnType::Integer)
            .column("price", ColumnType::Real)
            .column("active", ColumnType::Boolean)
            .primary_key("id")
    }

    fn sale(region: &str, revenue: i64, ts: i64) -> Row {
        Row::new()
            .with("region", region)
            .with("revenue", revenue)
            .with("ts", ts)
    }

    #[test]
    fn test_append_and_read_visible() {
        let (db, layout) = setup(plain());
        let ids = append_to_delta(db.conn(), &layout, &[sale("N", 1, 1), sale("S", 2, 2)]).unwrap();
        assert_eq!(ids, vec!["1", "2"]);

        let ids = append_to_delta(db.conn(), &layout, &[sale("E", 3, 3)]).unwrap();
        assert_eq!(ids, vec!["3"]);

        let rows = read_visible(db.conn(), &layout).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], sale("N", 1, 1));
        assert_eq!(rows[2], sale("E", 3, 3));
        assert_eq!(count_visible(db.conn(), &layout).unwrap(), 3);
    }

    #[test]
    fn test_missing_columns_are_null() {
        let (db, layout) = setup(plain());
        append_to_delta(db.conn(), &layout, &[Row::new().with("region", "N")]).unwrap();
        let rows = read_visible(db.conn(), &layout).unwrap();
        assert_eq!(rows[0].get("revenue"), Some(&Value::Null));
    }

    #[test]
    fn test_typed_decoding() {
        let (db, layout) = setup(keyed());
        let row = Row::new()
            .with("id", "a")
            .with("qty", 3)
            .with("price", 2)
            .with("active", true);
        append_to_delta(db.conn(), &layout, &[row]).unwrap();

        let rows = read_visible(db.conn(), &layout).unwrap();
        assert_eq!(rows[0].get("price"), Some(&Value::Real(2.0)));
        assert_eq!(rows[0].get("active"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_merge_preserves_visible_rows() {
        let (db, layout) = setup(plain());
        append_to_delta(db.conn(), &layout, &[sale("N", 1, 1), sale("S", 2, 2)]).unwrap();
        let before = read_visible(db.conn(), &layout).unwrap();

        assert_eq!(merge_delta(db.conn(), &layout).unwrap(), 2);
        assert_eq!(delta_len(db.conn(), &layout).unwrap(), 0);
        assert_eq!(read_visible(db.conn(), &layout).unwrap(), before);
    }

    #[test]
    fn test_primary_key_shadowing() {
        let (db, layout) = setup(keyed());
        let v1 = Row::new().with("id", "a").with("qty", 1);
        let v2 = Row::new().with("id", "a").with("qty", 2);
        let other = Row::new().with("id", "b").with("qty", 9);

        append_to_delta(db.conn(), &layout, &[v1, other]).unwrap();
        merge_delta(db.conn(), &layout).unwrap();
        let ids = append_to_delta(db.conn(), &layout, &[v2]).unwrap();
        assert_eq!(ids, vec!["a"]);

        // a:2 in delta shadows a:1 in main
        let rows = read_visible(db.conn(), &layout).unwrap();
        assert_eq!(rows.len(), 2);
        let a = rows.iter().find(|r| r.get("id") == Some(&Value::from("a"))).unwrap();
        assert_eq!(a.get("qty"), Some(&Value::Integer(2)));

        merge_delta(db.conn(), &layout).unwrap();
        assert_eq!(count_visible(db.conn(), &layout).unwrap(), 2);
    }

    #[test]
    fn test_lookup_by_keys() {
        let (db, layout) = setup(keyed());
        append_to_delta(db.conn(), &layout, &[Row::new().with("id", "a").with("qty", 1)]).unwrap();

        let a = Value::from("a");
        let z = Value::from("z");
        let found = lookup_by_keys(db.conn(), &layout, &[&a, &z]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found["a"].get("qty"), Some(&Value::Integer(1)));
    }

    #[test]
    fn test_evict_oldest_by_time_column() {
        let schema = plain().retention(2, Some("ts"));
        let (db, layout) = setup(schema);
        // inserted out of time order
        append_to_delta(
            db.conn(),
            &layout,
            &[sale("c", 3, 30), sale("a", 1, 10), sale("d", 4, 40), sale("b", 2, 20)],
        )
        .unwrap();
        merge_delta(db.conn(), &layout).unwrap();

        let evicted = evict_oldest(db.conn(), &layout, 2).unwrap();
        let evicted_regions: Vec<_> = evicted
            .iter()
            .map(|(_, r)| r.get("region").cloned().unwrap())
            .collect();
        assert_eq!(evicted_regions, vec![Value::from("a"), Value::from("b")]);

        let left = read_visible(db.conn(), &layout).unwrap();
        assert_eq!(left, vec![sale("c", 3, 30), sale("d", 4, 40)]);
    }

    #[test]
    fn test_evict_within_bound_is_noop() {
        let (db, layout) = setup(plain());
        append_to_delta(db.conn(), &layout, &[sale("a", 1, 1)]).unwrap();
        merge_delta(db.conn(), &layout).unwrap();
        assert!(evict_oldest(db.conn(), &layout, 5).unwrap().is_empty());
    }

    #[test]
    fn test_replace_rows() {
        let mut db = Database::open_in_memory().unwrap();
        let cols = vec![
            ColumnDef::new("region", ColumnType::Text),
            ColumnDef::new("revenue_sum", ColumnType::Integer),
        ];
        let name = db.create_view_storage(&NodeId::new("v"), &cols).unwrap();

        let first = vec![Row::new().with("region", "N").with("revenue_sum", 5)];
        replace_rows(db.conn(), &name, &cols, &first).unwrap();
        let second = vec![
            Row::new().with("region", "S").with("revenue_sum", 9),
            Row::new().with("region", "N").with("revenue_sum", 7),
        ];
        replace_rows(db.conn(), &name, &cols, &second).unwrap();

        assert_eq!(read_table(db.conn(), &name, &cols).unwrap(), second);
        replace_rows(db.conn(), &name, &cols, &[]).unwrap();
        assert_eq!(count_rows(db.conn(), &name).unwrap(), 0);
    }
}
