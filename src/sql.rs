//! # SQL Text Helpers
//!
//! Statements that embed user data are assembled here, in one place, so the
//! escaping rules live in one file:
//!
//! - identifiers are double-quoted, embedded `"` doubled
//! - strings are single-quoted, embedded `'` doubled
//! - `NULL`, booleans as `1`/`0`, integers and finite reals as literals
//!
//! Flushes build a single multi-row `INSERT` with inline literals; a batch may
//! hold more rows than SQLite's bound-parameter limit allows.

use crate::types::{NodeId, Value};

/// Suffix of a table's delta-log physical table.
const DELTA_SUFFIX: &str = "__delta";

/// Quotes an identifier: `region` → `"region"`, `a"b` → `"a""b"`.
pub fn quote_ident(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('"');
    for c in name.chars() {
        if c == '"' {
            out.push('"');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Quotes a string literal: `O'Brien` → `'O''Brien'`.
pub fn quote_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push('\'');
        }
        out.push(c);
    }
    out.push('\'');
    out
}

/// Renders a value as an SQL literal.
pub fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "1".to_string(),
        Value::Bool(false) => "0".to_string(),
        Value::Integer(i) => i.to_string(),
        // `{:?}` always keeps a decimal point or exponent, so SQLite reads it back as REAL
        Value::Real(f) if f.is_finite() => format!("{f:?}"),
        Value::Real(_) => "NULL".to_string(),
        Value::Text(s) => quote_text(s),
    }
}

/// Comma-separated, quoted column list.
pub fn column_list<'a>(columns: impl IntoIterator<Item = &'a str>) -> String {
    columns
        .into_iter()
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Physical name of a table's main storage.
pub fn main_table_name(id: &NodeId) -> String {
    format!("t_{}", id.as_str())
}

/// Physical name of a table's delta log.
pub fn delta_table_name(id: &NodeId) -> String {
    format!("t_{}{}", id.as_str(), DELTA_SUFFIX)
}

/// Physical name of a view's backing table.
pub fn view_table_name(id: &NodeId) -> String {
    format!("v_{}", id.as_str())
}
