//! # Domain Types for GNode
//!
//! This module defines the values that flow through the engine: node ids,
//! scalar values and rows, table schemas, view configurations, and the
//! [`Delta`] records handed to subscribers.
//!
//! ## Design Philosophy: Typed Rows
//!
//! Rows arriving from the authoring layer are plain `{column: scalar}` maps.
//! Instead of carrying them around as loosely-typed JSON, they are converted
//! into [`Row`] (a map of [`Value`]s) and checked against the table's
//! [`TableSchema`] once, at the ingest boundary. Everything downstream can
//! assume the columns exist and the values fit.
//!
//! ## Serialization
//!
//! [`Value`], [`Row`], [`TableSchema`] and [`ViewConfig`] implement serde so a
//! JSON config or row batch can be handed over as-is:
//!
//! ```rust
//! use gnode::types::{Row, ViewConfig};
//!
//! let row: Row = serde_json::from_str(r#"{"region": "N", "revenue": 1000}"#).unwrap();
//! let config = ViewConfig::from_json(
//!     r#"{"source": "sales", "rowPivots": ["region"], "aggregates": {"revenue": "sum"}}"#,
//! ).unwrap();
//! assert_eq!(config.source.as_str(), "sales");
//! assert_eq!(row.len(), 2);
//! ```

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Node Identification
// =============================================================================

/// The id of a table or view, stable for the node's lifetime.
///
/// # Rust Pattern: Borrow<str>
///
/// Implementing `Borrow<str>` lets a `HashMap<NodeId, _>` be queried with a
/// plain `&str`, so lookups never allocate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&NodeId> for NodeId {
    fn from(id: &NodeId) -> Self {
        id.clone()
    }
}

/// Whether a node is a base table or a derived view. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Table,
    View,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Table => f.write_str("table"),
            NodeKind::View => f.write_str("view"),
        }
    }
}

// =============================================================================
// Values and Rows
// =============================================================================

/// A scalar cell value.
///
/// Serializes to the matching JSON scalar (`null`, `true`, `42`, `4.2`,
/// `"text"`). On deserialization integers are tried before reals, so `1000`
/// becomes `Integer(1000)` and `1000.5` becomes `Real(1000.5)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Value {
    /// Returns true for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the value as `i64` if it is an integer (or a boolean).
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Returns the value as `f64` if it is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Real(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns the string contents of a text value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Checks whether this value can be stored in a column of `col_type`.
    ///
    /// `Null` fits everywhere. Integers are accepted by real columns, and
    /// `0`/`1` are accepted by boolean columns.
    pub fn fits(&self, col_type: ColumnType) -> bool {
        match (self, col_type) {
            (Value::Null, _) => true,
            (Value::Text(_), ColumnType::Text) => true,
            (Value::Integer(_), ColumnType::Integer) => true,
            (Value::Bool(_), ColumnType::Integer) => true,
            (Value::Integer(_), ColumnType::Real) => true,
            (Value::Real(_), ColumnType::Real) => true,
            (Value::Bool(_), ColumnType::Boolean) => true,
            (Value::Integer(i), ColumnType::Boolean) => *i == 0 || *i == 1,
            _ => false,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::Text(_) => "text",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Real(r) => write!(f, "{r}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Real(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// One row, keyed by column name.
///
/// Ordered by column name so that rows compare and print deterministically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(BTreeMap<String, Value>);

impl Row {
    /// Creates an empty row.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style insert.
    ///
    /// ```rust
    /// use gnode::types::{Row, Value};
    ///
    /// let row = Row::new().with("region", "N").with("revenue", 1000);
    /// assert_eq!(row.get("revenue"), Some(&Value::Integer(1000)));
    /// ```
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(column, value);
        self
    }

    /// Sets a column's value.
    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(column.into(), value.into());
    }

    /// Returns a column's value.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    /// Returns a column's value, treating a missing column as `Null`.
    pub fn get_or_null(&self, column: &str) -> &Value {
        const NULL: Value = Value::Null;
        self.0.get(column).unwrap_or(&NULL)
    }

    /// Iterates `(column, value)` pairs in column-name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterates column names.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Number of columns present.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if no columns are present.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

// =============================================================================
// Table Schemas
// =============================================================================

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Boolean,
}

impl ColumnType {
    /// The SQLite declared type for this column.
    pub fn to_sql(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            // SQLite stores booleans as integers
            ColumnType::Boolean => "INTEGER",
        }
    }

    /// True for types whose `sum` stays integral.
    pub fn is_integral(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Boolean)
    }
}

impl FromStr for ColumnType {
    type Err = Error;

    /// Parses a type name (case-insensitive), accepting common aliases.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "text" | "string" | "varchar" => Ok(ColumnType::Text),
            "integer" | "int" | "bigint" => Ok(ColumnType::Integer),
            "real" | "float" | "double" | "decimal" | "number" => Ok(ColumnType::Real),
            "boolean" | "bool" => Ok(ColumnType::Boolean),
            other => Err(Error::InvalidConfig(format!("unknown column type '{other}'"))),
        }
    }
}

impl TryFrom<String> for ColumnType {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ColumnType> for String {
    fn from(t: ColumnType) -> Self {
        match t {
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::Real => "real",
            ColumnType::Boolean => "boolean",
        }
        .to_string()
    }
}

/// Definition of one column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub col_type: ColumnType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, col_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            col_type,
        }
    }
}

/// Declared shape of a base table.
///
/// # Optional Behaviours
///
/// - `primary_key`: flushes use `INSERT OR REPLACE`, giving upsert semantics
/// - `max_rows`: sliding retention window, oldest rows evicted after each flush
/// - `time_column`: ordering used by the retention window (falls back to
///   insertion order when absent)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub primary_key: Option<String>,
    #[serde(default)]
    pub max_rows: Option<usize>,
    #[serde(default)]
    pub time_column: Option<String>,
}

impl TableSchema {
    /// Creates an empty schema; add columns with [`TableSchema::column`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a schema from `(column, type name)` pairs.
    ///
    /// This is the shape the authoring layer hands over
    /// (`{"region": "text", "revenue": "integer"}`).
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let columns = pairs
            .into_iter()
            .map(|(name, ty)| Ok(ColumnDef::new(name, ty.as_ref().parse()?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            columns,
            ..Self::default()
        })
    }

    /// Adds a column.
    pub fn column(mut self, name: impl Into<String>, col_type: ColumnType) -> Self {
        self.columns.push(ColumnDef::new(name, col_type));
        self
    }

    /// Declares the upsert key.
    pub fn primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = Some(column.into());
        self
    }

    /// Bounds the table to its newest `max_rows` rows, ordered by `time_column`.
    pub fn retention(mut self, max_rows: usize, time_column: Option<&str>) -> Self {
        self.max_rows = Some(max_rows);
        self.time_column = time_column.map(str::to_string);
        self
    }

    /// Looks up a column definition.
    pub fn get(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Column names in declaration order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Checks the schema is internally consistent.
    pub fn validate(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(Error::InvalidConfig("table schema has no columns".into()));
        }
        for (i, col) in self.columns.iter().enumerate() {
            if col.name.trim().is_empty() {
                return Err(Error::InvalidConfig("column name cannot be empty".into()));
            }
            if self.columns[..i].iter().any(|c| c.name == col.name) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate column '{}'",
                    col.name
                )));
            }
        }
        if let Some(pk) = &self.primary_key {
            if self.get(pk).is_none() {
                return Err(Error::InvalidConfig(format!(
                    "primary key '{pk}' is not a declared column"
                )));
            }
        }
        if let Some(tc) = &self.time_column {
            if self.get(tc).is_none() {
                return Err(Error::InvalidConfig(format!(
                    "time column '{tc}' is not a declared column"
                )));
            }
        }
        if self.max_rows == Some(0) {
            return Err(Error::InvalidConfig("max_rows must be positive".into()));
        }
        Ok(())
    }

    /// Validates one incoming row against this schema.
    ///
    /// Missing columns are allowed (stored as NULL), except the primary key,
    /// which must be present and non-null. Unknown columns and values of the
    /// wrong type are rejected.
    pub fn check_row(&self, table: &NodeId, row: &Row) -> Result<()> {
        if let Some(pk) = &self.primary_key {
            if matches!(row.get(pk), None | Some(Value::Null)) {
                return Err(Error::InvalidRow {
                    table: table.to_string(),
                    reason: format!("primary key '{pk}' is missing or null"),
                });
            }
        }
        for (column, value) in row.iter() {
            let def = self.get(column).ok_or_else(|| Error::InvalidRow {
                table: table.to_string(),
                reason: format!("unknown column '{column}'"),
            })?;
            if !value.fits(def.col_type) {
                return Err(Error::InvalidRow {
                    table: table.to_string(),
                    reason: format!(
                        "column '{}' expects {}, got {}",
                        column,
                        String::from(def.col_type),
                        value.type_name()
                    ),
                });
            }
        }
        Ok(())
    }
}

// =============================================================================
// View Configuration
// =============================================================================

/// Aggregate function applied to a source column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AggregateFn {
    Sum,
    Avg,
    Count,
    Min,
    Max,
}

impl AggregateFn {
    /// Lowercase name, also used as the output column suffix.
    pub fn name(&self) -> &'static str {
        match self {
            AggregateFn::Sum => "sum",
            AggregateFn::Avg => "avg",
            AggregateFn::Count => "count",
            AggregateFn::Min => "min",
            AggregateFn::Max => "max",
        }
    }

    /// SQL function name.
    pub fn to_sql(&self) -> &'static str {
        match self {
            AggregateFn::Sum => "SUM",
            AggregateFn::Avg => "AVG",
            AggregateFn::Count => "COUNT",
            AggregateFn::Min => "MIN",
            AggregateFn::Max => "MAX",
        }
    }

    /// Type of the aggregate's result for a source column of `source`.
    pub fn output_type(&self, source: ColumnType) -> ColumnType {
        match self {
            AggregateFn::Count => ColumnType::Integer,
            AggregateFn::Avg => ColumnType::Real,
            AggregateFn::Sum if source.is_integral() => ColumnType::Integer,
            AggregateFn::Sum => ColumnType::Real,
            AggregateFn::Min | AggregateFn::Max => source,
        }
    }

    /// Output column name: `<column>_<function>`.
    pub fn output_column(&self, column: &str) -> String {
        format!("{}_{}", column, self.name())
    }
}

impl FromStr for AggregateFn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "sum" => Ok(AggregateFn::Sum),
            "avg" => Ok(AggregateFn::Avg),
            "count" => Ok(AggregateFn::Count),
            "min" => Ok(AggregateFn::Min),
            "max" => Ok(AggregateFn::Max),
            other => Err(Error::InvalidConfig(format!(
                "unsupported aggregate function '{other}'"
            ))),
        }
    }
}

impl TryFrom<String> for AggregateFn {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<AggregateFn> for String {
    fn from(f: AggregateFn) -> Self {
        f.name().to_string()
    }
}

/// Comparison used by a view filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "LIKE", alias = "like")]
    Like,
    #[serde(rename = "IN", alias = "in")]
    In,
}

impl FilterOp {
    pub fn to_sql(&self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Ne => "!=",
            FilterOp::Gt => ">",
            FilterOp::Lt => "<",
            FilterOp::Ge => ">=",
            FilterOp::Le => "<=",
            FilterOp::Like => "LIKE",
            FilterOp::In => "IN",
        }
    }
}

/// Right-hand side of a filter: a scalar, or a list for `IN`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Scalar(Value),
    List(Vec<Value>),
}

macro_rules! scalar_filter_value {
    ($($t:ty),*) => {
        $(impl From<$t> for FilterValue {
            fn from(v: $t) -> Self {
                FilterValue::Scalar(v.into())
            }
        })*
    };
}

scalar_filter_value!(Value, &str, String, i64, i32, f64, bool);

impl From<Vec<Value>> for FilterValue {
    fn from(values: Vec<Value>) -> Self {
        FilterValue::List(values)
    }
}

/// One `WHERE` clause term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub operator: FilterOp,
    pub value: FilterValue,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[serde(alias = "ASC")]
    Asc,
    #[serde(alias = "DESC")]
    Desc,
}

/// One `ORDER BY` term; `column` names a pivot or an aggregate output column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub column: String,
    pub direction: SortDirection,
}

/// Immutable definition of a view: a grouped, filtered, sorted aggregate over
/// exactly one source table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewConfig {
    pub source: NodeId,
    #[serde(default)]
    pub row_pivots: Vec<String>,
    #[serde(default)]
    pub aggregates: BTreeMap<String, AggregateFn>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub sort: Vec<SortKey>,
}

impl ViewConfig {
    /// Starts a config over `source`.
    pub fn new(source: impl Into<NodeId>) -> Self {
        Self {
            source: source.into(),
            row_pivots: Vec::new(),
            aggregates: BTreeMap::new(),
            filters: Vec::new(),
            sort: Vec::new(),
        }
    }

    /// Parses the authoring layer's JSON form.
    ///
    /// Unsupported aggregate functions and malformed filters surface as
    /// [`Error::InvalidConfig`].
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    pub fn pivot(mut self, column: impl Into<String>) -> Self {
        self.row_pivots.push(column.into());
        self
    }

    pub fn aggregate(mut self, column: impl Into<String>, func: AggregateFn) -> Self {
        self.aggregates.insert(column.into(), func);
        self
    }

    pub fn filter(
        mut self,
        column: impl Into<String>,
        operator: FilterOp,
        value: impl Into<FilterValue>,
    ) -> Self {
        self.filters.push(Filter {
            column: column.into(),
            operator,
            value: value.into(),
        });
        self
    }

    pub fn sort(mut self, column: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push(SortKey {
            column: column.into(),
            direction,
        });
        self
    }

    /// Output column names: pivots first, then `<column>_<fn>` per aggregate.
    pub fn output_columns(&self) -> Vec<String> {
        self.row_pivots
            .iter()
            .cloned()
            .chain(self.aggregates.iter().map(|(c, f)| f.output_column(c)))
            .collect()
    }
}

// =============================================================================
// Deltas
// =============================================================================

/// Kind of change applied to one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    Insert,
    Update,
    Delete,
}

/// One row-level change inside a [`Delta`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowOp {
    /// Primary key, delta-log rowid, or view group key.
    pub row_id: String,
    pub op_type: OpType,
    pub old_values: Option<Row>,
    pub new_values: Option<Row>,
}

impl RowOp {
    pub fn insert(row_id: impl Into<String>, row: Row) -> Self {
        Self {
            row_id: row_id.into(),
            op_type: OpType::Insert,
            old_values: None,
            new_values: Some(row),
        }
    }

    pub fn update(row_id: impl Into<String>, old: Row, new: Row) -> Self {
        Self {
            row_id: row_id.into(),
            op_type: OpType::Update,
            old_values: Some(old),
            new_values: Some(new),
        }
    }

    pub fn delete(row_id: impl Into<String>, old: Row) -> Self {
        Self {
            row_id: row_id.into(),
            op_type: OpType::Delete,
            old_values: Some(old),
            new_values: None,
        }
    }
}

/// Immutable record of one flush (tables) or refresh (views).
///
/// Deltas tell subscribers how much changed; they are never replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    pub node: NodeId,
    /// Monotonic per node.
    pub version: u64,
    pub timestamp_ms: u64,
    pub operations: Vec<RowOp>,
}

impl Delta {
    /// Number of row operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Number of operations of the given kind.
    pub fn count(&self, op_type: OpType) -> usize {
        self.operations
            .iter()
            .filter(|op| op.op_type == op_type)
            .count()
    }
}

/// Returns the current time in Unix milliseconds.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================
