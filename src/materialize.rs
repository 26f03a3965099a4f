//! # Aggregation Materializer
//!
//! Turns a [`ViewConfig`] into one grouped `SELECT` over the visible rows of its
//! source table, and runs it.
//!
//! ```text
//! SELECT "region", SUM("revenue") AS "revenue_sum"
//! FROM (<main ∪ delta of sales>)
//! WHERE "revenue" > 1000
//! GROUP BY "region"
//! ORDER BY "revenue_sum" DESC
//! ```
//!
//! Materialization is a pure read: it returns rows and never touches node
//! state. The scheduler decides what to do with them.

use rusqlite::Connection;

use crate::error::{Error, Result};
use crate::schema::TableLayout;
use crate::sql::{literal, quote_ident};
use crate::storage::{select_rows, visible_source};
use crate::types::{
    AggregateFn, ColumnDef, ColumnType, Filter, FilterOp, FilterValue, NodeId, Row, SortDirection,
    TableSchema, Value, ViewConfig,
};

// =============================================================================
// Validation
// =============================================================================

fn invalid(view: &NodeId, msg: impl std::fmt::Display) -> Error {
    Error::InvalidConfig(format!("view '{view}': {msg}"))
}

/// Checks a view config against its source schema and returns the typed
/// output columns (pivots first, then one column per aggregate).
pub fn output_schema(view: &NodeId, config: &ViewConfig, source: &TableSchema) -> Result<Vec<ColumnDef>> {
    if config.aggregates.is_empty() {
        return Err(invalid(view, "at least one aggregate is required"));
    }

    let column = |name: &str, role: &str| {
        source
            .get(name)
            .ok_or_else(|| invalid(view, format!("{role} column '{name}' does not exist in '{}'", config.source)))
    };

    let mut outputs: Vec<ColumnDef> = Vec::new();
    for pivot in &config.row_pivots {
        let def = column(pivot, "pivot")?;
        outputs.push(def.clone());
    }
    for (name, func) in &config.aggregates {
        let def = column(name, "aggregate")?;
        if matches!(func, AggregateFn::Sum | AggregateFn::Avg) && def.col_type == ColumnType::Text {
            return Err(invalid(
                view,
                format!("{} is not defined for text column '{name}'", func.name()),
            ));
        }
        outputs.push(ColumnDef::new(
            func.output_column(name),
            func.output_type(def.col_type),
        ));
    }
    for (i, out) in outputs.iter().enumerate() {
        if outputs[..i].iter().any(|o| o.name == out.name) {
            return Err(invalid(view, format!("duplicate output column '{}'", out.name)));
        }
    }

    for filter in &config.filters {
        column(&filter.column, "filter")?;
        match (&filter.operator, &filter.value) {
            (FilterOp::In, FilterValue::List(_)) => {}
            (FilterOp::In, FilterValue::Scalar(_)) => {
                return Err(invalid(view, format!("IN filter on '{}' needs a list", filter.column)));
            }
            (op, FilterValue::List(_)) => {
                return Err(invalid(
                    view,
                    format!("{} filter on '{}' needs a scalar", op.to_sql(), filter.column),
                ));
            }
            _ => {}
        }
    }

    for key in &config.sort {
        if !outputs.iter().any(|o| o.name == key.column) {
            return Err(invalid(
                view,
                format!("sort column '{}' is neither a pivot nor an aggregate output", key.column),
            ));
        }
    }

    Ok(outputs)
}

// =============================================================================
// Query Building
// =============================================================================

fn filter_sql(filter: &Filter) -> String {
    let column = quote_ident(&filter.column);
    match &filter.value {
        FilterValue::List(values) if values.is_empty() => "0".to_string(),
        FilterValue::List(values) => {
            let items: Vec<String> = values.iter().map(literal).collect();
            format!("{column} {} ({})", filter.operator.to_sql(), items.join(", "))
        }
        FilterValue::Scalar(value) => {
            format!("{column} {} {}", filter.operator.to_sql(), literal(value))
        }
    }
}

/// Renders the aggregation query for `config` over `source`.
pub fn build_query(config: &ViewConfig, source: &TableLayout) -> String {
    let pivots: Vec<String> = config.row_pivots.iter().map(|p| quote_ident(p)).collect();

    let mut select = pivots.clone();
    select.extend(config.aggregates.iter().map(|(col, func)| {
        format!(
            "{}({}) AS {}",
            func.to_sql(),
            quote_ident(col),
            quote_ident(&func.output_column(col))
        )
    }));

    let mut sql = format!("SELECT {} FROM {}", select.join(", "), visible_source(source));

    if !config.filters.is_empty() {
        let terms: Vec<String> = config.filters.iter().map(filter_sql).collect();
        sql.push_str(" WHERE ");
        sql.push_str(&terms.join(" AND "));
    }

    if !pivots.is_empty() {
        sql.push_str(" GROUP BY ");
        sql.push_str(&pivots.join(", "));
    }

    // without an explicit sort, groups come out in pivot order
    let order: Vec<String> = if config.sort.is_empty() {
        pivots
    } else {
        config
            .sort
            .iter()
            .map(|k| {
                let dir = match k.direction {
                    SortDirection::Asc => "ASC",
                    SortDirection::Desc => "DESC",
                };
                format!("{} {dir}", quote_ident(&k.column))
            })
            .collect()
    };
    if !order.is_empty() {
        sql.push_str(" ORDER BY ");
        sql.push_str(&order.join(", "));
    }

    sql
}

/// Runs the aggregation and returns the output rows in sort order.
pub fn materialize(
    conn: &Connection,
    config: &ViewConfig,
    source: &TableLayout,
    outputs: &[ColumnDef],
) -> Result<Vec<Row>> {
    select_rows(conn, &build_query(config, source), outputs)
}

/// Identity of a group: the JSON array of its pivot values.
///
/// A view without pivots has exactly one group, `[]`.
pub fn group_key(config: &ViewConfig, row: &Row) -> String {
    let values: Vec<&Value> = config
        .row_pivots
        .iter()
        .map(|p| row.get_or_null(p))
        .collect();
    serde_json::to_string(&values).unwrap_or_default()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Database;
    use crate::storage::append_to_delta;

    fn sales_schema() -> TableSchema {
        TableSchema::new()
            .column("region", ColumnType::Text)
            .column("product", ColumnType::Text)
            .column("revenue", ColumnType::Integer)
            .column("price", ColumnType::Real)
    }

    fn setup(rows: &[Row]) -> (Database, TableLayout) {
        let mut db = Database::open_in_memory().unwrap();
        let layout = TableLayout::new(&NodeId::new("sales"), sales_schema());
        db.create_table_storage(&layout).unwrap();
        append_to_delta(db.conn(), &layout, rows).unwrap();
        (db, layout)
    }

    fn sale(region: &str, revenue: i64) -> Row {
        Row::new()
            .with("region", region)
            .with("product", "p")
            .with("revenue", revenue)
            .with("price", 1.5)
    }

    fn run(db: &Database, layout: &TableLayout, config: &ViewConfig) -> Vec<Row> {
        let outputs = output_schema(&NodeId::new("v"), config, &layout.schema).unwrap();
        materialize(db.conn(), config, layout, &outputs).unwrap()
    }

    #[test]
    fn test_sum_by_region() {
        let (db, layout) = setup(&[sale("N", 1000), sale("S", 500), sale("N", 250)]);
        let config = ViewConfig::new("sales")
            .pivot("region")
            .aggregate("revenue", AggregateFn::Sum);

        let rows = run(&db, &layout, &config);
        assert_eq!(
            rows,
            vec![
                Row::new().with("region", "N").with("revenue_sum", 1250),
                Row::new().with("region", "S").with("revenue_sum", 500),
            ]
        );
    }

    #[test]
    fn test_no_pivots_single_row() {
        let (db, layout) = setup(&[sale("N", 10), sale("S", 20)]);
        let config = ViewConfig::new("sales")
            .aggregate("revenue", AggregateFn::Avg)
            .aggregate("region", AggregateFn::Count);

        let rows = run(&db, &layout, &config);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("revenue_avg"), Some(&Value::Real(15.0)));
        assert_eq!(rows[0].get("region_count"), Some(&Value::Integer(2)));
        assert!(!build_query(&config, &layout).contains("GROUP BY"));
    }

    #[test]
    fn test_filter_and_sort_desc() {
        let (db, layout) = setup(&[sale("N", 500), sale("S", 2000), sale("E", 1500), sale("W", 3000)]);
        let config = ViewConfig::new("sales")
            .pivot("region")
            .aggregate("revenue", AggregateFn::Max)
            .filter("revenue", FilterOp::Gt, 1000)
            .sort("revenue_max", SortDirection::Desc);

        let rows = run(&db, &layout, &config);
        let regions: Vec<_> = rows.iter().map(|r| r.get("region").cloned().unwrap()).collect();
        assert_eq!(regions, vec![Value::from("W"), Value::from("S"), Value::from("E")]);
    }

    #[test]
    fn test_in_and_like_filters() {
        let (db, layout) = setup(&[sale("North", 1), sale("South", 2), sale("East", 4)]);
        let config = ViewConfig::new("sales")
            .aggregate("revenue", AggregateFn::Sum)
            .filter(
                "region",
                FilterOp::In,
                FilterValue::List(vec!["North".into(), "East".into()]),
            );
        assert_eq!(run(&db, &layout, &config)[0].get("revenue_sum"), Some(&Value::Integer(5)));

        let config = ViewConfig::new("sales")
            .aggregate("revenue", AggregateFn::Sum)
            .filter("region", FilterOp::Like, "%th");
        assert_eq!(run(&db, &layout, &config)[0].get("revenue_sum"), Some(&Value::Integer(3)));
    }

    #[test]
    fn test_filter_values_are_escaped() {
        let (db, layout) = setup(&[sale("O'Brien", 7), sale("Other", 1)]);
        let config = ViewConfig::new("sales")
            .pivot("region")
            .aggregate("revenue", AggregateFn::Sum)
            .filter("region", FilterOp::Eq, "O'Brien");

        let rows = run(&db, &layout, &config);
        assert_eq!(rows, vec![Row::new().with("region", "O'Brien").with("revenue_sum", 7)]);
    }

    #[test]
    fn test_output_schema_types() {
        let config = ViewConfig::new("sales")
            .pivot("region")
            .aggregate("revenue", AggregateFn::Sum)
            .aggregate("price", AggregateFn::Sum);
        let outputs = output_schema(&NodeId::new("v"), &config, &sales_schema()).unwrap();
        assert_eq!(
            outputs,
            vec![
                ColumnDef::new("region", ColumnType::Text),
                ColumnDef::new("price_sum", ColumnType::Real),
                ColumnDef::new("revenue_sum", ColumnType::Integer),
            ]
        );
    }

    #[test]
    fn test_output_schema_rejections() {
        let view = NodeId::new("v");
        let schema = sales_schema();
        let cases = [
            ViewConfig::new("sales").pivot("region"),
            ViewConfig::new("sales").aggregate("nope", AggregateFn::Sum),
            ViewConfig::new("sales")
                .pivot("nope")
                .aggregate("revenue", AggregateFn::Sum),
            ViewConfig::new("sales").aggregate("region", AggregateFn::Sum),
            ViewConfig::new("sales")
                .aggregate("revenue", AggregateFn::Sum)
                .filter("region", FilterOp::In, "N"),
            ViewConfig::new("sales")
                .aggregate("revenue", AggregateFn::Sum)
                .sort("revenue", SortDirection::Asc),
        ];
        for config in cases {
            let err = output_schema(&view, &config, &schema).unwrap_err();
            assert!(matches!(err, Error::InvalidConfig(_)), "{config:?} gave {err:?}");
        }
    }

    #[test]
    fn test_group_key() {
        let config = ViewConfig::new("sales")
            .pivot("region")
            .pivot("product")
            .aggregate("revenue", AggregateFn::Sum);
        let row = Row::new().with("region", "N").with("product", "a\"b");
        assert_eq!(group_key(&config, &row), r#"["N","a\"b"]"#);

        let total = ViewConfig::new("sales").aggregate("revenue", AggregateFn::Sum);
        assert_eq!(group_key(&total, &Row::new()), "[]");
    }
}
