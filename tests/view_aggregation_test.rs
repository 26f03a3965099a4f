//! View Aggregation Tests
//!
//! Tests that views hold the right rows after a settle:
//! - Sum/count/avg per pivot group
//! - Filters and descending sort
//! - Whole-table aggregates without pivots
//! - Escaping of awkward values and identifiers
//! - Views built from the JSON config form

mod common;

use common::{sale, sales_schema};
use gnode::{AggregateFn, ColumnType, FilterOp, Row, SortDirection, TableSchema, Value, ViewConfig};

#[tokio::test]
async fn sum_and_count_per_region() {
    let engine = common::engine().await;
    engine.create_table("sales", sales_schema()).await.unwrap();
    let view = engine
        .create_view(
            "by_region",
            ViewConfig::new("sales")
                .pivot("region")
                .aggregate("revenue", AggregateFn::Sum)
                .aggregate("product", AggregateFn::Count),
        )
        .await
        .unwrap();

    engine
        .update(
            "sales",
            vec![
                sale("North", "widget", 100),
                sale("South", "widget", 40),
                sale("North", "gadget", 25),
            ],
        )
        .await
        .unwrap();
    engine.settle().await.unwrap();

    let rows = view.snapshot().await.unwrap();
    assert_eq!(
        rows,
        vec![
            Row::new()
                .with("region", "North")
                .with("product_count", 2)
                .with("revenue_sum", 125),
            Row::new()
                .with("region", "South")
                .with("product_count", 1)
                .with("revenue_sum", 40),
        ]
    );
    assert_eq!(view.row_count().await.unwrap(), 2);
    engine.destroy();
}

#[tokio::test]
async fn filter_threshold_and_sort_desc() {
    let engine = common::engine().await;
    engine.create_table("sales", sales_schema()).await.unwrap();
    let view = engine
        .create_view(
            "big_products",
            ViewConfig::new("sales")
                .pivot("product")
                .aggregate("revenue", AggregateFn::Max)
                .filter("revenue", FilterOp::Gt, 10)
                .sort("revenue_max", SortDirection::Desc),
        )
        .await
        .unwrap();

    engine
        .update(
            "sales",
            vec![
                sale("N", "a", 5),
                sale("N", "b", 50),
                sale("S", "c", 20),
                sale("S", "a", 30),
            ],
        )
        .await
        .unwrap();
    engine.settle().await.unwrap();

    let rows = view.snapshot().await.unwrap();
    let products: Vec<_> = rows
        .iter()
        .map(|r| r.get("product").and_then(Value::as_str).unwrap().to_string())
        .collect();
    assert_eq!(products, vec!["b", "a", "c"]);
    assert_eq!(rows[1].get("revenue_max"), Some(&Value::Integer(30)));
    engine.destroy();
}

#[tokio::test]
async fn no_pivots_aggregates_whole_table() {
    let engine = common::engine().await;
    engine.create_table("sales", sales_schema()).await.unwrap();
    let view = engine
        .create_view(
            "totals",
            ViewConfig::new("sales").aggregate("revenue", AggregateFn::Avg),
        )
        .await
        .unwrap();

    engine
        .update("sales", vec![sale("N", "a", 10), sale("S", "b", 20)])
        .await
        .unwrap();
    engine.settle().await.unwrap();

    let rows = view.snapshot().await.unwrap();
    assert_eq!(rows, vec![Row::new().with("revenue_avg", 15.0)]);
    engine.destroy();
}

#[tokio::test]
async fn in_filter_restricts_groups() {
    let engine = common::engine().await;
    engine.create_table("sales", sales_schema()).await.unwrap();
    let view = engine
        .create_view(
            "picked",
            ViewConfig::new("sales")
                .pivot("region")
                .aggregate("revenue", AggregateFn::Sum)
                .filter(
                    "region",
                    FilterOp::In,
                    vec![Value::from("East"), Value::from("West")],
                ),
        )
        .await
        .unwrap();

    engine
        .update(
            "sales",
            vec![sale("East", "a", 1), sale("West", "a", 2), sale("North", "a", 4)],
        )
        .await
        .unwrap();
    engine.settle().await.unwrap();

    let regions: Vec<_> = view
        .snapshot()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.get_or_null("region").clone())
        .collect();
    assert_eq!(regions, vec![Value::from("East"), Value::from("West")]);
    engine.destroy();
}

#[tokio::test]
async fn awkward_values_and_identifiers_round_trip() {
    let engine = common::engine().await;
    let schema = TableSchema::new()
        .column("owner name", ColumnType::Text)
        .column("say \"hi\"", ColumnType::Text)
        .column("amount", ColumnType::Real);
    engine.create_table("odd-table", schema).await.unwrap();
    let view = engine
        .create_view(
            "odd view",
            ViewConfig::new("odd-table")
                .pivot("owner name")
                .aggregate("amount", AggregateFn::Sum)
                .filter("owner name", FilterOp::Eq, "O'Brien"),
        )
        .await
        .unwrap();

    let tricky = Row::new()
        .with("owner name", "O'Brien")
        .with("say \"hi\"", "it's; DROP TABLE x; --")
        .with("amount", 1.5);
    engine
        .update(
            "odd-table",
            vec![
                tricky.clone(),
                Row::new().with("owner name", "O'Brien").with("amount", 2.25),
                Row::new().with("owner name", "Smith").with("amount", 100.0),
            ],
        )
        .await
        .unwrap();
    engine.settle().await.unwrap();

    let table_rows = engine.query("odd-table").await.unwrap();
    assert_eq!(table_rows.len(), 3);
    assert_eq!(table_rows[0], tricky);

    let rows = view.snapshot().await.unwrap();
    assert_eq!(
        rows,
        vec![Row::new().with("owner name", "O'Brien").with("amount_sum", 3.75)]
    );
    engine.destroy();
}

#[tokio::test]
async fn view_from_json_config() {
    let engine = common::engine().await;
    engine.create_table("sales", sales_schema()).await.unwrap();

    let config = ViewConfig::from_json(
        r#"{
            "source": "sales",
            "rowPivots": ["region"],
            "aggregates": {"revenue": "sum"},
            "filters": [{"column": "product", "operator": "LIKE", "value": "w%"}],
            "sort": [{"column": "revenue_sum", "direction": "desc"}]
        }"#,
    )
    .unwrap();
    let view = engine.create_view("json_view", config).await.unwrap();
    assert_eq!(view.columns(), vec!["region", "revenue_sum"]);

    engine
        .update(
            "sales",
            vec![
                sale("N", "widget", 5),
                sale("S", "wrench", 9),
                sale("S", "gadget", 100),
            ],
        )
        .await
        .unwrap();
    engine.settle().await.unwrap();

    assert_eq!(
        view.snapshot().await.unwrap(),
        vec![
            Row::new().with("region", "S").with("revenue_sum", 9),
            Row::new().with("region", "N").with("revenue_sum", 5),
        ]
    );
    engine.destroy();
}

#[tokio::test]
async fn views_follow_later_updates() {
    let engine = common::engine().await;
    engine.create_table("sales", sales_schema()).await.unwrap();
    let view = engine
        .create_view(
            "by_region",
            ViewConfig::new("sales")
                .pivot("region")
                .aggregate("revenue", AggregateFn::Sum),
        )
        .await
        .unwrap();

    engine.update("sales", vec![sale("N", "a", 1)]).await.unwrap();
    engine.settle().await.unwrap();
    engine.update("sales", vec![sale("N", "b", 2)]).await.unwrap();
    engine.settle().await.unwrap();

    assert_eq!(
        view.snapshot().await.unwrap(),
        vec![Row::new().with("region", "N").with("revenue_sum", 3)]
    );
    let status = view.status().await.unwrap();
    assert!(!status.needs_refresh);
    assert_eq!(status.group_count, 1);
    assert!(status.last_refresh_time.is_some());
    engine.destroy();
}
