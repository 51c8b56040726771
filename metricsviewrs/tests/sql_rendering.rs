//! SQL shapes per dialect, compiled without an engine.

use chrono::{TimeZone, Utc};
use metricsview::models::{Dimension, Measure};
use metricsview::query::{DimensionRef, MeasureCompute, MeasureRef, Sort};
use metricsview::time::{TimeGrain, TimeRange};
use metricsview::{
    DialectKind, Expression, MetricsError, MetricsView, Query, ResolvedSecurity, SqlBuilder,
};
use serde_json::json;

fn view() -> MetricsView {
    MetricsView {
        name: "ad_bids_metrics".to_string(),
        data_source: "olap".to_string(),
        database: None,
        database_schema: None,
        table: "ad_bids".to_string(),
        time_dimension: Some("timestamp".to_string()),
        smallest_time_grain: None,
        first_day_of_week: 1,
        first_month_of_year: 1,
        dimensions: vec![Dimension::column("pub"), Dimension::column("dom")],
        measures: vec![
            Measure::new("count", "count(*)"),
            Measure::new("avg_bid", "avg(bid_price)"),
        ],
        security: None,
        description: None,
    }
}

fn comparison_query() -> Query {
    let mut q = Query::new("ad_bids_metrics");
    q.dimensions = vec![
        DimensionRef::new("pub"),
        DimensionRef::time("timestamp", TimeGrain::Day),
    ];
    q.measures = vec![
        MeasureRef::new("count"),
        MeasureRef::computed(
            "count__previous",
            MeasureCompute::ComparisonValue {
                measure: "count".to_string(),
            },
        ),
    ];
    q.time_range = Some(TimeRange::between(
        Utc.with_ymd_and_hms(2022, 1, 3, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2022, 1, 5, 0, 0, 0).unwrap(),
    ));
    q.comparison_time_range = Some(TimeRange::between(
        Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2022, 1, 3, 0, 0, 0).unwrap(),
    ));
    q.sort = vec![Sort::desc("count")];
    q.exact = true;
    q
}

#[test]
fn compiling_twice_is_byte_identical() {
    let builder = SqlBuilder::default();
    let security = ResolvedSecurity::open();
    for kind in [DialectKind::DuckDb, DialectKind::Druid, DialectKind::ClickHouse] {
        let mut q = comparison_query();
        q.where_clause = Some(Expression::in_list("pub", vec![json!("Yahoo"), json!(null)]));
        let first = builder
            .build(&view(), kind.dialect(), &security, &q, None)
            .unwrap();
        let second = builder
            .build(&view(), kind.dialect(), &security, &q, None)
            .unwrap();
        assert_eq!(first.query.sql, second.query.sql);
        assert_eq!(first.query.args, second.query.args);
    }
}

#[test]
fn comparison_joins_on_offsets_and_exposes_previous_time() {
    let plan = SqlBuilder::default()
        .build(
            &view(),
            DialectKind::DuckDb.dialect(),
            &ResolvedSecurity::open(),
            &comparison_query(),
            None,
        )
        .unwrap();
    let sql = &plan.query.sql;
    assert!(sql.contains("FULL OUTER JOIN"), "{sql}");
    assert!(sql.contains("\"timestamp__offset\""), "{sql}");
    assert!(sql.contains("AS \"timestamp__previous\""), "{sql}");
    assert!(sql.contains("'__metricsview_null__'"), "{sql}");
    assert_eq!(plan.query.placeholder_count(), plan.query.args.len());
}

#[test]
fn druid_threads_join_columns_through_any_value() {
    let plan = SqlBuilder::default()
        .build(
            &view(),
            DialectKind::Druid.dialect(),
            &ResolvedSecurity::open(),
            &comparison_query(),
            None,
        )
        .unwrap();
    assert!(plan.query.sql.contains("ANY_VALUE("), "{}", plan.query.sql);
    assert!(plan.query.sql.contains("GROUP BY"), "{}", plan.query.sql);
}

#[test]
fn druid_needs_dimension_discovery_for_comparison_sorts() {
    let mut q = comparison_query();
    q.exact = false;
    q.sort = vec![Sort::desc("count__previous")];
    let discovery = SqlBuilder::default()
        .discovery(
            &view(),
            DialectKind::Druid.dialect(),
            &ResolvedSecurity::open(),
            &q,
        )
        .unwrap()
        .expect("druid discovers dimension values");
    assert_eq!(
        discovery.dimensions,
        vec![("pub".to_string(), "pub".to_string())]
    );

    let duckdb = SqlBuilder::default()
        .discovery(
            &view(),
            DialectKind::DuckDb.dialect(),
            &ResolvedSecurity::open(),
            &q,
        )
        .unwrap();
    assert!(duckdb.is_none());
}

#[test]
fn pinot_rejects_comparisons() {
    let err = SqlBuilder::default()
        .build(
            &view(),
            DialectKind::Pinot.dialect(),
            &ResolvedSecurity::open(),
            &comparison_query(),
            None,
        )
        .unwrap_err();
    assert!(matches!(err, MetricsError::UnsupportedDialectFeature(_)));
}

#[test]
fn clickhouse_truncates_with_time_zone_argument() {
    let mut q = Query::new("ad_bids_metrics");
    q.dimensions = vec![DimensionRef {
        time_zone: Some("Asia/Kathmandu".to_string()),
        ..DimensionRef::time("timestamp", TimeGrain::Week)
    }];
    q.measures = vec![MeasureRef::new("count")];
    let plan = SqlBuilder::default()
        .build(
            &view(),
            DialectKind::ClickHouse.dialect(),
            &ResolvedSecurity::open(),
            &q,
            None,
        )
        .unwrap();
    assert!(
        plan.query.sql.contains("'Asia/Kathmandu'"),
        "{}",
        plan.query.sql
    );
    assert!(plan.pivot.is_none());
}

#[test]
fn zero_limit_falls_back_to_default() {
    let mut q = Query::new("ad_bids_metrics");
    q.dimensions = vec![DimensionRef::new("pub")];
    q.measures = vec![MeasureRef::new("count")];
    q.limit = Some(0);
    let plan = SqlBuilder::default()
        .build(
            &view(),
            DialectKind::DuckDb.dialect(),
            &ResolvedSecurity::open(),
            &q,
            None,
        )
        .unwrap();
    assert!(plan.query.sql.ends_with("LIMIT 100"), "{}", plan.query.sql);
}

#[test]
fn restricted_fields_are_denied() {
    let security = ResolvedSecurity {
        row_filter: None,
        allowed_fields: Some(["pub".to_string(), "timestamp".to_string()].into()),
    };
    let mut q = Query::new("ad_bids_metrics");
    q.dimensions = vec![DimensionRef::new("pub")];
    q.measures = vec![MeasureRef::new("avg_bid")];
    let err = SqlBuilder::default()
        .build(&view(), DialectKind::DuckDb.dialect(), &security, &q, None)
        .unwrap_err();
    assert!(matches!(err, MetricsError::AccessDenied(_)));
}
