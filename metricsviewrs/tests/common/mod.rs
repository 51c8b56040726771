#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use metricsview::config::DuckDbConfig;
use metricsview::query::{DimensionRef, MeasureRef};
use metricsview::time::TimeRange;
use metricsview::{
    ConnectionManager, DuckDbConnection, MetricsConfig, MetricsRuntime, MetricsViewRegistry,
    Query, SecurityAttributes,
};
use tempfile::TempDir;

const AD_BIDS: &str = r#"
name: ad_bids_metrics
data_source: local
table: ad_bids
time_dimension: timestamp
dimensions:
  - pub
  - dom
measures:
  - name: count
    expression: count(*)
  - name: avg_bid
    expression: avg(bid_price)
"#;

const PUBLISHERS: &str = r#"
name: publishers
data_source: local
table: publishers
dimensions:
  - pub
measures:
  - name: count
    expression: count(*)
"#;

/// Rows per publisher, spread round-robin over 2022-01-01 .. 2022-01-04.
const PUBLISHER_ROWS: &[(Option<&str>, u32)] = &[
    (Some("Facebook"), 19341),
    (Some("Microsoft"), 10406),
    (Some("Google"), 5000),
    (Some("Yahoo"), 3000),
    (None, 100),
];

pub struct Fixture {
    _dir: TempDir,
    pub db_path: PathBuf,
    pub conn: DuckDbConnection,
    pub runtime: MetricsRuntime,
}

pub fn fixture() -> anyhow::Result<Fixture> {
    fixture_with_config(MetricsConfig::default())
}

/// `config` with the `local` source limited to one statement at a time.
pub fn single_slot(mut config: MetricsConfig) -> MetricsConfig {
    config.datasources.entry("local".to_string()).or_default().duckdb =
        Some(DuckDbConfig { max_concurrency: 1 });
    config
}

pub fn fixture_with_config(config: MetricsConfig) -> anyhow::Result<Fixture> {
    fixture_with_views(config, &[])
}

/// Like [`fixture_with_config`], with extra metrics view YAML documents.
pub fn fixture_with_views(config: MetricsConfig, extra_views: &[&str]) -> anyhow::Result<Fixture> {
    let dir = tempfile::tempdir()?;
    let db_path = dir.path().join("ad_bids.duckdb");
    {
        let conn = duckdb::Connection::open(&db_path)?;
        conn.execute_batch(
            "CREATE TABLE ad_bids (\"timestamp\" TIMESTAMP, pub VARCHAR, dom VARCHAR, bid_price DOUBLE);
             CREATE TABLE publishers (pub VARCHAR);
             INSERT INTO publishers VALUES ('Yahoo'), ('Google'), (NULL), ('Microsoft');",
        )?;
        for (publisher, rows) in PUBLISHER_ROWS {
            let value = match publisher {
                Some(p) => format!("'{p}'"),
                None => "NULL".to_string(),
            };
            conn.execute_batch(&format!(
                "INSERT INTO ad_bids
                 SELECT TIMESTAMP '2022-01-01 00:00:00' + INTERVAL (i % 4) DAY,
                        {value},
                        CASE WHEN i % 2 = 0 THEN 'google.com' ELSE 'msn.com' END,
                        1.0 + (i % 3)
                 FROM range({rows}) t(i);"
            ))?;
        }
        // Only present in the last day.
        conn.execute_batch(
            "INSERT INTO ad_bids
             SELECT TIMESTAMP '2022-01-04 12:00:00', 'Baidu', 'baidu.com', 2.0 FROM range(50) t(i);",
        )?;
    }

    let views = dir.path().join("metrics_views");
    fs::create_dir_all(&views)?;
    fs::write(views.join("ad_bids.yaml"), AD_BIDS)?;
    fs::write(views.join("publishers.yml"), PUBLISHERS)?;
    for (i, view) in extra_views.iter().enumerate() {
        fs::write(views.join(format!("extra_{i}.yml")), view)?;
    }
    let registry = MetricsViewRegistry::load_from_dir(dir.path())?;

    let mut connections = ConnectionManager::with_config(single_slot(config));
    let conn = connections.open_duckdb("local", &db_path);
    let runtime = MetricsRuntime::new(Arc::new(registry), connections);

    Ok(Fixture {
        _dir: dir,
        db_path,
        conn,
        runtime,
    })
}

pub fn no_attributes() -> SecurityAttributes {
    SecurityAttributes::new()
}

pub fn day(d: u32) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2022, 1, d, 0, 0, 0).unwrap()
}

/// `pub` by `count` over the whole table.
pub fn by_publisher() -> Query {
    let mut q = Query::new("ad_bids_metrics");
    q.dimensions = vec![DimensionRef::new("pub")];
    q.measures = vec![MeasureRef::new("count")];
    q
}

/// Base window Jan 3-4, comparison window Jan 1-2.
pub fn adjacent_windows(q: &mut Query) {
    q.time_range = Some(TimeRange::between(day(3), day(5)));
    q.comparison_time_range = Some(TimeRange::between(day(1), day(3)));
}
