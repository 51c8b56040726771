//! Compile-and-run entry points.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::backends::{ConnectionManager, OlapConnection, Statement};
use crate::config::ResolvedDatasourceConfig;
use crate::error::{MetricsError, Result};
use crate::executor::{MetricsResponse, QueryResult};
use crate::query::{ComparisonToplistQuery, Query, SecurityAttributes, ToplistQuery};
use crate::query_builder::{DiscoveredValues, SqlBuilder};
use crate::registry::{MetricsViewResolver, ResolvedMetricsView};
use crate::sql_ast::CompiledQuery;
use crate::time::TimeRange;

/// Earliest and latest value of a view's time dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TimeRangeSummary {
    pub min: Option<DateTime<Utc>>,
    pub max: Option<DateTime<Utc>>,
}

/// One request against one view. Every statement it runs shares `deadline`.
struct Prepared {
    resolved: ResolvedMetricsView,
    conn: Arc<dyn OlapConnection>,
    config: ResolvedDatasourceConfig,
    deadline: Option<Instant>,
}

impl Prepared {
    fn statement(&self, query: CompiledQuery, priority: i32) -> Result<Statement> {
        let priority = if priority != 0 {
            priority
        } else {
            self.config.query.priority
        };
        Ok(Statement::new(query)
            .with_priority(priority)
            .with_timeout(self.remaining()?))
    }

    /// What is left of the request's budget; an error once it is spent.
    fn remaining(&self) -> Result<Option<Duration>> {
        let Some(deadline) = self.deadline else {
            return Ok(None);
        };
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(MetricsError::Timeout {
                ms: u128::from(self.config.query.timeout_ms),
            });
        }
        Ok(Some(left))
    }
}

pub struct MetricsRuntime {
    resolver: Arc<dyn MetricsViewResolver>,
    connections: ConnectionManager,
}

impl MetricsRuntime {
    pub fn new(resolver: Arc<dyn MetricsViewResolver>, connections: ConnectionManager) -> Self {
        Self {
            resolver,
            connections,
        }
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    fn prepare(&self, view: &str, attributes: &SecurityAttributes) -> Result<Prepared> {
        let resolved = self.resolver.resolve(view, attributes)?;
        let source = resolved.view.data_source.clone();
        let conn = self.connections.require(&source)?.clone();
        let config = self.connections.config_for(&source);
        let deadline = config.timeout().map(|t| Instant::now() + t);
        Ok(Prepared {
            resolved,
            conn,
            config,
            deadline,
        })
    }

    pub async fn run_aggregation(
        &self,
        query: &Query,
        attributes: &SecurityAttributes,
    ) -> Result<MetricsResponse> {
        let prepared = self.prepare(&query.metrics_view, attributes)?;
        self.aggregate(&prepared, query).await
    }

    pub async fn run_toplist(
        &self,
        request: &ToplistQuery,
        attributes: &SecurityAttributes,
    ) -> Result<MetricsResponse> {
        let prepared = self.prepare(&request.metrics_view, attributes)?;
        let query = SqlBuilder::new(prepared.config.build_options()).toplist(request);
        self.aggregate(&prepared, &query).await
    }

    pub async fn run_comparison_toplist(
        &self,
        request: &ComparisonToplistQuery,
        attributes: &SecurityAttributes,
    ) -> Result<MetricsResponse> {
        let prepared = self.prepare(&request.metrics_view, attributes)?;
        let query = SqlBuilder::new(prepared.config.build_options())
            .comparison_toplist(request)
            .map_err(|e| e.context("error building query"))?;
        self.aggregate(&prepared, &query).await
    }

    /// Runs `MIN` and `MAX` concurrently; the first failure drops the sibling.
    pub async fn run_time_range_summary(
        &self,
        view: &str,
        attributes: &SecurityAttributes,
    ) -> Result<TimeRangeSummary> {
        let prepared = self.prepare(view, attributes)?;
        self.summarize(&prepared).await
    }

    async fn summarize(&self, prepared: &Prepared) -> Result<TimeRangeSummary> {
        let (min_query, max_query) = SqlBuilder::new(prepared.config.build_options())
            .time_range_summary(
                &prepared.resolved.view,
                prepared.conn.dialect(),
                &prepared.resolved.security,
            )
            .map_err(|e| e.context("error building query"))?;
        let min_stmt = prepared.statement(min_query, 0)?;
        let max_stmt = prepared.statement(max_query, 0)?;
        let (min, max) = futures::try_join!(
            prepared.conn.execute(&min_stmt),
            prepared.conn.execute(&max_stmt)
        )
        .map_err(|e| e.context("error executing query"))?;
        Ok(TimeRangeSummary {
            min: first_timestamp(&min, "min")?,
            max: first_timestamp(&max, "max")?,
        })
    }

    async fn aggregate(&self, prepared: &Prepared, query: &Query) -> Result<MetricsResponse> {
        let start = Instant::now();
        let mut options = prepared.config.build_options();
        if needs_anchor(query.time_range.as_ref())
            || needs_anchor(query.comparison_time_range.as_ref())
        {
            let summary = self.summarize(prepared).await?;
            options.time_anchor = summary
                .max
                .map(|max| max + chrono::Duration::milliseconds(1));
        }

        let builder = SqlBuilder::new(options);
        let view = &prepared.resolved.view;
        let security = &prepared.resolved.security;
        let dialect = prepared.conn.dialect();

        let discovery = builder
            .discovery(view, dialect, security, query)
            .map_err(|e| e.context("error building query"))?;
        let discovered = match discovery {
            Some(discovery) => {
                let stmt = prepared.statement(discovery.query.clone(), query.priority)?;
                let rows = prepared
                    .conn
                    .execute(&stmt)
                    .await
                    .map_err(|e| e.context("error executing query"))?;
                tracing::debug!(
                    view = view.name.as_str(),
                    rows = rows.rows.len(),
                    "dimension discovery"
                );
                Some(DiscoveredValues::from_rows(&discovery, &rows.rows))
            }
            None => None,
        };

        let plan = builder
            .build(view, dialect, security, query, discovered.as_ref())
            .map_err(|e| e.context("error building query"))?;
        let stmt = prepared.statement(plan.query.clone(), query.priority)?;
        tracing::debug!(view = view.name.as_str(), sql = stmt.sql.as_str(), "compiled query");
        let result = match &plan.pivot {
            Some(spec) => prepared.conn.execute_pivot(&stmt, spec).await,
            None => prepared.conn.execute(&stmt).await,
        }
        .map_err(|e| e.context("error executing query"))?;

        tracing::debug!(
            view = view.name.as_str(),
            rows = result.rows.len(),
            approximate = plan.approximate,
            ms = start.elapsed().as_millis(),
            "metrics query"
        );
        Ok(MetricsResponse::from_result(result, plan.approximate))
    }
}

/// A duration with neither bound needs the latest timestamp as its end.
fn needs_anchor(range: Option<&TimeRange>) -> bool {
    range.is_some_and(|r| r.iso_duration.is_some() && r.start.is_none() && r.end.is_none())
}

fn first_timestamp(result: &QueryResult, column: &str) -> Result<Option<DateTime<Utc>>> {
    match result.rows.first().and_then(|row| row.get(column)) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| MetricsError::Execution(format!("invalid {column} timestamp {s}: {e}"))),
        Some(other) => Err(MetricsError::Execution(format!(
            "expected a timestamp for {column}, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Map};

    use super::*;
    use crate::config::MetricsConfig;
    use crate::dialect::{Dialect, DialectKind};
    use crate::executor::ColumnMeta;
    use crate::models::{MetricsView, ResolvedSecurity};

    struct Idle;

    #[async_trait]
    impl OlapConnection for Idle {
        fn dialect(&self) -> &'static dyn Dialect {
            DialectKind::DuckDb.dialect()
        }

        async fn execute(&self, _statement: &Statement) -> Result<QueryResult> {
            Ok(QueryResult::default())
        }
    }

    fn prepared(deadline: Option<Instant>) -> Prepared {
        let view: MetricsView = serde_yaml::from_str(
            "name: v\ndata_source: local\ntable: t\nmeasures:\n  - name: n\n    expression: count(*)\n",
        )
        .unwrap();
        Prepared {
            resolved: ResolvedMetricsView {
                view,
                security: ResolvedSecurity::open(),
            },
            conn: Arc::new(Idle),
            config: MetricsConfig::default().for_datasource("local"),
            deadline,
        }
    }

    fn select_one() -> CompiledQuery {
        CompiledQuery {
            sql: "SELECT 1".to_string(),
            args: vec![],
        }
    }

    fn single(column: &str, value: Value) -> QueryResult {
        let mut row = Map::new();
        row.insert(column.to_string(), value);
        QueryResult {
            columns: vec![ColumnMeta::new(column, "TIMESTAMP")],
            rows: vec![row],
        }
    }

    #[test]
    fn parses_summary_timestamps() {
        let t = first_timestamp(&single("max", json!("2022-03-31T23:59:59Z")), "max").unwrap();
        assert_eq!(t.map(|t| t.to_rfc3339()).as_deref(), Some("2022-03-31T23:59:59+00:00"));
        assert_eq!(first_timestamp(&single("max", Value::Null), "max").unwrap(), None);
        assert!(first_timestamp(&single("max", json!(true)), "max").is_err());
    }

    #[test]
    fn statements_share_the_request_deadline() {
        let pending = prepared(Some(Instant::now() + Duration::from_secs(60)));
        let first = pending.statement(select_one(), 0).unwrap();
        let second = pending.statement(select_one(), 3).unwrap();
        assert!(first.timeout.unwrap() <= Duration::from_secs(60));
        assert!(second.timeout.unwrap() <= first.timeout.unwrap());
        assert_eq!(second.priority, 3);

        let spent = prepared(Some(Instant::now()));
        assert!(matches!(
            spent.statement(select_one(), 0),
            Err(MetricsError::Timeout { ms: 30_000 })
        ));
        assert_eq!(prepared(None).statement(select_one(), 0).unwrap().timeout, None);
    }

    #[test]
    fn only_open_durations_need_an_anchor() {
        let open = TimeRange {
            iso_duration: Some("P7D".to_string()),
            ..Default::default()
        };
        assert!(needs_anchor(Some(&open)));
        let bounded = TimeRange {
            end: Some(Utc::now()),
            ..open
        };
        assert!(!needs_anchor(Some(&bounded)));
        assert!(!needs_anchor(None));
    }
}
