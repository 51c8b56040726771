use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::dialect::Dialect;
use crate::error::{MetricsError, Result};
use crate::models::{MetricsView, ResolvedSecurity};
use crate::query::{ComparisonToplistQuery, Query, ToplistQuery};
use crate::sql_ast::{CompiledQuery, Fragment, SelectField, SelectNode, SqlRenderer};
use crate::time::ResolvedTimeRange;

mod aggregation;
mod comparison;
mod components;
mod pivot;
mod toplist;

pub use pivot::{temp_table_name, PivotSpec};

use components::QueryContext;

/// Knobs that come from configuration rather than from the request.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildOptions {
    /// Used when a request limit is absent or zero.
    pub default_limit: u64,
    pub pivot_cell_limit: u64,
    pub pivot_batch_size: usize,
    /// When false every comparison runs exact regardless of the request flag.
    pub allow_approximate: bool,
    pub discovery_limit: u64,
    /// Reference instant for time ranges that only carry a duration.
    pub time_anchor: Option<DateTime<Utc>>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            default_limit: 100,
            pivot_cell_limit: 2_000_000,
            pivot_batch_size: 1024,
            allow_approximate: true,
            discovery_limit: 10_000,
            time_anchor: None,
        }
    }
}

/// A compiled query plus what the executor needs to run it.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    /// For pivots this is the underlying grouped query.
    pub query: CompiledQuery,
    pub pivot: Option<PivotSpec>,
    /// True when a comparison pre-limited one side of its join.
    pub approximate: bool,
}

/// Query that lists dimension values to splice into a comparison on engines
/// that cannot prune an outer join on their own.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryQuery {
    pub query: CompiledQuery,
    /// `(view dimension name, output column)` pairs.
    pub dimensions: Vec<(String, String)>,
}

/// Values returned by a [`DiscoveryQuery`], keyed by view dimension name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveredValues {
    pub values: Vec<(String, Vec<Value>)>,
}

impl DiscoveredValues {
    pub fn from_rows(discovery: &DiscoveryQuery, rows: &[Map<String, Value>]) -> Self {
        let values = discovery
            .dimensions
            .iter()
            .map(|(source, column)| {
                let mut seen: Vec<Value> = Vec::new();
                for row in rows {
                    let v = row.get(column).cloned().unwrap_or(Value::Null);
                    if !seen.contains(&v) {
                        seen.push(v);
                    }
                }
                (source.clone(), seen)
            })
            .collect();
        Self { values }
    }
}

/// Compiles metrics queries into dialect-specific SQL.
#[derive(Debug, Clone, Default)]
pub struct SqlBuilder {
    options: BuildOptions,
}

impl SqlBuilder {
    pub fn new(options: BuildOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    /// Compiles an aggregation, or a comparison when the query carries a
    /// comparison time range.
    pub fn build(
        &self,
        view: &MetricsView,
        dialect: &dyn Dialect,
        security: &ResolvedSecurity,
        query: &Query,
        discovered: Option<&DiscoveredValues>,
    ) -> Result<QueryPlan> {
        let ctx = QueryContext {
            view,
            dialect,
            security,
            options: &self.options,
        };
        if query.comparison_time_range.is_some() {
            comparison::build(&ctx, query, discovered)
        } else {
            aggregation::build(&ctx, query)
        }
    }

    /// The discovery query a comparison needs first, if any.
    pub fn discovery(
        &self,
        view: &MetricsView,
        dialect: &dyn Dialect,
        security: &ResolvedSecurity,
        query: &Query,
    ) -> Result<Option<DiscoveryQuery>> {
        let ctx = QueryContext {
            view,
            dialect,
            security,
            options: &self.options,
        };
        comparison::discovery(&ctx, query)
    }

    /// `MIN` and `MAX` of the view's time dimension as two statements, so
    /// engines can serve each from segment metadata independently.
    pub fn time_range_summary(
        &self,
        view: &MetricsView,
        dialect: &dyn Dialect,
        security: &ResolvedSecurity,
    ) -> Result<(CompiledQuery, CompiledQuery)> {
        let ctx = QueryContext {
            view,
            dialect,
            security,
            options: &self.options,
        };
        let column = view.time_dimension_expr(dialect).ok_or_else(|| {
            MetricsError::UnsupportedDialectFeature(format!(
                "metrics view {} has no time dimension",
                view.name
            ))
        })?;
        let filter = ctx.leg_filter(&ResolvedTimeRange::default(), None, &[])?;
        let renderer = SqlRenderer::new(dialect);
        let bound = |func: &str, alias: &str| {
            let mut node = SelectNode::new(ctx.table_from(&[]));
            node.fields.push(SelectField::new(
                Fragment::raw(format!("{func}({column})")),
                alias,
            ));
            node.where_clause = filter.clone();
            renderer.render(&node)
        };
        Ok((bound("MIN", "min"), bound("MAX", "max")))
    }

    pub fn toplist(&self, request: &ToplistQuery) -> Query {
        toplist::toplist_query(request)
    }

    pub fn comparison_toplist(&self, request: &ComparisonToplistQuery) -> Result<Query> {
        toplist::comparison_toplist_query(request)
    }
}
