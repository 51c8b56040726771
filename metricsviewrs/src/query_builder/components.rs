//! Resolved query components and the shared select IR builders.
//!
//! Every path (plain aggregation, measure-filter self-join, comparison legs,
//! toplists) produces its grouped subqueries through [`build_leg`] and applies
//! having, sort and limit through [`finish`].

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::dialect::{offset_unit, Dialect};
use crate::error::{MetricsError, Result};
use crate::expression::{self, IdentifierMap};
use crate::models::{MetricsView, ResolvedSecurity};
use crate::query::{Expression, MeasureCompute, Query, Sort};
use crate::sql_ast::{
    Fragment, FromClause, OrderItem, SelectField, SelectNode, SqlArg,
};
use crate::time::{self, CalendarSettings, ResolvedTimeRange, TimeGrain, TimeRange};

use super::BuildOptions;

/// Sentinel that stands in for NULL when matching dimension values across a join.
pub(crate) const NULL_SENTINEL: &str = "__metricsview_null__";

/// Everything a builder needs besides the query itself.
pub(crate) struct QueryContext<'a> {
    pub view: &'a MetricsView,
    pub dialect: &'a dyn Dialect,
    pub security: &'a ResolvedSecurity,
    pub options: &'a BuildOptions,
}

impl<'a> QueryContext<'a> {
    pub fn calendar(&self) -> CalendarSettings {
        self.view.calendar()
    }

    pub fn quote(&self, ident: &str) -> String {
        self.dialect.quote_ident(ident)
    }

    /// Dimension names (and the time dimension) usable in `where` and measure filters.
    pub fn where_identifiers(&self) -> IdentifierMap {
        let mut map = IdentifierMap::new();
        for dim in &self.view.dimensions {
            if !self.security.can_access(&dim.name) {
                continue;
            }
            if let Some(expr) = self.view.dimension_expr(&dim.name, self.dialect) {
                map.insert(dim.name.clone(), expr, dim.unnest);
            }
        }
        if let Some(td) = &self.view.time_dimension {
            if !map.contains(td) {
                map.insert(td.clone(), self.quote(td), false);
            }
        }
        map
    }

    pub fn compile_where(&self, expr: Option<&Expression>) -> Result<Option<Fragment>> {
        expr.map(|e| expression::compile(e, &self.where_identifiers(), self.dialect))
            .transpose()
    }

    pub fn time_zone(&self, query_tz: Option<&str>) -> Result<Tz> {
        time::parse_time_zone(query_tz)
    }

    pub fn resolve_window(
        &self,
        range: Option<&TimeRange>,
        query_tz: Option<&str>,
    ) -> Result<ResolvedTimeRange> {
        match range {
            None => Ok(ResolvedTimeRange::default()),
            Some(r) => time::resolve_time_range(
                r,
                self.time_zone(query_tz)?,
                self.calendar(),
                self.options.time_anchor,
            ),
        }
    }

    /// Half-open `[start, end)` predicate on the view's time dimension.
    pub fn time_clause(&self, window: &ResolvedTimeRange) -> Result<Option<Fragment>> {
        if window.start.is_none() && window.end.is_none() {
            return Ok(None);
        }
        let column = self.view.time_dimension_expr(self.dialect).ok_or_else(|| {
            MetricsError::UnsupportedDialectFeature(format!(
                "metrics view {} has no time dimension to apply a time range to",
                self.view.name
            ))
        })?;
        let mut parts = Vec::new();
        if let Some(start) = window.start {
            parts.push(Fragment::new(
                format!("{column} >= ?"),
                vec![SqlArg::Timestamp(start)],
            ));
        }
        if let Some(end) = window.end {
            parts.push(Fragment::new(
                format!("{column} < ?"),
                vec![SqlArg::Timestamp(end)],
            ));
        }
        Ok(Fragment::and_all(parts))
    }

    /// Time range, user filter and row-security filter, each only when present.
    pub fn leg_filter(
        &self,
        window: &ResolvedTimeRange,
        user_where: Option<&Fragment>,
        extra: &[Fragment],
    ) -> Result<Option<Fragment>> {
        let mut parts = Vec::new();
        if let Some(clause) = self.time_clause(window)? {
            parts.push(clause);
        }
        if let Some(w) = user_where {
            parts.push(w.clone());
        }
        if let Some(rf) = self.security.row_filter.as_deref().filter(|s| !s.trim().is_empty()) {
            parts.push(Fragment::raw(rf));
        }
        parts.extend(extra.iter().cloned());
        Ok(Fragment::and_all(parts))
    }

    pub fn table_from(&self, dimensions: &[ResolvedDimension]) -> FromClause {
        FromClause::Table {
            name: self.view.table_ref(self.dialect),
            unnest: dimensions.iter().filter_map(|d| d.unnest.clone()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TimeBucket {
    pub grain: TimeGrain,
    pub column: Fragment,
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ResolvedDimension {
    /// Name in the metrics view.
    pub source: String,
    /// Output column name.
    pub name: String,
    pub expr: Fragment,
    pub unnest: Option<String>,
    pub time: Option<TimeBucket>,
}

impl ResolvedDimension {
    pub fn offset_alias(&self) -> String {
        format!("{}__offset", self.name)
    }

    pub fn previous_alias(&self) -> String {
        format!("{}__previous", self.name)
    }
}

pub(crate) fn resolve_dimensions(
    ctx: &QueryContext<'_>,
    query: &Query,
) -> Result<Vec<ResolvedDimension>> {
    let mut out = Vec::with_capacity(query.dimensions.len());
    for (idx, dref) in query.dimensions.iter().enumerate() {
        if !ctx.security.can_access(&dref.name) {
            return Err(MetricsError::AccessDenied(format!(
                "dimension {} is not accessible",
                dref.name
            )));
        }
        let column = ctx
            .view
            .dimension_expr(&dref.name, ctx.dialect)
            .ok_or_else(|| MetricsError::UnknownIdentifier(dref.name.clone()))?;
        let name = dref.output_name().to_string();

        if let Some(grain) = dref.time_grain {
            if !ctx.view.is_time_dimension(&dref.name) {
                return Err(MetricsError::UnsupportedDialectFeature(format!(
                    "time grain on {}, which is not a time dimension",
                    dref.name
                )));
            }
            let time_zone = dref
                .time_zone
                .clone()
                .or_else(|| query.time_zone.clone())
                .filter(|tz| !tz.is_empty());
            // Validates the name before it reaches SQL.
            ctx.time_zone(time_zone.as_deref())?;
            let column = Fragment::raw(column);
            let expr = ctx
                .dialect
                .truncate_time(&column, grain, time_zone.as_deref(), ctx.calendar())?;
            out.push(ResolvedDimension {
                source: dref.name.clone(),
                name,
                expr,
                unnest: None,
                time: Some(TimeBucket {
                    grain,
                    column,
                    time_zone,
                }),
            });
            continue;
        }

        let unnest_dim = ctx.view.dimension(&dref.name).is_some_and(|d| d.unnest);
        let unnested_col = format!("unnested_{}", dref.name);
        let unnest = if unnest_dim {
            ctx.dialect
                .unnest_clause(&column, &format!("tbl_{idx}"), &unnested_col)
        } else {
            None
        };
        let expr = match &unnest {
            Some(_) => Fragment::raw(ctx.quote(&unnested_col)),
            None => Fragment::raw(column),
        };
        out.push(ResolvedDimension {
            source: dref.name.clone(),
            name,
            expr,
            unnest,
            time: None,
        });
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ComparisonKind {
    Value,
    Delta,
    Ratio,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MeasureValue {
    /// Aggregated inside each leg.
    Aggregate {
        expr: String,
        filter: Option<Expression>,
    },
    /// Computed from the base and comparison legs.
    Comparison { kind: ComparisonKind, base: String },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ResolvedMeasure {
    pub name: String,
    pub value: MeasureValue,
}

impl ResolvedMeasure {
    pub fn filter(&self) -> Option<&Expression> {
        match &self.value {
            MeasureValue::Aggregate { filter, .. } => filter.as_ref(),
            MeasureValue::Comparison { .. } => None,
        }
    }
}

/// A measure computed inside a leg subquery.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LegMeasure {
    pub name: String,
    pub expr: String,
    pub filter: Option<Expression>,
}

pub(crate) fn resolve_measures(
    ctx: &QueryContext<'_>,
    query: &Query,
) -> Result<Vec<ResolvedMeasure>> {
    let mut out = Vec::with_capacity(query.measures.len());
    for mref in &query.measures {
        let value = match &mref.compute {
            None => {
                let measure = view_measure(ctx, &mref.name)?;
                MeasureValue::Aggregate {
                    expr: measure.to_string(),
                    filter: mref.filter.clone(),
                }
            }
            Some(MeasureCompute::Count) => MeasureValue::Aggregate {
                expr: "COUNT(*)".to_string(),
                filter: mref.filter.clone(),
            },
            Some(MeasureCompute::CountDistinct { dimension }) => {
                if !ctx.security.can_access(dimension) {
                    return Err(MetricsError::AccessDenied(format!(
                        "dimension {dimension} is not accessible"
                    )));
                }
                let expr = ctx
                    .view
                    .dimension_expr(dimension, ctx.dialect)
                    .ok_or_else(|| MetricsError::UnknownIdentifier(dimension.clone()))?;
                MeasureValue::Aggregate {
                    expr: format!("COUNT(DISTINCT {expr})"),
                    filter: mref.filter.clone(),
                }
            }
            Some(
                compute @ (MeasureCompute::ComparisonValue { measure }
                | MeasureCompute::ComparisonDelta { measure }
                | MeasureCompute::ComparisonRatio { measure }),
            ) => {
                if mref.filter.is_some() {
                    return Err(MetricsError::Validation(format!(
                        "measure {}: set the filter on the underlying measure {measure}",
                        mref.name
                    )));
                }
                view_measure(ctx, measure)?;
                let kind = match compute {
                    MeasureCompute::ComparisonValue { .. } => ComparisonKind::Value,
                    MeasureCompute::ComparisonDelta { .. } => ComparisonKind::Delta,
                    _ => ComparisonKind::Ratio,
                };
                MeasureValue::Comparison {
                    kind,
                    base: measure.clone(),
                }
            }
        };
        out.push(ResolvedMeasure {
            name: mref.name.clone(),
            value,
        });
    }
    Ok(out)
}

fn view_measure<'v>(ctx: &QueryContext<'v>, name: &str) -> Result<&'v str> {
    if !ctx.security.can_access(name) {
        return Err(MetricsError::AccessDenied(format!(
            "measure {name} is not accessible"
        )));
    }
    ctx.view
        .measure(name)
        .map(|m| m.expression.as_str())
        .ok_or_else(|| MetricsError::UnknownIdentifier(name.to_string()))
}

/// Measures each leg has to aggregate: the requested aggregates plus the
/// underlying measures of comparison-derived values.
pub(crate) fn leg_measures(
    ctx: &QueryContext<'_>,
    measures: &[ResolvedMeasure],
) -> Result<Vec<LegMeasure>> {
    let mut out: Vec<LegMeasure> = Vec::new();
    for m in measures {
        if let MeasureValue::Aggregate { expr, filter } = &m.value {
            out.push(LegMeasure {
                name: m.name.clone(),
                expr: expr.clone(),
                filter: filter.clone(),
            });
        }
    }
    for m in measures {
        if let MeasureValue::Comparison { base, .. } = &m.value {
            if out.iter().any(|l| &l.name == base) {
                continue;
            }
            out.push(LegMeasure {
                name: base.clone(),
                expr: view_measure(ctx, base)?.to_string(),
                filter: None,
            });
        }
    }
    Ok(out)
}

/// Rejects duplicate output names across dimensions and measures.
pub(crate) fn check_output_names(
    dimensions: &[ResolvedDimension],
    measures: &[ResolvedMeasure],
) -> Result<()> {
    let mut seen = HashSet::new();
    for name in dimensions
        .iter()
        .map(|d| &d.name)
        .chain(measures.iter().map(|m| &m.name))
    {
        if !seen.insert(name.to_lowercase()) {
            return Err(MetricsError::Validation(format!(
                "duplicate output name {name}"
            )));
        }
    }
    Ok(())
}

/// One grouped subquery over the view's table.
pub(crate) struct Leg<'a> {
    pub dimensions: &'a [ResolvedDimension],
    pub measures: &'a [LegMeasure],
    pub filter: Option<Fragment>,
    /// Window start that offset columns are measured from.
    pub offset_start: Option<DateTime<Utc>>,
}

/// `SELECT dims, measures[, offsets] FROM table WHERE .. GROUP BY <ordinals>`.
///
/// Grouping is always by position so parameterized expressions are never
/// restated.
pub(crate) fn build_leg(ctx: &QueryContext<'_>, leg: &Leg<'_>) -> Result<SelectNode> {
    let mut node = SelectNode::new(ctx.table_from(leg.dimensions));
    for dim in leg.dimensions {
        node.fields.push(SelectField::new(dim.expr.clone(), dim.name.clone()));
        node.group_by.push(node.fields.len());
    }
    for m in leg.measures {
        node.fields
            .push(SelectField::new(Fragment::raw(m.expr.clone()), m.name.clone()));
    }
    if let Some(start) = leg.offset_start {
        for dim in leg.dimensions {
            if let Some(bucket) = &dim.time {
                node.fields.push(SelectField::new(
                    offset_expr(ctx, bucket, start)?,
                    dim.offset_alias(),
                ));
                node.group_by.push(node.fields.len());
            }
        }
    }
    node.where_clause = leg.filter.clone();
    Ok(node)
}

/// Distance between a row's bucket and the bucket of the window start, in
/// units of the bucket's grain.
pub(crate) fn offset_expr(
    ctx: &QueryContext<'_>,
    bucket: &TimeBucket,
    start: DateTime<Utc>,
) -> Result<Fragment> {
    let tz = bucket.time_zone.as_deref();
    let start_bucket = ctx.dialect.truncate_time(
        &Fragment::new("?", vec![SqlArg::Timestamp(start)]),
        bucket.grain,
        tz,
        ctx.calendar(),
    )?;
    let row_bucket = ctx
        .dialect
        .truncate_time(&bucket.column, bucket.grain, tz, ctx.calendar())?;
    Ok(ctx
        .dialect
        .date_diff(offset_unit(bucket.grain), &start_bucket, &row_bucket))
}

/// Equality that also matches NULL with NULL, expressed as an equi-join.
pub(crate) fn null_safe_eq(dialect: &dyn Dialect, left: &str, right: &str) -> String {
    let sentinel = dialect.string_literal(NULL_SENTINEL);
    format!(
        "COALESCE({}, {sentinel}) = COALESCE({}, {sentinel})",
        dialect.cast_to_string(left),
        dialect.cast_to_string(right)
    )
}

/// `alias."column"`.
pub(crate) fn qualified(ctx: &QueryContext<'_>, alias: &str, column: &str) -> String {
    format!("{}.{}", ctx.quote(alias), ctx.quote(column))
}

/// Wraps the non-key fields of a join node in `ANY_VALUE` and groups by the
/// leading `key_count` fields on engines that need it.
pub(crate) fn apply_passthrough(ctx: &QueryContext<'_>, node: &mut SelectNode, key_count: usize) {
    if !ctx.dialect.capabilities().any_value_passthrough {
        return;
    }
    for field in node.fields.iter_mut().skip(key_count) {
        field.expr = Fragment::new(
            ctx.dialect.any_value(&field.expr.sql),
            std::mem::take(&mut field.expr.args),
        );
    }
    node.group_by = (1..=key_count.min(node.fields.len())).collect();
}

/// Final shaping over named output columns.
pub(crate) struct Finish<'a> {
    pub outputs: &'a [String],
    pub having: Option<&'a Expression>,
    pub sort: &'a [Sort],
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Always select from a wrapping subquery (used over joins).
    pub wrap: bool,
}

/// Applies having, sort, limit and offset. Having is evaluated as a filter
/// over the aggregated subquery so it can reference output names directly.
pub(crate) fn finish(
    ctx: &QueryContext<'_>,
    node: SelectNode,
    spec: &Finish<'_>,
) -> Result<SelectNode> {
    let mut outputs = IdentifierMap::new();
    for name in spec.outputs {
        outputs.insert(name.clone(), ctx.quote(name), false);
    }
    for sort in spec.sort {
        if !outputs.contains(&sort.name) {
            return Err(MetricsError::UnknownIdentifier(format!(
                "sort field {}",
                sort.name
            )));
        }
    }

    let having = spec
        .having
        .map(|h| expression::compile(h, &outputs, ctx.dialect))
        .transpose()?;

    let mut node = if having.is_some() || spec.wrap {
        let mut outer = SelectNode::wrap(node, "agg");
        outer.where_clause = having;
        outer
    } else {
        node
    };

    node.order_by = spec
        .sort
        .iter()
        .map(|s| OrderItem {
            expr: ctx.quote(&s.name),
            desc: s.desc,
        })
        .collect();
    node.limit = spec.limit;
    node.offset = spec.offset.filter(|o| *o > 0);
    Ok(node)
}

/// Limit after applying the "zero means default" rule.
pub(crate) fn effective_limit(options: &BuildOptions, limit: Option<u64>) -> u64 {
    match limit {
        None | Some(0) => options.default_limit,
        Some(n) => n,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::DialectKind;
    use crate::models::{Dimension, Measure};
    use crate::query::{DimensionRef, MeasureRef};

    fn view() -> MetricsView {
        MetricsView {
            name: "mv".to_string(),
            data_source: "local".to_string(),
            database: None,
            database_schema: None,
            table: "ad_bids".to_string(),
            time_dimension: Some("timestamp".to_string()),
            smallest_time_grain: None,
            first_day_of_week: 1,
            first_month_of_year: 1,
            dimensions: vec![
                Dimension::column("pub"),
                Dimension {
                    unnest: true,
                    ..Dimension::column("tags")
                },
            ],
            measures: vec![Measure::new("records", "count(*)")],
            security: None,
            description: None,
        }
    }

    #[test]
    fn resolves_time_and_unnest_dimensions() {
        let v = view();
        let security = ResolvedSecurity::open();
        let options = BuildOptions::default();
        let ctx = QueryContext {
            view: &v,
            dialect: DialectKind::DuckDb.dialect(),
            security: &security,
            options: &options,
        };
        let mut q = Query::new("mv");
        q.dimensions = vec![
            DimensionRef::time("timestamp", TimeGrain::Day),
            DimensionRef::new("tags"),
        ];
        let dims = resolve_dimensions(&ctx, &q).unwrap();
        assert_eq!(
            dims[0].expr.sql,
            "date_trunc('DAY', \"timestamp\"::TIMESTAMP)::TIMESTAMP"
        );
        assert!(dims[0].time.is_some());
        assert_eq!(dims[1].expr.sql, "\"unnested_tags\"");
        assert_eq!(
            dims[1].unnest.as_deref(),
            Some(", LATERAL UNNEST(\"tags\") tbl_1(\"unnested_tags\")")
        );
    }

    #[test]
    fn rejects_grain_on_plain_dimension() {
        let v = view();
        let security = ResolvedSecurity::open();
        let options = BuildOptions::default();
        let ctx = QueryContext {
            view: &v,
            dialect: DialectKind::DuckDb.dialect(),
            security: &security,
            options: &options,
        };
        let mut q = Query::new("mv");
        q.dimensions = vec![DimensionRef::time("pub", TimeGrain::Day)];
        assert!(matches!(
            resolve_dimensions(&ctx, &q),
            Err(MetricsError::UnsupportedDialectFeature(_))
        ));
    }

    #[test]
    fn adds_hidden_bases_for_comparison_measures() {
        let v = view();
        let security = ResolvedSecurity::open();
        let options = BuildOptions::default();
        let ctx = QueryContext {
            view: &v,
            dialect: DialectKind::DuckDb.dialect(),
            security: &security,
            options: &options,
        };
        let mut q = Query::new("mv");
        q.measures = vec![
            MeasureRef::computed("n", MeasureCompute::Count),
            MeasureRef::computed(
                "records__delta",
                MeasureCompute::ComparisonDelta {
                    measure: "records".to_string(),
                },
            ),
        ];
        let measures = resolve_measures(&ctx, &q).unwrap();
        let legs = leg_measures(&ctx, &measures).unwrap();
        let names: Vec<&str> = legs.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["n", "records"]);
        assert_eq!(legs[0].expr, "COUNT(*)");
    }

    #[test]
    fn null_safe_equality_is_an_equi_join() {
        let got = null_safe_eq(DialectKind::DuckDb.dialect(), "a.\"d\"", "b.\"d\"");
        assert_eq!(
            got,
            "COALESCE(CAST(a.\"d\" AS VARCHAR), '__metricsview_null__') = COALESCE(CAST(b.\"d\" AS VARCHAR), '__metricsview_null__')"
        );
    }
}
