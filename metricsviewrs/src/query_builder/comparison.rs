//! Period-over-period queries.
//!
//! Both windows are aggregated into legs that carry, for every time
//! dimension, the offset of the row's bucket from the window start. The legs
//! are then joined on equal offsets plus null-safe equality of the remaining
//! dimensions, and derived measures are computed over the join.
//!
//! Exact mode uses a full outer join. Approximate mode pre-sorts and
//! pre-limits the side the first sort key reads from and drops the unmatched
//! rows of the other side; rows that would only rank through the other side
//! can be missing, which is surfaced as `QueryPlan::approximate`.

use crate::error::{MetricsError, Result};
use crate::query::{Expression, Query, Sort};
use crate::sql_ast::{
    AliasedRelation, Fragment, FromClause, JoinSpec, OrderItem, SelectField, SelectNode,
    SqlJoinType, SqlRenderer,
};

use super::aggregation::grouped_leg;
use super::components::{
    apply_passthrough, build_leg, check_output_names, effective_limit, finish, leg_measures,
    null_safe_eq, qualified, resolve_dimensions, resolve_measures, ComparisonKind, Finish, Leg,
    MeasureValue, QueryContext, ResolvedDimension, ResolvedMeasure,
};
use super::{DiscoveredValues, DiscoveryQuery, QueryPlan};

const BASE: &str = "base";
const COMPARISON: &str = "comparison";

/// What the first sort key reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SortTarget {
    Dimension(String),
    PreviousTime(String),
    Base(String),
    ComparisonValue(String),
    Delta(String),
}

impl SortTarget {
    fn classify(
        sort: &Sort,
        dimensions: &[ResolvedDimension],
        measures: &[ResolvedMeasure],
    ) -> Option<Self> {
        if let Some(d) = dimensions.iter().find(|d| d.name == sort.name) {
            return Some(SortTarget::Dimension(d.name.clone()));
        }
        if let Some(d) = dimensions
            .iter()
            .find(|d| d.time.is_some() && d.previous_alias() == sort.name)
        {
            return Some(SortTarget::PreviousTime(d.name.clone()));
        }
        let m = measures.iter().find(|m| m.name == sort.name)?;
        Some(match &m.value {
            MeasureValue::Aggregate { .. } => SortTarget::Base(m.name.clone()),
            MeasureValue::Comparison {
                kind: ComparisonKind::Value,
                base,
            } => SortTarget::ComparisonValue(base.clone()),
            MeasureValue::Comparison { base, .. } => SortTarget::Delta(base.clone()),
        })
    }

    fn reads_comparison(&self) -> bool {
        !matches!(self, SortTarget::Dimension(_) | SortTarget::Base(_))
    }

    /// Column of the leg that orders this target.
    fn leg_column(&self) -> &str {
        match self {
            SortTarget::Dimension(n)
            | SortTarget::PreviousTime(n)
            | SortTarget::Base(n)
            | SortTarget::ComparisonValue(n)
            | SortTarget::Delta(n) => n,
        }
    }
}

/// Sort and limit applied inside one leg before the join.
struct Pushdown {
    order: Option<(String, bool)>,
    limit: u64,
}

struct JoinStrategy {
    join_type: SqlJoinType,
    base: Option<Pushdown>,
    comparison: Option<Pushdown>,
}

impl JoinStrategy {
    fn exact() -> Self {
        Self {
            join_type: SqlJoinType::Full,
            base: None,
            comparison: None,
        }
    }

    fn approximate(ctx: &QueryContext<'_>, query: &Query, target: &SortTarget) -> Self {
        let total = effective_limit(ctx.options, query.limit) + query.offset.unwrap_or(0);
        let desc = query.sort.first().is_some_and(|s| s.desc);
        let order = Some((target.leg_column().to_string(), desc));
        match target {
            SortTarget::ComparisonValue(_) | SortTarget::PreviousTime(_) => Self {
                join_type: SqlJoinType::Right,
                base: None,
                comparison: Some(Pushdown {
                    order,
                    limit: total,
                }),
            },
            SortTarget::Delta(_) => Self {
                join_type: SqlJoinType::Left,
                base: Some(Pushdown {
                    order,
                    limit: total.max(ctx.options.default_limit),
                }),
                comparison: None,
            },
            SortTarget::Dimension(_) | SortTarget::Base(_) => Self {
                join_type: SqlJoinType::Left,
                base: Some(Pushdown {
                    order,
                    limit: total,
                }),
                comparison: None,
            },
        }
    }
}

pub(super) fn build(
    ctx: &QueryContext<'_>,
    query: &Query,
    discovered: Option<&DiscoveredValues>,
) -> Result<QueryPlan> {
    if ctx.view.time_dimension.is_none() {
        return Err(MetricsError::UnsupportedDialectFeature(format!(
            "comparison requires a time dimension on metrics view {}",
            ctx.view.name
        )));
    }
    if !ctx.dialect.capabilities().time_offsets {
        return Err(MetricsError::UnsupportedDialectFeature(format!(
            "comparison time ranges are not supported on {}",
            ctx.dialect.kind().as_str()
        )));
    }

    let dimensions = resolve_dimensions(ctx, query)?;
    let measures = resolve_measures(ctx, query)?;
    check_output_names(&dimensions, &measures)?;
    if measures.is_empty() {
        return Err(MetricsError::Validation(
            "comparison requires at least one measure".to_string(),
        ));
    }
    if measures.iter().filter(|m| m.filter().is_some()).count() > 1 {
        return Err(MetricsError::Validation(
            "at most one measure may carry a filter".to_string(),
        ));
    }
    if !query.pivot_on.is_empty() {
        return Err(MetricsError::UnsupportedDialectFeature(
            "pivot is not supported with a comparison time range".to_string(),
        ));
    }

    let tz = query.time_zone.as_deref();
    let base_window = ctx.resolve_window(query.time_range.as_ref(), tz)?;
    let comparison_window = ctx.resolve_window(query.comparison_time_range.as_ref(), tz)?;
    let (Some(base_start), Some(comparison_start)) = (base_window.start, comparison_window.start)
    else {
        return Err(MetricsError::Validation(
            "both comparison windows need a resolvable start".to_string(),
        ));
    };

    let user_where = ctx.compile_where(query.effective_where().as_ref())?;
    let spliced = match discovered {
        Some(values) => discovery_filters(ctx, values)?,
        None => Vec::new(),
    };
    let legs = leg_measures(ctx, &measures)?;
    let base_filter = ctx.leg_filter(&base_window, user_where.as_ref(), &spliced)?;
    let comparison_filter = ctx.leg_filter(&comparison_window, user_where.as_ref(), &spliced)?;
    let mut base = grouped_leg(ctx, &dimensions, &legs, base_filter, Some(base_start))?;
    let mut comparison = grouped_leg(
        ctx,
        &dimensions,
        &legs,
        comparison_filter,
        Some(comparison_start),
    )?;

    // Only a single sort key can be pushed into one leg; anything else stays exact.
    let target = match query.sort.as_slice() {
        [sort] if !query.exact && ctx.options.allow_approximate => {
            SortTarget::classify(sort, &dimensions, &measures)
        }
        _ => None,
    };
    let strategy = match &target {
        Some(t) => JoinStrategy::approximate(ctx, query, t),
        None => JoinStrategy::exact(),
    };
    if let Some(p) = &strategy.base {
        base = push_down(ctx, base, p);
    }
    if let Some(p) = &strategy.comparison {
        comparison = push_down(ctx, comparison, p);
    }

    let node = offset_join(ctx, &dimensions, &measures, base, comparison, strategy.join_type);

    let outputs: Vec<String> = dimensions
        .iter()
        .map(|d| d.name.clone())
        .chain(measures.iter().map(|m| m.name.clone()))
        .chain(
            dimensions
                .iter()
                .filter(|d| d.time.is_some())
                .map(|d| d.previous_alias()),
        )
        .collect();
    let node = finish(
        ctx,
        node,
        &Finish {
            outputs: &outputs,
            having: query.having.as_ref(),
            sort: &query.sort,
            limit: Some(effective_limit(ctx.options, query.limit)),
            offset: query.offset,
            wrap: true,
        },
    )?;

    Ok(QueryPlan {
        query: SqlRenderer::new(ctx.dialect).render(&node),
        pivot: None,
        approximate: target.is_some(),
    })
}

/// Joins the two legs by relative position and computes the derived measures.
fn offset_join(
    ctx: &QueryContext<'_>,
    dimensions: &[ResolvedDimension],
    measures: &[ResolvedMeasure],
    base: SelectNode,
    comparison: SelectNode,
    join_type: SqlJoinType,
) -> SelectNode {
    let on = dimensions
        .iter()
        .map(|d| {
            if d.time.is_some() {
                let alias = d.offset_alias();
                Fragment::raw(format!(
                    "{} = {}",
                    qualified(ctx, BASE, &alias),
                    qualified(ctx, COMPARISON, &alias)
                ))
            } else {
                Fragment::raw(null_safe_eq(
                    ctx.dialect,
                    &qualified(ctx, BASE, &d.name),
                    &qualified(ctx, COMPARISON, &d.name),
                ))
            }
        })
        .collect();
    let on = Fragment::and_all(on).unwrap_or_else(|| Fragment::raw("1=1"));

    let mut node = SelectNode::new(FromClause::Join(Box::new(JoinSpec {
        left: AliasedRelation::subquery(base, BASE),
        right: AliasedRelation::subquery(comparison, COMPARISON),
        join_type,
        on,
    })));

    for d in dimensions {
        let base_col = qualified(ctx, BASE, &d.name);
        let expr = if d.time.is_some() {
            base_col
        } else {
            format!("COALESCE({base_col}, {})", qualified(ctx, COMPARISON, &d.name))
        };
        node.fields
            .push(SelectField::new(Fragment::raw(expr), d.name.clone()));
    }
    for m in measures {
        let expr = match &m.value {
            MeasureValue::Aggregate { .. } => qualified(ctx, BASE, &m.name),
            MeasureValue::Comparison { kind, base } => {
                let current = qualified(ctx, BASE, base);
                let previous = qualified(ctx, COMPARISON, base);
                match kind {
                    ComparisonKind::Value => previous,
                    ComparisonKind::Delta => format!("{current} - {previous}"),
                    ComparisonKind::Ratio => ctx
                        .dialect
                        .safe_divide(&format!("{current} - {previous}"), &previous),
                }
            }
        };
        node.fields
            .push(SelectField::new(Fragment::raw(expr), m.name.clone()));
    }
    for d in dimensions.iter().filter(|d| d.time.is_some()) {
        node.fields.push(SelectField::new(
            Fragment::raw(qualified(ctx, COMPARISON, &d.name)),
            d.previous_alias(),
        ));
    }
    apply_passthrough(ctx, &mut node, dimensions.len());
    node
}

fn push_down(ctx: &QueryContext<'_>, node: SelectNode, pushdown: &Pushdown) -> SelectNode {
    let mut node = if matches!(node.from, FromClause::Join(_)) {
        SelectNode::wrap(node, "leg")
    } else {
        node
    };
    if let Some((column, desc)) = &pushdown.order {
        node.order_by = vec![OrderItem {
            expr: ctx.quote(column),
            desc: *desc,
        }];
    }
    node.limit = Some(pushdown.limit);
    node
}

fn discovery_filters(ctx: &QueryContext<'_>, discovered: &DiscoveredValues) -> Result<Vec<Fragment>> {
    let mut out = Vec::with_capacity(discovered.values.len());
    for (dimension, values) in &discovered.values {
        if values.is_empty() {
            out.push(Fragment::raw("1=0"));
            continue;
        }
        let expr = Expression::in_list(dimension, values.clone());
        if let Some(clause) = ctx.compile_where(Some(&expr))? {
            out.push(clause);
        }
    }
    Ok(out)
}

/// Lists the dimension values a comparison should be restricted to, on
/// engines where an unrestricted offset join degrades into a full scan.
///
/// Needed when a measure carries a filter or the first sort reads the
/// comparison window.
pub(super) fn discovery(ctx: &QueryContext<'_>, query: &Query) -> Result<Option<DiscoveryQuery>> {
    if !ctx.dialect.capabilities().dimension_discovery || query.comparison_time_range.is_none() {
        return Ok(None);
    }
    let dimensions = resolve_dimensions(ctx, query)?;
    let measures = resolve_measures(ctx, query)?;
    let keys: Vec<ResolvedDimension> = dimensions
        .iter()
        .filter(|d| d.time.is_none())
        .cloned()
        .collect();
    if keys.is_empty() {
        return Ok(None);
    }

    let target = query
        .sort
        .first()
        .and_then(|s| SortTarget::classify(s, &dimensions, &measures));
    let filtered = measures.iter().any(|m| m.filter().is_some());
    let comparison_sorted = target.as_ref().is_some_and(SortTarget::reads_comparison);
    if !filtered && !comparison_sorted {
        return Ok(None);
    }

    let use_comparison = matches!(
        target,
        Some(SortTarget::ComparisonValue(_) | SortTarget::PreviousTime(_))
    );
    let range = if use_comparison {
        query.comparison_time_range.as_ref()
    } else {
        query.time_range.as_ref()
    };
    let window = ctx.resolve_window(range, query.time_zone.as_deref())?;
    let user_where = ctx.compile_where(query.effective_where().as_ref())?;
    let filter = ctx.leg_filter(&window, user_where.as_ref(), &[])?;

    let sort_measure = match &target {
        Some(SortTarget::Base(m) | SortTarget::ComparisonValue(m) | SortTarget::Delta(m)) => {
            leg_measures(ctx, &measures)?
                .into_iter()
                .find(|l| &l.name == m)
                .map(|mut l| {
                    l.filter = None;
                    l
                })
        }
        _ => None,
    };
    let sort_measures: Vec<_> = sort_measure.into_iter().collect();
    let mut node = build_leg(
        ctx,
        &Leg {
            dimensions: &keys,
            measures: &sort_measures,
            filter,
            offset_start: None,
        },
    )?;
    if let Some(m) = sort_measures.first() {
        node.order_by = vec![OrderItem {
            expr: ctx.quote(&m.name),
            desc: query.sort.first().is_some_and(|s| s.desc),
        }];
    }
    let exact = query.exact || !ctx.options.allow_approximate || query.sort.len() != 1;
    node.limit = Some(if exact {
        ctx.options.discovery_limit
    } else {
        ctx.options
            .discovery_limit
            .min(effective_limit(ctx.options, query.limit) + query.offset.unwrap_or(0))
    });

    Ok(Some(DiscoveryQuery {
        query: SqlRenderer::new(ctx.dialect).render(&node),
        dimensions: keys
            .iter()
            .map(|d| (d.source.clone(), d.name.clone()))
            .collect(),
    }))
}
