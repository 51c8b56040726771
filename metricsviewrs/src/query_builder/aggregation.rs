//! Single-window grouped queries, the measure-filter self-join and the
//! underlying query of a pivot.

use chrono::{DateTime, Utc};

use crate::error::{MetricsError, Result};
use crate::query::Query;
use crate::sql_ast::{
    AliasedRelation, Fragment, FromClause, JoinSpec, SelectField, SelectNode, SqlJoinType,
    SqlRenderer,
};

use super::components::{
    apply_passthrough, build_leg, check_output_names, effective_limit, finish, leg_measures,
    null_safe_eq, qualified, resolve_dimensions, resolve_measures, Finish, Leg, LegMeasure,
    MeasureValue, QueryContext, ResolvedDimension,
};
use super::pivot;
use super::QueryPlan;

pub(super) fn build(ctx: &QueryContext<'_>, query: &Query) -> Result<QueryPlan> {
    let dimensions = resolve_dimensions(ctx, query)?;
    let measures = resolve_measures(ctx, query)?;
    check_output_names(&dimensions, &measures)?;

    if dimensions.is_empty() && measures.is_empty() {
        return Err(MetricsError::Validation(
            "query must request at least one dimension or measure".to_string(),
        ));
    }
    if let Some(m) = measures
        .iter()
        .find(|m| matches!(m.value, MeasureValue::Comparison { .. }))
    {
        return Err(MetricsError::Validation(format!(
            "measure {} requires a comparison time range",
            m.name
        )));
    }
    let filtered = measures.iter().filter(|m| m.filter().is_some()).count();
    if filtered > 1 {
        return Err(MetricsError::Validation(
            "at most one measure may carry a filter".to_string(),
        ));
    }
    let pivoting = !query.pivot_on.is_empty();
    if pivoting && filtered > 0 {
        return Err(MetricsError::Validation(
            "measure filters cannot be combined with pivot".to_string(),
        ));
    }
    if pivoting && query.offset.unwrap_or(0) > 0 {
        return Err(MetricsError::UnsupportedDialectFeature(
            "offset is not supported with pivot".to_string(),
        ));
    }

    let window = ctx.resolve_window(query.time_range.as_ref(), query.time_zone.as_deref())?;
    let user_where = ctx.compile_where(query.effective_where().as_ref())?;
    let filter = ctx.leg_filter(&window, user_where.as_ref(), &[])?;
    let legs = leg_measures(ctx, &measures)?;
    let node = grouped_leg(ctx, &dimensions, &legs, filter, None)?;
    let is_join = matches!(node.from, FromClause::Join(_));

    let outputs: Vec<String> = dimensions
        .iter()
        .map(|d| d.name.clone())
        .chain(measures.iter().map(|m| m.name.clone()))
        .collect();

    if pivoting {
        let spec = pivot::pivot_spec(ctx, query, &dimensions, &measures)?;
        let node = finish(
            ctx,
            node,
            &Finish {
                outputs: &outputs,
                having: query.having.as_ref(),
                sort: &[],
                limit: Some(spec.row_budget() + 1),
                offset: None,
                wrap: is_join,
            },
        )?;
        return Ok(QueryPlan {
            query: SqlRenderer::new(ctx.dialect).render(&node),
            pivot: Some(spec),
            approximate: false,
        });
    }

    let node = finish(
        ctx,
        node,
        &Finish {
            outputs: &outputs,
            having: query.having.as_ref(),
            sort: &query.sort,
            limit: Some(effective_limit(ctx.options, query.limit)),
            offset: query.offset,
            wrap: is_join,
        },
    )?;
    Ok(QueryPlan {
        query: SqlRenderer::new(ctx.dialect).render(&node),
        pivot: None,
        approximate: false,
    })
}

/// A grouped subquery that honours at most one measure filter.
///
/// Without a filter this is a plain leg. With one, the filtered measure is
/// aggregated in its own subquery and left-joined onto the unfiltered one so
/// the dimension set is defined by the unfiltered rows.
pub(super) fn grouped_leg(
    ctx: &QueryContext<'_>,
    dimensions: &[ResolvedDimension],
    measures: &[LegMeasure],
    filter: Option<Fragment>,
    offset_start: Option<DateTime<Utc>>,
) -> Result<SelectNode> {
    let Some(idx) = measures.iter().position(|m| m.filter.is_some()) else {
        return build_leg(
            ctx,
            &Leg {
                dimensions,
                measures,
                filter,
                offset_start,
            },
        );
    };

    let measure_filter = ctx.compile_where(measures[idx].filter.as_ref())?;
    let filtered_where = Fragment::and_all(filter.iter().cloned().chain(measure_filter).collect());

    if dimensions.is_empty() && measures.len() == 1 {
        return build_leg(
            ctx,
            &Leg {
                dimensions,
                measures,
                filter: filtered_where,
                offset_start,
            },
        );
    }

    measure_filter_self_join(
        ctx,
        dimensions,
        measures,
        idx,
        filter,
        filtered_where,
        offset_start,
    )
}

fn measure_filter_self_join(
    ctx: &QueryContext<'_>,
    dimensions: &[ResolvedDimension],
    measures: &[LegMeasure],
    filtered_idx: usize,
    base_where: Option<Fragment>,
    filtered_where: Option<Fragment>,
    offset_start: Option<DateTime<Utc>>,
) -> Result<SelectNode> {
    const BASE: &str = "base";
    const FILTERED: &str = "filtered";

    let unfiltered: Vec<LegMeasure> = measures
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != filtered_idx)
        .map(|(_, m)| m.clone())
        .collect();
    let base = build_leg(
        ctx,
        &Leg {
            dimensions,
            measures: &unfiltered,
            filter: base_where,
            offset_start,
        },
    )?;
    let filtered = build_leg(
        ctx,
        &Leg {
            dimensions,
            measures: std::slice::from_ref(&measures[filtered_idx]),
            filter: filtered_where,
            offset_start: None,
        },
    )?;

    let on = dimensions
        .iter()
        .map(|d| {
            Fragment::raw(null_safe_eq(
                ctx.dialect,
                &qualified(ctx, BASE, &d.name),
                &qualified(ctx, FILTERED, &d.name),
            ))
        })
        .collect();
    let on = Fragment::and_all(on).unwrap_or_else(|| Fragment::raw("1=1"));

    let mut node = SelectNode::new(FromClause::Join(Box::new(JoinSpec {
        left: AliasedRelation::subquery(base, BASE),
        right: AliasedRelation::subquery(filtered, FILTERED),
        join_type: SqlJoinType::Left,
        on,
    })));
    for d in dimensions {
        node.fields.push(SelectField::new(
            Fragment::raw(qualified(ctx, BASE, &d.name)),
            d.name.clone(),
        ));
    }
    for (i, m) in measures.iter().enumerate() {
        let side = if i == filtered_idx { FILTERED } else { BASE };
        node.fields.push(SelectField::new(
            Fragment::raw(qualified(ctx, side, &m.name)),
            m.name.clone(),
        ));
    }
    if offset_start.is_some() {
        for d in dimensions.iter().filter(|d| d.time.is_some()) {
            let alias = d.offset_alias();
            node.fields.push(SelectField::new(
                Fragment::raw(qualified(ctx, BASE, &alias)),
                alias,
            ));
        }
    }
    apply_passthrough(ctx, &mut node, dimensions.len());
    Ok(node)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::dialect::DialectKind;
    use crate::models::{Dimension, Measure, MetricsView, ResolvedSecurity};
    use crate::query::{DimensionRef, Expression, MeasureRef, Sort};
    use crate::query_builder::BuildOptions;
    use crate::sql_ast::SqlArg;
    use crate::time::{TimeGrain, TimeRange};

    fn view() -> MetricsView {
        MetricsView {
            name: "ad_bids_metrics".to_string(),
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
                    column: Some("domain".to_string()),
                    ..Dimension::column("dom")
                },
            ],
            measures: vec![
                Measure::new("count", "count(*)"),
                Measure::new("avg_bid", "avg(bid_price)"),
            ],
            security: None,
            description: None,
        }
    }

    fn build_with(kind: DialectKind, query: &Query) -> Result<QueryPlan> {
        let v = view();
        let security = ResolvedSecurity::open();
        let options = BuildOptions::default();
        let ctx = QueryContext {
            view: &v,
            dialect: kind.dialect(),
            security: &security,
            options: &options,
        };
        build(&ctx, query)
    }

    #[test]
    fn builds_grouped_query_with_default_limit() {
        let mut q = Query::new("ad_bids_metrics");
        q.dimensions = vec![DimensionRef::new("pub")];
        q.measures = vec![MeasureRef::new("count")];
        q.where_clause = Some(Expression::like("pub", "%c%"));
        q.sort = vec![Sort::asc("pub")];
        let plan = build_with(DialectKind::DuckDb, &q).unwrap();
        assert_eq!(
            plan.query.sql,
            "SELECT \"pub\" AS \"pub\", count(*) AS \"count\" FROM \"ad_bids\" WHERE ((\"pub\") ILIKE (?)) GROUP BY 1 ORDER BY \"pub\" NULLS LAST LIMIT 100"
        );
        assert_eq!(plan.query.args, vec![SqlArg::Text("%c%".to_string())]);
        assert!(plan.pivot.is_none());
    }

    #[test]
    fn binds_time_range_and_groups_by_ordinal() {
        let mut q = Query::new("ad_bids_metrics");
        q.dimensions = vec![DimensionRef::time("timestamp", TimeGrain::Day).with_alias("day")];
        q.measures = vec![MeasureRef::new("count")];
        q.time_zone = Some("Asia/Kathmandu".to_string());
        q.time_range = Some(TimeRange::between(
            Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2022, 1, 3, 0, 0, 0).unwrap(),
        ));
        q.limit = Some(5);
        q.offset = Some(10);
        let plan = build_with(DialectKind::DuckDb, &q).unwrap();
        assert!(plan.query.sql.contains("GROUP BY 1 "));
        assert!(plan.query.sql.ends_with("LIMIT 5 OFFSET 10"));
        assert_eq!(plan.query.args.len(), plan.query.placeholder_count());
        assert_eq!(plan.query.args[0], SqlArg::Text("Asia/Kathmandu".to_string()));
    }

    #[test]
    fn measure_filter_uses_a_left_self_join() {
        let mut q = Query::new("ad_bids_metrics");
        q.dimensions = vec![DimensionRef::new("pub")];
        q.measures = vec![
            MeasureRef::new("count"),
            MeasureRef::filtered("avg_bid", Expression::eq("dom", "msn.com")),
        ];
        q.having = Some(Expression::gt("count", 0));
        let plan = build_with(DialectKind::DuckDb, &q).unwrap();
        let sql = &plan.query.sql;
        assert!(sql.starts_with("SELECT * FROM (SELECT \"base\".\"pub\" AS \"pub\", \"base\".\"count\" AS \"count\", \"filtered\".\"avg_bid\" AS \"avg_bid\" FROM (SELECT"));
        assert!(sql.contains("LEFT OUTER JOIN"));
        assert!(sql.contains(
            "ON (COALESCE(CAST(\"base\".\"pub\" AS VARCHAR), '__metricsview_null__') = COALESCE(CAST(\"filtered\".\"pub\" AS VARCHAR), '__metricsview_null__'))"
        ));
        assert!(sql.contains("WHERE ((\"domain\") = (?))"));
        assert!(sql.contains(") \"agg\" WHERE (\"count\") > (?)"));
        assert_eq!(
            plan.query.args,
            vec![SqlArg::Text("msn.com".to_string()), SqlArg::Int(0)]
        );
    }

    #[test]
    fn druid_threads_join_columns_through_any_value() {
        let mut q = Query::new("ad_bids_metrics");
        q.dimensions = vec![DimensionRef::new("pub")];
        q.measures = vec![
            MeasureRef::new("count"),
            MeasureRef::filtered("avg_bid", Expression::eq("dom", "msn.com")),
        ];
        let plan = build_with(DialectKind::Druid, &q).unwrap();
        assert!(plan
            .query
            .sql
            .contains("ANY_VALUE(\"base\".\"count\") AS \"count\""));
        assert!(plan.query.sql.contains(" GROUP BY 1) \"agg\""));
    }

    #[test]
    fn single_filtered_measure_without_dimensions_filters_directly() {
        let mut q = Query::new("ad_bids_metrics");
        q.measures = vec![MeasureRef::filtered("count", Expression::eq("pub", "Yahoo"))];
        let plan = build_with(DialectKind::DuckDb, &q).unwrap();
        assert_eq!(
            plan.query.sql,
            "SELECT count(*) AS \"count\" FROM \"ad_bids\" WHERE ((\"pub\") = (?)) LIMIT 100"
        );
    }

    #[test]
    fn rejects_invalid_shapes() {
        let empty = Query::new("ad_bids_metrics");
        assert!(matches!(
            build_with(DialectKind::DuckDb, &empty),
            Err(MetricsError::Validation(_))
        ));

        let mut two_filters = Query::new("ad_bids_metrics");
        two_filters.measures = vec![
            MeasureRef::filtered("count", Expression::eq("pub", "a")),
            MeasureRef::filtered("avg_bid", Expression::eq("pub", "b")),
        ];
        assert!(matches!(
            build_with(DialectKind::DuckDb, &two_filters),
            Err(MetricsError::Validation(_))
        ));

        let mut unknown = Query::new("ad_bids_metrics");
        unknown.measures = vec![MeasureRef::new("count")];
        unknown.where_clause = Some(Expression::eq("nope", json!(1)));
        assert!(matches!(
            build_with(DialectKind::DuckDb, &unknown),
            Err(MetricsError::UnknownIdentifier(_))
        ));

        let mut pivot_offset = Query::new("ad_bids_metrics");
        pivot_offset.dimensions = vec![DimensionRef::new("pub"), DimensionRef::new("dom")];
        pivot_offset.measures = vec![MeasureRef::new("count")];
        pivot_offset.pivot_on = vec!["pub".to_string()];
        pivot_offset.offset = Some(1);
        assert!(matches!(
            build_with(DialectKind::DuckDb, &pivot_offset),
            Err(MetricsError::UnsupportedDialectFeature(_))
        ));
    }

    #[test]
    fn pivot_caps_the_underlying_query() {
        let mut q = Query::new("ad_bids_metrics");
        q.dimensions = vec![DimensionRef::new("pub"), DimensionRef::new("dom")];
        q.measures = vec![MeasureRef::new("count")];
        q.pivot_on = vec!["pub".to_string()];
        q.sort = vec![Sort::asc("dom")];
        let plan = build_with(DialectKind::DuckDb, &q).unwrap();
        let spec = plan.pivot.unwrap();
        assert_eq!(spec.num_columns, 3);
        assert!(plan
            .query
            .sql
            .ends_with(&format!("LIMIT {}", 2_000_000 / 3 + 1)));
        assert!(!plan.query.sql.contains("ORDER BY"));
    }

    #[test]
    fn compilation_is_idempotent() {
        let mut q = Query::new("ad_bids_metrics");
        q.dimensions = vec![DimensionRef::time("timestamp", TimeGrain::Week)];
        q.measures = vec![MeasureRef::new("count")];
        q.where_clause = Some(Expression::in_list(
            "pub",
            vec![json!("Yahoo"), serde_json::Value::Null],
        ));
        let a = build_with(DialectKind::DuckDb, &q).unwrap();
        let b = build_with(DialectKind::DuckDb, &q).unwrap();
        assert_eq!(a, b);
    }
}
