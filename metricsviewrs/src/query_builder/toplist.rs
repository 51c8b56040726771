//! Single-dimension ranked lists, expressed as ordinary queries.

use std::collections::HashMap;

use crate::error::{MetricsError, Result};
use crate::query::{
    ComparisonSortType, ComparisonToplistQuery, Condition, DimensionRef, Expression,
    MeasureCompute, MeasureRef, Query, Sort, ToplistQuery,
};

pub(super) fn toplist_query(request: &ToplistQuery) -> Query {
    let mut query = Query::new(&request.metrics_view);
    query.dimensions = vec![DimensionRef::new(&request.dimension)];
    query.measures = request.measures.iter().map(MeasureRef::new).collect();
    query.time_range = request.time_range.clone();
    query.where_clause = request.where_clause.clone();
    query.filter = request.filter.clone();
    query.having = request.having.clone();
    query.sort = request.sort.clone();
    query.limit = request.limit;
    query.offset = request.offset;
    query.priority = request.priority;
    query
}

/// Output column holding `measure` for a comparison toplist column kind.
pub(crate) fn comparison_column(measure: &str, kind: ComparisonSortType) -> String {
    match kind {
        ComparisonSortType::BaseValue => measure.to_string(),
        ComparisonSortType::ComparisonValue => format!("{measure}__previous"),
        ComparisonSortType::AbsDelta => format!("{measure}__delta_abs"),
        ComparisonSortType::RelDelta => format!("{measure}__delta_rel"),
    }
}

/// Expands every measure into base, `__previous`, `__delta_abs` and
/// `__delta_rel` columns joined on the dimension value. Without a comparison
/// range only the base columns are produced.
pub(super) fn comparison_toplist_query(request: &ComparisonToplistQuery) -> Result<Query> {
    let has_comparison = request.comparison_time_range.is_some();

    let Some(first) = request.sort.first() else {
        return Err(MetricsError::Validation(
            "comparison toplist requires a sort".to_string(),
        ));
    };
    if request.sort.iter().any(|s| s.sort_type != first.sort_type) {
        return Err(MetricsError::Validation(
            "all sorts of a comparison toplist must share one sort type".to_string(),
        ));
    }
    if !has_comparison && first.sort_type != ComparisonSortType::BaseValue {
        return Err(MetricsError::Validation(format!(
            "sort type {:?} requires a comparison time range",
            first.sort_type
        )));
    }

    let mut measures = Vec::with_capacity(request.measures.len() * 4);
    for name in &request.measures {
        measures.push(MeasureRef::new(name));
        if has_comparison {
            measures.push(MeasureRef::computed(
                comparison_column(name, ComparisonSortType::ComparisonValue),
                MeasureCompute::ComparisonValue {
                    measure: name.clone(),
                },
            ));
            measures.push(MeasureRef::computed(
                comparison_column(name, ComparisonSortType::AbsDelta),
                MeasureCompute::ComparisonDelta {
                    measure: name.clone(),
                },
            ));
            measures.push(MeasureRef::computed(
                comparison_column(name, ComparisonSortType::RelDelta),
                MeasureCompute::ComparisonRatio {
                    measure: name.clone(),
                },
            ));
        }
    }

    let sort = request
        .sort
        .iter()
        .map(|s| {
            let name = if s.name == request.dimension {
                s.name.clone()
            } else {
                comparison_column(&s.name, s.sort_type)
            };
            Sort { name, desc: s.desc }
        })
        .collect();

    let mut aliases = HashMap::new();
    for alias in &request.aliases {
        if !has_comparison && alias.kind != ComparisonSortType::BaseValue {
            return Err(MetricsError::Validation(format!(
                "alias {} refers to a comparison column without a comparison time range",
                alias.alias
            )));
        }
        aliases.insert(alias.alias.clone(), comparison_column(&alias.name, alias.kind));
    }

    let mut query = Query::new(&request.metrics_view);
    query.dimensions = vec![DimensionRef::new(&request.dimension)];
    query.measures = measures;
    query.time_range = Some(request.base_time_range.clone());
    query.comparison_time_range = request.comparison_time_range.clone();
    query.where_clause = request.where_clause.clone();
    query.filter = request.filter.clone();
    query.having = request.having.as_ref().map(|h| rewrite_aliases(h, &aliases));
    query.sort = sort;
    query.limit = request.limit;
    query.offset = request.offset;
    query.exact = request.exact;
    query.priority = request.priority;
    Ok(query)
}

fn rewrite_aliases(expr: &Expression, aliases: &HashMap<String, String>) -> Expression {
    match expr {
        Expression::Identifier(name) => {
            Expression::Identifier(aliases.get(name).cloned().unwrap_or_else(|| name.clone()))
        }
        Expression::Value(_) => expr.clone(),
        Expression::Condition(cond) => Expression::Condition(Condition {
            op: cond.op,
            exprs: cond
                .exprs
                .iter()
                .map(|e| rewrite_aliases(e, aliases))
                .collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::query::{ComparisonSort, MeasureAlias};
    use crate::time::TimeRange;

    fn request() -> ComparisonToplistQuery {
        ComparisonToplistQuery {
            metrics_view: "ad_bids_metrics".to_string(),
            dimension: "dom".to_string(),
            measures: vec!["measure_0".to_string()],
            base_time_range: TimeRange::between(
                Utc.with_ymd_and_hms(2022, 1, 3, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2022, 1, 5, 0, 0, 0).unwrap(),
            ),
            comparison_time_range: Some(TimeRange::between(
                Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2022, 1, 3, 0, 0, 0).unwrap(),
            )),
            where_clause: None,
            filter: None,
            having: Some(Expression::gt("m0_prev", 0)),
            sort: vec![ComparisonSort {
                name: "measure_0".to_string(),
                sort_type: ComparisonSortType::AbsDelta,
                desc: true,
            }],
            aliases: vec![MeasureAlias {
                name: "measure_0".to_string(),
                kind: ComparisonSortType::ComparisonValue,
                alias: "m0_prev".to_string(),
            }],
            limit: Some(250),
            offset: None,
            exact: false,
            priority: 0,
        }
    }

    #[test]
    fn expands_measures_into_four_columns() {
        let q = comparison_toplist_query(&request()).unwrap();
        let names: Vec<&str> = q.measures.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "measure_0",
                "measure_0__previous",
                "measure_0__delta_abs",
                "measure_0__delta_rel"
            ]
        );
        assert_eq!(q.sort, vec![Sort::desc("measure_0__delta_abs")]);
        assert_eq!(q.having, Some(Expression::gt("measure_0__previous", 0)));
        assert!(!q.exact);
    }

    #[test]
    fn rejects_mixed_or_missing_sorts() {
        let mut mixed = request();
        mixed.sort.push(ComparisonSort {
            name: "measure_0".to_string(),
            sort_type: ComparisonSortType::BaseValue,
            desc: false,
        });
        assert!(matches!(
            comparison_toplist_query(&mixed),
            Err(MetricsError::Validation(_))
        ));

        let mut none = request();
        none.sort.clear();
        assert!(matches!(
            comparison_toplist_query(&none),
            Err(MetricsError::Validation(_))
        ));
    }

    #[test]
    fn base_only_without_comparison_range() {
        let mut r = request();
        r.comparison_time_range = None;
        assert!(matches!(
            comparison_toplist_query(&r),
            Err(MetricsError::Validation(_))
        ));

        r.sort[0].sort_type = ComparisonSortType::BaseValue;
        r.aliases.clear();
        r.having = None;
        let q = comparison_toplist_query(&r).unwrap();
        assert_eq!(q.measures.len(), 1);
        assert!(q.comparison_time_range.is_none());
    }

    #[test]
    fn plain_toplist_groups_by_one_dimension() {
        let q = toplist_query(&ToplistQuery {
            metrics_view: "ad_bids_metrics".to_string(),
            dimension: "pub".to_string(),
            measures: vec!["count".to_string()],
            time_range: None,
            where_clause: Some(Expression::like("pub", "%c%")),
            filter: None,
            having: None,
            sort: vec![Sort::asc("pub")],
            limit: None,
            offset: None,
            priority: 1,
        });
        assert_eq!(q.dimensions, vec![DimensionRef::new("pub")]);
        assert_eq!(q.measures, vec![MeasureRef::new("count")]);
        assert_eq!(q.priority, 1);
    }
}
