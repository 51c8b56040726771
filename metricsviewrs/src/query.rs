//! Request types accepted by the compile-and-run entry points.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::time::{TimeGrain, TimeRange};

/// Caller attributes used to evaluate security templates.
pub type SecurityAttributes = HashMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionRef {
    pub name: String,
    #[serde(default)]
    pub time_grain: Option<TimeGrain>,
    #[serde(default)]
    pub time_zone: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
}

impl DimensionRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            time_grain: None,
            time_zone: None,
            alias: None,
        }
    }

    pub fn time(name: impl Into<String>, grain: TimeGrain) -> Self {
        Self {
            time_grain: Some(grain),
            ..Self::new(name)
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn output_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// How a requested measure is computed. Absent means the view's own expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeasureCompute {
    Count,
    CountDistinct { dimension: String },
    ComparisonValue { measure: String },
    ComparisonDelta { measure: String },
    ComparisonRatio { measure: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureRef {
    pub name: String,
    #[serde(default)]
    pub compute: Option<MeasureCompute>,
    #[serde(default)]
    pub filter: Option<Expression>,
}

impl MeasureRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            compute: None,
            filter: None,
        }
    }

    pub fn computed(name: impl Into<String>, compute: MeasureCompute) -> Self {
        Self {
            compute: Some(compute),
            ..Self::new(name)
        }
    }

    pub fn filtered(name: impl Into<String>, filter: Expression) -> Self {
        Self {
            filter: Some(filter),
            ..Self::new(name)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub name: String,
    #[serde(default)]
    pub desc: bool,
}

impl Sort {
    pub fn asc(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            desc: false,
        }
    }

    pub fn desc(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            desc: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    Or,
    And,
    In,
    Nin,
    Like,
    Nlike,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub op: Operator,
    pub exprs: Vec<Expression>,
}

/// A filter or having predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expression {
    #[serde(rename = "name")]
    Identifier(String),
    Value(Value),
    Condition(Condition),
}

impl Expression {
    pub fn ident(name: impl Into<String>) -> Self {
        Expression::Identifier(name.into())
    }

    pub fn value(v: impl Into<Value>) -> Self {
        Expression::Value(v.into())
    }

    pub fn condition(op: Operator, exprs: Vec<Expression>) -> Self {
        Expression::Condition(Condition { op, exprs })
    }

    fn binary(op: Operator, name: &str, v: impl Into<Value>) -> Self {
        Self::condition(op, vec![Self::ident(name), Self::value(v)])
    }

    pub fn eq(name: &str, v: impl Into<Value>) -> Self {
        Self::binary(Operator::Eq, name, v)
    }

    pub fn neq(name: &str, v: impl Into<Value>) -> Self {
        Self::binary(Operator::Neq, name, v)
    }

    pub fn gt(name: &str, v: impl Into<Value>) -> Self {
        Self::binary(Operator::Gt, name, v)
    }

    pub fn lt(name: &str, v: impl Into<Value>) -> Self {
        Self::binary(Operator::Lt, name, v)
    }

    pub fn like(name: &str, pattern: &str) -> Self {
        Self::binary(Operator::Like, name, pattern)
    }

    pub fn not_like(name: &str, pattern: &str) -> Self {
        Self::binary(Operator::Nlike, name, pattern)
    }

    pub fn in_list(name: &str, values: Vec<Value>) -> Self {
        let mut exprs = vec![Self::ident(name)];
        exprs.extend(values.into_iter().map(Expression::Value));
        Self::condition(Operator::In, exprs)
    }

    pub fn not_in_list(name: &str, values: Vec<Value>) -> Self {
        let mut exprs = vec![Self::ident(name)];
        exprs.extend(values.into_iter().map(Expression::Value));
        Self::condition(Operator::Nin, exprs)
    }

    pub fn and(exprs: Vec<Expression>) -> Self {
        Self::condition(Operator::And, exprs)
    }

    pub fn or(exprs: Vec<Expression>) -> Self {
        Self::condition(Operator::Or, exprs)
    }

    /// ANDs the present expressions together.
    pub fn and_optional(exprs: Vec<Option<Expression>>) -> Option<Expression> {
        let mut present: Vec<Expression> = exprs.into_iter().flatten().collect();
        match present.len() {
            0 => None,
            1 => present.pop(),
            _ => Some(Self::and(present)),
        }
    }
}

/// Legacy include/exclude filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InlineFilter {
    pub include: Vec<FilterCondition>,
    pub exclude: Vec<FilterCondition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterCondition {
    pub name: String,
    #[serde(rename = "in")]
    pub in_values: Vec<Value>,
    pub like: Vec<String>,
}

impl InlineFilter {
    /// Each include condition ORs its own values; conditions are ANDed.
    /// Exclude conditions are negated and ANDed.
    pub fn to_expression(&self) -> Option<Expression> {
        let mut clauses: Vec<Expression> = self
            .include
            .iter()
            .filter_map(|c| {
                let mut exprs = c.to_expressions(false);
                match exprs.len() {
                    0 => None,
                    1 => exprs.pop(),
                    _ => Some(Expression::or(exprs)),
                }
            })
            .collect();
        clauses.extend(self.exclude.iter().flat_map(|c| c.to_expressions(true)));
        match clauses.len() {
            0 => None,
            1 => clauses.pop(),
            _ => Some(Expression::and(clauses)),
        }
    }
}

impl FilterCondition {
    fn to_expressions(&self, exclude: bool) -> Vec<Expression> {
        let mut out = Vec::new();
        if !self.in_values.is_empty() {
            out.push(if exclude {
                Expression::not_in_list(&self.name, self.in_values.clone())
            } else {
                Expression::in_list(&self.name, self.in_values.clone())
            });
        }
        for pattern in &self.like {
            out.push(if exclude {
                Expression::not_like(&self.name, pattern)
            } else {
                Expression::like(&self.name, pattern)
            });
        }
        out
    }
}

/// A grouped query over one metrics view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub metrics_view: String,
    #[serde(default)]
    pub dimensions: Vec<DimensionRef>,
    #[serde(default)]
    pub measures: Vec<MeasureRef>,
    #[serde(default, rename = "where")]
    pub where_clause: Option<Expression>,
    #[serde(default)]
    pub filter: Option<InlineFilter>,
    #[serde(default)]
    pub having: Option<Expression>,
    #[serde(default)]
    pub time_range: Option<TimeRange>,
    #[serde(default)]
    pub comparison_time_range: Option<TimeRange>,
    #[serde(default)]
    pub sort: Vec<Sort>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub pivot_on: Vec<String>,
    /// Exact comparisons use a full outer join; approximate ones pre-limit one side.
    pub exact: bool,
    #[serde(default)]
    pub time_zone: Option<String>,
    #[serde(default)]
    pub priority: i32,
}

impl Query {
    pub fn new(metrics_view: impl Into<String>) -> Self {
        Self {
            metrics_view: metrics_view.into(),
            dimensions: Vec::new(),
            measures: Vec::new(),
            where_clause: None,
            filter: None,
            having: None,
            time_range: None,
            comparison_time_range: None,
            sort: Vec::new(),
            limit: None,
            offset: None,
            pivot_on: Vec::new(),
            exact: false,
            time_zone: None,
            priority: 0,
        }
    }

    /// The user `where` ANDed with any legacy inline filter.
    pub fn effective_where(&self) -> Option<Expression> {
        Expression::and_optional(vec![
            self.where_clause.clone(),
            self.filter.as_ref().and_then(|f| f.to_expression()),
        ])
    }
}

/// Which column of a comparison toplist a sort or alias refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonSortType {
    BaseValue,
    ComparisonValue,
    AbsDelta,
    RelDelta,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonSort {
    pub name: String,
    pub sort_type: ComparisonSortType,
    #[serde(default)]
    pub desc: bool,
}

/// Lets `having` reference a comparison toplist column by a short name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasureAlias {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ComparisonSortType,
    pub alias: String,
}

/// Ranked values of a single dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToplistQuery {
    pub metrics_view: String,
    pub dimension: String,
    pub measures: Vec<String>,
    #[serde(default)]
    pub time_range: Option<TimeRange>,
    #[serde(default, rename = "where")]
    pub where_clause: Option<Expression>,
    #[serde(default)]
    pub filter: Option<InlineFilter>,
    #[serde(default)]
    pub having: Option<Expression>,
    #[serde(default)]
    pub sort: Vec<Sort>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub priority: i32,
}

/// A toplist joined against a comparison window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonToplistQuery {
    pub metrics_view: String,
    pub dimension: String,
    pub measures: Vec<String>,
    pub base_time_range: TimeRange,
    #[serde(default)]
    pub comparison_time_range: Option<TimeRange>,
    #[serde(default, rename = "where")]
    pub where_clause: Option<Expression>,
    #[serde(default)]
    pub filter: Option<InlineFilter>,
    #[serde(default)]
    pub having: Option<Expression>,
    pub sort: Vec<ComparisonSort>,
    #[serde(default)]
    pub aliases: Vec<MeasureAlias>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
    pub exact: bool,
    #[serde(default)]
    pub priority: i32,
}
