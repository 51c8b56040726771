use crate::dialect::Dialect;
use crate::error::{MetricsError, Result};
use crate::query::{Query, Sort};

use super::components::{QueryContext, ResolvedDimension, ResolvedMeasure};

/// How to transpose the rows of an underlying grouped query.
#[derive(Debug, Clone, PartialEq)]
pub struct PivotSpec {
    /// Dimensions whose values become columns.
    pub on: Vec<String>,
    /// Dimensions that stay as row keys.
    pub keep: Vec<String>,
    /// Measures spread across the pivoted columns.
    pub using: Vec<String>,
    pub order_by: Vec<Sort>,
    /// Requested row limit on the pivoted result.
    pub limit: Option<u64>,
    pub cell_limit: u64,
    /// Columns per underlying row (dimensions plus measures).
    pub num_columns: u64,
    /// Rows per appender batch when pivoting outside the engine.
    pub batch_size: usize,
}

impl PivotSpec {
    /// Most underlying rows that fit in the cell budget.
    pub fn row_budget(&self) -> u64 {
        self.cell_limit / self.num_columns.max(1)
    }

    pub fn check_cells(&self, rows: u64) -> Result<()> {
        if rows.saturating_mul(self.num_columns) > self.cell_limit {
            return Err(MetricsError::CellLimitExceeded {
                limit: self.cell_limit,
            });
        }
        Ok(())
    }

    pub fn check_limit(&self, rows: u64) -> Result<()> {
        match self.limit {
            Some(limit) if rows > limit => Err(MetricsError::LimitExceeded { limit }),
            _ => Ok(()),
        }
    }

    /// `PIVOT <source> ON .. USING .. [GROUP BY ..] [ORDER BY ..] [LIMIT ..]`.
    ///
    /// The limit is one past the requested one so an overflowing result can be
    /// detected rather than silently cut.
    pub fn pivot_sql(&self, dialect: &dyn Dialect, source: &str) -> String {
        let on: Vec<String> = self.on.iter().map(|c| dialect.quote_ident(c)).collect();
        let using: Vec<String> = self
            .using
            .iter()
            .map(|m| {
                let q = dialect.quote_ident(m);
                format!("{} AS {q}", dialect.any_value(&q))
            })
            .collect();
        let mut sql = format!(
            "PIVOT {} ON {} USING {}",
            dialect.quote_ident(source),
            on.join(", "),
            using.join(", ")
        );
        if !self.keep.is_empty() {
            let keep: Vec<String> = self.keep.iter().map(|c| dialect.quote_ident(c)).collect();
            sql.push_str(&format!(" GROUP BY {}", keep.join(", ")));
        }
        if !self.order_by.is_empty() {
            let order: Vec<String> = self
                .order_by
                .iter()
                .map(|s| dialect.order_by(&dialect.quote_ident(&s.name), s.desc))
                .collect();
            sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit + 1));
        }
        sql
    }
}

/// Unique per-call name for materializing the underlying rows.
pub fn temp_table_name() -> String {
    format!("t{}", hex::encode(uuid::Uuid::new_v4().as_bytes()))
}

pub(super) fn pivot_spec(
    ctx: &QueryContext<'_>,
    query: &Query,
    dimensions: &[ResolvedDimension],
    measures: &[ResolvedMeasure],
) -> Result<PivotSpec> {
    let is_dim = |name: &str| dimensions.iter().any(|d| d.name == name);
    for name in &query.pivot_on {
        if !is_dim(name) {
            return Err(MetricsError::Validation(format!(
                "pivot field {name} is not a dimension of the query"
            )));
        }
    }
    let keep: Vec<String> = dimensions
        .iter()
        .filter(|d| !query.pivot_on.contains(&d.name))
        .map(|d| d.name.clone())
        .collect();
    for sort in &query.sort {
        if !keep.contains(&sort.name) {
            return Err(MetricsError::Validation(format!(
                "pivot queries can only sort by non-pivoted dimensions, got {}",
                sort.name
            )));
        }
    }
    Ok(PivotSpec {
        on: query.pivot_on.clone(),
        keep,
        using: measures.iter().map(|m| m.name.clone()).collect(),
        order_by: query.sort.clone(),
        limit: query.limit.filter(|l| *l > 0),
        cell_limit: ctx.options.pivot_cell_limit,
        num_columns: (dimensions.len() + measures.len()) as u64,
        batch_size: ctx.options.pivot_batch_size,
    })
}
