//! Apache Druid dialect implementation.

use crate::error::Result;
use crate::sql_ast::Fragment;
use crate::time::{CalendarSettings, TimeGrain};

use super::{calendar_shift, Capabilities, Dialect, DialectKind};

static CAPABILITIES: Capabilities = Capabilities {
    ilike: false,
    unnest: false,
    pivot: false,
    temp_tables: false,
    nulls_last: false,
    any_value_passthrough: true,
    dimension_discovery: true,
    calendar_shift: true,
    time_offsets: true,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct DruidDialect;

fn period(grain: TimeGrain) -> &'static str {
    match grain {
        TimeGrain::Millisecond => "PT0.001S",
        TimeGrain::Second => "PT1S",
        TimeGrain::Minute => "PT1M",
        TimeGrain::Hour => "PT1H",
        TimeGrain::Day => "P1D",
        TimeGrain::Week => "P1W",
        TimeGrain::Month => "P1M",
        TimeGrain::Quarter => "P3M",
        TimeGrain::Year => "P1Y",
    }
}

impl Dialect for DruidDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Druid
    }

    fn capabilities(&self) -> &'static Capabilities {
        &CAPABILITIES
    }

    fn safe_divide(&self, numerator: &str, denominator: &str) -> String {
        format!("SAFE_DIVIDE({numerator}, CAST({denominator} AS DOUBLE))")
    }

    fn date_trunc(
        &self,
        expr: &Fragment,
        grain: TimeGrain,
        time_zone: Option<&str>,
        calendar: CalendarSettings,
    ) -> Result<Fragment> {
        let tz = self.string_literal(time_zone.filter(|t| !t.is_empty()).unwrap_or("UTC"));
        let floor_period = period(grain);
        let mut out = Fragment::default();
        match calendar_shift(grain, calendar) {
            None => {
                out.push_sql("TIME_FLOOR(")
                    .push(expr)
                    .push_sql(&format!(", '{floor_period}', NULL, {tz})"));
            }
            Some((n, unit)) => {
                let step = if unit == "DAY" { "P1D" } else { "P1M" };
                out.push_sql("TIME_SHIFT(TIME_FLOOR(TIME_SHIFT(")
                    .push(expr)
                    .push_sql(&format!(
                        ", '{step}', {n}, {tz}), '{floor_period}', NULL, {tz}), '{step}', -{n}, {tz})"
                    ));
            }
        }
        Ok(out)
    }

    fn date_diff(&self, unit: TimeGrain, start: &Fragment, end: &Fragment) -> Fragment {
        let mut out = Fragment::raw(format!("TIMESTAMPDIFF({}, ", unit.as_str().to_uppercase()));
        out.push(start).push_sql(", ").push(end).push_sql(")");
        out
    }
}
