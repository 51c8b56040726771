//! ClickHouse dialect implementation.

use crate::error::Result;
use crate::sql_ast::Fragment;
use crate::time::{CalendarSettings, TimeGrain};

use super::{calendar_shift, Capabilities, Dialect, DialectKind};

static CAPABILITIES: Capabilities = Capabilities {
    ilike: true,
    unnest: false,
    pivot: false,
    temp_tables: false,
    nulls_last: true,
    any_value_passthrough: false,
    dimension_discovery: false,
    calendar_shift: true,
    time_offsets: true,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct ClickHouseDialect;

impl Dialect for ClickHouseDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::ClickHouse
    }

    fn capabilities(&self) -> &'static Capabilities {
        &CAPABILITIES
    }

    fn cast_to_string(&self, expr: &str) -> String {
        format!("toString({expr})")
    }

    fn date_trunc(
        &self,
        expr: &Fragment,
        grain: TimeGrain,
        time_zone: Option<&str>,
        calendar: CalendarSettings,
    ) -> Result<Fragment> {
        let specifier = grain.as_str();
        let tz = self.string_literal(time_zone.filter(|t| !t.is_empty()).unwrap_or("UTC"));
        let mut out = Fragment::raw(format!("date_trunc('{specifier}', "));
        out.push(expr);
        match calendar_shift(grain, calendar) {
            None => {
                out.push_sql(&format!(", {tz})"));
            }
            Some((n, unit)) => {
                out.push_sql(&format!(
                    " + INTERVAL {n} {unit}, {tz}) - INTERVAL {n} {unit}"
                ));
            }
        }
        Ok(out)
    }

    fn date_diff(&self, unit: TimeGrain, start: &Fragment, end: &Fragment) -> Fragment {
        let mut out = Fragment::raw(format!("dateDiff('{}', ", unit.as_str()));
        out.push(start).push_sql(", ").push(end).push_sql(")");
        out
    }
}
