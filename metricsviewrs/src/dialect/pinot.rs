//! Apache Pinot dialect implementation.

use crate::error::Result;
use crate::sql_ast::Fragment;
use crate::time::{CalendarSettings, TimeGrain};

use super::{Capabilities, Dialect, DialectKind};

static CAPABILITIES: Capabilities = Capabilities {
    ilike: false,
    unnest: false,
    pivot: false,
    temp_tables: false,
    nulls_last: false,
    any_value_passthrough: false,
    dimension_discovery: false,
    calendar_shift: false,
    time_offsets: false,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct PinotDialect;

impl Dialect for PinotDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Pinot
    }

    fn capabilities(&self) -> &'static Capabilities {
        &CAPABILITIES
    }

    fn date_trunc(
        &self,
        expr: &Fragment,
        grain: TimeGrain,
        time_zone: Option<&str>,
        _calendar: CalendarSettings,
    ) -> Result<Fragment> {
        let tz = self.string_literal(time_zone.filter(|t| !t.is_empty()).unwrap_or("UTC"));
        let specifier = grain.as_str().to_uppercase();
        let mut out = Fragment::raw(format!("ToDateTime(date_trunc('{specifier}', "));
        out.push(expr).push_sql(&format!(
            ", 'MILLISECONDS', {tz}), 'yyyy-MM-dd''T''HH:mm:ss''Z''')"
        ));
        Ok(out)
    }

    fn date_diff(&self, unit: TimeGrain, start: &Fragment, end: &Fragment) -> Fragment {
        let mut out = Fragment::raw(format!("TIMESTAMPDIFF({}, ", unit.as_str().to_uppercase()));
        out.push(start).push_sql(", ").push(end).push_sql(")");
        out
    }
}
