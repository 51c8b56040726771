//! DuckDB dialect implementation.

use crate::error::Result;
use crate::sql_ast::{Fragment, SqlArg};
use crate::time::{CalendarSettings, TimeGrain};

use super::{calendar_shift, is_utc, Capabilities, Dialect, DialectKind};

static CAPABILITIES: Capabilities = Capabilities {
    ilike: true,
    unnest: true,
    pivot: true,
    temp_tables: true,
    nulls_last: true,
    any_value_passthrough: false,
    dimension_discovery: false,
    calendar_shift: true,
    time_offsets: true,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct DuckDbDialect;

impl Dialect for DuckDbDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::DuckDb
    }

    fn capabilities(&self) -> &'static Capabilities {
        &CAPABILITIES
    }

    fn date_trunc(
        &self,
        expr: &Fragment,
        grain: TimeGrain,
        time_zone: Option<&str>,
        calendar: CalendarSettings,
    ) -> Result<Fragment> {
        let specifier = grain.as_str().to_uppercase();
        let shift = calendar_shift(grain, calendar);
        let mut out = Fragment::default();

        match time_zone.filter(|tz| !is_utc(Some(*tz))) {
            None => {
                out.push_sql(&format!("date_trunc('{specifier}', "));
                out.push(expr).push_sql("::TIMESTAMP");
                match shift {
                    Some((n, unit)) => {
                        out.push_sql(&format!(
                            " + INTERVAL {n} {unit})::TIMESTAMP - INTERVAL {n} {unit}"
                        ));
                    }
                    None => {
                        out.push_sql(")::TIMESTAMP");
                    }
                }
            }
            Some(tz) if grain.is_calendar() => {
                // Truncate on the local wall clock, then map back to an instant.
                out.push_sql("timezone(")
                    .push_arg(SqlArg::from(tz))
                    .push_sql(&format!(", date_trunc('{specifier}', timezone("))
                    .push_arg(SqlArg::from(tz))
                    .push_sql(", ")
                    .push(expr)
                    .push_sql("::TIMESTAMPTZ)");
                match shift {
                    Some((n, unit)) => {
                        out.push_sql(&format!(
                            " + INTERVAL {n} {unit}) - INTERVAL {n} {unit})::TIMESTAMP"
                        ));
                    }
                    None => {
                        out.push_sql("))::TIMESTAMP");
                    }
                }
            }
            Some(tz) => {
                out.push_sql(&format!("time_bucket(INTERVAL '1 {specifier}', "))
                    .push(expr)
                    .push_sql("::TIMESTAMPTZ, ")
                    .push_arg(SqlArg::from(tz))
                    .push_sql(")");
            }
        }
        Ok(out)
    }

    fn date_diff(&self, unit: TimeGrain, start: &Fragment, end: &Fragment) -> Fragment {
        let mut out = Fragment::raw(format!("date_diff('{}', ", unit.as_str()));
        out.push(start).push_sql(", ").push(end).push_sql(")");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col() -> Fragment {
        Fragment::raw("\"ts\"")
    }

    #[test]
    fn truncates_without_time_zone() {
        let got = DuckDbDialect
            .date_trunc(&col(), TimeGrain::Day, None, CalendarSettings::default())
            .unwrap();
        assert_eq!(got.sql, "date_trunc('DAY', \"ts\"::TIMESTAMP)::TIMESTAMP");
        assert!(got.args.is_empty());
    }

    #[test]
    fn truncates_shifted_week() {
        let got = DuckDbDialect
            .date_trunc(&col(), TimeGrain::Week, Some("UTC"), CalendarSettings::new(2, 1))
            .unwrap();
        assert_eq!(
            got.sql,
            "date_trunc('WEEK', \"ts\"::TIMESTAMP + INTERVAL 6 DAY)::TIMESTAMP - INTERVAL 6 DAY"
        );
    }

    #[test]
    fn binds_time_zone_as_arguments() {
        let got = DuckDbDialect
            .date_trunc(
                &col(),
                TimeGrain::Day,
                Some("Asia/Kathmandu"),
                CalendarSettings::default(),
            )
            .unwrap();
        assert_eq!(
            got.sql,
            "timezone(?, date_trunc('DAY', timezone(?, \"ts\"::TIMESTAMPTZ)))::TIMESTAMP"
        );
        assert_eq!(got.args.len(), 2);

        let hourly = DuckDbDialect
            .date_trunc(
                &col(),
                TimeGrain::Hour,
                Some("Asia/Kathmandu"),
                CalendarSettings::default(),
            )
            .unwrap();
        assert_eq!(
            hourly.sql,
            "time_bucket(INTERVAL '1 HOUR', \"ts\"::TIMESTAMPTZ, ?)"
        );
    }

    #[test]
    fn renders_date_diff() {
        let start = Fragment::new("?", vec![SqlArg::Int(0)]);
        let got = DuckDbDialect.date_diff(TimeGrain::Day, &start, &col());
        assert_eq!(got.sql, "date_diff('day', ?, \"ts\")");
        assert_eq!(got.args.len(), 1);
    }
}
