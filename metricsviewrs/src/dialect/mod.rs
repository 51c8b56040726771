//! SQL dialects for the supported OLAP engines.
//!
//! Each engine is a zero-sized type implementing [`Dialect`], paired with an
//! immutable [`Capabilities`] value. Builders consult the capabilities and call
//! the rendering hooks; nothing else in the crate branches on the engine.

use serde::{Deserialize, Serialize};

use crate::error::{MetricsError, Result};
use crate::sql_ast::Fragment;
use crate::time::{CalendarSettings, TimeGrain};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialectKind {
    #[serde(rename = "duckdb")]
    DuckDb,
    Druid,
    #[serde(rename = "clickhouse")]
    ClickHouse,
    Pinot,
}

impl DialectKind {
    pub fn dialect(self) -> &'static dyn Dialect {
        match self {
            DialectKind::DuckDb => &DuckDbDialect,
            DialectKind::Druid => &DruidDialect,
            DialectKind::ClickHouse => &ClickHouseDialect,
            DialectKind::Pinot => &PinotDialect,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DialectKind::DuckDb => "duckdb",
            DialectKind::Druid => "druid",
            DialectKind::ClickHouse => "clickhouse",
            DialectKind::Pinot => "pinot",
        }
    }
}

/// Static facts about an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Case-insensitive `ILIKE`.
    pub ilike: bool,
    /// Array columns can be unnested with `LATERAL UNNEST` and filtered with list functions.
    pub unnest: bool,
    /// Native `PIVOT` statement.
    pub pivot: bool,
    /// Cheap connection-scoped temporary tables.
    pub temp_tables: bool,
    /// Deterministic null ordering with `NULLS LAST`.
    pub nulls_last: bool,
    /// Columns threaded through a join must be wrapped in `ANY_VALUE` and grouped.
    pub any_value_passthrough: bool,
    /// Comparison joins need the dimension values spliced in up front.
    pub dimension_discovery: bool,
    /// Week and year starts other than Monday/January.
    pub calendar_shift: bool,
    /// Offset columns for comparison windows.
    pub time_offsets: bool,
}

pub trait Dialect: Send + Sync {
    fn kind(&self) -> DialectKind;

    fn capabilities(&self) -> &'static Capabilities;

    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn quote_table(&self, database: Option<&str>, schema: Option<&str>, table: &str) -> String {
        let mut parts = Vec::new();
        if let Some(db) = database.filter(|d| !d.is_empty()) {
            parts.push(self.quote_ident(db));
        }
        if let Some(schema) = schema.filter(|s| !s.is_empty()) {
            parts.push(self.quote_ident(schema));
        }
        parts.push(self.quote_ident(table));
        parts.join(".")
    }

    fn string_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    fn order_by(&self, expr: &str, desc: bool) -> String {
        let mut out = expr.to_string();
        if desc {
            out.push_str(" DESC");
        }
        if self.capabilities().nulls_last {
            out.push_str(" NULLS LAST");
        }
        out
    }

    fn safe_divide(&self, numerator: &str, denominator: &str) -> String {
        format!("CAST(({numerator}) AS DOUBLE)/({denominator})")
    }

    fn any_value(&self, expr: &str) -> String {
        format!("ANY_VALUE({expr})")
    }

    fn cast_to_string(&self, expr: &str) -> String {
        format!("CAST({expr} AS VARCHAR)")
    }

    /// `, LATERAL UNNEST(<expr>) <table>(<column>)` for engines with unnest support.
    fn unnest_clause(&self, expr: &str, table_alias: &str, column_alias: &str) -> Option<String> {
        if !self.capabilities().unnest {
            return None;
        }
        Some(format!(
            ", LATERAL UNNEST({expr}) {table_alias}({})",
            self.quote_ident(column_alias)
        ))
    }

    /// Truncates `expr` to `grain` in `time_zone` (UTC when `None`).
    fn date_trunc(
        &self,
        expr: &Fragment,
        grain: TimeGrain,
        time_zone: Option<&str>,
        calendar: CalendarSettings,
    ) -> Result<Fragment>;

    /// Signed number of `unit`s from `start` to `end`.
    fn date_diff(&self, unit: TimeGrain, start: &Fragment, end: &Fragment) -> Fragment;

    /// [`Dialect::date_trunc`], rejecting shifted calendars the engine cannot express.
    fn truncate_time(
        &self,
        expr: &Fragment,
        grain: TimeGrain,
        time_zone: Option<&str>,
        calendar: CalendarSettings,
    ) -> Result<Fragment> {
        if !self.capabilities().calendar_shift && calendar_shift(grain, calendar).is_some() {
            return Err(MetricsError::UnsupportedDialectFeature(format!(
                "custom first day of week or first month of year on {}",
                self.kind().as_str()
            )));
        }
        self.date_trunc(expr, grain, time_zone, calendar)
    }
}

/// Units added before truncating and subtracted afterwards so that week,
/// quarter and year buckets start on the configured day and month.
pub(crate) fn calendar_shift(grain: TimeGrain, calendar: CalendarSettings) -> Option<(u32, &'static str)> {
    let shift = match grain {
        TimeGrain::Week => ((8 - calendar.first_day_of_week) % 7, "DAY"),
        TimeGrain::Quarter => ((13 - calendar.first_month_of_year) % 3, "MONTH"),
        TimeGrain::Year => ((13 - calendar.first_month_of_year) % 12, "MONTH"),
        _ => (0, "DAY"),
    };
    if shift.0 == 0 {
        None
    } else {
        Some(shift)
    }
}

/// Time zone names that need no conversion.
pub(crate) fn is_utc(time_zone: Option<&str>) -> bool {
    matches!(time_zone, None | Some("") | Some("UTC") | Some("Etc/UTC"))
}

/// Unit used to measure offsets between truncated buckets.
pub(crate) fn offset_unit(grain: TimeGrain) -> TimeGrain {
    match grain {
        TimeGrain::Week => TimeGrain::Day,
        TimeGrain::Quarter | TimeGrain::Year => TimeGrain::Month,
        other => other,
    }
}

mod clickhouse;
mod druid;
mod duckdb;
mod pinot;

pub use clickhouse::ClickHouseDialect;
pub use druid::DruidDialect;
pub use duckdb::DuckDbDialect;
pub use pinot::PinotDialect;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_descriptors_are_distinct() {
        let duck = DialectKind::DuckDb.dialect().capabilities();
        let druid = DialectKind::Druid.dialect().capabilities();
        assert!(duck.ilike && duck.unnest && duck.pivot && duck.nulls_last);
        assert!(!druid.ilike && !druid.unnest && !druid.pivot);
        assert!(druid.any_value_passthrough && druid.dimension_discovery);
        assert!(!DialectKind::Pinot.dialect().capabilities().calendar_shift);
    }

    #[test]
    fn kinds_round_trip_through_the_registry() {
        for kind in [
            DialectKind::DuckDb,
            DialectKind::Druid,
            DialectKind::ClickHouse,
            DialectKind::Pinot,
        ] {
            assert_eq!(kind.dialect().kind(), kind);
        }
        let parsed: DialectKind = serde_json::from_str("\"clickhouse\"").unwrap();
        assert_eq!(parsed, DialectKind::ClickHouse);
    }

    #[test]
    fn escapes_identifiers_and_strings() {
        let d = DialectKind::DuckDb.dialect();
        assert_eq!(d.quote_ident("a\"b"), "\"a\"\"b\"");
        assert_eq!(d.string_literal("it's"), "'it''s'");
        assert_eq!(
            d.quote_table(Some("db"), None, "t"),
            "\"db\".\"t\""
        );
    }

    #[test]
    fn shifts_only_non_default_calendars() {
        let default = CalendarSettings::default();
        assert_eq!(calendar_shift(TimeGrain::Week, default), None);
        assert_eq!(calendar_shift(TimeGrain::Year, default), None);
        let custom = CalendarSettings::new(2, 2);
        assert_eq!(calendar_shift(TimeGrain::Week, custom), Some((6, "DAY")));
        assert_eq!(calendar_shift(TimeGrain::Quarter, custom), Some((2, "MONTH")));
        assert_eq!(calendar_shift(TimeGrain::Year, custom), Some((11, "MONTH")));
        assert_eq!(calendar_shift(TimeGrain::Day, custom), None);
    }

    #[test]
    fn orders_nulls_last_only_where_supported() {
        assert_eq!(
            DialectKind::DuckDb.dialect().order_by("\"x\"", true),
            "\"x\" DESC NULLS LAST"
        );
        assert_eq!(DialectKind::Druid.dialect().order_by("\"x\"", false), "\"x\"");
    }
}
