//! Time grains, ISO-8601 durations and time-range resolution.
//!
//! All arithmetic happens in the requested timezone and is converted back to
//! UTC at the end, so calendar units (days, weeks, months) follow local wall
//! clocks and DST transitions.

use chrono::{
    DateTime, Datelike, Days, Duration as ChronoDuration, LocalResult, Months, NaiveDate,
    NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{MetricsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeGrain {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl TimeGrain {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeGrain::Millisecond => "millisecond",
            TimeGrain::Second => "second",
            TimeGrain::Minute => "minute",
            TimeGrain::Hour => "hour",
            TimeGrain::Day => "day",
            TimeGrain::Week => "week",
            TimeGrain::Month => "month",
            TimeGrain::Quarter => "quarter",
            TimeGrain::Year => "year",
        }
    }

    /// Grains of a day or coarser are truncated on the local calendar.
    pub fn is_calendar(&self) -> bool {
        *self >= TimeGrain::Day
    }
}

/// A time window as supplied by the caller.
///
/// At most two of `start`, `end` and `iso_duration` may be given.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub iso_duration: Option<String>,
    pub iso_offset: Option<String>,
    pub round_to_grain: Option<TimeGrain>,
    pub time_zone: Option<String>,
}

impl TimeRange {
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start.is_none()
            && self.end.is_none()
            && self.iso_duration.is_none()
            && self.iso_offset.is_none()
    }
}

/// Absolute bounds of a resolved window. The window is half-open: `[start, end)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolvedTimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// Calendar settings that shape week, quarter and year boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarSettings {
    /// 1 = Monday .. 7 = Sunday.
    pub first_day_of_week: u32,
    /// 1 = January .. 12 = December.
    pub first_month_of_year: u32,
}

impl Default for CalendarSettings {
    fn default() -> Self {
        Self {
            first_day_of_week: 1,
            first_month_of_year: 1,
        }
    }
}

impl CalendarSettings {
    /// Out-of-range values fall back to Monday and January.
    pub fn new(first_day_of_week: u32, first_month_of_year: u32) -> Self {
        Self {
            first_day_of_week: if (1..=7).contains(&first_day_of_week) {
                first_day_of_week
            } else {
                1
            },
            first_month_of_year: if (1..=12).contains(&first_month_of_year) {
                first_month_of_year
            } else {
                1
            },
        }
    }
}

/// Parses an IANA timezone name. An empty name means UTC.
pub fn parse_time_zone(name: Option<&str>) -> Result<Tz> {
    match name {
        None => Ok(Tz::UTC),
        Some(n) if n.is_empty() => Ok(Tz::UTC),
        Some(n) => n
            .parse::<Tz>()
            .map_err(|_| MetricsError::Validation(format!("invalid time zone {n:?}"))),
    }
}

/// A parsed ISO-8601 duration such as `P1Y2M`, `P2W` or `PT12H30M`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IsoDuration {
    pub years: u32,
    pub months: u32,
    pub weeks: u32,
    pub days: u32,
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
}

impl IsoDuration {
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = || MetricsError::Validation(format!("invalid ISO 8601 duration {input:?}"));
        let rest = input.strip_prefix('P').ok_or_else(invalid)?;
        if rest.is_empty() {
            return Err(invalid());
        }

        let mut duration = IsoDuration::default();
        let mut in_time = false;
        let mut digits = String::new();
        let mut seen_component = false;
        for ch in rest.chars() {
            match ch {
                '0'..='9' => digits.push(ch),
                'T' if !in_time && digits.is_empty() => in_time = true,
                unit => {
                    let value: u32 = digits.parse().map_err(|_| invalid())?;
                    digits.clear();
                    let slot = match (in_time, unit) {
                        (false, 'Y') => &mut duration.years,
                        (false, 'M') => &mut duration.months,
                        (false, 'W') => &mut duration.weeks,
                        (false, 'D') => &mut duration.days,
                        (true, 'H') => &mut duration.hours,
                        (true, 'M') => &mut duration.minutes,
                        (true, 'S') => &mut duration.seconds,
                        _ => return Err(invalid()),
                    };
                    *slot = value;
                    seen_component = true;
                }
            }
        }
        if !digits.is_empty() || !seen_component {
            return Err(invalid());
        }
        duration.total_months().ok_or_else(invalid)?;
        Ok(duration)
    }

    /// Years and months as a single month count, if it fits.
    fn total_months(&self) -> Option<u32> {
        self.years.checked_mul(12)?.checked_add(self.months)
    }

    pub fn add(&self, t: DateTime<Utc>, tz: Tz) -> Result<DateTime<Utc>> {
        self.shift(t, tz, true)
    }

    pub fn sub(&self, t: DateTime<Utc>, tz: Tz) -> Result<DateTime<Utc>> {
        self.shift(t, tz, false)
    }

    fn shift(&self, t: DateTime<Utc>, tz: Tz, forward: bool) -> Result<DateTime<Utc>> {
        let overflow = || MetricsError::Validation("time range out of bounds".to_string());
        let mut local = t.with_timezone(&tz).naive_local();

        let months = Months::new(self.total_months().ok_or_else(overflow)?);
        let days = Days::new(u64::from(self.weeks) * 7 + u64::from(self.days));
        local = if forward {
            local.checked_add_months(months).and_then(|l| l.checked_add_days(days))
        } else {
            local.checked_sub_months(months).and_then(|l| l.checked_sub_days(days))
        }
        .ok_or_else(overflow)?;

        let utc = from_local(tz, local)?;
        let clock = ChronoDuration::hours(i64::from(self.hours))
            + ChronoDuration::minutes(i64::from(self.minutes))
            + ChronoDuration::seconds(i64::from(self.seconds));
        let shifted = if forward {
            utc.checked_add_signed(clock)
        } else {
            utc.checked_sub_signed(clock)
        };
        shifted.ok_or_else(overflow)
    }
}

/// Truncates `t` to the start of its `grain` bucket in `tz`.
pub fn truncate(
    t: DateTime<Utc>,
    grain: TimeGrain,
    tz: Tz,
    calendar: CalendarSettings,
) -> Result<DateTime<Utc>> {
    let local = t.with_timezone(&tz).naive_local();
    let date = local.date();
    let time = local.time();

    let truncated = match grain {
        TimeGrain::Millisecond => {
            let nanos = time.nanosecond() - time.nanosecond() % 1_000_000;
            local.with_nanosecond(nanos).unwrap_or(local)
        }
        TimeGrain::Second => at(date, time.hour(), time.minute(), time.second()),
        TimeGrain::Minute => at(date, time.hour(), time.minute(), 0),
        TimeGrain::Hour => at(date, time.hour(), 0, 0),
        TimeGrain::Day => date.and_time(NaiveTime::MIN),
        TimeGrain::Week => {
            let first = calendar.first_day_of_week % 7;
            let weekday = (7 + date.weekday().num_days_from_sunday() - first) % 7;
            date.checked_sub_days(Days::new(u64::from(weekday)))
                .unwrap_or(date)
                .and_time(NaiveTime::MIN)
        }
        TimeGrain::Month => first_of_month(date.year(), date.month())?,
        TimeGrain::Quarter => {
            let month = first_of_month(date.year(), date.month())?;
            let back = (date.month() as i32 - calendar.first_month_of_year as i32).rem_euclid(3);
            month
                .checked_sub_months(Months::new(back as u32))
                .unwrap_or(month)
        }
        TimeGrain::Year => {
            let year = if date.month() < calendar.first_month_of_year {
                date.year() - 1
            } else {
                date.year()
            };
            first_of_month(year, calendar.first_month_of_year)?
        }
    };

    from_local(tz, truncated)
}

/// Resolves a caller's time range to absolute UTC bounds.
///
/// `anchor` stands in for the missing bound when only a duration is given
/// (typically the latest timestamp in the data).
pub fn resolve_time_range(
    range: &TimeRange,
    default_tz: Tz,
    calendar: CalendarSettings,
    anchor: Option<DateTime<Utc>>,
) -> Result<ResolvedTimeRange> {
    if range.start.is_some() && range.end.is_some() && range.iso_duration.is_some() {
        return Err(MetricsError::Validation(
            "only two of start, end and iso_duration can be specified".to_string(),
        ));
    }

    let tz = match range.time_zone.as_deref() {
        Some(name) => parse_time_zone(Some(name))?,
        None => default_tz,
    };

    let mut start = range.start;
    let mut end = range.end;
    let mut relative = false;

    if let Some(iso) = &range.iso_duration {
        let duration = IsoDuration::parse(iso)?;
        match (start, end) {
            (Some(s), _) => end = Some(duration.add(s, tz)?),
            (None, Some(e)) => start = Some(duration.sub(e, tz)?),
            (None, None) => {
                let e = anchor.ok_or_else(|| {
                    MetricsError::Validation(
                        "iso_duration requires start, end or a known latest timestamp".to_string(),
                    )
                })?;
                end = Some(e);
                start = Some(duration.sub(e, tz)?);
            }
        }
        relative = true;
    }

    if let Some(iso) = &range.iso_offset {
        let offset = IsoDuration::parse(iso)?;
        start = start.map(|s| offset.sub(s, tz)).transpose()?;
        end = end.map(|e| offset.sub(e, tz)).transpose()?;
        relative = true;
    }

    if relative {
        if let Some(grain) = range.round_to_grain {
            start = start.map(|s| truncate(s, grain, tz, calendar)).transpose()?;
            end = end.map(|e| truncate(e, grain, tz, calendar)).transpose()?;
        }
    }

    Ok(ResolvedTimeRange { start, end })
}

fn at(date: NaiveDate, hour: u32, minute: u32, second: u32) -> NaiveDateTime {
    date.and_time(NaiveTime::from_hms_opt(hour, minute, second).unwrap_or(NaiveTime::MIN))
}

fn first_of_month(year: i32, month: u32) -> Result<NaiveDateTime> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .map(|d| d.and_time(NaiveTime::MIN))
        .ok_or_else(|| MetricsError::Validation(format!("invalid date {year}-{month}-01")))
}

/// Maps a local wall-clock time back to UTC. Times skipped by a DST jump
/// resolve to the first valid instant after the gap.
fn from_local(tz: Tz, local: NaiveDateTime) -> Result<DateTime<Utc>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(t) => Ok(t.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Ok(earliest.with_timezone(&Utc)),
        LocalResult::None => {
            let mut candidate = local;
            for _ in 0..4 {
                candidate += ChronoDuration::minutes(30);
                if let Some(t) = tz.from_local_datetime(&candidate).earliest() {
                    return Ok(t.with_timezone(&Utc));
                }
            }
            Err(MetricsError::Validation(format!(
                "local time {local} does not exist in {tz}"
            )))
        }
    }
}
