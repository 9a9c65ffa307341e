//! Calendar helpers shared by the query builder and the analysis engines:
//! granularity bucketing, inclusive date ranges, and ISO-8601 durations.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Duration, Months, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{DrilldownError, DrilldownResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Second,
    Minute,
    Hour,
    #[default]
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Second => "second",
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
            Granularity::Quarter => "quarter",
            Granularity::Year => "year",
        }
    }

    /// Start of the period containing `date`. Sub-day granularities bucket
    /// by calendar day; weeks start on Monday.
    pub fn truncate(&self, date: NaiveDate) -> NaiveDate {
        match self {
            Granularity::Second | Granularity::Minute | Granularity::Hour | Granularity::Day => {
                date
            }
            Granularity::Week => {
                date - Duration::days(date.weekday().num_days_from_monday() as i64)
            }
            Granularity::Month => first_of_month(date.year(), date.month()),
            Granularity::Quarter => first_of_month(date.year(), ((date.month() - 1) / 3) * 3 + 1),
            Granularity::Year => first_of_month(date.year(), 1),
        }
    }

    /// Whole periods from `from` to `to`, after bucketing both dates.
    pub fn periods_between(&self, from: NaiveDate, to: NaiveDate) -> i64 {
        let from = self.truncate(from);
        let to = self.truncate(to);
        match self {
            Granularity::Second | Granularity::Minute | Granularity::Hour | Granularity::Day => {
                (to - from).num_days()
            }
            Granularity::Week => (to - from).num_days() / 7,
            Granularity::Month => month_index(to) - month_index(from),
            Granularity::Quarter => (month_index(to) - month_index(from)) / 3,
            Granularity::Year => (to.year() - from.year()) as i64,
        }
    }

    /// Moves `date` by `n` periods (negative moves backwards).
    pub fn advance(&self, date: NaiveDate, n: i64) -> Option<NaiveDate> {
        match self {
            Granularity::Second | Granularity::Minute | Granularity::Hour | Granularity::Day => {
                date.checked_add_signed(Duration::days(n))
            }
            Granularity::Week => date.checked_add_signed(Duration::weeks(n)),
            Granularity::Month => shift_months(date, n),
            Granularity::Quarter => shift_months(date, n * 3),
            Granularity::Year => shift_months(date, n * 12),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn first_of_month(year: i32, month: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MIN)
}

fn month_index(date: NaiveDate) -> i64 {
    date.year() as i64 * 12 + date.month0() as i64
}

fn shift_months(date: NaiveDate, n: i64) -> Option<NaiveDate> {
    let months = Months::new(u32::try_from(n.unsigned_abs()).ok()?);
    if n >= 0 {
        date.checked_add_months(months)
    } else {
        date.checked_sub_months(months)
    }
}

/// Reads the calendar date out of a result cell such as `"2024-01-31"` or
/// `"2024-01-31T00:00:00.000"`.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let head = raw.get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

/// Inclusive calendar range, serialized as `["start", "end"]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange(pub NaiveDate, pub NaiveDate);

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> DrilldownResult<Self> {
        if end < start {
            return Err(DrilldownError::DateRange(format!(
                "{end} is before {start}"
            )));
        }
        Ok(Self(start, end))
    }

    /// Builds a range from the two leading values of an `inDateRange` filter.
    pub fn from_values(values: &[String]) -> DrilldownResult<Self> {
        match values {
            [start, end, ..] => {
                let start = parse_date(start)
                    .ok_or_else(|| DrilldownError::DateRange(format!("bad start {start}")))?;
                let end = parse_date(end)
                    .ok_or_else(|| DrilldownError::DateRange(format!("bad end {end}")))?;
                Self::new(start, end)
            }
            _ => Err(DrilldownError::DateRange(format!(
                "expected 2 values, got {}",
                values.len()
            ))),
        }
    }

    pub fn start(&self) -> NaiveDate {
        self.0
    }

    pub fn end(&self) -> NaiveDate {
        self.1
    }

    /// Inclusive number of days covered.
    pub fn days(&self) -> i64 {
        (self.1 - self.0).num_days() + 1
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.0 <= date && date <= self.1
    }

    /// The range of identical day count ending the day before this one starts.
    pub fn prior_period(&self) -> Self {
        let prior_end = self.0 - Duration::days(1);
        let prior_start = prior_end - Duration::days(self.days() - 1);
        Self(prior_start, prior_end)
    }

    /// Pushes the end out by `periods` periods of `granularity`.
    pub fn extend_by(&self, granularity: Granularity, periods: u32) -> Self {
        let end = granularity
            .advance(self.1, periods as i64)
            .unwrap_or(self.1);
        Self(self.0, end)
    }

    pub fn to_values(&self) -> Vec<String> {
        vec![self.0.to_string(), self.1.to_string()]
    }
}

/// ISO-8601 duration (`P1Y2M3W4DT5H6M7S`). Only integer components are
/// accepted.
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
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    /// Approximate length, counting months as 30 days and years as 365.
    pub fn approx(&self) -> Duration {
        Duration::days(self.years as i64 * 365 + self.months as i64 * 30)
            + Duration::weeks(self.weeks as i64)
            + Duration::days(self.days as i64)
            + Duration::hours(self.hours as i64)
            + Duration::minutes(self.minutes as i64)
            + Duration::seconds(self.seconds as i64)
    }
}

impl FromStr for IsoDuration {
    type Err = DrilldownError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || DrilldownError::Duration(s.to_string());
        let body = s.strip_prefix('P').ok_or_else(bad)?;
        if body.is_empty() {
            return Err(bad());
        }

        let mut out = IsoDuration::default();
        let mut in_time = false;
        let mut digits = String::new();
        let mut seen_component = false;
        let mut last_rank = 0u8;

        for ch in body.chars() {
            if ch.is_ascii_digit() {
                digits.push(ch);
                continue;
            }
            if ch == 'T' {
                if in_time || !digits.is_empty() {
                    return Err(bad());
                }
                in_time = true;
                continue;
            }
            let value: u32 = digits.parse().map_err(|_| bad())?;
            digits.clear();
            let (slot, rank) = match (in_time, ch) {
                (false, 'Y') => (&mut out.years, 1),
                (false, 'M') => (&mut out.months, 2),
                (false, 'W') => (&mut out.weeks, 3),
                (false, 'D') => (&mut out.days, 4),
                (true, 'H') => (&mut out.hours, 5),
                (true, 'M') => (&mut out.minutes, 6),
                (true, 'S') => (&mut out.seconds, 7),
                _ => return Err(bad()),
            };
            // components must appear in canonical order, each at most once
            if rank <= last_rank {
                return Err(bad());
            }
            last_rank = rank;
            *slot = value;
            seen_component = true;
        }

        if !digits.is_empty() || !seen_component || (in_time && last_rank < 5) {
            return Err(bad());
        }
        Ok(out)
    }
}

impl fmt::Display for IsoDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("P")?;
        for (value, unit) in [
            (self.years, 'Y'),
            (self.months, 'M'),
            (self.weeks, 'W'),
            (self.days, 'D'),
        ] {
            if value > 0 {
                write!(f, "{value}{unit}")?;
            }
        }
        if self.hours > 0 || self.minutes > 0 || self.seconds > 0 {
            f.write_str("T")?;
            for (value, unit) in [(self.hours, 'H'), (self.minutes, 'M'), (self.seconds, 'S')] {
                if value > 0 {
                    write!(f, "{value}{unit}")?;
                }
            }
        }
        if self.is_zero() {
            f.write_str("T0S")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_prior_period_full_month() {
        let range = DateRange::new(d("2024-01-01"), d("2024-01-31")).unwrap();
        let prior = range.prior_period();
        assert_eq!(prior, DateRange(d("2023-12-01"), d("2023-12-31")));
    }

    #[test]
    fn test_prior_period_uses_exact_day_count() {
        // 29 days of February 2024 map onto the 29 days ending Jan 31
        let range = DateRange::new(d("2024-02-01"), d("2024-02-29")).unwrap();
        assert_eq!(range.prior_period(), DateRange(d("2024-01-03"), d("2024-01-31")));
    }

    #[test]
    fn test_reversed_range_rejected() {
        assert!(DateRange::new(d("2024-02-01"), d("2024-01-01")).is_err());
        assert!(DateRange::from_values(&["2024-01-01".into()]).is_err());
    }

    #[test]
    fn test_from_values_accepts_timestamps() {
        let range = DateRange::from_values(&[
            "2024-03-01T00:00:00.000".into(),
            "2024-03-07T23:59:59.999".into(),
        ])
        .unwrap();
        assert_eq!(range.days(), 7);
    }

    #[test]
    fn test_granularity_truncate() {
        let date = d("2024-05-16"); // Thursday
        assert_eq!(Granularity::Week.truncate(date), d("2024-05-13"));
        assert_eq!(Granularity::Month.truncate(date), d("2024-05-01"));
        assert_eq!(Granularity::Quarter.truncate(date), d("2024-04-01"));
        assert_eq!(Granularity::Year.truncate(date), d("2024-01-01"));
        assert_eq!(Granularity::Hour.truncate(date), date);
    }

    #[test]
    fn test_periods_between() {
        assert_eq!(Granularity::Day.periods_between(d("2024-01-30"), d("2024-02-02")), 3);
        assert_eq!(Granularity::Week.periods_between(d("2024-01-01"), d("2024-01-15")), 2);
        assert_eq!(Granularity::Month.periods_between(d("2023-11-20"), d("2024-02-01")), 3);
        assert_eq!(Granularity::Quarter.periods_between(d("2024-01-05"), d("2024-07-01")), 2);
        assert_eq!(Granularity::Month.periods_between(d("2024-03-01"), d("2024-01-01")), -2);
    }

    #[test]
    fn test_advance_months() {
        assert_eq!(Granularity::Month.advance(d("2024-01-31"), 1), Some(d("2024-02-29")));
        assert_eq!(Granularity::Quarter.advance(d("2024-04-01"), -1), Some(d("2024-01-01")));
    }

    #[test]
    fn test_iso_duration_parse() {
        let dur: IsoDuration = "P7D".parse().unwrap();
        assert_eq!(dur.days, 7);
        assert_eq!(dur.approx(), Duration::days(7));

        let dur: IsoDuration = "P1DT12H".parse().unwrap();
        assert_eq!(dur.approx(), Duration::hours(36));
        assert_eq!(dur.to_string(), "P1DT12H");

        let dur: IsoDuration = "PT30M".parse().unwrap();
        assert_eq!(dur.minutes, 30);
    }

    #[test]
    fn test_iso_duration_rejects_malformed() {
        for raw in ["", "P", "PT", "7D", "P7", "PD", "P1H", "PT1D", "P1D1D", "P1M1Y", "P1DT"] {
            assert!(raw.parse::<IsoDuration>().is_err(), "{raw} should be rejected");
        }
    }
}
