//! Timeframes and time points.
//!
//! A daily timeframe identifies rows by the `date` column; every intraday
//! timeframe identifies rows by the `timestamp` column.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::record::Value;

pub const DATE_COLUMN: &str = "date";
pub const TIMESTAMP_COLUMN: &str = "timestamp";

/// Bar granularity of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    Daily,
    Intraday { minutes: u32 },
}

impl Timeframe {
    pub fn minutes(n: u32) -> Self {
        Timeframe::Intraday { minutes: n }
    }

    pub fn is_intraday(&self) -> bool {
        matches!(self, Timeframe::Intraday { .. })
    }

    /// Distance between two consecutive grid points.
    pub fn step(&self) -> Duration {
        match self {
            Timeframe::Daily => Duration::days(1),
            Timeframe::Intraday { minutes } => Duration::minutes(i64::from(*minutes)),
        }
    }

    /// Column that carries time identity in datasets of this timeframe.
    pub fn time_column(&self) -> &'static str {
        match self {
            Timeframe::Daily => DATE_COLUMN,
            Timeframe::Intraday { .. } => TIMESTAMP_COLUMN,
        }
    }

    /// Interval in milliseconds, as the provider expects it. `None` for daily.
    pub fn interval_ms(&self) -> Option<u64> {
        match self {
            Timeframe::Daily => None,
            Timeframe::Intraday { minutes } => Some(u64::from(*minutes) * 60_000),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeframe::Daily => f.write_str("daily"),
            Timeframe::Intraday { minutes } if minutes % 60 == 0 => {
                write!(f, "{}hour", minutes / 60)
            }
            Timeframe::Intraday { minutes } => write!(f, "{minutes}minute"),
        }
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "daily" || s == "eod" {
            return Ok(Timeframe::Daily);
        }

        let (digits, multiplier) = if let Some(n) = s.strip_suffix("minute") {
            (n, 1)
        } else if let Some(n) = s.strip_suffix("min") {
            (n, 1)
        } else if let Some(n) = s.strip_suffix("hour") {
            (n, 60)
        } else {
            return Err(format!("unknown timeframe '{s}'"));
        };

        let n: u32 = digits
            .parse()
            .map_err(|_| format!("invalid interval in timeframe '{s}'"))?;
        if n == 0 {
            return Err(format!("timeframe '{s}' has a zero interval"));
        }
        Ok(Timeframe::Intraday {
            minutes: n * multiplier,
        })
    }
}

impl TryFrom<String> for Timeframe {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.to_string()
    }
}

/// A single daily date or intraday timestamp at which data may exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimePoint {
    Day(NaiveDate),
    Instant(NaiveDateTime),
}

impl TimePoint {
    pub fn date(&self) -> NaiveDate {
        match self {
            TimePoint::Day(d) => *d,
            TimePoint::Instant(t) => t.date(),
        }
    }

    /// Typed value stored in the time column.
    pub fn to_value(&self) -> Value {
        match self {
            TimePoint::Day(d) => Value::Date(*d),
            TimePoint::Instant(t) => Value::Timestamp(*t),
        }
    }

    /// Re-express this point at the granularity of `timeframe`.
    pub fn at_granularity(&self, timeframe: Timeframe) -> TimePoint {
        match (self, timeframe) {
            (TimePoint::Day(d), Timeframe::Intraday { .. }) => {
                TimePoint::Instant(d.and_time(NaiveTime::MIN))
            }
            (TimePoint::Instant(t), Timeframe::Daily) => TimePoint::Day(t.date()),
            _ => *self,
        }
    }
}

impl fmt::Display for TimePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimePoint::Day(d) => write!(f, "{d}"),
            TimePoint::Instant(t) => write!(f, "{}", t.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

/// Inclusive requested time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TimeRange {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self { start, end }
    }

    /// Range of dates, anchored at midnight on both ends.
    pub fn days(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start: start.and_time(NaiveTime::MIN),
            end: end.and_time(NaiveTime::MIN),
        }
    }

    /// Range covering every instant of the dates from `start` through `end`.
    pub fn whole_days(start: NaiveDate, end: NaiveDate) -> Self {
        let last = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN);
        Self {
            start: start.and_time(NaiveTime::MIN),
            end: end.and_time(last),
        }
    }
}
