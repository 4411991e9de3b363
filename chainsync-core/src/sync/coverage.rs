//! Which time points a persisted dataset already holds.
//!
//! Time values are normalized before comparison so storage format never
//! produces a false gap:
//! - Date / Datetime columns map directly; a datetime in a daily dataset
//!   maps to its date, a date in an intraday dataset maps to midnight.
//! - Strings are parsed with the layouts in `DATETIME_LAYOUTS`, then
//!   `DATE_LAYOUTS`.
//! - Integers are `YYYYMMDD` in daily datasets and epoch milliseconds in
//!   intraday datasets.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use std::collections::BTreeSet;
use std::path::Path;

use crate::data::schema::column_values;
use crate::data::store::{read_frame, StoreError};
use crate::domain::{TimePoint, Timeframe, Value};

const DATE_LAYOUTS: [&str; 2] = ["%Y-%m-%d", "%Y%m%d"];
const DATETIME_LAYOUTS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y%m%d%H%M",
];

fn parse_time_str(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    DATETIME_LAYOUTS
        .iter()
        .find_map(|layout| NaiveDateTime::parse_from_str(s, layout).ok())
        .or_else(|| {
            DATE_LAYOUTS
                .iter()
                .find_map(|layout| NaiveDate::parse_from_str(s, layout).ok())
                .map(|d| d.and_time(NaiveTime::MIN))
        })
}

fn yyyymmdd(n: i64) -> Option<NaiveDate> {
    let n = i32::try_from(n).ok()?;
    NaiveDate::from_ymd_opt(n / 10_000, (n / 100 % 100) as u32, (n % 100) as u32)
}

/// Canonical time point of one time-column cell. `Ok(None)` for nulls.
pub fn normalize_time_value(
    column: &str,
    value: &Value,
    timeframe: Timeframe,
) -> Result<Option<TimePoint>, StoreError> {
    let instant = match value {
        Value::Null => return Ok(None),
        Value::Date(d) => Some(d.and_time(NaiveTime::MIN)),
        Value::Timestamp(t) => Some(*t),
        Value::Str(s) => parse_time_str(s),
        Value::Int(n) => match timeframe {
            Timeframe::Daily => yyyymmdd(*n).map(|d| d.and_time(NaiveTime::MIN)),
            Timeframe::Intraday { .. } => {
                DateTime::from_timestamp_millis(*n).map(|dt| dt.naive_utc())
            }
        },
        Value::Bool(_) | Value::Float(_) => None,
    };

    let instant = instant.ok_or_else(|| StoreError::UnparseableTime {
        column: column.to_string(),
        value: format!("{value:?}"),
    })?;

    Ok(Some(
        TimePoint::Instant(instant).at_granularity(timeframe),
    ))
}

/// Time points present in the dataset at `path`.
///
/// A missing file and a file with zero rows both mean "no coverage yet".
pub fn existing_points(path: &Path, timeframe: Timeframe) -> Result<BTreeSet<TimePoint>, StoreError> {
    let Some(df) = read_frame(path)? else {
        return Ok(BTreeSet::new());
    };
    if df.height() == 0 {
        return Ok(BTreeSet::new());
    }

    let column_name = timeframe.time_column();
    let column = df
        .column(column_name)
        .map_err(|_| StoreError::MissingTimeColumn {
            path: path.to_path_buf(),
            column: column_name.to_string(),
        })?;

    let mut points = BTreeSet::new();
    for value in column_values(column)? {
        if let Some(p) = normalize_time_value(column_name, &value, timeframe)? {
            points.insert(p);
        }
    }
    Ok(points)
}

/// Latest point held by the dataset, if any.
pub fn latest_point(path: &Path, timeframe: Timeframe) -> Result<Option<TimePoint>, StoreError> {
    Ok(existing_points(path, timeframe)?.last().copied())
}
