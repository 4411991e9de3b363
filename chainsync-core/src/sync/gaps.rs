//! Gap resolution and fetch planning.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::domain::{FetchWindow, TimePoint, Timeframe};

/// How missing points are computed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Only points strictly after the latest existing point.
    #[default]
    Tail,
    /// Every expected point not already present, interior gaps included.
    FullGap,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Tail => f.write_str("tail"),
            SyncMode::FullGap => f.write_str("full_gap"),
        }
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "tail" => Ok(SyncMode::Tail),
            "full_gap" | "full" => Ok(SyncMode::FullGap),
            other => Err(format!("unknown sync mode '{other}' (expected tail or full_gap)")),
        }
    }
}

/// How missing points are grouped into provider requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchGranularity {
    /// One window per run of consecutive points.
    #[default]
    Contiguous,
    /// One window per calendar day.
    PerDay,
}

impl FromStr for FetchGranularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "contiguous" => Ok(FetchGranularity::Contiguous),
            "per_day" => Ok(FetchGranularity::PerDay),
            other => Err(format!(
                "unknown fetch granularity '{other}' (expected contiguous or per_day)"
            )),
        }
    }
}

/// Expected points absent from `existing`, ascending.
///
/// Both inputs must be at the same granularity.
pub fn missing<I>(expected: I, existing: &BTreeSet<TimePoint>, mode: SyncMode) -> Vec<TimePoint>
where
    I: IntoIterator<Item = TimePoint>,
{
    let latest = match mode {
        SyncMode::Tail => existing.last().copied(),
        SyncMode::FullGap => None,
    };

    let mut out: Vec<TimePoint> = expected
        .into_iter()
        .filter(|p| latest.map_or(true, |l| *p > l))
        .filter(|p| !existing.contains(p))
        .collect();
    out.sort_unstable();
    out.dedup();
    out
}

/// Group ascending missing points into request windows.
pub fn plan_windows(
    missing: &[TimePoint],
    timeframe: Timeframe,
    granularity: FetchGranularity,
) -> Vec<FetchWindow> {
    let step = timeframe.step();
    let mut windows: Vec<FetchWindow> = Vec::new();

    for &point in missing {
        if let Some(current) = windows.last_mut() {
            let extends = match granularity {
                FetchGranularity::Contiguous => next_point(current.last, step) == Some(point),
                FetchGranularity::PerDay => current.last.date() == point.date(),
            };
            if extends {
                current.last = point;
                continue;
            }
        }
        windows.push(FetchWindow::point(point));
    }
    windows
}

fn next_point(p: TimePoint, step: chrono::Duration) -> Option<TimePoint> {
    match p {
        TimePoint::Day(d) => d.checked_add_signed(step).map(TimePoint::Day),
        TimePoint::Instant(t) => t.checked_add_signed(step).map(TimePoint::Instant),
    }
}
