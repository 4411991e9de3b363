//! Expected time points of a range.

use chrono::NaiveDateTime;
use thiserror::Error;

use crate::domain::{TimePoint, TimeRange, Timeframe};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid time range: end {end} is before start {start}")]
pub struct InvalidRangeError {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

/// Complete, ordered set of points for a range at one timeframe.
///
/// Cheap to copy; every call to [`iter`](Self::iter) starts over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeGrid {
    range: TimeRange,
    timeframe: Timeframe,
}

impl TimeGrid {
    pub fn new(range: TimeRange, timeframe: Timeframe) -> Result<Self, InvalidRangeError> {
        if range.end < range.start {
            return Err(InvalidRangeError {
                start: range.start,
                end: range.end,
            });
        }
        Ok(Self { range, timeframe })
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn range(&self) -> TimeRange {
        self.range
    }

    pub fn iter(&self) -> GridIter {
        let (next, end) = match self.timeframe {
            Timeframe::Daily => (
                TimePoint::Day(self.range.start.date()),
                TimePoint::Day(self.range.end.date()),
            ),
            Timeframe::Intraday { .. } => (
                TimePoint::Instant(self.range.start),
                TimePoint::Instant(self.range.end),
            ),
        };
        GridIter {
            next: Some(next),
            end,
            timeframe: self.timeframe,
        }
    }
}

impl IntoIterator for &TimeGrid {
    type Item = TimePoint;
    type IntoIter = GridIter;

    fn into_iter(self) -> GridIter {
        self.iter()
    }
}

/// Convenience wrapper: the expected points of `range` at `timeframe`.
pub fn expected_points(
    start: NaiveDateTime,
    end: NaiveDateTime,
    timeframe: Timeframe,
) -> Result<TimeGrid, InvalidRangeError> {
    TimeGrid::new(TimeRange::new(start, end), timeframe)
}

#[derive(Debug, Clone)]
pub struct GridIter {
    next: Option<TimePoint>,
    end: TimePoint,
    timeframe: Timeframe,
}

impl Iterator for GridIter {
    type Item = TimePoint;

    fn next(&mut self) -> Option<TimePoint> {
        let current = self.next.filter(|p| *p <= self.end)?;
        let step = self.timeframe.step();
        self.next = match current {
            TimePoint::Day(d) => d.checked_add_signed(step).map(TimePoint::Day),
            TimePoint::Instant(t) => t.checked_add_signed(step).map(TimePoint::Instant),
        };
        Some(current)
    }
}
