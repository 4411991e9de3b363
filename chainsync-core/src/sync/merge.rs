//! Merge of new rows into a persisted dataset.
//!
//! A commit is read, merge, stage, publish. Only the final rename makes the
//! result visible, so a failure anywhere before it leaves the previous file
//! as it was.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

use super::coverage::normalize_time_value;
use crate::data::store::{read_dataset, read_frame, StagedWrite, StoreError};
use crate::domain::{Record, RecordSet, Timeframe, Value, CONTRACT_COLUMNS};

#[derive(Debug, Error)]
pub enum MergeError {
    #[error(
        "schema mismatch: columns missing from new rows {missing_in_new:?}, \
         columns not in existing dataset {unexpected_in_new:?}"
    )]
    SchemaMismatch {
        missing_in_new: Vec<String>,
        unexpected_in_new: Vec<String>,
    },

    #[error("row has no value in time column '{column}'")]
    MissingTimePoint { column: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of one commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommitReport {
    pub rows_before: usize,
    pub rows_after: usize,
    /// Whether the dataset file was replaced.
    pub written: bool,
}

impl CommitReport {
    pub fn rows_added(&self) -> usize {
        self.rows_after.saturating_sub(self.rows_before)
    }
}

/// A merged dataset staged next to its target, not yet visible.
#[derive(Debug)]
pub struct PreparedCommit {
    staged: Option<StagedWrite>,
    report: CommitReport,
}

impl PreparedCommit {
    pub fn report(&self) -> CommitReport {
        self.report
    }

    /// Temporary file holding the merged dataset, when a write is needed.
    pub fn staged_path(&self) -> Option<&Path> {
        self.staged.as_ref().map(StagedWrite::tmp_path)
    }

    /// Make the merged dataset visible. Dropping instead abandons it.
    pub fn publish(self) -> Result<CommitReport, MergeError> {
        if let Some(staged) = self.staged {
            staged.publish()?;
        }
        Ok(self.report)
    }
}

/// Merges rows into the dataset of one timeframe.
#[derive(Debug, Clone, Copy)]
pub struct DatasetMerger {
    timeframe: Timeframe,
}

impl DatasetMerger {
    pub fn new(timeframe: Timeframe) -> Self {
        Self { timeframe }
    }

    /// Read, merge and stage. Nothing is visible until [`PreparedCommit::publish`].
    ///
    /// Empty `new_rows` never touch the file; the report then carries the
    /// dataset's current row count. A dataset whose column set differs from
    /// `new_rows` is rejected with `SchemaMismatch`.
    pub fn prepare(&self, path: &Path, new_rows: RecordSet) -> Result<PreparedCommit, MergeError> {
        if new_rows.is_empty() {
            let rows = read_frame(path)?.map_or(0, |df| df.height());
            return Ok(PreparedCommit {
                staged: None,
                report: CommitReport {
                    rows_before: rows,
                    rows_after: rows,
                    written: false,
                },
            });
        }

        let existing = read_dataset(path)?;
        if let Some(existing) = &existing {
            check_schema(existing, &new_rows)?;
        }

        let rows_before = existing.as_ref().map_or(0, RecordSet::len);
        let previous = existing.as_ref().map(|e| e.rows().to_vec());
        let merged = self.merge_rows(existing, new_rows)?;
        let report = CommitReport {
            rows_before,
            rows_after: merged.len(),
            written: previous.as_deref() != Some(merged.rows()),
        };

        if !report.written {
            debug!(path = %path.display(), rows = report.rows_after, "dataset unchanged");
            return Ok(PreparedCommit {
                staged: None,
                report,
            });
        }

        let staged = StagedWrite::stage(path, &merged)?;
        Ok(PreparedCommit {
            staged: Some(staged),
            report,
        })
    }

    /// Merge `new_rows` into the dataset at `path` and publish the result.
    pub fn commit(&self, path: &Path, new_rows: RecordSet) -> Result<CommitReport, MergeError> {
        self.prepare(path, new_rows)?.publish()
    }

    /// Pure merge: existing rows followed by new rows, one row per key (the
    /// latest), sorted by time and contract columns.
    ///
    /// The time column of every row is rewritten to its canonical typed value.
    pub fn merge_rows(
        &self,
        existing: Option<RecordSet>,
        new_rows: RecordSet,
    ) -> Result<RecordSet, MergeError> {
        let mut combined = existing.unwrap_or_default();
        combined.extend(new_rows);
        let (columns, rows) = combined.into_parts();

        let key: Vec<String> = std::iter::once(self.timeframe.time_column())
            .chain(CONTRACT_COLUMNS)
            .filter(|c| columns.iter().any(|h| h.as_str() == *c))
            .map(str::to_string)
            .collect();

        let mut slots: HashMap<Vec<Value>, usize> = HashMap::with_capacity(rows.len());
        let mut kept: Vec<Record> = Vec::with_capacity(rows.len());
        for row in rows {
            let row = self.canonicalize(row)?;
            let k = row.key(&key);
            match slots.get(&k) {
                Some(&slot) => kept[slot] = row,
                None => {
                    slots.insert(k, kept.len());
                    kept.push(row);
                }
            }
        }

        kept.sort_by_cached_key(|r| r.key(&key));

        let mut out = RecordSet::new(columns);
        for row in kept {
            out.push(row);
        }
        Ok(out)
    }

    fn canonicalize(&self, mut row: Record) -> Result<Record, MergeError> {
        let column = self.timeframe.time_column();
        let point = normalize_time_value(column, row.get(column), self.timeframe)?.ok_or_else(
            || MergeError::MissingTimePoint {
                column: column.to_string(),
            },
        )?;
        row.set(column, point.to_value());
        Ok(row)
    }
}

fn check_schema(existing: &RecordSet, new_rows: &RecordSet) -> Result<(), MergeError> {
    let old: BTreeSet<&str> = existing.column_set();
    let new: BTreeSet<&str> = new_rows.column_set();
    if old == new {
        return Ok(());
    }
    Err(MergeError::SchemaMismatch {
        missing_in_new: old.difference(&new).map(|c| c.to_string()).collect(),
        unexpected_in_new: new.difference(&old).map(|c| c.to_string()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::fs;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn bar(d: u32, close: f64) -> Record {
        Record::new()
            .with("date", day(d))
            .with("close", close)
            .with("volume", 100i64)
    }

    fn bars(days: &[u32]) -> RecordSet {
        RecordSet::from_rows(days.iter().map(|d| bar(*d, *d as f64)).collect())
    }

    fn merger() -> DatasetMerger {
        DatasetMerger::new(Timeframe::Daily)
    }

    fn dates(set: &RecordSet) -> Vec<Value> {
        set.rows().iter().map(|r| r.get("date").clone()).collect()
    }

    #[test]
    fn first_commit_sorts_new_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SPY_stock_daily.parquet");

        let report = merger().commit(&path, bars(&[3, 1, 5, 2, 4])).unwrap();
        assert_eq!(report.rows_after, 5);
        assert!(report.written);

        let stored = read_dataset(&path).unwrap().unwrap();
        assert_eq!(dates(&stored), (1..=5).map(|d| Value::Date(day(d))).collect::<Vec<_>>());
    }

    #[test]
    fn empty_new_rows_do_not_touch_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.parquet");
        let report = merger().commit(&path, RecordSet::new(["date", "close"])).unwrap();
        assert!(!report.written);
        assert!(!path.exists());
    }

    #[test]
    fn empty_new_rows_report_the_existing_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SPY_stock_daily.parquet");
        merger().commit(&path, bars(&[1, 2, 3])).unwrap();
        let before = fs::read(&path).unwrap();

        let report = merger()
            .commit(&path, RecordSet::new(["date", "close", "volume"]))
            .unwrap();
        assert_eq!(report.rows_before, 3);
        assert_eq!(report.rows_after, 3);
        assert!(!report.written);
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn duplicates_collapse_and_latest_wins() {
        let existing = RecordSet::from_rows(vec![bar(1, 1.0), bar(2, 2.0)]);
        let new = RecordSet::from_rows(vec![bar(2, 2.5), bar(2, 2.5), bar(3, 3.0)]);
        let merged = merger().merge_rows(Some(existing), new).unwrap();

        assert_eq!(merged.len(), 3);
        assert_eq!(merged.rows()[1].get("close"), &Value::Float(2.5));
    }

    #[test]
    fn options_sort_by_contract_after_time() {
        let opt = |d: u32, strike: f64, right: &str| {
            Record::new()
                .with("date", day(d))
                .with("expiration", day(19))
                .with("strike", strike)
                .with("type", right)
        };
        let new = RecordSet::from_rows(vec![
            opt(2, 475.0, "C"),
            opt(1, 470.0, "P"),
            opt(1, 470.0, "C"),
            opt(2, 470.0, "C"),
        ]);
        let merged = merger().merge_rows(None, new).unwrap();
        let keys: Vec<(Value, Value, Value)> = merged
            .rows()
            .iter()
            .map(|r| (r.get("date").clone(), r.get("strike").clone(), r.get("type").clone()))
            .collect();
        assert_eq!(
            keys,
            vec![
                (Value::Date(day(1)), Value::Float(470.0), Value::from("C")),
                (Value::Date(day(1)), Value::Float(470.0), Value::from("P")),
                (Value::Date(day(2)), Value::Float(470.0), Value::from("C")),
                (Value::Date(day(2)), Value::Float(475.0), Value::from("C")),
            ]
        );
    }

    #[test]
    fn string_time_values_are_canonicalized() {
        let new = RecordSet::from_rows(vec![
            Record::new().with("date", "20240103").with("close", 3.0),
            Record::new().with("date", "2024-01-03").with("close", 3.1),
        ]);
        let merged = merger().merge_rows(None, new).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.rows()[0].get("date"), &Value::Date(day(3)));
    }

    #[test]
    fn schema_mismatch_names_the_difference_and_leaves_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SPY_stock_daily.parquet");
        merger().commit(&path, bars(&[1, 2, 3])).unwrap();
        let before = fs::read(&path).unwrap();

        let narrow = RecordSet::from_rows(vec![Record::new().with("date", day(4)).with("close", 4.0)]);
        match merger().commit(&path, narrow) {
            Err(MergeError::SchemaMismatch {
                missing_in_new,
                unexpected_in_new,
            }) => {
                assert_eq!(missing_in_new, vec!["volume".to_string()]);
                assert!(unexpected_in_new.is_empty());
            }
            other => panic!("expected schema mismatch, got {other:?}"),
        }
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn identical_merge_skips_the_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SPY_stock_daily.parquet");
        merger().commit(&path, bars(&[1, 2, 3])).unwrap();
        let before = fs::read(&path).unwrap();

        let report = merger().commit(&path, bars(&[2, 3])).unwrap();
        assert!(!report.written);
        assert_eq!(report.rows_added(), 0);
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn abandoned_prepare_keeps_prior_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SPY_stock_daily.parquet");
        merger().commit(&path, bars(&[1, 2])).unwrap();
        let before = fs::read(&path).unwrap();

        let prepared = merger().prepare(&path, bars(&[3, 4])).unwrap();
        let tmp = prepared.staged_path().unwrap().to_path_buf();
        assert!(tmp.exists());
        drop(prepared);

        assert!(!tmp.exists());
        assert_eq!(fs::read(&path).unwrap(), before);
        assert_eq!(read_dataset(&path).unwrap().unwrap().len(), 2);
    }

    #[test]
    fn row_without_time_value_is_rejected() {
        let new = RecordSet::from_rows(vec![Record::new().with("close", 1.0)]);
        assert!(matches!(
            merger().merge_rows(None, new),
            Err(MergeError::MissingTimePoint { .. })
        ));
    }
}
