//! Per-unit sync state machine and the batch runner.
//!
//! A unit of work is one (instrument, aspect group, timeframe) dataset:
//!
//! ```text
//! IDLE -> RESOLVING_GAPS -> FETCHING -> JOINING -> COMMITTING -> DONE
//!              |                |                      |
//!              +-> DONE         +-> FAILED             +-> FAILED
//!                (no gaps)
//! ```
//!
//! Units are independent. A failure is recorded in that unit's report and
//! never stops its siblings.

use rayon::prelude::*;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::coverage::existing_points;
use super::gaps::{missing, plan_windows, FetchGranularity, SyncMode};
use super::grid::{InvalidRangeError, TimeGrid};
use super::join::{EmptyAspectWarning, RecordJoiner};
use super::locks::PathLocks;
use super::merge::{CommitReport, DatasetMerger, MergeError};
use crate::data::provider::{MarketDataProvider, ProviderError};
use crate::data::store::{DatasetStore, StoreError};
use crate::domain::{
    Aspect, AspectGroup, DatasetKey, FetchWindow, Instrument, InstrumentError, OptionContract,
    QueryDescriptor, RecordSet, TimePoint, TimeRange, Timeframe,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    Idle,
    ResolvingGaps,
    Fetching,
    Joining,
    Committing,
    Done,
    Failed,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncState::Idle => "IDLE",
            SyncState::ResolvingGaps => "RESOLVING_GAPS",
            SyncState::Fetching => "FETCHING",
            SyncState::Joining => "JOINING",
            SyncState::Committing => "COMMITTING",
            SyncState::Done => "DONE",
            SyncState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    InvalidRange(#[from] InvalidRangeError),

    #[error("provider error ({context}): {source}")]
    Provider {
        context: String,
        #[source]
        source: ProviderError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Instrument(#[from] InstrumentError),

    #[error("provider '{0}' is not reachable; no work was dispatched")]
    ProviderUnhealthy(String),

    #[error("failed to start worker pool: {0}")]
    WorkerPool(String),

    #[error("cancelled")]
    Cancelled,
}

/// One dataset to bring up to date.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncUnit {
    pub instrument: Instrument,
    pub group: AspectGroup,
    pub timeframe: Timeframe,
    pub range: TimeRange,
    /// Explicit option contracts; empty means whole-chain requests.
    pub contracts: Vec<OptionContract>,
}

impl SyncUnit {
    pub fn new(
        instrument: Instrument,
        group: AspectGroup,
        timeframe: Timeframe,
        range: TimeRange,
    ) -> Self {
        Self {
            instrument,
            group,
            timeframe,
            range,
            contracts: Vec::new(),
        }
    }

    pub fn dataset_key(&self) -> DatasetKey {
        DatasetKey::new(
            self.instrument.symbol.clone(),
            self.group.data_type(self.instrument.kind),
            self.timeframe,
        )
    }

    fn aspects(&self) -> impl Iterator<Item = Aspect> + '_ {
        std::iter::once(self.group.primary()).chain(self.group.secondary().iter().copied())
    }
}

impl fmt::Display for SyncUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dataset_key())
    }
}

/// Knobs shared by every unit of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    pub mode: SyncMode,
    pub granularity: FetchGranularity,
    pub restrict_to_available_dates: bool,
    pub workers: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            mode: SyncMode::Tail,
            granularity: FetchGranularity::Contiguous,
            restrict_to_available_dates: false,
            workers: 4,
        }
    }
}

/// Gap resolution result for one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitPlan {
    pub unit: SyncUnit,
    pub path: PathBuf,
    pub existing_points: usize,
    pub missing: Vec<TimePoint>,
    pub windows: Vec<FetchWindow>,
}

#[derive(Debug)]
pub enum UnitOutcome {
    Done { commit: CommitReport },
    /// Nothing was missing; no fetch was issued.
    Skipped,
    Failed { state: SyncState, error: SyncError },
}

impl UnitOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, UnitOutcome::Failed { .. })
    }
}

impl fmt::Display for UnitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitOutcome::Done { commit } if !commit.written => {
                write!(f, "DONE (no new rows, {} total, file unchanged)", commit.rows_after)
            }
            UnitOutcome::Done { commit } => write!(
                f,
                "DONE (+{} rows, {} total)",
                commit.rows_added(),
                commit.rows_after
            ),
            UnitOutcome::Skipped => f.write_str("SKIPPED (no gaps)"),
            UnitOutcome::Failed { state, error } => write!(f, "FAILED in {state}: {error}"),
        }
    }
}

#[derive(Debug)]
pub struct UnitReport {
    pub unit: SyncUnit,
    pub outcome: UnitOutcome,
    /// Every state the unit passed through, in order.
    pub trail: Vec<SyncState>,
    pub missing_points: usize,
    pub windows: usize,
    pub rows_fetched: Vec<(Aspect, usize)>,
    pub warnings: Vec<EmptyAspectWarning>,
}

impl UnitReport {
    fn new(unit: &SyncUnit) -> Self {
        Self {
            unit: unit.clone(),
            outcome: UnitOutcome::Skipped,
            trail: vec![SyncState::Idle],
            missing_points: 0,
            windows: 0,
            rows_fetched: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn state(&self) -> SyncState {
        self.trail.last().copied().unwrap_or(SyncState::Idle)
    }

    fn enter(&mut self, state: SyncState) {
        debug!(unit = %self.unit, from = %self.state(), to = %state, "transition");
        self.trail.push(state);
    }

    fn fail(mut self, error: SyncError) -> Self {
        let state = self.state();
        warn!(unit = %self.unit, %state, %error, "unit failed");
        self.trail.push(SyncState::Failed);
        self.outcome = UnitOutcome::Failed { state, error };
        self
    }

    pub fn final_state(&self) -> SyncState {
        self.state()
    }
}

/// A configured symbol whose kind could not be determined. None of its
/// units were built, so it fails on its own while the others run.
#[derive(Debug)]
pub struct UnresolvedInstrument {
    pub symbol: String,
    pub error: InstrumentError,
}

impl fmt::Display for UnresolvedInstrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FAILED in {}: {}", SyncState::Idle, self.error)
    }
}

/// Outcome of a batch of units, in input order.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub units: Vec<UnitReport>,
    pub unresolved: Vec<UnresolvedInstrument>,
}

impl SyncReport {
    pub fn done(&self) -> usize {
        self.count(|o| matches!(o, UnitOutcome::Done { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, UnitOutcome::Skipped))
    }

    /// Failed units plus symbols that never became units.
    pub fn failed(&self) -> usize {
        self.count(UnitOutcome::is_failed) + self.unresolved.len()
    }

    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }

    fn count(&self, pred: impl Fn(&UnitOutcome) -> bool) -> usize {
        self.units.iter().filter(|u| pred(&u.outcome)).count()
    }
}

/// Progress callbacks for a batch run. Called from worker threads.
pub trait SyncProgress: Send + Sync {
    fn on_start(&self, unit: &SyncUnit, index: usize, total: usize);

    fn on_complete(&self, report: &UnitReport, index: usize, total: usize);

    fn on_batch_complete(&self, report: &SyncReport);
}

/// Progress reporter that logs through `tracing`.
pub struct LogProgress;

impl SyncProgress for LogProgress {
    fn on_start(&self, unit: &SyncUnit, index: usize, total: usize) {
        info!(unit = %unit, "[{}/{}] syncing", index + 1, total);
    }

    fn on_complete(&self, report: &UnitReport, index: usize, total: usize) {
        info!(
            unit = %report.unit,
            missing = report.missing_points,
            "[{}/{}] {}",
            index + 1,
            total,
            report.outcome
        );
    }

    fn on_batch_complete(&self, report: &SyncReport) {
        info!(
            done = report.done(),
            skipped = report.skipped(),
            failed = report.failed(),
            "sync complete"
        );
    }
}

fn is_cancelled(cancel: Option<&AtomicBool>) -> bool {
    cancel.is_some_and(|f| f.load(Ordering::Relaxed))
}

/// Drives units of work against one provider and one dataset store.
pub struct SyncOrchestrator<'a> {
    provider: &'a dyn MarketDataProvider,
    store: DatasetStore,
    options: SyncOptions,
    locks: PathLocks,
}

impl<'a> SyncOrchestrator<'a> {
    pub fn new(provider: &'a dyn MarketDataProvider, store: DatasetStore, options: SyncOptions) -> Self {
        Self {
            provider,
            store,
            options,
            locks: PathLocks::new(),
        }
    }

    pub fn store(&self) -> &DatasetStore {
        &self.store
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Resolve which points of the unit are missing and how they would be
    /// fetched. Reads coverage under the dataset's lock; fetches no data.
    pub fn plan_unit(&self, unit: &SyncUnit) -> Result<UnitPlan, SyncError> {
        let grid = TimeGrid::new(unit.range, unit.timeframe)?;
        let path = self.store.dataset_path(&unit.dataset_key());
        let existing = self
            .locks
            .with_lock(&path, || existing_points(&path, unit.timeframe))?;

        let available = if self.options.restrict_to_available_dates {
            self.provider
                .available_dates(&unit.instrument, unit.timeframe)
                .map_err(|source| SyncError::Provider {
                    context: format!("available dates of {}", unit.instrument.symbol),
                    source,
                })?
        } else {
            None
        };
        let expected = grid
            .iter()
            .filter(|p| available.as_ref().map_or(true, |dates| dates.contains(&p.date())));

        let gaps = missing(expected, &existing, self.options.mode);
        let windows = plan_windows(&gaps, unit.timeframe, self.options.granularity);
        debug!(
            unit = %unit,
            existing = existing.len(),
            missing = gaps.len(),
            windows = windows.len(),
            "gaps resolved"
        );

        Ok(UnitPlan {
            unit: unit.clone(),
            path,
            existing_points: existing.len(),
            missing: gaps,
            windows,
        })
    }

    /// Run one unit through the state machine. Never panics on provider or
    /// storage failures; they end up in the report.
    pub fn run_unit(&self, unit: &SyncUnit, cancel: Option<&AtomicBool>) -> UnitReport {
        let mut report = UnitReport::new(unit);
        if is_cancelled(cancel) {
            return report.fail(SyncError::Cancelled);
        }

        report.enter(SyncState::ResolvingGaps);
        let plan = match self.plan_unit(unit) {
            Ok(plan) => plan,
            Err(e) => return report.fail(e),
        };
        report.missing_points = plan.missing.len();
        report.windows = plan.windows.len();

        if plan.windows.is_empty() {
            report.enter(SyncState::Done);
            report.outcome = UnitOutcome::Skipped;
            return report;
        }
        if is_cancelled(cancel) {
            return report.fail(SyncError::Cancelled);
        }

        report.enter(SyncState::Fetching);
        let mut fetched = Vec::new();
        for aspect in unit.aspects() {
            match self.fetch_aspect(unit, aspect, &plan.windows, cancel) {
                Ok(records) => {
                    report.rows_fetched.push((aspect, records.len()));
                    fetched.push((aspect, records));
                }
                Err(e) => return report.fail(e),
            }
        }
        if is_cancelled(cancel) {
            return report.fail(SyncError::Cancelled);
        }

        report.enter(SyncState::Joining);
        let mut fetched = fetched.into_iter();
        let primary = fetched.next().map(|(_, r)| r).unwrap_or_default();
        let secondary = fetched.map(|(a, r)| (a.to_string(), r)).collect();
        let joined = RecordJoiner::new(unit.group.key_columns(unit.timeframe)).join(primary, secondary);
        for w in &joined.warnings {
            warn!(unit = %unit, aspect = %w.aspect, discarded = w.discarded_rows, "{w}");
        }
        report.warnings = joined.warnings;
        if is_cancelled(cancel) {
            return report.fail(SyncError::Cancelled);
        }

        report.enter(SyncState::Committing);
        let merger = DatasetMerger::new(unit.timeframe);
        let committed = self.locks.with_lock(&plan.path, || -> Result<CommitReport, SyncError> {
            let prepared = merger.prepare(&plan.path, joined.records)?;
            if is_cancelled(cancel) {
                return Err(SyncError::Cancelled);
            }
            Ok(prepared.publish()?)
        });
        match committed {
            Ok(commit) => {
                report.enter(SyncState::Done);
                info!(
                    unit = %unit,
                    added = commit.rows_added(),
                    total = commit.rows_after,
                    written = commit.written,
                    "committed"
                );
                report.outcome = UnitOutcome::Done { commit };
                report
            }
            Err(e) => report.fail(e),
        }
    }

    /// Fetch every window of one aspect. No lock is held here.
    fn fetch_aspect(
        &self,
        unit: &SyncUnit,
        aspect: Aspect,
        windows: &[FetchWindow],
        cancel: Option<&AtomicBool>,
    ) -> Result<RecordSet, SyncError> {
        let contracts: Vec<Option<OptionContract>> = if aspect.is_option() && !unit.contracts.is_empty() {
            unit.contracts.iter().copied().map(Some).collect()
        } else {
            vec![None]
        };

        let mut out = RecordSet::default();
        for window in windows {
            for contract in &contracts {
                if is_cancelled(cancel) {
                    return Err(SyncError::Cancelled);
                }
                let query = QueryDescriptor {
                    instrument: unit.instrument.clone(),
                    aspect,
                    timeframe: unit.timeframe,
                    window: *window,
                    contract: *contract,
                };
                let records = self.provider.fetch(&query).map_err(|source| SyncError::Provider {
                    context: format!("{aspect} {window}"),
                    source,
                })?;
                debug!(unit = %unit, %aspect, %window, rows = records.len(), "fetched");
                out.extend(records);
            }
        }
        Ok(out)
    }

    /// Run every unit on a worker pool of `options.workers` threads.
    ///
    /// Fails fast, before dispatching anything, when the provider's health
    /// check fails. Otherwise every unit gets a report, failed or not.
    pub fn run_all(
        &self,
        units: &[SyncUnit],
        cancel: Option<&AtomicBool>,
        progress: Option<&dyn SyncProgress>,
    ) -> Result<SyncReport, SyncError> {
        if !self.provider.is_available() {
            return Err(SyncError::ProviderUnhealthy(self.provider.name().to_string()));
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.workers.max(1))
            .build()
            .map_err(|e| SyncError::WorkerPool(e.to_string()))?;

        let total = units.len();
        let reports: Vec<UnitReport> = pool.install(|| {
            units
                .par_iter()
                .enumerate()
                .map(|(i, unit)| {
                    if let Some(p) = progress {
                        p.on_start(unit, i, total);
                    }
                    let report = self.run_unit(unit, cancel);
                    if let Some(p) = progress {
                        p.on_complete(&report, i, total);
                    }
                    report
                })
                .collect()
        });

        let report = SyncReport {
            units: reports,
            unresolved: Vec::new(),
        };
        if let Some(p) = progress {
            p.on_batch_complete(&report);
        }
        Ok(report)
    }

    /// Plan every unit without fetching data.
    pub fn plan_all(&self, units: &[SyncUnit]) -> Vec<Result<UnitPlan, SyncError>> {
        units.iter().map(|u| self.plan_unit(u)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::memory::InMemoryProvider;
    use crate::domain::{InstrumentKind, Record};
    use chrono::NaiveDate;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn bars(range: std::ops::RangeInclusive<u32>) -> RecordSet {
        RecordSet::from_rows(
            range
                .map(|d| Record::new().with("date", day(d)).with("close", d as f64))
                .collect(),
        )
    }

    fn unit(first: u32, last: u32) -> SyncUnit {
        SyncUnit::new(
            Instrument::new("SPY", InstrumentKind::Stock),
            AspectGroup::Underlying,
            Timeframe::Daily,
            TimeRange::days(day(first), day(last)),
        )
    }

    fn provider() -> InMemoryProvider {
        InMemoryProvider::new().with_series("SPY", Aspect::Underlying, Timeframe::Daily, bars(1..=31))
    }

    #[test]
    fn happy_path_trail() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider();
        let orch = SyncOrchestrator::new(&p, DatasetStore::new(dir.path()), SyncOptions::default());

        let report = orch.run_unit(&unit(1, 5), None);
        assert_eq!(
            report.trail,
            vec![
                SyncState::Idle,
                SyncState::ResolvingGaps,
                SyncState::Fetching,
                SyncState::Joining,
                SyncState::Committing,
                SyncState::Done
            ]
        );
        assert!(matches!(report.outcome, UnitOutcome::Done { commit } if commit.rows_after == 5));
        assert_eq!(report.rows_fetched, vec![(Aspect::Underlying, 5)]);
    }

    #[test]
    fn no_gaps_skips_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider();
        let orch = SyncOrchestrator::new(&p, DatasetStore::new(dir.path()), SyncOptions::default());

        orch.run_unit(&unit(1, 5), None);
        let fetches = p.fetch_count();
        let again = orch.run_unit(&unit(1, 5), None);

        assert!(matches!(again.outcome, UnitOutcome::Skipped));
        assert_eq!(again.trail.last(), Some(&SyncState::Done));
        assert_eq!(p.fetch_count(), fetches);
    }

    #[test]
    fn provider_failure_fails_in_fetching() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider();
        p.fail_with("SPY", Aspect::Underlying, Timeframe::Daily, 503);
        let orch = SyncOrchestrator::new(&p, DatasetStore::new(dir.path()), SyncOptions::default());

        let report = orch.run_unit(&unit(1, 5), None);
        assert!(matches!(
            report.outcome,
            UnitOutcome::Failed {
                state: SyncState::Fetching,
                error: SyncError::Provider { .. }
            }
        ));
        assert_eq!(report.final_state(), SyncState::Failed);
    }

    #[test]
    fn inverted_range_fails_before_io() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider();
        let orch = SyncOrchestrator::new(&p, DatasetStore::new(dir.path()), SyncOptions::default());

        let report = orch.run_unit(&unit(5, 1), None);
        assert!(matches!(
            report.outcome,
            UnitOutcome::Failed {
                state: SyncState::ResolvingGaps,
                error: SyncError::InvalidRange(_)
            }
        ));
        assert_eq!(p.fetch_count(), 0);
    }

    #[test]
    fn cancelled_unit_leaves_no_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider();
        let store = DatasetStore::new(dir.path());
        let path = store.dataset_path(&unit(1, 5).dataset_key());
        let orch = SyncOrchestrator::new(&p, store, SyncOptions::default());

        let cancel = AtomicBool::new(true);
        let report = orch.run_unit(&unit(1, 5), Some(&cancel));
        assert!(matches!(
            report.outcome,
            UnitOutcome::Failed {
                error: SyncError::Cancelled,
                ..
            }
        ));
        assert!(!path.exists());
    }

    #[test]
    fn available_dates_restrict_the_grid() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider().with_available_dates("SPY", [day(2), day(3), day(4)]);
        let options = SyncOptions {
            restrict_to_available_dates: true,
            mode: SyncMode::FullGap,
            ..SyncOptions::default()
        };
        let orch = SyncOrchestrator::new(&p, DatasetStore::new(dir.path()), options);

        let plan = orch.plan_unit(&unit(1, 7)).unwrap();
        assert_eq!(plan.missing.len(), 3);
        assert_eq!(plan.windows.len(), 1);
    }

    #[test]
    fn unhealthy_provider_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider();
        p.set_healthy(false);
        let orch = SyncOrchestrator::new(&p, DatasetStore::new(dir.path()), SyncOptions::default());

        assert!(matches!(
            orch.run_all(&[unit(1, 5)], None, None),
            Err(SyncError::ProviderUnhealthy(_))
        ));
        assert_eq!(p.fetch_count(), 0);
    }
}
