//! Incremental reconciliation engine.
//!
//! TimeGrid + CoverageIndex -> GapResolver -> provider fetch ->
//! RecordJoiner -> DatasetMerger, driven per unit by the orchestrator.

pub mod coverage;
pub mod gaps;
pub mod grid;
pub mod join;
pub mod locks;
pub mod merge;
pub mod orchestrator;

pub use coverage::{existing_points, latest_point, normalize_time_value};
pub use gaps::{missing, plan_windows, FetchGranularity, SyncMode};
pub use grid::{expected_points, InvalidRangeError, TimeGrid};
pub use join::{EmptyAspectWarning, JoinOutcome, RecordJoiner};
pub use locks::PathLocks;
pub use merge::{CommitReport, DatasetMerger, MergeError, PreparedCommit};
pub use orchestrator::{
    LogProgress, SyncError, SyncOptions, SyncOrchestrator, SyncProgress, SyncReport, SyncState,
    SyncUnit, UnitOutcome, UnitPlan, UnitReport, UnresolvedInstrument,
};
