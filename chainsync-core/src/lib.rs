//! ChainSync Core: incremental synchronization of market data into parquet datasets.
//!
//! - Domain types (instruments, timeframes, records, aspects, dataset keys)
//! - Providers behind a trait (ThetaData terminal over HTTP, in-memory)
//! - Parquet store with staged, atomic publishes
//! - Sync engine: time grids, coverage, gap resolution, joins, merges
//! - TOML configuration

pub mod config;
pub mod data;
pub mod domain;
pub mod sync;
