//! Criterion benchmarks for sync engine hot paths.
//!
//! Benchmarks:
//! 1. Gap resolution over intraday grids with scattered coverage
//! 2. Fetch window planning
//! 3. Joining option aspects onto a quote chain
//! 4. Merging new rows into an existing dataset (in memory)

use chrono::{Duration, NaiveDate};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::BTreeSet;

use chainsync_core::domain::{Record, RecordSet, TimePoint, TimeRange, Timeframe};
use chainsync_core::sync::{
    missing, plan_windows, DatasetMerger, FetchGranularity, RecordJoiner, SyncMode, TimeGrid,
};

// ── Helpers ──────────────────────────────────────────────────────────

fn base_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()
}

fn minute_grid(days: i64) -> TimeGrid {
    let start = base_date();
    TimeGrid::new(
        TimeRange::whole_days(start, start + Duration::days(days - 1)),
        Timeframe::minutes(1),
    )
    .unwrap()
}

/// Every point of the grid except one in `hole_every`.
fn scattered_coverage(grid: &TimeGrid, hole_every: usize) -> BTreeSet<TimePoint> {
    grid.iter()
        .enumerate()
        .filter(|(i, _)| i % hole_every != 0)
        .map(|(_, p)| p)
        .collect()
}

fn chain(days: u32, strikes: u32, columns: &[&str]) -> RecordSet {
    let mut rows = Vec::with_capacity((days * strikes * 2) as usize);
    for d in 0..days {
        let date = base_date() + Duration::days(d as i64);
        for s in 0..strikes {
            for right in ["C", "P"] {
                let mut row = Record::new()
                    .with("date", date)
                    .with("expiration", base_date() + Duration::days(45))
                    .with("strike", 400.0 + s as f64)
                    .with("type", right);
                for (i, c) in columns.iter().enumerate() {
                    row.set(*c, (d * strikes + s) as f64 * 0.01 + i as f64);
                }
                rows.push(row);
            }
        }
    }
    RecordSet::from_rows(rows)
}

// ── 1. Gap Resolution ────────────────────────────────────────────────

fn bench_gap_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("gap_resolution");
    for days in [5i64, 20, 60] {
        let grid = minute_grid(days);
        let existing = scattered_coverage(&grid, 7);
        group.bench_with_input(BenchmarkId::new("full_gap", days), &days, |b, _| {
            b.iter(|| missing(black_box(&grid), black_box(&existing), SyncMode::FullGap))
        });
        group.bench_with_input(BenchmarkId::new("tail", days), &days, |b, _| {
            b.iter(|| missing(black_box(&grid), black_box(&existing), SyncMode::Tail))
        });
    }
    group.finish();
}

// ── 2. Window Planning ───────────────────────────────────────────────

fn bench_plan_windows(c: &mut Criterion) {
    let grid = minute_grid(20);
    let gaps = missing(&grid, &scattered_coverage(&grid, 3), SyncMode::FullGap);
    let mut group = c.benchmark_group("plan_windows");
    for granularity in [FetchGranularity::Contiguous, FetchGranularity::PerDay] {
        group.bench_function(format!("{granularity:?}"), |b| {
            b.iter(|| plan_windows(black_box(&gaps), Timeframe::minutes(1), granularity))
        });
    }
    group.finish();
}

// ── 3. Joining ───────────────────────────────────────────────────────

fn bench_join(c: &mut Criterion) {
    let joiner = RecordJoiner::new(["date", "expiration", "strike", "type"]);
    let mut group = c.benchmark_group("join");
    for strikes in [50u32, 200] {
        let quotes = chain(20, strikes, &["bid", "ask"]);
        let greeks = chain(20, strikes, &["delta", "gamma", "theta", "vega"]);
        let oi = chain(20, strikes / 2, &["open_interest"]);
        group.bench_with_input(BenchmarkId::new("options", strikes), &strikes, |b, _| {
            b.iter(|| {
                joiner.join(
                    quotes.clone(),
                    vec![
                        ("option_greeks".to_string(), greeks.clone()),
                        ("option_open_interest".to_string(), oi.clone()),
                    ],
                )
            })
        });
    }
    group.finish();
}

// ── 4. Merging ───────────────────────────────────────────────────────

fn bench_merge(c: &mut Criterion) {
    let merger = DatasetMerger::new(Timeframe::Daily);
    let existing = chain(60, 100, &["bid", "ask"]);
    let new_rows = chain(65, 100, &["bid", "ask"]);
    c.bench_function("merge/options_60d_plus_5d", |b| {
        b.iter(|| {
            merger
                .merge_rows(Some(existing.clone()), new_rows.clone())
                .unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_gap_resolution,
    bench_plan_windows,
    bench_join,
    bench_merge
);
criterion_main!(benches);
