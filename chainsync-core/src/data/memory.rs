//! In-memory provider for tests and benches.
//!
//! Serves canned record sets per (symbol, aspect, timeframe), filtered to
//! the requested window and contract, and can be told to fail.

use chrono::NaiveDate;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::provider::{MarketDataProvider, ProviderError};
use crate::domain::{
    Aspect, Instrument, InstrumentKind, QueryDescriptor, Record, RecordSet, Timeframe, Value,
    EXPIRATION_COLUMN, RIGHT_COLUMN, STRIKE_COLUMN,
};
use crate::sync::coverage::normalize_time_value;

type SeriesKey = (String, Aspect, Timeframe);

#[derive(Debug, Default)]
pub struct InMemoryProvider {
    series: HashMap<SeriesKey, RecordSet>,
    failures: Mutex<HashMap<SeriesKey, u16>>,
    roots: HashMap<InstrumentKind, BTreeSet<String>>,
    available: HashMap<String, BTreeSet<NaiveDate>>,
    unhealthy: AtomicBool,
    fetches: AtomicUsize,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `records` for every query on (symbol, aspect, timeframe).
    pub fn with_series(
        mut self,
        symbol: &str,
        aspect: Aspect,
        timeframe: Timeframe,
        records: RecordSet,
    ) -> Self {
        self.series
            .insert((symbol.to_string(), aspect, timeframe), records);
        self
    }

    pub fn with_roots<I, S>(mut self, kind: InstrumentKind, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roots
            .entry(kind)
            .or_default()
            .extend(symbols.into_iter().map(Into::into));
        self
    }

    pub fn with_available_dates(
        mut self,
        symbol: &str,
        dates: impl IntoIterator<Item = NaiveDate>,
    ) -> Self {
        self.available
            .insert(symbol.to_string(), dates.into_iter().collect());
        self
    }

    /// Make every later fetch of (symbol, aspect, timeframe) fail with `status`.
    pub fn fail_with(&self, symbol: &str, aspect: Aspect, timeframe: Timeframe, status: u16) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((symbol.to_string(), aspect, timeframe), status);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.unhealthy.store(!healthy, Ordering::SeqCst);
    }

    /// Number of `fetch` calls served so far, failures included.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn matches_contract(query: &QueryDescriptor, row: &Record) -> bool {
        let Some(c) = &query.contract else {
            return true;
        };
        row.get(EXPIRATION_COLUMN) == &Value::Date(c.expiration)
            && row.get(STRIKE_COLUMN).as_f64() == Some(c.strike)
            && row.get(RIGHT_COLUMN).as_str() == Some(c.right.code())
    }
}

impl MarketDataProvider for InMemoryProvider {
    fn name(&self) -> &str {
        "in_memory"
    }

    fn fetch(&self, query: &QueryDescriptor) -> Result<RecordSet, ProviderError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let key = (query.instrument.symbol.clone(), query.aspect, query.timeframe);
        if let Some(status) = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return Err(ProviderError::Status {
                status: *status,
                body: format!("injected failure for {}", query.aspect),
            });
        }

        let Some(canned) = self.series.get(&key) else {
            return Ok(RecordSet::default());
        };

        let column = query.timeframe.time_column();
        let mut out = RecordSet::new(canned.columns().iter().cloned());
        for row in canned.rows() {
            let point = normalize_time_value(column, row.get(column), query.timeframe)
                .map_err(|e| ProviderError::ResponseFormatChanged(e.to_string()))?;
            let in_window = point
                .map(|p| p >= query.window.first && p <= query.window.last)
                .unwrap_or(false);
            if in_window && Self::matches_contract(query, row) {
                out.push(row.clone());
            }
        }
        Ok(out)
    }

    fn is_available(&self) -> bool {
        !self.unhealthy.load(Ordering::SeqCst)
    }

    fn list_roots(&self, kind: InstrumentKind) -> Result<BTreeSet<String>, ProviderError> {
        Ok(self.roots.get(&kind).cloned().unwrap_or_default())
    }

    fn available_dates(
        &self,
        instrument: &Instrument,
        _timeframe: Timeframe,
    ) -> Result<Option<BTreeSet<NaiveDate>>, ProviderError> {
        Ok(self.available.get(&instrument.symbol).cloned())
    }
}
