//! Data provider trait and structured error types.
//!
//! The MarketDataProvider trait abstracts over data sources (the local
//! ThetaData terminal, canned in-memory data) so the sync engine can be
//! driven against a mock in tests.

use chrono::NaiveDate;
use std::collections::BTreeSet;
use thiserror::Error;

use crate::domain::{Instrument, InstrumentKind, QueryDescriptor, RecordSet, Timeframe};

/// Failures surfaced by a provider.
///
/// A successful response with no rows is not an error: providers return an
/// empty `RecordSet` for it.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("hard stop: data provider has blocked requests (circuit breaker tripped)")]
    CircuitBreakerTripped,

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),
}

/// Fetch capability consumed by the sync engine.
///
/// Retry and rate-limit policy belong to implementations; the engine
/// never retries a failed fetch.
pub trait MarketDataProvider: Send + Sync {
    /// Human-readable name of this provider.
    fn name(&self) -> &str;

    /// Return the records for one query descriptor.
    fn fetch(&self, query: &QueryDescriptor) -> Result<RecordSet, ProviderError>;

    /// Health check consulted before any work is dispatched.
    fn is_available(&self) -> bool;

    /// Root symbols the provider lists for an instrument kind.
    fn list_roots(&self, kind: InstrumentKind) -> Result<BTreeSet<String>, ProviderError>;

    /// Dates on which the provider has data for the instrument.
    ///
    /// `None` means the provider cannot say, and no restriction applies.
    fn available_dates(
        &self,
        _instrument: &Instrument,
        _timeframe: Timeframe,
    ) -> Result<Option<BTreeSet<NaiveDate>>, ProviderError> {
        Ok(None)
    }
}
