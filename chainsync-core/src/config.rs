//! Sync configuration, loaded from TOML.
//!
//! ```toml
//! data_dir = "data"
//! mode = "tail"
//! workers = 4
//!
//! [provider]
//! base_url = "http://127.0.0.1:25510"
//!
//! [[instruments]]
//! symbol = "SPY"
//! timeframes = ["daily", "5minute"]
//! groups = ["underlying", "options"]
//! start = "2024-01-01"
//! ```

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::data::circuit_breaker::CircuitBreaker;
use crate::data::provider::{MarketDataProvider, ProviderError};
use crate::data::theta::{ThetaProvider, DEFAULT_BASE_URL};
use crate::domain::{
    AspectGroup, Instrument, InstrumentError, InstrumentKind, OptionContract, RootLists, TimeRange,
    Timeframe,
};
use crate::sync::{
    FetchGranularity, SyncError, SyncMode, SyncOptions, SyncUnit, UnresolvedInstrument,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config TOML: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_workers() -> usize {
    4
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

/// Connection settings of the ThetaData terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

impl ProviderConfig {
    pub fn build(&self) -> Result<ThetaProvider, ProviderError> {
        let provider = ThetaProvider::new(
            self.base_url.clone(),
            Duration::from_secs(self.timeout_secs),
            Arc::new(CircuitBreaker::default_provider()),
        )?;
        Ok(provider.with_retry_policy(
            self.max_retries,
            Duration::from_millis(self.retry_base_delay_ms),
        ))
    }
}

/// One symbol and the datasets to keep for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstrumentConfig {
    pub symbol: String,
    /// Resolved from the provider's root lists when absent.
    #[serde(default)]
    pub kind: Option<InstrumentKind>,
    pub timeframes: Vec<Timeframe>,
    pub groups: Vec<AspectGroup>,
    pub start: NaiveDate,
    /// Defaults to the day the sync runs.
    #[serde(default)]
    pub end: Option<NaiveDate>,
    #[serde(default)]
    pub contracts: Vec<OptionContract>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub mode: SyncMode,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub fetch_granularity: FetchGranularity,
    #[serde(default)]
    pub restrict_to_available_dates: bool,
    #[serde(default)]
    pub provider: ProviderConfig,
    pub instruments: Vec<InstrumentConfig>,
}

impl SyncConfig {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instruments.is_empty() {
            return Err(ConfigError::Invalid("no instruments configured".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        for inst in &self.instruments {
            if inst.symbol.trim().is_empty() {
                return Err(ConfigError::Invalid("instrument with empty symbol".into()));
            }
            if inst.timeframes.is_empty() {
                return Err(ConfigError::Invalid(format!("{}: no timeframes", inst.symbol)));
            }
            if inst.groups.is_empty() {
                return Err(ConfigError::Invalid(format!("{}: no groups", inst.symbol)));
            }
            if let Some(end) = inst.end {
                if end < inst.start {
                    return Err(ConfigError::Invalid(format!(
                        "{}: end {end} is before start {}",
                        inst.symbol, inst.start
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn options(&self) -> SyncOptions {
        SyncOptions {
            mode: self.mode,
            granularity: self.fetch_granularity,
            restrict_to_available_dates: self.restrict_to_available_dates,
            workers: self.workers,
        }
    }

    /// Expand instruments into units of work, one per (timeframe, group).
    ///
    /// Probes the provider first and fails fast when it is unreachable.
    /// Kinds not given in the config come from the provider's root lists,
    /// fetched at most once. A symbol that cannot be resolved is reported in
    /// `unresolved` and the other symbols still expand. Instruments without
    /// an `end` sync through `today`.
    pub fn units(
        &self,
        provider: &dyn MarketDataProvider,
        today: NaiveDate,
    ) -> Result<UnitExpansion, SyncError> {
        if !provider.is_available() {
            return Err(SyncError::ProviderUnhealthy(provider.name().to_string()));
        }

        let mut roots: Option<Result<RootLists, String>> = None;
        let mut expansion = UnitExpansion::default();
        for inst in &self.instruments {
            let resolved = match inst.kind {
                Some(kind) => Ok(Instrument::new(inst.symbol.clone(), kind)),
                None => match roots
                    .get_or_insert_with(|| RootLists::fetch(provider).map_err(|e| e.to_string()))
                {
                    Ok(lists) => Instrument::resolve(&inst.symbol, lists),
                    Err(reason) => Err(InstrumentError::RootsUnavailable {
                        symbol: inst.symbol.clone(),
                        reason: reason.clone(),
                    }),
                },
            };
            let instrument = match resolved {
                Ok(instrument) => instrument,
                Err(error) => {
                    warn!(symbol = %inst.symbol, %error, "instrument skipped");
                    expansion.unresolved.push(UnresolvedInstrument {
                        symbol: inst.symbol.clone(),
                        error,
                    });
                    continue;
                }
            };

            let range = TimeRange::whole_days(inst.start, inst.end.unwrap_or(today));
            for &timeframe in &inst.timeframes {
                for &group in &inst.groups {
                    expansion.units.push(SyncUnit {
                        instrument: instrument.clone(),
                        group,
                        timeframe,
                        range,
                        contracts: if group.is_option() {
                            inst.contracts.clone()
                        } else {
                            Vec::new()
                        },
                    });
                }
            }
        }
        Ok(expansion)
    }
}

/// Units built from a config, plus the symbols that could not be resolved.
#[derive(Debug, Default)]
pub struct UnitExpansion {
    pub units: Vec<SyncUnit>,
    pub unresolved: Vec<UnresolvedInstrument>,
}
