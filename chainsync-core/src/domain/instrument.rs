use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::data::provider::{MarketDataProvider, ProviderError};

/// Whether the underlying trades as a stock or is a computed index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    Stock,
    Index,
}

impl InstrumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentKind::Stock => "stock",
            InstrumentKind::Index => "index",
        }
    }
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstrumentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stock" => Ok(InstrumentKind::Stock),
            "index" => Ok(InstrumentKind::Index),
            other => Err(format!("unknown instrument kind '{other}' (expected stock or index)")),
        }
    }
}

/// The underlying being synced.
///
/// The kind is fixed once per sync session; every unit of work for the
/// symbol shares the same `Instrument` value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub kind: InstrumentKind,
}

#[derive(Debug, Error)]
pub enum InstrumentError {
    #[error("symbol '{symbol}' is neither a stock nor an index root at the provider")]
    UnknownSymbol { symbol: String },

    #[error("could not resolve instrument kind for '{symbol}': {reason}")]
    RootsUnavailable { symbol: String, reason: String },
}

/// The provider's stock and index root lists, fetched once per session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootLists {
    stock: BTreeSet<String>,
    index: BTreeSet<String>,
}

impl RootLists {
    pub fn fetch(provider: &dyn MarketDataProvider) -> Result<Self, ProviderError> {
        Ok(Self {
            stock: provider.list_roots(InstrumentKind::Stock)?,
            index: provider.list_roots(InstrumentKind::Index)?,
        })
    }

    /// Stock roots win over index roots.
    pub fn kind_of(&self, symbol: &str) -> Option<InstrumentKind> {
        if self.stock.contains(symbol) {
            Some(InstrumentKind::Stock)
        } else if self.index.contains(symbol) {
            Some(InstrumentKind::Index)
        } else {
            None
        }
    }
}

impl Instrument {
    pub fn new(symbol: impl Into<String>, kind: InstrumentKind) -> Self {
        Self {
            symbol: symbol.into(),
            kind,
        }
    }

    /// Classify `symbol` by the provider's root lists.
    pub fn resolve(symbol: &str, roots: &RootLists) -> Result<Self, InstrumentError> {
        roots
            .kind_of(symbol)
            .map(|kind| Self::new(symbol, kind))
            .ok_or_else(|| InstrumentError::UnknownSymbol {
                symbol: symbol.to_string(),
            })
    }
}
