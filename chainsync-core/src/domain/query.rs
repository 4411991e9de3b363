//! Aspects, dataset identity and the query descriptor sent to providers.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::instrument::{Instrument, InstrumentKind};
use super::timeframe::{TimePoint, Timeframe};

pub const EXPIRATION_COLUMN: &str = "expiration";
pub const STRIKE_COLUMN: &str = "strike";
pub const RIGHT_COLUMN: &str = "type";

/// Secondary sort/join columns of option datasets, in sort order.
pub const CONTRACT_COLUMNS: [&str; 3] = [EXPIRATION_COLUMN, STRIKE_COLUMN, RIGHT_COLUMN];

/// One kind of data about an instrument-date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aspect {
    Underlying,
    OptionQuote,
    OptionGreeks,
    OptionOpenInterest,
}

impl Aspect {
    pub fn is_option(&self) -> bool {
        !matches!(self, Aspect::Underlying)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Aspect::Underlying => "underlying",
            Aspect::OptionQuote => "option_quote",
            Aspect::OptionGreeks => "option_greeks",
            Aspect::OptionOpenInterest => "option_open_interest",
        }
    }
}

impl fmt::Display for Aspect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of persistence: a primary aspect plus the aspects joined onto it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AspectGroup {
    Underlying,
    Options,
    Greeks,
    OpenInterest,
}

impl AspectGroup {
    pub const ALL: [AspectGroup; 4] = [
        AspectGroup::Underlying,
        AspectGroup::Options,
        AspectGroup::Greeks,
        AspectGroup::OpenInterest,
    ];

    pub fn primary(&self) -> Aspect {
        match self {
            AspectGroup::Underlying => Aspect::Underlying,
            AspectGroup::Options => Aspect::OptionQuote,
            AspectGroup::Greeks => Aspect::OptionGreeks,
            AspectGroup::OpenInterest => Aspect::OptionOpenInterest,
        }
    }

    /// Aspects joined onto the primary, in override order (later wins).
    pub fn secondary(&self) -> &'static [Aspect] {
        match self {
            AspectGroup::Underlying | AspectGroup::OpenInterest => &[],
            AspectGroup::Options => &[Aspect::OptionGreeks, Aspect::OptionOpenInterest],
            AspectGroup::Greeks => &[Aspect::OptionOpenInterest],
        }
    }

    pub fn is_option(&self) -> bool {
        self.primary().is_option()
    }

    pub fn data_type(&self, kind: InstrumentKind) -> DataType {
        match (self, kind) {
            (AspectGroup::Underlying, InstrumentKind::Stock) => DataType::Stock,
            (AspectGroup::Underlying, InstrumentKind::Index) => DataType::Index,
            (AspectGroup::Options, _) => DataType::Options,
            (AspectGroup::Greeks, _) => DataType::Greeks,
            (AspectGroup::OpenInterest, _) => DataType::OpenInterest,
        }
    }

    /// Natural key of rows in this group's datasets.
    pub fn key_columns(&self, timeframe: Timeframe) -> Vec<String> {
        let mut key = vec![timeframe.time_column().to_string()];
        if self.is_option() {
            key.extend(CONTRACT_COLUMNS.iter().map(|c| c.to_string()));
        }
        key
    }
}

impl fmt::Display for AspectGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AspectGroup::Underlying => "underlying",
            AspectGroup::Options => "options",
            AspectGroup::Greeks => "greeks",
            AspectGroup::OpenInterest => "open_interest",
        };
        f.write_str(s)
    }
}

impl FromStr for AspectGroup {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AspectGroup::ALL
            .into_iter()
            .find(|g| g.to_string() == s)
            .ok_or_else(|| format!("unknown aspect group '{s}'"))
    }
}

/// Data-type segment of a dataset file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Options,
    Greeks,
    Underlying,
    Stock,
    Index,
    OpenInterest,
}

impl DataType {
    pub const ALL: [DataType; 6] = [
        DataType::Options,
        DataType::Greeks,
        DataType::Underlying,
        DataType::Stock,
        DataType::Index,
        DataType::OpenInterest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Options => "options",
            DataType::Greeks => "greeks",
            DataType::Underlying => "underlying",
            DataType::Stock => "stock",
            DataType::Index => "index",
            DataType::OpenInterest => "open_interest",
        }
    }

    pub fn is_option(&self) -> bool {
        matches!(self, DataType::Options | DataType::Greeks | DataType::OpenInterest)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DataType::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| format!("unknown data type '{s}'"))
    }
}

/// Identity of one persisted dataset file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatasetKey {
    pub symbol: String,
    pub data_type: DataType,
    pub timeframe: Timeframe,
}

impl DatasetKey {
    pub const EXTENSION: &'static str = "parquet";

    pub fn new(symbol: impl Into<String>, data_type: DataType, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            data_type,
            timeframe,
        }
    }

    /// `{symbol}_{data_type}_{timeframe}.parquet`
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{}.{}",
            self.symbol,
            self.data_type,
            self.timeframe,
            Self::EXTENSION
        )
    }

    /// Inverse of [`file_name`](Self::file_name).
    ///
    /// Symbols may contain underscores, so the data type is matched as a
    /// suffix of everything before the timeframe.
    pub fn parse_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(&format!(".{}", Self::EXTENSION))?;
        let (rest, timeframe) = stem.rsplit_once('_')?;
        let timeframe: Timeframe = timeframe.parse().ok()?;

        DataType::ALL.into_iter().find_map(|data_type| {
            let symbol = rest.strip_suffix(&format!("_{}", data_type.as_str()))?;
            (!symbol.is_empty()).then(|| DatasetKey::new(symbol, data_type, timeframe))
        })
    }
}

impl fmt::Display for DatasetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.symbol, self.data_type, self.timeframe)
    }
}

/// Call or put.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Right {
    #[serde(alias = "C", alias = "call")]
    Call,
    #[serde(alias = "P", alias = "put")]
    Put,
}

impl Right {
    /// Code stored in the `type` column and sent to the provider.
    pub fn code(&self) -> &'static str {
        match self {
            Right::Call => "C",
            Right::Put => "P",
        }
    }
}

/// A single option contract filter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptionContract {
    pub expiration: NaiveDate,
    pub strike: f64,
    pub right: Right,
}

/// Inclusive span of grid points fetched in one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub first: TimePoint,
    pub last: TimePoint,
}

impl FetchWindow {
    pub fn point(p: TimePoint) -> Self {
        Self { first: p, last: p }
    }

    pub fn start_date(&self) -> NaiveDate {
        self.first.date()
    }

    pub fn end_date(&self) -> NaiveDate {
        self.last.date()
    }
}

impl fmt::Display for FetchWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.first == self.last {
            write!(f, "{}", self.first)
        } else {
            write!(f, "{}..{}", self.first, self.last)
        }
    }
}

/// The unit of request to a data provider.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDescriptor {
    pub instrument: Instrument,
    pub aspect: Aspect,
    pub timeframe: Timeframe,
    pub window: FetchWindow,
    /// `None` requests the whole chain for option aspects.
    pub contract: Option<OptionContract>,
}
