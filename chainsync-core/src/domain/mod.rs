//! Domain types: instruments, timeframes, aspects, records

pub mod instrument;
pub mod query;
pub mod record;
pub mod timeframe;

pub use instrument::{Instrument, InstrumentError, InstrumentKind, RootLists};
pub use query::{
    Aspect, AspectGroup, DataType, DatasetKey, FetchWindow, OptionContract, QueryDescriptor,
    Right, CONTRACT_COLUMNS, EXPIRATION_COLUMN, RIGHT_COLUMN, STRIKE_COLUMN,
};
pub use record::{Record, RecordSet, Value};
pub use timeframe::{TimePoint, TimeRange, Timeframe, DATE_COLUMN, TIMESTAMP_COLUMN};
