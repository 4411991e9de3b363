//! ThetaData terminal provider.
//!
//! Talks to the local ThetaData terminal over its v2 REST API. The terminal
//! proxies requests to ThetaData's servers; this client only needs the base
//! URL it listens on.
//!
//! Handles retries with exponential backoff plus jitter, the circuit
//! breaker, and decoding of both plain (`[[...], ...]`) and bulk
//! (`[{ticks, contract}, ...]`) responses into records.

use chrono::{Duration as ChronoDuration, NaiveDate, NaiveTime};
use rand::Rng;
use serde::Deserialize;
use serde_json::Value as Json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::circuit_breaker::CircuitBreaker;
use super::provider::{MarketDataProvider, ProviderError};
use crate::domain::{
    Aspect, Instrument, InstrumentKind, QueryDescriptor, Record, RecordSet, Timeframe, Value,
    CONTRACT_COLUMNS, DATE_COLUMN, EXPIRATION_COLUMN, RIGHT_COLUMN, STRIKE_COLUMN, TIMESTAMP_COLUMN,
};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:25510";

/// Terminal status for "no data in the requested window".
const NO_DATA_STATUS: u16 = 472;

/// Strikes arrive in tenths of a cent.
const STRIKE_SCALE: f64 = 1000.0;

/// Fields of the terminal's end-of-day reports (stock and option).
const EOD_FORMAT: &[&str] = &[
    "ms_of_day", "ms_of_day2", "open", "high", "low", "close", "volume", "count", "bid_size",
    "bid_exchange", "bid", "bid_condition", "ask_size", "ask_exchange", "ask", "ask_condition",
    "date",
];

const QUOTE_FORMAT: &[&str] = &[
    "ms_of_day", "bid_size", "bid_exchange", "bid", "bid_condition", "ask_size", "ask_exchange",
    "ask", "ask_condition", "date",
];

const INDEX_PRICE_FORMAT: &[&str] = &["ms_of_day", "price", "date"];

const INDEX_OHLC_FORMAT: &[&str] = &[
    "ms_of_day", "open", "high", "low", "close", "volume", "count", "date",
];

const GREEKS_FORMAT: &[&str] = &[
    "ms_of_day", "bid", "ask", "delta", "theta", "vega", "rho", "epsilon", "lambda",
    "implied_vol", "iv_error", "ms_of_day2", "underlying_price", "date",
];

const EOD_GREEKS_FORMAT: &[&str] = &[
    "ms_of_day", "ms_of_day2", "open", "high", "low", "close", "volume", "count", "bid_size",
    "bid_exchange", "bid", "bid_condition", "ask_size", "ask_exchange", "ask", "ask_condition",
    "delta", "theta", "vega", "rho", "epsilon", "lambda", "gamma", "vanna", "charm", "vomma",
    "veta", "vera", "speed", "zomma", "color", "ultima", "d1", "d2", "dual_delta", "dual_gamma",
    "implied_vol", "iv_error", "underlying_ms_of_day", "underlying_price", "date",
];

const OPEN_INTEREST_FORMAT: &[&str] = &["ms_of_day", "open_interest", "date"];

/// Fields an endpoint declares in its header.
///
/// The 472 "no data" answer has no header at all, so empty windows take
/// their columns from here and a day without Greeks keeps the same schema as
/// a day with them.
fn declared_format(path: &str) -> &'static [&'static str] {
    match path {
        "/v2/hist/stock/eod" | "/v2/hist/option/eod" | "/v2/bulk_hist/option/eod" => EOD_FORMAT,
        "/v2/hist/stock/quote" | "/v2/hist/option/quote" | "/v2/bulk_hist/option/quote" => {
            QUOTE_FORMAT
        }
        "/v2/hist/index/price" => INDEX_PRICE_FORMAT,
        "/v2/hist/index/ohlc" => INDEX_OHLC_FORMAT,
        "/v2/hist/option/greeks" | "/v2/bulk_hist/option/greeks" => GREEKS_FORMAT,
        "/v2/hist/option/eod_greeks" | "/v2/bulk_hist/option/eod_greeks" => EOD_GREEKS_FORMAT,
        "/v2/hist/option/open_interest" | "/v2/bulk_hist/option/open_interest" => {
            OPEN_INTEREST_FORMAT
        }
        _ => &[],
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    header: Header,
    #[serde(default)]
    response: Vec<Json>,
}

#[derive(Debug, Default, Deserialize)]
struct Header {
    #[serde(default)]
    format: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    ticks: Vec<Vec<Json>>,
    #[serde(default)]
    contract: serde_json::Map<String, Json>,
}

/// ThetaData terminal provider.
pub struct ThetaProvider {
    client: reqwest::blocking::Client,
    base_url: String,
    circuit_breaker: Arc<CircuitBreaker>,
    max_retries: u32,
    base_delay: Duration,
}

impl ThetaProvider {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            circuit_breaker,
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        })
    }

    pub fn with_retry_policy(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.base_delay = base_delay;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Backoff before retry `attempt` (1-based): base * 2^(attempt-1) plus up
    /// to 50% jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_delay * 2u32.saturating_pow(attempt - 1);
        let jitter_ms = (base.as_millis() / 2) as u64;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        base + Duration::from_millis(jitter)
    }

    /// GET with retry and circuit breaker logic. `Ok(None)` is the
    /// terminal's "no data" answer.
    fn get_with_retry(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Option<Envelope>, ProviderError> {
        if !self.circuit_breaker.is_allowed() {
            return Err(ProviderError::CircuitBreakerTripped);
        }

        let url = self.url(path);
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.backoff(attempt);
                debug!(path, attempt, delay_ms = delay.as_millis() as u64, "retrying");
                std::thread::sleep(delay);
            }

            if !self.circuit_breaker.is_allowed() {
                return Err(ProviderError::CircuitBreakerTripped);
            }

            let resp = match self.client.get(&url).query(params).send() {
                Ok(resp) => resp,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    self.circuit_breaker.record_failure();
                    last_error = Some(ProviderError::Unavailable(e.to_string()));
                    continue;
                }
                Err(e) => return Err(ProviderError::Unavailable(e.to_string())),
            };

            let status = resp.status();

            if status.as_u16() == NO_DATA_STATUS {
                self.circuit_breaker.record_success();
                return Ok(None);
            }

            if status == reqwest::StatusCode::FORBIDDEN {
                self.circuit_breaker.trip();
                return Err(ProviderError::CircuitBreakerTripped);
            }

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                self.circuit_breaker.record_failure();
                let body = resp.text().unwrap_or_default();
                warn!(path, status = status.as_u16(), "provider request failed");
                last_error = Some(ProviderError::Status {
                    status: status.as_u16(),
                    body,
                });
                continue;
            }

            if !status.is_success() {
                return Err(ProviderError::Status {
                    status: status.as_u16(),
                    body: resp.text().unwrap_or_default(),
                });
            }

            let text = resp
                .text()
                .map_err(|e| ProviderError::Unavailable(format!("reading body of {path}: {e}")))?;
            let envelope: Envelope = serde_json::from_str(&text).map_err(|e| {
                ProviderError::ResponseFormatChanged(format!("failed to parse {path}: {e}"))
            })?;
            self.circuit_breaker.record_success();
            return Ok(Some(envelope));
        }

        Err(last_error
            .unwrap_or_else(|| ProviderError::Unavailable("max retries exceeded".into())))
    }

    fn endpoint(query: &QueryDescriptor) -> &'static str {
        let intraday = query.timeframe.is_intraday();
        let bulk = query.contract.is_none();
        match (query.aspect, query.instrument.kind) {
            (Aspect::Underlying, InstrumentKind::Stock) if intraday => "/v2/hist/stock/quote",
            (Aspect::Underlying, InstrumentKind::Stock) => "/v2/hist/stock/eod",
            (Aspect::Underlying, InstrumentKind::Index) if intraday => "/v2/hist/index/ohlc",
            (Aspect::Underlying, InstrumentKind::Index) => "/v2/hist/index/price",
            (Aspect::OptionQuote, _) => match (bulk, intraday) {
                (true, true) => "/v2/bulk_hist/option/quote",
                (true, false) => "/v2/bulk_hist/option/eod",
                (false, true) => "/v2/hist/option/quote",
                (false, false) => "/v2/hist/option/eod",
            },
            (Aspect::OptionGreeks, _) => match (bulk, intraday) {
                (true, true) => "/v2/bulk_hist/option/greeks",
                (true, false) => "/v2/bulk_hist/option/eod_greeks",
                (false, true) => "/v2/hist/option/greeks",
                (false, false) => "/v2/hist/option/eod_greeks",
            },
            (Aspect::OptionOpenInterest, _) if bulk => "/v2/bulk_hist/option/open_interest",
            (Aspect::OptionOpenInterest, _) => "/v2/hist/option/open_interest",
        }
    }

    fn params(query: &QueryDescriptor) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("root", query.instrument.symbol.clone()),
            ("start_date", yyyymmdd(query.window.start_date())),
            ("end_date", yyyymmdd(query.window.end_date())),
        ];
        if let Some(ivl) = query.timeframe.interval_ms() {
            params.push(("ivl", ivl.to_string()));
            if query.aspect == Aspect::Underlying && query.instrument.kind == InstrumentKind::Stock
            {
                params.push(("rth", "false".to_string()));
            }
        }
        if query.aspect.is_option() {
            match &query.contract {
                Some(c) => {
                    params.push(("exp", yyyymmdd(c.expiration)));
                    params.push(("strike", ((c.strike * STRIKE_SCALE).round() as i64).to_string()));
                    params.push(("right", c.right.code().to_string()));
                }
                None => params.push(("exp", "0".to_string())),
            }
        }
        params
    }

    fn list(&self, path: &str, params: &[(&str, String)]) -> Result<Vec<Json>, ProviderError> {
        Ok(self
            .get_with_retry(path, params)?
            .map(|e| e.response)
            .unwrap_or_default())
    }
}

fn yyyymmdd(d: NaiveDate) -> String {
    d.format("%Y%m%d").to_string()
}

fn parse_yyyymmdd(v: &Json) -> Option<NaiveDate> {
    let n = match v {
        Json::Number(n) => n.as_i64()?,
        Json::String(s) => s.parse().ok()?,
        _ => return None,
    };
    let n = i32::try_from(n).ok()?;
    NaiveDate::from_ymd_opt(n / 10_000, (n / 100 % 100) as u32, (n % 100) as u32)
}

fn plain_value(v: &Json) -> Value {
    match v {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => n
            .as_i64()
            .map(Value::Int)
            .or_else(|| n.as_f64().map(Value::Float))
            .unwrap_or(Value::Null),
        Json::String(s) => Value::Str(s.clone()),
        other => Value::Str(other.to_string()),
    }
}

/// Store one named field of a tick or contract, renaming and rescaling the
/// contract identity fields.
fn set_field(record: &mut Record, name: &str, v: &Json) -> Result<(), ProviderError> {
    let bad = |what: &str| ProviderError::ResponseFormatChanged(format!("bad {what}: {v}"));
    match name {
        "date" => record.set(DATE_COLUMN, parse_yyyymmdd(v).ok_or_else(|| bad("date"))?),
        "expiration" => record.set(
            EXPIRATION_COLUMN,
            parse_yyyymmdd(v).ok_or_else(|| bad("expiration"))?,
        ),
        "strike" => {
            let raw = v.as_f64().ok_or_else(|| bad("strike"))?;
            record.set(STRIKE_COLUMN, raw / STRIKE_SCALE);
        }
        "right" => record.set(RIGHT_COLUMN, v.as_str().ok_or_else(|| bad("right"))?),
        // The contract object repeats the query root.
        "root" => {}
        _ => record.set(name, plain_value(v)),
    }
    Ok(())
}

fn column_name(field: &str) -> &str {
    match field {
        "right" => RIGHT_COLUMN,
        other => other,
    }
}

fn decode_tick(
    format: &[String],
    tick: &[Json],
    timeframe: Timeframe,
) -> Result<Record, ProviderError> {
    if tick.len() != format.len() {
        return Err(ProviderError::ResponseFormatChanged(format!(
            "row has {} fields, header declares {}",
            tick.len(),
            format.len()
        )));
    }
    let mut record = Record::new();
    for (name, v) in format.iter().zip(tick) {
        set_field(&mut record, name, v)?;
    }
    if timeframe.is_intraday() {
        let day = match record.get(DATE_COLUMN) {
            Value::Date(d) => Some(*d),
            _ => None,
        };
        if let (Some(day), Some(ms)) = (day, record.get("ms_of_day").as_f64()) {
            let ts = day.and_time(NaiveTime::MIN) + ChronoDuration::milliseconds(ms as i64);
            record.set(TIMESTAMP_COLUMN, ts);
        }
    }
    Ok(record)
}

/// Header of a decoded response: the endpoint's declared fields, any extra
/// fields the response itself declares, the derived `timestamp` for
/// intraday data and the contract columns for option aspects.
fn response_header(format: &[String], query: &QueryDescriptor) -> RecordSet {
    let declared = declared_format(ThetaProvider::endpoint(query));
    let fields: Vec<&str> = declared
        .iter()
        .copied()
        .chain(format.iter().map(String::as_str))
        .collect();

    let mut columns: Vec<&str> = Vec::new();
    if query.timeframe.is_intraday() && fields.contains(&"ms_of_day") {
        columns.push(TIMESTAMP_COLUMN);
    }
    columns.extend(fields.iter().map(|f| column_name(f)));
    if query.aspect.is_option() {
        columns.extend(CONTRACT_COLUMNS);
    }
    RecordSet::new(columns)
}

/// Decode a `{header, response}` envelope into records.
///
/// Option rows always carry the contract columns: bulk items take them from
/// their `contract` object, single-contract requests from the query.
fn decode_rows(envelope: Envelope, query: &QueryDescriptor) -> Result<RecordSet, ProviderError> {
    let timeframe = query.timeframe;
    let format = envelope.header.format.unwrap_or_else(|| {
        declared_format(ThetaProvider::endpoint(query))
            .iter()
            .map(|f| f.to_string())
            .collect()
    });
    let mut set = response_header(&format, query);

    for item in envelope.response {
        match item {
            Json::Array(tick) => {
                let mut record = decode_tick(&format, &tick, timeframe)?;
                if let Some(c) = &query.contract {
                    record.set(EXPIRATION_COLUMN, c.expiration);
                    record.set(STRIKE_COLUMN, c.strike);
                    record.set(RIGHT_COLUMN, c.right.code());
                }
                set.push(record);
            }
            Json::Object(_) => {
                let bulk: BulkItem = serde_json::from_value(item).map_err(|e| {
                    ProviderError::ResponseFormatChanged(format!("bad bulk item: {e}"))
                })?;
                for tick in &bulk.ticks {
                    let mut record = decode_tick(&format, tick, timeframe)?;
                    for (name, v) in &bulk.contract {
                        set_field(&mut record, name, v)?;
                    }
                    set.push(record);
                }
            }
            other => {
                return Err(ProviderError::ResponseFormatChanged(format!(
                    "unexpected response item: {other}"
                )))
            }
        }
    }
    Ok(set)
}

impl MarketDataProvider for ThetaProvider {
    fn name(&self) -> &str {
        "thetadata"
    }

    fn fetch(&self, query: &QueryDescriptor) -> Result<RecordSet, ProviderError> {
        let path = Self::endpoint(query);
        let params = Self::params(query);
        debug!(
            symbol = %query.instrument.symbol,
            aspect = %query.aspect,
            window = %query.window,
            path,
            "fetching"
        );
        match self.get_with_retry(path, &params)? {
            Some(envelope) => decode_rows(envelope, query),
            None => Ok(response_header(&[], query)),
        }
    }

    fn is_available(&self) -> bool {
        if !self.circuit_breaker.is_allowed() {
            return false;
        }
        self.client
            .get(self.url("/v2/list/roots/option"))
            .send()
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    fn list_roots(&self, kind: InstrumentKind) -> Result<BTreeSet<String>, ProviderError> {
        let path = format!("/v2/list/roots/{}", kind.as_str());
        Ok(self
            .list(&path, &[])?
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect())
    }

    fn available_dates(
        &self,
        instrument: &Instrument,
        _timeframe: Timeframe,
    ) -> Result<Option<BTreeSet<NaiveDate>>, ProviderError> {
        let path = format!("/v2/list/dates/{}/quote", instrument.kind.as_str());
        let dates = self
            .list(&path, &[("root", instrument.symbol.clone())])?
            .iter()
            .filter_map(parse_yyyymmdd)
            .collect();
        Ok(Some(dates))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FetchWindow, OptionContract, Right, TimePoint};

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn query(aspect: Aspect, kind: InstrumentKind, tf: Timeframe) -> QueryDescriptor {
        QueryDescriptor {
            instrument: Instrument::new("SPY", kind),
            aspect,
            timeframe: tf,
            window: FetchWindow {
                first: TimePoint::Day(date(2)),
                last: TimePoint::Day(date(5)),
            },
            contract: None,
        }
    }

    fn envelope(json: &str) -> Envelope {
        serde_json::from_str(json).unwrap()
    }

    fn daily_stock() -> QueryDescriptor {
        query(Aspect::Underlying, InstrumentKind::Stock, Timeframe::Daily)
    }

    #[test]
    fn endpoints_by_aspect_and_granularity() {
        let daily = Timeframe::Daily;
        let m5 = Timeframe::minutes(5);
        assert_eq!(
            ThetaProvider::endpoint(&query(Aspect::Underlying, InstrumentKind::Stock, daily)),
            "/v2/hist/stock/eod"
        );
        assert_eq!(
            ThetaProvider::endpoint(&query(Aspect::Underlying, InstrumentKind::Index, m5)),
            "/v2/hist/index/ohlc"
        );
        assert_eq!(
            ThetaProvider::endpoint(&query(Aspect::OptionGreeks, InstrumentKind::Stock, daily)),
            "/v2/bulk_hist/option/eod_greeks"
        );

        let mut q = query(Aspect::OptionQuote, InstrumentKind::Stock, m5);
        q.contract = Some(OptionContract {
            expiration: date(19),
            strike: 470.0,
            right: Right::Call,
        });
        assert_eq!(ThetaProvider::endpoint(&q), "/v2/hist/option/quote");
    }

    #[test]
    fn params_for_contract_and_bulk() {
        let mut q = query(Aspect::OptionQuote, InstrumentKind::Stock, Timeframe::minutes(1));
        let bulk = ThetaProvider::params(&q);
        assert!(bulk.contains(&("exp", "0".to_string())));
        assert!(bulk.contains(&("ivl", "60000".to_string())));
        assert!(bulk.contains(&("start_date", "20240102".to_string())));

        q.contract = Some(OptionContract {
            expiration: date(19),
            strike: 472.5,
            right: Right::Put,
        });
        let single = ThetaProvider::params(&q);
        assert!(single.contains(&("exp", "20240119".to_string())));
        assert!(single.contains(&("strike", "472500".to_string())));
        assert!(single.contains(&("right", "P".to_string())));
    }

    #[test]
    fn stock_intraday_excludes_rth_filter() {
        let q = query(Aspect::Underlying, InstrumentKind::Stock, Timeframe::minutes(5));
        assert!(ThetaProvider::params(&q).contains(&("rth", "false".to_string())));
    }

    #[test]
    fn decodes_plain_daily_rows() {
        let env = envelope(
            r#"{"header":{"format":["ms_of_day","open","close","volume","date"]},
                "response":[[57600000,470.1,471.25,1000,20240102],[57600000,471.0,469.5,900,20240103]]}"#,
        );
        let set = decode_rows(env, &daily_stock()).unwrap();
        assert_eq!(set.len(), 2);
        assert!(!set.has_column("timestamp"));
        assert_eq!(set.rows()[0].get("date"), &Value::Date(date(2)));
        assert_eq!(set.rows()[1].get("close"), &Value::Float(469.5));
        assert_eq!(set.rows()[1].get("volume"), &Value::Int(900));
    }

    #[test]
    fn intraday_rows_gain_timestamp() {
        let env = envelope(
            r#"{"header":{"format":["ms_of_day","bid","ask","date"]},
                "response":[[34200000,1.0,1.1,20240102]]}"#,
        );
        let q = query(Aspect::Underlying, InstrumentKind::Stock, Timeframe::minutes(1));
        let set = decode_rows(env, &q).unwrap();
        assert_eq!(set.columns()[0], "timestamp");
        assert_eq!(
            set.rows()[0].get("timestamp"),
            &Value::Timestamp(date(2).and_hms_opt(9, 30, 0).unwrap())
        );
    }

    #[test]
    fn decodes_bulk_items_with_contract() {
        let env = envelope(
            r#"{"header":{"format":["ms_of_day","delta","date"]},
                "response":[{"ticks":[[57600000,0.52,20240102]],
                             "contract":{"root":"SPY","expiration":20240119,"strike":470000,"right":"C"}}]}"#,
        );
        let q = query(Aspect::OptionGreeks, InstrumentKind::Stock, Timeframe::Daily);
        let set = decode_rows(env, &q).unwrap();
        let row = &set.rows()[0];
        assert_eq!(row.get("expiration"), &Value::Date(date(19)));
        assert_eq!(row.get("strike"), &Value::Float(470.0));
        assert_eq!(row.get("type"), &Value::from("C"));
        assert!(row.get("root").is_null());
        assert!(set.has_column("type"));
    }

    #[test]
    fn empty_response_keeps_declared_header() {
        let env = envelope(r#"{"header":{"format":["ms_of_day","open_interest","date"]},"response":[]}"#);
        let q = query(Aspect::OptionOpenInterest, InstrumentKind::Stock, Timeframe::Daily);
        let set = decode_rows(env, &q).unwrap();
        assert!(set.is_empty());
        assert!(set.has_column("open_interest"));
        assert!(set.has_column("strike"));
    }

    #[test]
    fn no_data_answer_declares_the_endpoint_columns() {
        let q = query(Aspect::OptionGreeks, InstrumentKind::Stock, Timeframe::Daily);
        let set = response_header(&[], &q);
        assert!(set.is_empty());
        for column in ["delta", "gamma", "implied_vol", "date", "expiration", "strike", "type"] {
            assert!(set.has_column(column), "missing {column}");
        }

        let oi = query(Aspect::OptionOpenInterest, InstrumentKind::Stock, Timeframe::minutes(5));
        let set = response_header(&[], &oi);
        assert_eq!(set.columns()[0], "timestamp");
        assert!(set.has_column("open_interest"));
    }

    #[test]
    fn greeks_day_and_empty_day_share_a_header() {
        let q = query(Aspect::OptionGreeks, InstrumentKind::Stock, Timeframe::Daily);
        let format: Vec<String> = EOD_GREEKS_FORMAT.iter().map(|f| f.to_string()).collect();
        let env = Envelope {
            header: Header {
                format: Some(format),
            },
            response: Vec::new(),
        };
        let with_header = decode_rows(env, &q).unwrap();
        assert_eq!(with_header.column_set(), response_header(&[], &q).column_set());
    }

    #[test]
    fn headerless_rows_use_the_declared_format() {
        let env = envelope(r#"{"header":{},"response":[[57600000,120,20240102]]}"#);
        let q = query(Aspect::OptionOpenInterest, InstrumentKind::Stock, Timeframe::Daily);
        let set = decode_rows(env, &q).unwrap();
        assert_eq!(set.rows()[0].get("open_interest"), &Value::Int(120));
        assert_eq!(set.rows()[0].get("date"), &Value::Date(date(2)));
    }

    #[test]
    fn unexpected_fields_extend_the_declared_header() {
        let env = envelope(
            r#"{"header":{"format":["ms_of_day","open_interest","oi_flag","date"]},
                "response":[[57600000,120,1,20240102]]}"#,
        );
        let q = query(Aspect::OptionOpenInterest, InstrumentKind::Stock, Timeframe::Daily);
        let set = decode_rows(env, &q).unwrap();
        assert!(set.has_column("oi_flag"));
        assert!(set.has_column("open_interest"));
    }

    #[test]
    fn single_contract_rows_are_stamped_with_the_contract() {
        let env = envelope(
            r#"{"header":{"format":["ms_of_day","bid","date"]},"response":[[57600000,3.2,20240102]]}"#,
        );
        let mut q = query(Aspect::OptionQuote, InstrumentKind::Stock, Timeframe::Daily);
        q.contract = Some(OptionContract {
            expiration: date(19),
            strike: 470.0,
            right: Right::Put,
        });
        let set = decode_rows(env, &q).unwrap();
        assert_eq!(set.rows()[0].get("type"), &Value::from("P"));
        assert_eq!(set.rows()[0].get("expiration"), &Value::Date(date(19)));
    }

    #[test]
    fn mismatched_row_width_is_a_format_change() {
        let env = envelope(r#"{"header":{"format":["date","close"]},"response":[[20240102]]}"#);
        assert!(matches!(
            decode_rows(env, &daily_stock()),
            Err(ProviderError::ResponseFormatChanged(_))
        ));
    }

    #[test]
    fn refuses_when_breaker_open() {
        let breaker = Arc::new(CircuitBreaker::new(Duration::from_secs(60)));
        breaker.trip();
        let provider =
            ThetaProvider::new("http://127.0.0.1:9", Duration::from_secs(1), breaker).unwrap();
        assert!(!provider.is_available());
        assert!(matches!(
            provider.fetch(&daily_stock()),
            Err(ProviderError::CircuitBreakerTripped)
        ));
    }
}
