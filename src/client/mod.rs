//! TradingView historical data client
//!
//! [`TvDatafeed`] is a blocking facade over an async websocket session. It
//! owns a private tokio runtime, so it must be used from plain threads and
//! never from inside another async runtime.

pub mod auth;
pub mod protocol;
pub mod rate_limiter;
pub mod totp;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::runtime::Runtime;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use self::protocol::{create_message, prepend_header, split_frames, Frame, SeriesCollector, QUOTE_FIELDS};
use self::rate_limiter::RateLimiter;
use crate::config::Config;
use crate::error::{Result, TvError};
use crate::interval::Interval;
use crate::ohlcv::OhlcvTable;
use crate::provider::{BarRange, HistoryProvider, HistoryRequest, SymbolSearchResult};
use crate::utils::{
    generate_chart_session_id, generate_session_id, mask_sensitive_data, retry_with_backoff,
    strip_highlight,
};
use crate::validators::{
    validate_date_range, validate_exchange, validate_n_bars, validate_ohlc, validate_symbol,
};

/// Offset TradingView applies to range requests, in milliseconds
const RANGE_OFFSET_MS: i64 = 1_800_000;
const SERIES_ID: &str = "s1";
const SYMBOL_ID: &str = "symbol_1";

pub struct TvDatafeed {
    config: Config,
    http: Client,
    token: String,
    limiter: RateLimiter,
    runtime: Runtime,
}

impl TvDatafeed {
    /// Build the client and authenticate.
    ///
    /// Without credentials the client runs anonymously with delayed data.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("tvdatafeed-io")
            .enable_all()
            .build()?;

        let http = Client::builder()
            .cookie_store(true)
            .timeout(config.network.recv_timeout)
            .connect_timeout(config.network.connect_timeout)
            .build()?;

        let token = runtime.block_on(auth::authenticate(&http, &config.auth))?;
        info!("TvDatafeed ready (token {})", mask_sensitive_data(&token, 4));

        Ok(Self {
            limiter: RateLimiter::new(config.network.requests_per_minute),
            config,
            http,
            token,
            runtime,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_authenticated(&self) -> bool {
        self.token != auth::UNAUTHORIZED_TOKEN
    }

    /// Latest `n_bars` bars of `symbol`
    pub fn get_hist(
        &self,
        symbol: &str,
        exchange: &str,
        interval: Interval,
        n_bars: u32,
        fut_contract: Option<u32>,
        extended_session: bool,
    ) -> Result<OhlcvTable> {
        let mut request = HistoryRequest::new(symbol, exchange, interval, BarRange::Count(n_bars));
        request.fut_contract = fut_contract;
        request.extended_session = extended_session;
        self.fetch_history(&request)
    }

    /// All bars of `symbol` between `start` and `end`
    pub fn get_hist_range(
        &self,
        symbol: &str,
        exchange: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<OhlcvTable> {
        let request = HistoryRequest::new(symbol, exchange, interval, BarRange::Between(start, end));
        self.fetch_history(&request)
    }

    pub fn search_symbol(&self, text: &str, exchange: &str) -> Result<Vec<SymbolSearchResult>> {
        self.search(text, exchange)
    }

    fn validated(&self, request: &HistoryRequest) -> Result<HistoryRequest> {
        let mut request = request.clone();
        request.symbol = validate_symbol(&request.symbol, true)?;
        if !request.symbol.contains(':') {
            request.exchange = validate_exchange(&request.exchange)?;
        }
        match request.range {
            BarRange::Count(n) => {
                validate_n_bars(n, self.config.data.max_bars)?;
            }
            BarRange::Between(start, end) => {
                validate_date_range(Some(start), Some(end))?;
            }
        }
        request.extended_session |= self.config.data.extended_session;
        Ok(request)
    }

    async fn fetch_async(&self, request: &HistoryRequest) -> Result<OhlcvTable> {
        let net = &self.config.network;
        self.limiter.acquire().await;

        let mut ws_request = net.ws_url.as_str().into_client_request()?;
        let origin = HeaderValue::from_str(&net.ws_origin)
            .map_err(|e| TvError::Config(format!("invalid ws_origin: {}", e)))?;
        ws_request.headers_mut().insert("Origin", origin);

        let (ws_stream, _) = timeout(net.connect_timeout, connect_async(ws_request))
            .await
            .map_err(|_| TvError::Timeout(format!("connecting to {}", net.ws_url)))??;
        let (mut write, mut read) = ws_stream.split();

        let symbol = request.formatted_symbol();
        debug!("Opened session for {} {}", symbol, request.interval);
        for message in session_messages(&self.token, request)? {
            timeout(net.send_timeout, write.send(WsMessage::Text(message)))
                .await
                .map_err(|_| TvError::Timeout("sending session message".into()))??;
        }

        let mut collector = SeriesCollector::new();
        while !collector.is_completed() {
            let message = match timeout(net.recv_timeout, read.next()).await {
                Err(_) => {
                    return Err(TvError::Timeout(format!(
                        "no series_completed for {} within {:?}",
                        symbol, net.recv_timeout
                    )))
                }
                Ok(None) => {
                    return Err(TvError::Connection(
                        "websocket closed before series completed".into(),
                    ))
                }
                Ok(Some(message)) => message?,
            };

            match message {
                WsMessage::Text(text) => {
                    for frame in split_frames(&text) {
                        match frame {
                            Frame::Heartbeat(beat) => {
                                write.send(WsMessage::Text(prepend_header(&beat))).await?;
                            }
                            Frame::Message(payload) => collector.feed(&payload)?,
                        }
                    }
                }
                WsMessage::Close(_) => {
                    return Err(TvError::Connection("websocket closed by server".into()))
                }
                _ => {}
            }
        }
        let _ = write.close().await;

        let table = collector.into_table(symbol.as_str());
        if table.is_empty() {
            return Err(TvError::DataNotFound(format!("no bars for {}", symbol)));
        }
        if self.config.data.validate_data {
            for bar in &table.bars {
                if let Err(e) = validate_ohlc(bar) {
                    warn!("{}: {}", symbol, e);
                }
            }
        }

        debug!("Fetched {} bars for {}", table.len(), symbol);
        Ok(table)
    }
}

impl HistoryProvider for TvDatafeed {
    fn fetch_history(&self, request: &HistoryRequest) -> Result<OhlcvTable> {
        let request = self.validated(request)?;
        let net = &self.config.network;
        retry_with_backoff(
            || self.runtime.block_on(self.fetch_async(&request)),
            net.max_retries,
            net.base_retry_delay,
            net.max_retry_delay,
        )
    }

    fn search(&self, text: &str, exchange: &str) -> Result<Vec<SymbolSearchResult>> {
        if text.trim().is_empty() {
            return Err(TvError::validation("text", text, "search text cannot be empty"));
        }
        let url = search_url(&self.config.auth.search_url, text, exchange)?;

        let response = self.runtime.block_on(async {
            self.limiter.acquire().await;
            self.http
                .get(url)
                .header(reqwest::header::ORIGIN, &self.config.auth.referer)
                .send()
                .await?
                .error_for_status()?
                .json::<Value>()
                .await
        });

        match response {
            Ok(body) => Ok(parse_search_response(&body)),
            Err(e) => {
                warn!("Symbol search for '{}' failed: {}", text, e);
                Ok(Vec::new())
            }
        }
    }
}

fn search_url(base: &str, text: &str, exchange: &str) -> Result<url::Url> {
    url::Url::parse_with_params(
        base,
        &[
            ("text", text),
            ("hl", "1"),
            ("exchange", exchange),
            ("lang", "en"),
            ("type", ""),
            ("domain", "production"),
        ],
    )
    .map_err(|e| TvError::Config(format!("invalid search_url '{}': {}", base, e)))
}

/// Hits from either a bare array or a `{"symbols": [...]}` body
fn parse_search_response(body: &Value) -> Vec<SymbolSearchResult> {
    let items = body
        .as_array()
        .or_else(|| body.get("symbols").and_then(Value::as_array));
    let Some(items) = items else {
        warn!("Unexpected symbol search response");
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| match serde_json::from_value::<SymbolSearchResult>(item.clone()) {
            Ok(mut hit) => {
                hit.symbol = strip_highlight(&hit.symbol);
                hit.description = strip_highlight(&hit.description);
                Some(hit)
            }
            Err(e) => {
                debug!("Skipping malformed search hit: {}", e);
                None
            }
        })
        .collect()
}

fn series_range(range: &BarRange) -> Value {
    match range {
        BarRange::Count(n) => json!(n),
        BarRange::Between(start, end) => json!(format!(
            "r,{}:{}",
            start.timestamp_millis() - RANGE_OFFSET_MS,
            end.timestamp_millis() - RANGE_OFFSET_MS
        )),
    }
}

/// Messages that open a chart session and request one series
fn session_messages(token: &str, request: &HistoryRequest) -> Result<Vec<String>> {
    let chart_session = generate_chart_session_id();
    let quote_session = generate_session_id("qs");
    let symbol = request.formatted_symbol();
    let session = if request.extended_session { "extended" } else { "regular" };

    let resolve = serde_json::to_string(&json!({
        "symbol": symbol,
        "adjustment": "splits",
        "session": session,
    }))?;

    let mut fields = vec![json!(quote_session)];
    fields.extend(QUOTE_FIELDS.iter().map(|f| json!(f)));

    Ok(vec![
        create_message("set_auth_token", json!([token]))?,
        create_message("chart_create_session", json!([chart_session, ""]))?,
        create_message("quote_create_session", json!([quote_session]))?,
        create_message("quote_set_fields", Value::Array(fields))?,
        create_message(
            "quote_add_symbols",
            json!([quote_session, symbol, {"flags": ["force_permission"]}]),
        )?,
        create_message("quote_fast_symbols", json!([quote_session, symbol]))?,
        create_message(
            "resolve_symbol",
            json!([chart_session, SYMBOL_ID, format!("={}", resolve)]),
        )?,
        create_message(
            "create_series",
            json!([
                chart_session,
                SERIES_ID,
                SERIES_ID,
                SYMBOL_ID,
                request.interval.as_str(),
                series_range(&request.range)
            ]),
        )?,
        create_message("switch_timezone", json!([chart_session, "exchange"]))?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn payload(frame: &str) -> Value {
        let frames = split_frames(frame);
        match &frames[..] {
            [Frame::Message(p)] => serde_json::from_str(p).unwrap(),
            other => panic!("unexpected frames {:?}", other),
        }
    }

    #[test]
    fn test_session_messages() {
        let mut request =
            HistoryRequest::new("BTCUSDT", "BINANCE", Interval::Hour1, BarRange::Count(10));
        request.extended_session = true;
        let messages = session_messages("tok", &request).unwrap();
        assert_eq!(messages.len(), 9);

        let methods: Vec<String> = messages
            .iter()
            .map(|m| payload(m)["m"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(methods[0], "set_auth_token");
        assert_eq!(methods[7], "create_series");
        assert_eq!(methods[8], "switch_timezone");

        let resolve = payload(&messages[6]);
        let symbol_spec = resolve["p"][2].as_str().unwrap();
        assert!(symbol_spec.starts_with('='));
        let symbol_spec: Value = serde_json::from_str(&symbol_spec[1..]).unwrap();
        assert_eq!(symbol_spec["symbol"], "BINANCE:BTCUSDT");
        assert_eq!(symbol_spec["session"], "extended");

        let series = payload(&messages[7]);
        assert_eq!(series["p"][4], "1H");
        assert_eq!(series["p"][5], 10);

        let fields = payload(&messages[3]);
        assert_eq!(fields["p"].as_array().unwrap().len(), QUOTE_FIELDS.len() + 1);
    }

    #[test]
    fn test_series_range() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let value = series_range(&BarRange::Between(start, end));
        assert_eq!(value, json!("r,1704065400000:1704151800000"));
        assert_eq!(series_range(&BarRange::Count(2)), json!(2));
    }

    #[test]
    fn test_search_url() {
        let url = search_url("https://symbol-search.tradingview.com/symbol_search/", "BTC USDT", "BINANCE")
            .unwrap();
        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(query.contains(&("text".to_string(), "BTC USDT".to_string())));
        assert!(query.contains(&("exchange".to_string(), "BINANCE".to_string())));
        assert!(query.contains(&("domain".to_string(), "production".to_string())));
        assert!(search_url("not a url", "x", "").is_err());
    }

    #[test]
    fn test_parse_search_response() {
        let body = json!([
            {"symbol": "<em>BTC</em>USDT", "exchange": "BINANCE", "description": "Bitcoin / <em>Tether</em>", "type": "spot"},
            {"exchange": "BROKEN"}
        ]);
        let hits = parse_search_response(&body);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].symbol, "BTCUSDT");
        assert_eq!(hits[0].description, "Bitcoin / Tether");

        let wrapped = json!({"symbols": [{"symbol": "AAPL", "exchange": "NASDAQ"}]});
        assert_eq!(parse_search_response(&wrapped)[0].symbol, "AAPL");
        assert!(parse_search_response(&json!({"error": "x"})).is_empty());
    }

    #[test]
    fn test_anonymous_client_validates_before_network() {
        let client = TvDatafeed::new(Config::default()).unwrap();
        assert!(!client.is_authenticated());

        let err = client
            .get_hist("BTCUSDT", "BINANCE", Interval::Daily, 6000, None, false)
            .unwrap_err();
        assert!(matches!(err, TvError::Validation { .. }));

        let err = client.get_hist("", "BINANCE", Interval::Daily, 10, None, false).unwrap_err();
        assert!(matches!(err, TvError::Validation { .. }));

        let start = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let err = client
            .get_hist_range("BTCUSDT", "BINANCE", Interval::Daily, start, end)
            .unwrap_err();
        assert!(matches!(err, TvError::Validation { .. }));

        assert!(matches!(client.search_symbol("  ", ""), Err(TvError::Validation { .. })));
    }
}
