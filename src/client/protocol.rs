//! TradingView websocket framing
//!
//! Every frame is `~m~{len}~m~{payload}`. Payloads are either JSON
//! `{"m": method, "p": params}` messages or `~h~N` heartbeats, which the
//! client must echo back.

use chrono::{TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{Result, TvError};
use crate::ohlcv::{Bar, OhlcvTable};

const HEADER: &str = "~m~";
const HEARTBEAT: &str = "~h~";

/// Fields requested on the quote session
pub const QUOTE_FIELDS: [&str; 23] = [
    "ch",
    "chp",
    "current_session",
    "description",
    "local_description",
    "language",
    "exchange",
    "fractional",
    "is_tradable",
    "lp",
    "lp_time",
    "minmov",
    "minmove2",
    "original_name",
    "pricescale",
    "pro_name",
    "short_name",
    "type",
    "update_mode",
    "volume",
    "currency_code",
    "rchp",
    "rtc",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Heartbeat payload, e.g. `~h~12`
    Heartbeat(String),
    Message(String),
}

pub fn prepend_header(payload: &str) -> String {
    format!("{}{}{}{}", HEADER, payload.chars().count(), HEADER, payload)
}

/// Framed `{"m": func, "p": params}` message
pub fn create_message(func: &str, params: Value) -> Result<String> {
    let payload = serde_json::to_string(&json!({ "m": func, "p": params }))?;
    Ok(prepend_header(&payload))
}

/// Split a websocket text message into its frames
pub fn split_frames(raw: &str) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut rest = raw;

    while let Some(start) = rest.find(HEADER) {
        let after = &rest[start + HEADER.len()..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 || !after[digits..].starts_with(HEADER) {
            // Not a header, skip past this marker
            rest = after;
            continue;
        }
        let body = &after[digits + HEADER.len()..];
        let end = find_next_header(body).unwrap_or(body.len());
        let payload = &body[..end];
        rest = &body[end..];

        if payload.is_empty() {
            continue;
        }
        if payload.starts_with(HEARTBEAT) {
            frames.push(Frame::Heartbeat(payload.to_string()));
        } else {
            frames.push(Frame::Message(payload.to_string()));
        }
    }
    frames
}

fn find_next_header(body: &str) -> Option<usize> {
    let mut offset = 0;
    while let Some(pos) = body[offset..].find(HEADER) {
        let at = offset + pos;
        let after = &body[at + HEADER.len()..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        if digits > 0 && after[digits..].starts_with(HEADER) {
            return Some(at);
        }
        offset = at + HEADER.len();
    }
    None
}

#[derive(Debug, Deserialize)]
struct ServerMessage {
    m: String,
    #[serde(default)]
    p: Value,
}

/// Accumulates bars from one `create_series` exchange
#[derive(Debug, Default)]
pub struct SeriesCollector {
    bars: Vec<Bar>,
    completed: bool,
}

impl SeriesCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Handle one message payload
    pub fn feed(&mut self, payload: &str) -> Result<()> {
        let Ok(message) = serde_json::from_str::<ServerMessage>(payload) else {
            debug!("Ignoring non-JSON payload: {}", truncate(payload, 80));
            return Ok(());
        };

        match message.m.as_str() {
            "timescale_update" | "du" => {
                self.collect_series(&message.p);
                Ok(())
            }
            "series_completed" => {
                self.completed = true;
                Ok(())
            }
            "symbol_error" | "series_error" => Err(TvError::DataNotFound(format!(
                "{}: {}",
                message.m,
                truncate(&message.p.to_string(), 200)
            ))),
            "critical_error" | "protocol_error" => Err(TvError::Protocol(format!(
                "{}: {}",
                message.m,
                truncate(&message.p.to_string(), 200)
            ))),
            _ => Ok(()),
        }
    }

    fn collect_series(&mut self, params: &Value) {
        let Some(params) = params.as_array() else {
            return;
        };
        for update in params.iter().filter_map(Value::as_object) {
            for series in update.values() {
                let Some(points) = series.get("s").and_then(Value::as_array) else {
                    continue;
                };
                self.bars
                    .extend(points.iter().filter_map(|p| p.get("v")).filter_map(parse_bar));
            }
        }
    }

    /// Collected bars sorted by time. A later update for the same
    /// timestamp replaces the earlier one.
    pub fn into_table(self, symbol: impl Into<String>) -> OhlcvTable {
        let mut table = OhlcvTable::new(symbol, self.bars);
        table.normalize();
        table
    }
}

/// `[ts, open, high, low, close, volume?]`; missing volume is 0
fn parse_bar(values: &Value) -> Option<Bar> {
    let values = values.as_array()?;
    let num = |i: usize| values.get(i).and_then(Value::as_f64);

    let ts = num(0)?;
    let datetime = Utc
        .timestamp_opt(ts.trunc() as i64, (ts.fract() * 1e9) as u32)
        .single()?;

    Some(Bar {
        datetime,
        open: num(1)?,
        high: num(2)?,
        low: num(3)?,
        close: num(4)?,
        volume: num(5).unwrap_or(0.0),
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
