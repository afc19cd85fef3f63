//! Historical data provider seam
//!
//! The live feed only ever talks to a [`HistoryProvider`]. The TradingView
//! client in [`crate::client`] is the production implementation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::interval::Interval;
use crate::ohlcv::OhlcvTable;

/// Which bars to fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BarRange {
    /// The latest `n` bars
    Count(u32),
    /// All bars between two instants
    Between(DateTime<Utc>, DateTime<Utc>),
}

/// One historical fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRequest {
    pub symbol: String,
    pub exchange: String,
    pub interval: Interval,
    pub range: BarRange,
    /// Futures contract number, 1 for the front month
    pub fut_contract: Option<u32>,
    pub extended_session: bool,
}

impl HistoryRequest {
    pub fn new(symbol: &str, exchange: &str, interval: Interval, range: BarRange) -> Self {
        Self {
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            interval,
            range,
            fut_contract: None,
            extended_session: false,
        }
    }

    /// TradingView symbol: `EX:SYM`, or `EX:SYM{n}!` for a futures contract.
    /// A symbol that already carries an exchange prefix is used as-is.
    pub fn formatted_symbol(&self) -> String {
        if self.symbol.contains(':') {
            return self.symbol.clone();
        }
        match self.fut_contract {
            Some(n) => format!("{}:{}{}!", self.exchange, self.symbol, n),
            None => format!("{}:{}", self.exchange, self.symbol),
        }
    }
}

/// Symbol search hit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolSearchResult {
    pub symbol: String,
    pub exchange: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub currency_code: Option<String>,
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

/// Source of historical bars and symbol lookups.
///
/// Both calls are blocking. `fetch_history` fails with
/// `TvError::DataNotFound` when the symbol has no data; `search` returns an
/// empty list when nothing matches.
pub trait HistoryProvider: Send + Sync {
    fn fetch_history(&self, request: &HistoryRequest) -> Result<OhlcvTable>;

    fn search(&self, text: &str, exchange: &str) -> Result<Vec<SymbolSearchResult>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formatted_symbol() {
        let mut req = HistoryRequest::new("BTCUSDT", "BINANCE", Interval::Hour1, BarRange::Count(10));
        assert_eq!(req.formatted_symbol(), "BINANCE:BTCUSDT");

        req.symbol = "NIFTY".into();
        req.exchange = "NSE".into();
        req.fut_contract = Some(1);
        assert_eq!(req.formatted_symbol(), "NSE:NIFTY1!");

        req.symbol = "COINBASE:BTCUSD".into();
        assert_eq!(req.formatted_symbol(), "COINBASE:BTCUSD");
    }

    #[test]
    fn test_search_result_deserialize() {
        let raw = r#"{"symbol":"BTCUSDT","exchange":"BINANCE","description":"Bitcoin / TetherUS","type":"spot","currency_code":"USDT"}"#;
        let hit: SymbolSearchResult = serde_json::from_str(raw).unwrap();
        assert_eq!(hit.kind, "spot");
        assert_eq!(hit.currency_code.as_deref(), Some("USDT"));
        assert!(hit.provider_id.is_none());
    }
}
