//! OHLCV bar tables

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One OHLCV bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub datetime: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// A series of bars for one symbol, oldest first.
///
/// Equality is by value, which is what the live feed relies on to tell a
/// fresh fetch apart from the previous one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OhlcvTable {
    /// Formatted symbol, e.g. `BINANCE:BTCUSDT`
    pub symbol: String,
    pub bars: Vec<Bar>,
}

impl OhlcvTable {
    pub fn new(symbol: impl Into<String>, bars: Vec<Bar>) -> Self {
        Self {
            symbol: symbol.into(),
            bars,
        }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn first(&self) -> Option<&Bar> {
        self.bars.first()
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.last()
    }

    /// Sort by time and keep the last bar seen for each timestamp
    pub fn normalize(&mut self) {
        self.bars.sort_by_key(|b| b.datetime);
        let mut deduped: Vec<Bar> = Vec::with_capacity(self.bars.len());
        for bar in self.bars.drain(..) {
            match deduped.last_mut() {
                Some(prev) if prev.datetime == bar.datetime => *prev = bar,
                _ => deduped.push(bar),
            }
        }
        self.bars = deduped;
    }
}
