//! TradingView historical and live OHLCV data
//!
//! [`TvDatafeed`] fetches historical bars over TradingView's websocket
//! protocol. [`TvDatafeedLive`] polls it on interval boundaries and fans new
//! bars out to consumer threads attached to each [`Seis`]
//! (symbol, exchange, interval) subscription.

pub mod client;
pub mod config;
pub mod error;
pub mod interval;
pub mod live;
pub mod logging;
pub mod ohlcv;
pub mod provider;
pub mod utils;
pub mod validators;

pub use client::TvDatafeed;
pub use config::Config;
pub use error::{Result, TvError};
pub use interval::Interval;
pub use live::{Callback, Consumer, Seis, SeisesAndTrigger, TvDatafeedLive};
pub use ohlcv::{Bar, OhlcvTable};
pub use provider::{BarRange, HistoryProvider, HistoryRequest, SymbolSearchResult};
