//! Symbol-exchange-interval subscription key

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::consumer::Consumer;
use super::datafeed::TvDatafeedLive;
use crate::error::{Result, TvError};
use crate::interval::Interval;
use crate::ohlcv::OhlcvTable;
use crate::provider::{BarRange, HistoryRequest};

/// One live subscription: a (symbol, exchange, interval) triple.
///
/// Two `Seis` are equal when all three fields match. A `Seis` owns its
/// consumers and the last table it has seen, and keeps a weak reference to
/// the [`TvDatafeedLive`] that registered it so the convenience methods can
/// delegate back to it.
pub struct Seis {
    symbol: String,
    exchange: String,
    interval: Interval,
    /// Coordinator that registered this key, set at most once at a time
    datafeed: RwLock<Option<Weak<TvDatafeedLive>>>,
    /// Attached consumers, in attach order
    consumers: Mutex<Vec<Arc<Consumer>>>,
    /// Last table seen, used to detect new data
    last_data: Mutex<Option<OhlcvTable>>,
}

impl Seis {
    /// Create an unbound key with no consumers
    pub fn new(symbol: impl Into<String>, exchange: impl Into<String>, interval: Interval) -> Self {
        Self {
            symbol: symbol.into(),
            exchange: exchange.into(),
            interval,
            datafeed: RwLock::new(None),
            consumers: Mutex::new(Vec::new()),
            last_data: Mutex::new(None),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    /// True if this key is (`symbol`, `exchange`, `interval`)
    pub fn matches(&self, symbol: &str, exchange: &str, interval: Interval) -> bool {
        self.symbol == symbol && self.exchange == exchange && self.interval == interval
    }

    /// Bound coordinator, if any and still alive
    pub fn datafeed(&self) -> Option<Arc<TvDatafeedLive>> {
        self.datafeed.read().as_ref().and_then(Weak::upgrade)
    }

    /// Bind the coordinator. Fails if one is already bound.
    pub fn set_datafeed(&self, datafeed: &Arc<TvDatafeedLive>) -> Result<()> {
        let mut slot = self.datafeed.write();
        if slot.is_some() {
            return Err(TvError::CannotOverwrite(self.to_string()));
        }
        *slot = Some(Arc::downgrade(datafeed));
        Ok(())
    }

    /// Drop the coordinator binding so it can be set again
    pub fn clear_datafeed(&self) {
        *self.datafeed.write() = None;
    }

    /// Attach a consumer
    pub fn add_consumer(&self, consumer: Arc<Consumer>) {
        self.consumers.lock().push(consumer);
    }

    /// Detach a consumer. Fails with `ConsumerNotFound` if not attached.
    pub fn pop_consumer(&self, consumer: &Arc<Consumer>) -> Result<Arc<Consumer>> {
        let mut consumers = self.consumers.lock();
        let pos = consumers
            .iter()
            .position(|c| Arc::ptr_eq(c, consumer))
            .ok_or_else(|| TvError::ConsumerNotFound(consumer.name().to_string()))?;
        Ok(consumers.remove(pos))
    }

    /// Snapshot of the attached consumers
    pub fn get_consumers(&self) -> Vec<Arc<Consumer>> {
        self.consumers.lock().clone()
    }

    /// True if `data` differs from the last table seen, or nothing was seen yet.
    /// Always stores `data` as the new last table.
    pub fn is_new_data(&self, data: &OhlcvTable) -> bool {
        let mut last = self.last_data.lock();
        let is_new = last.as_ref() != Some(data);
        *last = Some(data.clone());
        is_new
    }

    /// Last table passed to `is_new_data`
    pub fn last_data(&self) -> Option<OhlcvTable> {
        self.last_data.lock().clone()
    }

    fn require_datafeed(&self) -> Result<Arc<TvDatafeedLive>> {
        self.datafeed()
            .ok_or_else(|| TvError::CoordinatorNotProvided(self.to_string()))
    }

    /// Fetch history for this key through the bound coordinator.
    /// `Ok(None)` means the coordinator lock timed out.
    pub fn get_hist(&self, range: BarRange, timeout: Option<Duration>) -> Result<Option<OhlcvTable>> {
        let datafeed = self.require_datafeed()?;
        let request = HistoryRequest::new(&self.symbol, &self.exchange, self.interval, range);
        datafeed.get_hist(&request, timeout)
    }

    /// Start a consumer on this key through the bound coordinator
    pub fn new_consumer<F>(
        self: &Arc<Self>,
        callback: F,
        timeout: Option<Duration>,
    ) -> Result<Option<Arc<Consumer>>>
    where
        F: Fn(&Arc<Seis>, &OhlcvTable) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.require_datafeed()?.new_consumer(self, callback, timeout)
    }

    /// Detach and stop a consumer through the bound coordinator
    pub fn del_consumer(&self, consumer: &Arc<Consumer>, timeout: Option<Duration>) -> Result<bool> {
        self.require_datafeed()?.del_consumer(consumer, timeout)
    }

    /// Unregister this key through the bound coordinator
    pub fn del_seis(&self, timeout: Option<Duration>) -> Result<bool> {
        self.require_datafeed()?.del_seis(self, timeout)
    }
}

impl PartialEq for Seis {
    fn eq(&self, other: &Self) -> bool {
        self.matches(&other.symbol, &other.exchange, other.interval)
    }
}

impl Eq for Seis {}

impl Hash for Seis {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.symbol.hash(state);
        self.exchange.hash(state);
        self.interval.hash(state);
    }
}

impl fmt::Display for Seis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Seis(symbol={}, exchange={}, interval={})",
            self.symbol, self.exchange, self.interval
        )
    }
}

impl fmt::Debug for Seis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Seis")
            .field("symbol", &self.symbol)
            .field("exchange", &self.exchange)
            .field("interval", &self.interval)
            .field("consumers", &self.consumers.lock().len())
            .finish()
    }
}
