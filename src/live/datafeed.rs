//! Polling live feed coordinator
//!
//! `TvDatafeedLive` turns the historical fetch into a live feed: a single
//! background thread wakes whenever an interval group is due, re-fetches
//! every `Seis` in that group and hands genuinely new tables to the
//! consumers attached to it.
//!
//! All structural changes (`new_seis`, `del_seis`, `new_consumer`,
//! `del_consumer`, `get_hist`) are serialized by one coordinator lock. Each
//! accepts an optional lock timeout; running out of time is reported as
//! `Ok(None)` / `Ok(false)` rather than an error.

use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::consumer::{Callback, Consumer};
use super::seis::Seis;
use super::trigger::SeisesAndTrigger;
use crate::client::TvDatafeed;
use crate::config::Config;
use crate::error::{Result, TvError};
use crate::interval::Interval;
use crate::ohlcv::OhlcvTable;
use crate::provider::{BarRange, HistoryProvider, HistoryRequest};

/// Bars fetched per `Seis` when seeding and on every tick
const LIVE_BARS: u32 = 2;

const MAIN_THREAD_NAME: &str = "tvdatafeed_main_thread";
const JOIN_POLL: Duration = Duration::from_millis(10);

/// Live feed coordinator
pub struct TvDatafeedLive {
    /// Source of history and symbol lookups
    provider: Arc<dyn HistoryProvider>,
    config: Config,
    /// Serializes structural changes and scheduler ticks
    lock: Mutex<()>,
    /// Registry shared with the polling thread
    sat: Arc<SeisesAndTrigger>,
    /// Polling thread, started with the first `Seis`
    main_thread: Mutex<Option<JoinHandle<()>>>,
    shutdown_in_progress: AtomicBool,
    /// Handed to each `Seis` as its back-reference
    self_ref: Weak<TvDatafeedLive>,
}

impl TvDatafeedLive {
    /// Build an idle coordinator over `provider`. The polling thread starts
    /// with the first `new_seis`.
    pub fn new(provider: Arc<dyn HistoryProvider>, config: Config) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            provider,
            config,
            lock: Mutex::new(()),
            sat: Arc::new(SeisesAndTrigger::new()),
            main_thread: Mutex::new(None),
            shutdown_in_progress: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    /// Sign in to TradingView with `config.auth` and build a live feed on top
    pub fn connect(config: Config) -> Result<Arc<Self>> {
        let client = TvDatafeed::new(config.clone())?;
        Ok(Self::new(Arc::new(client), config))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The interval trigger registry
    pub fn registry(&self) -> &SeisesAndTrigger {
        &self.sat
    }

    /// True while the polling thread is alive
    pub fn is_running(&self) -> bool {
        self.main_thread
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    fn acquire(&self, timeout: Option<Duration>) -> Option<MutexGuard<'_, ()>> {
        match timeout {
            None => Some(self.lock.lock()),
            Some(timeout) => self.lock.try_lock_for(timeout),
        }
    }

    fn is_listed(&self, symbol: &str, exchange: &str) -> Result<bool> {
        let results = self.provider.search(symbol, exchange)?;
        Ok(results
            .iter()
            .any(|r| r.symbol == symbol && r.exchange == exchange))
    }

    fn live_request(seis: &Seis) -> HistoryRequest {
        HistoryRequest::new(
            seis.symbol(),
            seis.exchange(),
            seis.interval(),
            BarRange::Count(LIVE_BARS),
        )
    }

    /// Register a live subscription, or return the existing equal one.
    ///
    /// `Ok(None)` if the lock timed out or the feed is shutting down.
    pub fn new_seis(
        &self,
        symbol: &str,
        exchange: &str,
        interval: Interval,
        timeout: Option<Duration>,
    ) -> Result<Option<Arc<Seis>>> {
        if !self.is_listed(symbol, exchange)? {
            return Err(TvError::NotListed(format!("{}:{}", exchange, symbol)));
        }

        let Some(_guard) = self.acquire(timeout) else {
            warn!("new_seis: lock timeout for {}:{} {}", exchange, symbol, interval);
            return Ok(None);
        };
        if self.shutdown_in_progress.load(Ordering::SeqCst) || self.sat.is_quit() {
            warn!("new_seis: live feed is shutting down");
            return Ok(None);
        }

        if let Some(existing) = self.sat.get_seis(symbol, exchange, interval) {
            return Ok(Some(existing));
        }

        let seis = Arc::new(Seis::new(symbol, exchange, interval));
        let data = self.provider.fetch_history(&Self::live_request(&seis))?;
        seis.is_new_data(&data);

        self.sat.append(seis.clone(), Some(Utc::now()))?;
        if let Some(this) = self.self_ref.upgrade() {
            seis.set_datafeed(&this)?;
        }
        self.ensure_main_thread()?;

        info!("Registered {}", seis);
        Ok(Some(seis))
    }

    /// Remove a subscription and signal its consumers to stop.
    ///
    /// Removing the last subscription shuts the polling thread down for good.
    pub fn del_seis(&self, seis: &Seis, timeout: Option<Duration>) -> Result<bool> {
        let Some(_guard) = self.acquire(timeout) else {
            warn!("del_seis: lock timeout for {}", seis);
            return Ok(false);
        };

        let registered = self
            .sat
            .get_seis(seis.symbol(), seis.exchange(), seis.interval())
            .ok_or_else(|| TvError::NotListed(seis.to_string()))?;

        for consumer in registered.get_consumers() {
            consumer.stop();
        }
        self.sat.discard(&registered)?;
        registered.clear_datafeed();

        if self.sat.is_empty() {
            debug!("No subscriptions left, stopping polling thread");
            self.sat.quit();
        }

        info!("Removed {}", registered);
        Ok(true)
    }

    /// Attach a callback to a registered subscription and start it
    pub fn new_consumer<F>(
        &self,
        seis: &Seis,
        callback: F,
        timeout: Option<Duration>,
    ) -> Result<Option<Arc<Consumer>>>
    where
        F: Fn(&Arc<Seis>, &OhlcvTable) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.new_consumer_with(seis, Arc::new(callback), timeout)
    }

    /// Same as `new_consumer` with an already boxed callback
    pub fn new_consumer_with(
        &self,
        seis: &Seis,
        callback: Callback,
        timeout: Option<Duration>,
    ) -> Result<Option<Arc<Consumer>>> {
        let Some(_guard) = self.acquire(timeout) else {
            warn!("new_consumer: lock timeout for {}", seis);
            return Ok(None);
        };

        let registered = self
            .sat
            .get_seis(seis.symbol(), seis.exchange(), seis.interval())
            .ok_or_else(|| TvError::NotListed(seis.to_string()))?;

        let consumer = Arc::new(Consumer::with_config(
            registered.clone(),
            callback,
            &self.config.threading,
        ));
        registered.add_consumer(consumer.clone());
        if let Err(e) = consumer.start() {
            let _ = registered.pop_consumer(&consumer);
            return Err(e);
        }

        debug!("Consumer {} attached to {}", consumer.name(), registered);
        Ok(Some(consumer))
    }

    /// Detach and stop a consumer. A consumer that has already let go of
    /// its subscription counts as removed.
    pub fn del_consumer(&self, consumer: &Arc<Consumer>, timeout: Option<Duration>) -> Result<bool> {
        let Some(_guard) = self.acquire(timeout) else {
            warn!("del_consumer: lock timeout for {}", consumer.name());
            return Ok(false);
        };

        let Some(seis) = consumer.seis() else {
            return Ok(true);
        };
        // The worker may still hold its seis for up to one poll interval
        // after stop(). It may also have been stopped while still attached.
        if consumer.is_stopped() {
            let _ = seis.pop_consumer(consumer);
            return Ok(true);
        }
        if !self.sat.contains(&seis) {
            return Err(TvError::NotListed(seis.to_string()));
        }

        seis.pop_consumer(consumer)?;
        consumer.stop();
        debug!("Consumer {} detached from {}", consumer.name(), seis);
        Ok(true)
    }

    /// Historical fetch under the coordinator lock.
    /// `Ok(None)` means the lock timed out.
    pub fn get_hist(
        &self,
        request: &HistoryRequest,
        timeout: Option<Duration>,
    ) -> Result<Option<OhlcvTable>> {
        let Some(_guard) = self.acquire(timeout) else {
            warn!("get_hist: lock timeout for {}", request.formatted_symbol());
            return Ok(None);
        };
        self.provider.fetch_history(request).map(Some)
    }

    fn ensure_main_thread(&self) -> Result<()> {
        let mut slot = self.main_thread.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }

        let this = self.self_ref.clone();
        let sat = self.sat.clone();
        let handle = thread::Builder::new()
            .name(MAIN_THREAD_NAME.to_string())
            .spawn(move || Self::main_loop(this, sat))?;
        *slot = Some(handle);
        info!("Live feed polling thread started");
        Ok(())
    }

    fn main_loop(this: Weak<TvDatafeedLive>, sat: Arc<SeisesAndTrigger>) {
        while sat.wait() {
            let Some(live) = this.upgrade() else {
                break;
            };
            live.tick();
        }
        debug!("Live feed polling thread exiting");
    }

    /// Run one scheduler pass: re-fetch every `Seis` in each expired
    /// interval group and deliver new data to its consumers.
    pub fn tick(&self) {
        let _guard = self.lock.lock();

        for interval in self.sat.get_expired() {
            let Some(group) = self.sat.get(interval) else {
                continue;
            };
            for seis in group {
                let Some(data) = self.fetch_with_retry(&seis) else {
                    continue;
                };
                if seis.is_new_data(&data) {
                    for consumer in seis.get_consumers() {
                        consumer.put(Some(data.clone()));
                    }
                }
            }
        }
    }

    /// Fetch with up to `retry_limit` attempts. Permanent errors are not
    /// retried.
    fn fetch_with_retry(&self, seis: &Seis) -> Option<OhlcvTable> {
        let request = Self::live_request(seis);
        let limit = self.config.threading.retry_limit.max(1);

        for attempt in 1..=limit {
            match self.provider.fetch_history(&request) {
                Ok(data) => return Some(data),
                Err(e) if !e.is_transient() => {
                    error!("Fetch for {} failed, skipping this tick: {}", seis, e);
                    return None;
                }
                Err(e) => debug!("Fetch {}/{} for {} failed: {}", attempt, limit, seis, e),
            }
            if self.sat.is_quit() {
                return None;
            }
            thread::sleep(self.config.threading.retry_sleep);
        }

        error!("Giving up on {} after {} attempts", seis, limit);
        None
    }

    /// Stop every consumer, discard every `Seis` and drop the polling
    /// thread handle. Safe to call repeatedly.
    pub(crate) fn graceful_shutdown(&self) {
        let timeout = self.config.threading.shutdown_timeout;
        let guard = self.lock.try_lock_for(timeout);
        if guard.is_none() {
            warn!("Graceful shutdown proceeding without the coordinator lock");
        }

        let mut consumers = Vec::new();
        for seis in self.sat.seises() {
            for consumer in seis.get_consumers() {
                consumer.stop();
                consumers.push(consumer);
            }
            if let Err(e) = self.sat.discard(&seis) {
                warn!("Failed to discard {}: {}", seis, e);
            }
            seis.clear_datafeed();
        }
        self.sat.quit();
        drop(guard);

        for consumer in consumers {
            if !consumer.join(Some(timeout)) {
                warn!("Consumer {} did not stop within {:?}", consumer.name(), timeout);
            }
        }

        let handle = self.main_thread.lock().take();
        if let Some(handle) = handle {
            join_with_timeout(handle, timeout);
        }
    }

    pub(crate) fn shutdown(&self) {
        if self.shutdown_in_progress.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down live feed");
        self.sat.quit();
        self.graceful_shutdown();
    }

    /// Tear down the live feed. Does nothing if it never started.
    pub fn del_tvdatafeed(&self) {
        if self.main_thread.lock().is_some() {
            self.shutdown();
        }
    }
}

fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) {
    if handle.thread().id() == thread::current().id() {
        return;
    }
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!("Polling thread did not exit within {:?}", timeout);
            return;
        }
        thread::sleep(JOIN_POLL);
    }
    if handle.join().is_err() {
        warn!("Polling thread panicked");
    }
}

impl Drop for TvDatafeedLive {
    fn drop(&mut self) {
        if panic::catch_unwind(AssertUnwindSafe(|| self.del_tvdatafeed())).is_err() {
            error!("Live feed teardown panicked");
        }
    }
}
