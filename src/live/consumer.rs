//! Per-subscription callback worker
//!
//! Each consumer runs its callback on a dedicated thread fed by a bounded
//! inbox. `None` in the inbox is the stop signal. A failing callback stops
//! only its own consumer, which then detaches itself from its `Seis`.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::seis::Seis;
use crate::config::ThreadingConfig;
use crate::error::{Result, TvError};
use crate::ohlcv::OhlcvTable;

/// User callback invoked with the subscription and its new data
pub type Callback = Arc<dyn Fn(&Arc<Seis>, &OhlcvTable) -> anyhow::Result<()> + Send + Sync>;

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

const JOIN_POLL: Duration = Duration::from_millis(10);

/// References cleared together when the worker exits
struct ConsumerState {
    seis: Option<Arc<Seis>>,
    callback: Option<Callback>,
    /// Set once by `stop` or on worker exit
    stopped: bool,
}

/// Callback worker bound to one `Seis`
pub struct Consumer {
    /// `consumer{n}_{symbol}_{exchange}_{interval}`, also the thread name
    name: String,
    state: Mutex<ConsumerState>,
    /// Inbox; `None` is the stop signal
    tx: Sender<Option<OhlcvTable>>,
    rx: Receiver<Option<OhlcvTable>>,
    /// Inbox wait before re-checking the stop flag
    poll_interval: Duration,
    /// Lock timeout when detaching after a callback failure
    detach_timeout: Option<Duration>,
    started: AtomicBool,
    /// Worker thread, taken by `join`
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Consumer {
    /// Create an unstarted consumer with default threading settings
    pub fn new<F>(seis: Arc<Seis>, callback: F) -> Self
    where
        F: Fn(&Arc<Seis>, &OhlcvTable) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::with_config(seis, Arc::new(callback), &ThreadingConfig::default())
    }

    /// Create an unstarted consumer with the inbox size, poll interval and
    /// detach timeout from `config`
    pub fn with_config(seis: Arc<Seis>, callback: Callback, config: &ThreadingConfig) -> Self {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "consumer{}_{}_{}_{}",
            id,
            seis.symbol(),
            seis.exchange(),
            seis.interval()
        );
        let (tx, rx) = bounded(config.consumer_queue_size.max(1));

        Self {
            name,
            state: Mutex::new(ConsumerState {
                seis: Some(seis),
                callback: Some(callback),
                stopped: false,
            }),
            tx,
            rx,
            poll_interval: config.consumer_poll_interval,
            detach_timeout: config.detach_timeout,
            started: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    /// Unique name, also used for the worker thread
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bound subscription, `None` once the consumer has terminated
    pub fn seis(&self) -> Option<Arc<Seis>> {
        self.state.lock().seis.clone()
    }

    /// Bound callback, `None` once the consumer has terminated
    pub fn callback(&self) -> Option<Callback> {
        self.state.lock().callback.clone()
    }

    /// True once `stop` was called or the worker exited
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// True while the worker thread is running
    pub fn is_alive(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Spawn the worker thread. A consumer can only be started once.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TvError::AlreadyStarted(self.name.clone()));
        }

        let worker = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || worker.run())?;
        *self.handle.lock() = Some(handle);
        debug!("Consumer {} started", self.name);
        Ok(())
    }

    /// Queue data for the callback without blocking.
    ///
    /// Does nothing once stopped. Drops the item if the inbox is full.
    pub fn put(&self, data: Option<OhlcvTable>) {
        if self.state.lock().stopped {
            return;
        }
        match self.tx.try_send(data) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Consumer {} inbox full, dropping data", self.name);
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("Consumer {} inbox closed", self.name);
            }
        }
    }

    /// Signal the worker to exit. Safe to call any number of times.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if state.stopped {
            return;
        }
        state.stopped = true;

        if !self.started.load(Ordering::SeqCst) {
            // No worker will run the exit path
            state.seis = None;
            state.callback = None;
            return;
        }
        drop(state);

        if self.tx.try_send(None).is_err() {
            debug!("Consumer {} inbox full, relying on stop flag", self.name);
        }
    }

    /// Wait for the worker to exit; `None` waits forever.
    /// Returns true if the worker has exited (or never ran).
    pub fn join(&self, timeout: Option<Duration>) -> bool {
        let Some(handle) = self.handle.lock().take() else {
            return true;
        };
        if handle.thread().id() == thread::current().id() {
            *self.handle.lock() = Some(handle);
            return false;
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        while !handle.is_finished() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                *self.handle.lock() = Some(handle);
                return false;
            }
            thread::sleep(JOIN_POLL);
        }
        if handle.join().is_err() {
            warn!("Consumer {} worker panicked", self.name);
        }
        true
    }

    /// Detach from the subscription through its coordinator.
    /// Trivially succeeds once the consumer no longer has a subscription.
    pub fn del_consumer(self: &Arc<Self>, timeout: Option<Duration>) -> Result<bool> {
        match self.seis() {
            None => Ok(true),
            Some(seis) => seis.del_consumer(self, timeout),
        }
    }

    fn run(self: Arc<Self>) {
        loop {
            if self.state.lock().stopped {
                break;
            }

            let data = match self.rx.recv_timeout(self.poll_interval) {
                Ok(Some(data)) => data,
                Ok(None) => break,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let (seis, callback) = {
                let state = self.state.lock();
                (state.seis.clone(), state.callback.clone())
            };
            let (Some(seis), Some(callback)) = (seis, callback) else {
                break;
            };

            let failure = match panic::catch_unwind(AssertUnwindSafe(|| callback(&seis, &data))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{:#}", e),
                Err(payload) => format!("panic: {}", panic_message(&*payload)),
            };

            error!("Consumer {} callback failed for {}: {}", self.name, seis, failure);
            self.detach(&seis);
            break;
        }

        let mut state = self.state.lock();
        state.seis = None;
        state.callback = None;
        state.stopped = true;
        drop(state);
        info!("Consumer {} stopped", self.name);
    }

    fn detach(self: &Arc<Self>, seis: &Arc<Seis>) {
        match seis.del_consumer(self, self.detach_timeout) {
            Ok(true) => {}
            Ok(false) => warn!("Consumer {} could not detach: lock timeout", self.name),
            Err(TvError::CoordinatorNotProvided(_)) => {
                if let Err(e) = seis.pop_consumer(self) {
                    warn!("Consumer {} could not detach: {}", self.name, e);
                }
            }
            Err(e) => warn!("Consumer {} could not detach: {}", self.name, e),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("name", &self.name)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::Interval;
    use crate::ohlcv::Bar;
    use chrono::Utc;

    fn seis() -> Arc<Seis> {
        Arc::new(Seis::new("BTCUSDT", "BINANCE", Interval::Hour1))
    }

    fn table(close: f64) -> OhlcvTable {
        OhlcvTable::new(
            "BINANCE:BTCUSDT",
            vec![Bar {
                datetime: Utc::now(),
                open: close,
                high: close,
                low: close,
                close,
                volume: 1.0,
            }],
        )
    }

    fn fast_config() -> ThreadingConfig {
        ThreadingConfig {
            consumer_poll_interval: Duration::from_millis(20),
            consumer_queue_size: 4,
            ..ThreadingConfig::default()
        }
    }

    fn consumer<F>(seis: &Arc<Seis>, callback: F) -> Arc<Consumer>
    where
        F: Fn(&Arc<Seis>, &OhlcvTable) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let consumer = Arc::new(Consumer::with_config(
            seis.clone(),
            Arc::new(callback),
            &fast_config(),
        ));
        seis.add_consumer(consumer.clone());
        consumer
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_delivers_data() {
        let seis = seis();
        let (tx, rx) = crossbeam_channel::unbounded();
        let c = consumer(&seis, move |s, data| {
            tx.send((s.symbol().to_string(), data.clone()))?;
            Ok(())
        });
        c.start().unwrap();

        let sent = table(1.0);
        c.put(Some(sent.clone()));
        let (symbol, received) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(symbol, "BTCUSDT");
        assert_eq!(received, sent);

        c.stop();
        assert!(c.join(Some(Duration::from_secs(5))));
        assert!(c.seis().is_none());
        assert!(c.callback().is_none());
    }

    #[test]
    fn test_name_format() {
        let c = consumer(&seis(), |_, _| Ok(()));
        let name = c.name();
        assert!(name.starts_with("consumer"));
        assert!(name.ends_with("_BTCUSDT_BINANCE_1H"));
        let id = &name["consumer".len()..name.len() - "_BTCUSDT_BINANCE_1H".len()];
        assert!(id.parse::<usize>().is_ok());
    }

    #[test]
    fn test_double_start() {
        let c = consumer(&seis(), |_, _| Ok(()));
        c.start().unwrap();
        assert!(matches!(c.start(), Err(TvError::AlreadyStarted(_))));
        c.stop();
        assert!(c.join(Some(Duration::from_secs(5))));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let c = consumer(&seis(), |_, _| Ok(()));
        c.start().unwrap();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let c = c.clone();
                thread::spawn(move || c.stop())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        c.stop();
        assert!(c.join(Some(Duration::from_secs(5))));
        assert!(!c.is_alive());
        assert!(c.is_stopped());
    }

    #[test]
    fn test_stop_before_start_clears_refs() {
        let c = consumer(&seis(), |_, _| Ok(()));
        c.stop();
        assert!(c.seis().is_none());
        assert!(c.callback().is_none());
        // put after stop is a no-op
        c.put(Some(table(1.0)));
        assert!(c.join(None));
    }

    #[test]
    fn test_poison_pill_stops_worker() {
        let c = consumer(&seis(), |_, _| Ok(()));
        c.start().unwrap();
        c.put(None);
        assert!(wait_until(|| !c.is_alive()));
        assert!(c.is_stopped());
        assert!(c.seis().is_none());
    }

    #[test]
    fn test_full_inbox_drops_without_blocking() {
        let c = consumer(&seis(), |_, _| Ok(()));
        // Not started, so nothing drains the inbox
        let started = Instant::now();
        for i in 0..20 {
            c.put(Some(table(i as f64)));
        }
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(c.rx.len(), 4);
        c.stop();
    }

    #[test]
    fn test_callback_error_isolated() {
        let seis = seis();
        let (tx, rx) = crossbeam_channel::unbounded();
        let failing = consumer(&seis, |_, _| anyhow::bail!("boom"));
        let healthy = consumer(&seis, move |_, data| {
            tx.send(data.clone())?;
            Ok(())
        });
        failing.start().unwrap();
        healthy.start().unwrap();

        failing.put(Some(table(1.0)));
        assert!(wait_until(|| !failing.is_alive()));
        assert!(failing.seis().is_none());
        assert!(failing.callback().is_none());

        // Detached itself without a coordinator
        let remaining = seis.get_consumers();
        assert_eq!(remaining.len(), 1);
        assert!(Arc::ptr_eq(&remaining[0], &healthy));

        healthy.put(Some(table(2.0)));
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert!(healthy.is_alive());

        healthy.stop();
        assert!(healthy.join(Some(Duration::from_secs(5))));
    }

    #[test]
    fn test_callback_panic_isolated() {
        let seis = seis();
        let c = consumer(&seis, |_, _| panic!("callback panicked"));
        c.start().unwrap();
        c.put(Some(table(1.0)));
        assert!(wait_until(|| !c.is_alive()));
        assert!(c.seis().is_none());
        assert!(seis.get_consumers().is_empty());
    }

    #[test]
    fn test_del_consumer_without_seis() {
        let c = consumer(&seis(), |_, _| Ok(()));
        c.stop();
        assert!(c.del_consumer(None).unwrap());
    }
}
