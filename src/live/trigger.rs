//! Interval trigger registry
//!
//! Groups the registered `Seis` by interval and tracks when each interval
//! group is next due for a re-fetch. The polling thread blocks in
//! [`SeisesAndTrigger::wait`] until the soonest due time passes.

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::seis::Seis;
use crate::error::{Result, TvError};
use crate::interval::Interval;

#[derive(Default)]
struct TriggerState {
    groups: HashMap<Interval, Vec<Arc<Seis>>>,
    due: HashMap<Interval, DateTime<Utc>>,
    /// Minimum of `due`
    target: Option<DateTime<Utc>>,
    quit: bool,
}

impl TriggerState {
    fn recompute_target(&mut self) -> Option<DateTime<Utc>> {
        let previous = self.target;
        self.target = self.due.values().min().copied();
        previous
    }
}

/// Interval groups and their due times, shared with the polling thread
#[derive(Default)]
pub struct SeisesAndTrigger {
    state: Mutex<TriggerState>,
    /// Signalled when the target moves sooner or on quit
    cond: Condvar,
}

impl SeisesAndTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `seis` to its interval group.
    ///
    /// A new group needs `update_dt`; its first due time is one interval
    /// later. Appending a `Seis` that is already present does nothing.
    pub fn append(&self, seis: Arc<Seis>, update_dt: Option<DateTime<Utc>>) -> Result<()> {
        let interval = seis.interval();
        let mut state = self.state.lock();

        if let Some(group) = state.groups.get_mut(&interval) {
            if !group.iter().any(|s| **s == *seis) {
                group.push(seis);
            }
            return Ok(());
        }

        let update_dt =
            update_dt.ok_or_else(|| TvError::MissingUpdateTime(interval.to_string()))?;
        state.groups.insert(interval, vec![seis]);
        state.due.insert(interval, interval.advance(update_dt));

        let previous = state.recompute_target();
        if previous.map_or(true, |p| state.target < Some(p)) {
            debug!("Next trigger moved to {:?}", state.target);
            self.cond.notify_all();
        }
        Ok(())
    }

    /// Remove `seis`; the interval group goes away with its last member
    pub fn discard(&self, seis: &Seis) -> Result<()> {
        let interval = seis.interval();
        let mut state = self.state.lock();

        let group = state
            .groups
            .get_mut(&interval)
            .ok_or_else(|| TvError::NoSuchSeis(seis.to_string()))?;
        let pos = group
            .iter()
            .position(|s| **s == *seis)
            .ok_or_else(|| TvError::NoSuchSeis(seis.to_string()))?;
        group.remove(pos);

        if group.is_empty() {
            state.groups.remove(&interval);
            state.due.remove(&interval);
            let previous = state.recompute_target();
            if previous != state.target {
                self.cond.notify_all();
            }
        }
        Ok(())
    }

    /// Intervals whose due time has passed. Each one's due time moves
    /// forward by one interval from its previous due time.
    pub fn get_expired(&self) -> Vec<Interval> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let mut expired = Vec::new();
        for (interval, due) in state.due.iter_mut() {
            if *due <= now {
                expired.push(*interval);
                *due = interval.advance(*due);
            }
        }
        if !expired.is_empty() {
            state.recompute_target();
        }
        expired
    }

    /// Block until the soonest due time passes (true), or until the
    /// registry is empty or told to quit (false).
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.quit {
                return false;
            }
            let Some(target) = state.target else {
                return false;
            };

            let now = Utc::now();
            if target <= now {
                return true;
            }
            let remaining = (target - now).to_std().unwrap_or(Duration::ZERO);
            self.cond.wait_for(&mut state, remaining);
        }
    }

    /// Permanently stop the registry and wake any waiter
    pub fn quit(&self) {
        self.state.lock().quit = true;
        self.cond.notify_all();
    }

    /// True once `quit` has been called
    pub fn is_quit(&self) -> bool {
        self.state.lock().quit
    }

    /// Bulk removal is not supported; discard each `Seis` instead
    pub fn clear(&self) -> Result<()> {
        Err(TvError::NotImplemented(
            "clearing the registry, discard each Seis instead".to_string(),
        ))
    }

    /// Registered key equal to (`symbol`, `exchange`, `interval`)
    pub fn get_seis(&self, symbol: &str, exchange: &str, interval: Interval) -> Option<Arc<Seis>> {
        self.state
            .lock()
            .groups
            .get(&interval)?
            .iter()
            .find(|s| s.matches(symbol, exchange, interval))
            .cloned()
    }

    /// True if an equal key is registered
    pub fn contains(&self, seis: &Seis) -> bool {
        self.state
            .lock()
            .groups
            .get(&seis.interval())
            .is_some_and(|group| group.iter().any(|s| **s == *seis))
    }

    /// Snapshot of the `Seis` in one interval group
    pub fn get(&self, interval: Interval) -> Option<Vec<Arc<Seis>>> {
        self.state.lock().groups.get(&interval).cloned()
    }

    /// Snapshot of every registered `Seis`
    pub fn seises(&self) -> Vec<Arc<Seis>> {
        self.state
            .lock()
            .groups
            .values()
            .flat_map(|group| group.iter().cloned())
            .collect()
    }

    /// Active intervals, shortest first
    pub fn intervals(&self) -> Vec<Interval> {
        let mut intervals: Vec<Interval> = self.state.lock().groups.keys().copied().collect();
        intervals.sort();
        intervals
    }

    /// Number of registered keys across all groups
    pub fn len(&self) -> usize {
        self.state.lock().groups.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().groups.is_empty()
    }

    /// Soonest due time across all groups
    pub fn next_trigger_dt(&self) -> Option<DateTime<Utc>> {
        self.state.lock().target
    }

    /// Next due time of one interval group
    pub fn due_time(&self, interval: Interval) -> Option<DateTime<Utc>> {
        self.state.lock().due.get(&interval).copied()
    }

    /// Move an interval group's due time
    #[cfg(test)]
    pub(crate) fn set_due_time(&self, interval: Interval, due: DateTime<Utc>) {
        let mut state = self.state.lock();
        if state.due.contains_key(&interval) {
            state.due.insert(interval, due);
            state.recompute_target();
            self.cond.notify_all();
        }
    }
}

impl<'a> IntoIterator for &'a SeisesAndTrigger {
    type Item = Arc<Seis>;
    type IntoIter = std::vec::IntoIter<Arc<Seis>>;

    fn into_iter(self) -> Self::IntoIter {
        self.seises().into_iter()
    }
}
