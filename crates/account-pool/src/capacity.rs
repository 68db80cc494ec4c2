//! Sliding-window capacity tracking
//!
//! Maintains, per account and per metric, a time-windowed usage ledger and
//! answers "does this account have room for N more units right now?" while
//! atomically reserving that room. Windows are keyed `{account_id}:{metric}`
//! and are self-cleaning: entries older than the window duration are pruned
//! on every read and write, so there is no separate sweep process.
//!
//! The [`CapacityStore`] trait is the seam where a deployment sharing state
//! across service instances plugs in its low-latency store; whatever backs it
//! must keep `try_reserve` linearizable (read usage, compare to limit, append
//! — as one step). [`MemoryCapacityStore`] provides that with one async mutex
//! per window.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::error::StoreError;

/// A tracked usage dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    /// Request count against the tier's requests-per-minute ceiling
    Requests,
    /// Token units against the tier's tokens-per-minute ceiling
    Tokens,
}

impl Metric {
    /// Metric label used in window keys, logs, and the health summary.
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Requests => "requests",
            Metric::Tokens => "tokens",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Windowed usage ledger for one (account, metric) pair.
#[async_trait]
pub trait CapacityStore: Send + Sync {
    /// Sum of non-expired entries in the account's window for that metric.
    async fn usage(&self, account_id: &str, metric: Metric) -> Result<u64, StoreError>;

    /// Atomically reserve `cost` units if they fit under `limit`.
    ///
    /// Computes current usage after pruning expired entries; if
    /// `usage + cost <= limit`, appends an entry and returns true, otherwise
    /// returns false with no side effect. Two concurrent reservations must
    /// never both succeed if their combined cost would exceed the limit.
    async fn try_reserve(
        &self,
        account_id: &str,
        metric: Metric,
        cost: u64,
        limit: u64,
    ) -> Result<bool, StoreError>;

    /// Remove up to `cost` previously reserved units, newest entries first.
    ///
    /// Returns the amount actually removed. A shortfall means the reservation
    /// already expired out of the window — the caller treats that as a stale
    /// reservation, not an error.
    async fn release(&self, account_id: &str, metric: Metric, cost: u64)
    -> Result<u64, StoreError>;

    /// Adjust a reservation from the estimated cost to the real consumption.
    ///
    /// An overrun past the limit is charged anyway: the consumption already
    /// happened and the window must reflect it.
    async fn commit(
        &self,
        account_id: &str,
        metric: Metric,
        reserved: u64,
        actual: u64,
    ) -> Result<(), StoreError>;
}

/// Cost entries within one window, oldest first.
struct Window {
    entries: VecDeque<(Instant, u64)>,
}

impl Window {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Drop entries older than the window duration.
    fn prune(&mut self, now: Instant, window: Duration) {
        while self
            .entries
            .front()
            .is_some_and(|(ts, _)| now.duration_since(*ts) >= window)
        {
            self.entries.pop_front();
        }
    }

    fn total(&self) -> u64 {
        self.entries.iter().map(|(_, cost)| cost).sum()
    }

    /// Remove up to `cost` units, newest entries first. Returns the amount
    /// actually removed.
    fn remove_newest(&mut self, cost: u64) -> u64 {
        let mut remaining = cost;
        while remaining > 0 {
            match self.entries.back_mut() {
                Some((_, c)) if *c <= remaining => {
                    remaining -= *c;
                    self.entries.pop_back();
                }
                Some((_, c)) => {
                    *c -= remaining;
                    remaining = 0;
                }
                None => break,
            }
        }
        cost - remaining
    }
}

/// In-process capacity store.
///
/// One mutex per window: prune, sum, compare, and append happen under a
/// single lock acquisition, which is the atomic check-and-append primitive
/// the reservation contract requires. The outer map lock is only held long
/// enough to look up or create the window handle.
pub struct MemoryCapacityStore {
    window: Duration,
    ledgers: RwLock<HashMap<String, Arc<Mutex<Window>>>>,
}

impl MemoryCapacityStore {
    /// Create a store with the given trailing window duration.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            ledgers: RwLock::new(HashMap::new()),
        }
    }

    fn key(account_id: &str, metric: Metric) -> String {
        format!("{account_id}:{metric}")
    }

    async fn ledger(&self, account_id: &str, metric: Metric) -> Arc<Mutex<Window>> {
        let key = Self::key(account_id, metric);
        {
            let ledgers = self.ledgers.read().await;
            if let Some(window) = ledgers.get(&key) {
                return window.clone();
            }
        }
        let mut ledgers = self.ledgers.write().await;
        ledgers
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(Window::new())))
            .clone()
    }
}

impl Default for MemoryCapacityStore {
    /// The provider's ceilings are per minute, so the default window is 60s.
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl CapacityStore for MemoryCapacityStore {
    async fn usage(&self, account_id: &str, metric: Metric) -> Result<u64, StoreError> {
        let ledger = self.ledger(account_id, metric).await;
        let mut window = ledger.lock().await;
        window.prune(Instant::now(), self.window);
        Ok(window.total())
    }

    async fn try_reserve(
        &self,
        account_id: &str,
        metric: Metric,
        cost: u64,
        limit: u64,
    ) -> Result<bool, StoreError> {
        let ledger = self.ledger(account_id, metric).await;
        let mut window = ledger.lock().await;
        let now = Instant::now();
        window.prune(now, self.window);
        if window.total() + cost > limit {
            return Ok(false);
        }
        window.entries.push_back((now, cost));
        Ok(true)
    }

    async fn release(
        &self,
        account_id: &str,
        metric: Metric,
        cost: u64,
    ) -> Result<u64, StoreError> {
        let ledger = self.ledger(account_id, metric).await;
        let mut window = ledger.lock().await;
        window.prune(Instant::now(), self.window);
        Ok(window.remove_newest(cost))
    }

    async fn commit(
        &self,
        account_id: &str,
        metric: Metric,
        reserved: u64,
        actual: u64,
    ) -> Result<(), StoreError> {
        if actual < reserved {
            self.release(account_id, metric, reserved - actual).await?;
        } else if actual > reserved {
            let ledger = self.ledger(account_id, metric).await;
            let mut window = ledger.lock().await;
            let now = Instant::now();
            window.prune(now, self.window);
            // Charged unconditionally: the extra consumption already happened.
            window.entries.push_back((now, actual - reserved));
        }
        Ok(())
    }
}
