//! Per-account circuit breaker
//!
//! Maintains a CLOSED / OPEN / HALF_OPEN state machine per account and
//! answers "is this account currently eligible to receive traffic?".
//!
//! Transitions:
//! - CLOSED → OPEN: consecutive failures reach the threshold
//! - OPEN → HALF_OPEN: cooldown elapsed, evaluated lazily at read time
//! - HALF_OPEN → CLOSED: consecutive successes reach the threshold
//! - HALF_OPEN → OPEN: any single failure, restarting the cooldown
//!
//! The OPEN → HALF_OPEN transition has no background timer: every eligibility
//! check re-evaluates elapsed time before trusting a stored OPEN state.
//! Transition logic is pure functions of (record, event, now) so it can be
//! tested without stores or clocks; [`CircuitBreaker`] adds per-account
//! write serialization, persistence through [`CircuitStore`], a broadcast
//! feed of transitions for alerting/audit, and transition metrics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::StoreError;

/// Availability gate state for one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation — eligible
    Closed,
    /// Recently failed repeatedly — ineligible until the cooldown elapses
    Open,
    /// Probationary — eligible for a limited trial
    HalfOpen,
}

impl CircuitState {
    /// State label for logs, health output, and the audit log.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Parse a stored state label (audit log replay).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "closed" => Some(CircuitState::Closed),
            "open" => Some(CircuitState::Open),
            "half_open" => Some(CircuitState::HalfOpen),
            _ => None,
        }
    }

    /// Whether an account in this state may receive traffic.
    pub fn is_eligible(&self) -> bool {
        matches!(self, CircuitState::Closed | CircuitState::HalfOpen)
    }
}

/// Stored circuit state for one account.
#[derive(Debug, Clone)]
pub struct CircuitRecord {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Set while OPEN; the cooldown clock
    pub opened_at: Option<Instant>,
    /// Most recent failure reason, kept for diagnostics
    pub last_failure_reason: Option<String>,
}

impl Default for CircuitRecord {
    /// Circuits are created implicitly as CLOSED on first reference.
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            last_failure_reason: None,
        }
    }
}

/// Thresholds and timing for the state machine.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open a CLOSED circuit
    pub failure_threshold: u32,
    /// How long an OPEN circuit stays ineligible before probation
    pub cooldown: Duration,
    /// Consecutive HALF_OPEN successes that close the circuit
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            success_threshold: 3,
        }
    }
}

/// One observed state transition, broadcast for alerting and audit.
#[derive(Debug, Clone)]
pub struct CircuitTransition {
    pub account_id: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: Option<String>,
}

/// Record a failure event. Pure function; the caller persists the result.
fn apply_failure(
    record: &CircuitRecord,
    config: &BreakerConfig,
    reason: &str,
    now: Instant,
) -> CircuitRecord {
    let mut next = record.clone();
    next.consecutive_successes = 0;
    next.last_failure_reason = Some(reason.to_string());
    match record.state {
        CircuitState::Closed => {
            next.consecutive_failures = record.consecutive_failures + 1;
            if next.consecutive_failures >= config.failure_threshold {
                next.state = CircuitState::Open;
                next.opened_at = Some(now);
            }
        }
        CircuitState::HalfOpen => {
            // Full reset, immediate reopen: a failed probe restarts the
            // cooldown with the failure counter pinned at the threshold.
            next.state = CircuitState::Open;
            next.consecutive_failures = config.failure_threshold;
            next.opened_at = Some(now);
        }
        CircuitState::Open => {
            // Late report from a call issued before the circuit opened
            next.consecutive_failures = record.consecutive_failures.saturating_add(1);
        }
    }
    next
}

/// Record a success event. Pure function; the caller persists the result.
fn apply_success(record: &CircuitRecord, config: &BreakerConfig) -> CircuitRecord {
    let mut next = record.clone();
    next.consecutive_failures = 0;
    next.consecutive_successes = record.consecutive_successes.saturating_add(1);
    if record.state == CircuitState::HalfOpen
        && next.consecutive_successes >= config.success_threshold
    {
        next.state = CircuitState::Closed;
        next.consecutive_failures = 0;
        next.consecutive_successes = 0;
        next.opened_at = None;
    }
    next
}

/// Apply the lazy OPEN → HALF_OPEN transition if the cooldown has elapsed.
fn apply_cooldown(record: &CircuitRecord, config: &BreakerConfig, now: Instant) -> CircuitRecord {
    if record.state == CircuitState::Open {
        if let Some(opened_at) = record.opened_at {
            if now.duration_since(opened_at) >= config.cooldown {
                let mut next = record.clone();
                next.state = CircuitState::HalfOpen;
                next.consecutive_successes = 0;
                return next;
            }
        }
    }
    record.clone()
}

/// Keyed circuit state in the shared low-latency store.
///
/// Plain load/store is sufficient here (unlike capacity reservations):
/// circuit state only needs read-after-write consistency from the writing
/// instance, and [`CircuitBreaker`] serializes its own read-modify-write
/// cycles per account.
#[async_trait]
pub trait CircuitStore: Send + Sync {
    async fn load(&self, account_id: &str) -> Result<Option<CircuitRecord>, StoreError>;
    async fn store(&self, account_id: &str, record: CircuitRecord) -> Result<(), StoreError>;
}

/// In-process circuit store.
#[derive(Default)]
pub struct MemoryCircuitStore {
    states: RwLock<HashMap<String, CircuitRecord>>,
}

impl MemoryCircuitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CircuitStore for MemoryCircuitStore {
    async fn load(&self, account_id: &str) -> Result<Option<CircuitRecord>, StoreError> {
        Ok(self.states.read().await.get(account_id).cloned())
    }

    async fn store(&self, account_id: &str, record: CircuitRecord) -> Result<(), StoreError> {
        self.states
            .write()
            .await
            .insert(account_id.to_string(), record);
        Ok(())
    }
}

/// Per-account availability gate.
pub struct CircuitBreaker {
    store: Arc<dyn CircuitStore>,
    config: BreakerConfig,
    /// Serializes read-modify-write per account within this instance
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    events: broadcast::Sender<CircuitTransition>,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn CircuitStore>, config: BreakerConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            config,
            locks: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to the transition feed (opened / half-opened / closed).
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitTransition> {
        self.events.subscribe()
    }

    async fn account_lock(&self, account_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load_or_default(&self, account_id: &str) -> Result<CircuitRecord, StoreError> {
        Ok(self.store.load(account_id).await?.unwrap_or_default())
    }

    fn publish(&self, account_id: &str, from: CircuitState, to: CircuitState, reason: Option<&str>) {
        info!(
            account_id,
            from = from.as_str(),
            to = to.as_str(),
            reason = reason.unwrap_or(""),
            "circuit transition"
        );
        metrics::counter!("circuit_transitions_total", "to" => to.as_str()).increment(1);
        let _ = self.events.send(CircuitTransition {
            account_id: account_id.to_string(),
            from,
            to,
            reason: reason.map(str::to_string),
        });
    }

    /// Current state, after applying the lazy cooldown transition if due.
    pub async fn check_state(&self, account_id: &str) -> Result<CircuitState, StoreError> {
        let lock = self.account_lock(account_id).await;
        let _guard = lock.lock().await;

        let record = self.load_or_default(account_id).await?;
        let next = apply_cooldown(&record, &self.config, Instant::now());
        if next.state != record.state {
            self.publish(account_id, record.state, next.state, None);
            self.store.store(account_id, next.clone()).await?;
        }
        Ok(next.state)
    }

    /// Record a failed upstream call against this account.
    pub async fn record_failure(
        &self,
        account_id: &str,
        reason: &str,
    ) -> Result<CircuitState, StoreError> {
        let lock = self.account_lock(account_id).await;
        let _guard = lock.lock().await;

        let record = self.load_or_default(account_id).await?;
        let next = apply_failure(&record, &self.config, reason, Instant::now());
        if next.state != record.state {
            self.publish(account_id, record.state, next.state, Some(reason));
        } else {
            debug!(
                account_id,
                consecutive_failures = next.consecutive_failures,
                reason,
                "recorded failure"
            );
        }
        self.store.store(account_id, next.clone()).await?;
        Ok(next.state)
    }

    /// Record a successful upstream call against this account.
    pub async fn record_success(&self, account_id: &str) -> Result<CircuitState, StoreError> {
        let lock = self.account_lock(account_id).await;
        let _guard = lock.lock().await;

        let record = self.load_or_default(account_id).await?;
        let next = apply_success(&record, &self.config);
        if next.state != record.state {
            self.publish(account_id, record.state, next.state, None);
        }
        self.store.store(account_id, next.clone()).await?;
        Ok(next.state)
    }

    /// Force CLOSED and zero both counters — administrative recovery.
    pub async fn reset(&self, account_id: &str) -> Result<(), StoreError> {
        let lock = self.account_lock(account_id).await;
        let _guard = lock.lock().await;

        let record = self.load_or_default(account_id).await?;
        if record.state != CircuitState::Closed {
            self.publish(account_id, record.state, CircuitState::Closed, None);
        }
        self.store
            .store(account_id, CircuitRecord::default())
            .await?;
        Ok(())
    }

    /// Seed a state recovered from the durable audit log.
    ///
    /// Used at startup when the fast store is empty. A restored OPEN circuit
    /// restarts its cooldown from now — conservative, since the original
    /// opening time was not persisted in the fast store.
    pub async fn restore(&self, account_id: &str, state: CircuitState) -> Result<(), StoreError> {
        let lock = self.account_lock(account_id).await;
        let _guard = lock.lock().await;

        if self.store.load(account_id).await?.is_some() {
            // Fast store already has fresher state than the audit log
            return Ok(());
        }

        let record = match state {
            CircuitState::Closed => CircuitRecord::default(),
            CircuitState::Open => CircuitRecord {
                state: CircuitState::Open,
                consecutive_failures: self.config.failure_threshold,
                opened_at: Some(Instant::now()),
                ..CircuitRecord::default()
            },
            CircuitState::HalfOpen => CircuitRecord {
                state: CircuitState::HalfOpen,
                consecutive_failures: self.config.failure_threshold,
                ..CircuitRecord::default()
            },
        };
        warn!(account_id, state = state.as_str(), "restored circuit state from audit log");
        self.store.store(account_id, record).await?;
        Ok(())
    }

    /// Raw record for diagnostics, with the lazy cooldown view applied
    /// (not persisted).
    pub async fn snapshot(&self, account_id: &str) -> Result<CircuitRecord, StoreError> {
        let record = self.load_or_default(account_id).await?;
        Ok(apply_cooldown(&record, &self.config, Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(Arc::new(MemoryCircuitStore::new()), BreakerConfig::default())
    }

    fn breaker_with(config: BreakerConfig) -> CircuitBreaker {
        CircuitBreaker::new(Arc::new(MemoryCircuitStore::new()), config)
    }

    #[tokio::test]
    async fn first_reference_is_closed() {
        let breaker = breaker();
        assert_eq!(
            breaker.check_state("a").await.unwrap(),
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn opens_after_exactly_threshold_failures() {
        let breaker = breaker();

        for _ in 0..4 {
            breaker.record_failure("a", "upstream 500").await.unwrap();
        }
        assert_eq!(
            breaker.check_state("a").await.unwrap(),
            CircuitState::Closed,
            "one fewer than the threshold must not open the circuit"
        );

        let state = breaker.record_failure("a", "upstream 500").await.unwrap();
        assert_eq!(state, CircuitState::Open);
        assert_eq!(breaker.check_state("a").await.unwrap(), CircuitState::Open);
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let breaker = breaker();

        for _ in 0..4 {
            breaker.record_failure("a", "timeout").await.unwrap();
        }
        breaker.record_success("a").await.unwrap();
        for _ in 0..4 {
            breaker.record_failure("a", "timeout").await.unwrap();
        }

        assert_eq!(
            breaker.check_state("a").await.unwrap(),
            CircuitState::Closed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_boundary_is_exact() {
        let breaker = breaker();
        for _ in 0..5 {
            breaker.record_failure("a", "upstream 529").await.unwrap();
        }

        tokio::time::advance(Duration::from_millis(59_999)).await;
        assert_eq!(
            breaker.check_state("a").await.unwrap(),
            CircuitState::Open,
            "one tick before the cooldown elapses the circuit is still open"
        );

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(
            breaker.check_state("a").await.unwrap(),
            CircuitState::HalfOpen
        );
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_recovers_after_success_threshold() {
        let breaker = breaker();
        for _ in 0..5 {
            breaker.record_failure("a", "upstream 500").await.unwrap();
        }
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(
            breaker.check_state("a").await.unwrap(),
            CircuitState::HalfOpen
        );

        breaker.record_success("a").await.unwrap();
        breaker.record_success("a").await.unwrap();
        assert_eq!(
            breaker.check_state("a").await.unwrap(),
            CircuitState::HalfOpen,
            "two successes are one short of recovery"
        );

        let state = breaker.record_success("a").await.unwrap();
        assert_eq!(state, CircuitState::Closed);

        let record = breaker.snapshot("a").await.unwrap();
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.consecutive_successes, 0);
        assert!(record.opened_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens_and_restarts_cooldown() {
        let breaker = breaker();
        for _ in 0..5 {
            breaker.record_failure("a", "upstream 500").await.unwrap();
        }
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(
            breaker.check_state("a").await.unwrap(),
            CircuitState::HalfOpen
        );

        let state = breaker.record_failure("a", "probe failed").await.unwrap();
        assert_eq!(state, CircuitState::Open);

        // The cooldown clock restarted at the probe failure
        tokio::time::advance(Duration::from_millis(59_999)).await;
        assert_eq!(breaker.check_state("a").await.unwrap(), CircuitState::Open);
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(
            breaker.check_state("a").await.unwrap(),
            CircuitState::HalfOpen
        );
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_success_streak_broken_by_failure_starts_over() {
        let breaker = breaker();
        for _ in 0..5 {
            breaker.record_failure("a", "upstream 500").await.unwrap();
        }
        tokio::time::advance(Duration::from_secs(60)).await;
        breaker.check_state("a").await.unwrap();

        breaker.record_success("a").await.unwrap();
        breaker.record_success("a").await.unwrap();
        breaker.record_failure("a", "probe failed").await.unwrap();

        // Back to OPEN; a fresh cooldown and a fresh success streak are needed
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(
            breaker.check_state("a").await.unwrap(),
            CircuitState::HalfOpen
        );
        breaker.record_success("a").await.unwrap();
        breaker.record_success("a").await.unwrap();
        assert_eq!(
            breaker.check_state("a").await.unwrap(),
            CircuitState::HalfOpen
        );
        breaker.record_success("a").await.unwrap();
        assert_eq!(
            breaker.check_state("a").await.unwrap(),
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn reset_forces_closed() {
        let breaker = breaker();
        for _ in 0..5 {
            breaker.record_failure("a", "upstream 500").await.unwrap();
        }
        assert_eq!(breaker.check_state("a").await.unwrap(), CircuitState::Open);

        breaker.reset("a").await.unwrap();
        assert_eq!(
            breaker.check_state("a").await.unwrap(),
            CircuitState::Closed
        );
        let record = breaker.snapshot("a").await.unwrap();
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.consecutive_successes, 0);
    }

    #[tokio::test]
    async fn failure_reason_is_kept_for_diagnostics() {
        let breaker = breaker();
        breaker.record_failure("a", "upstream 429").await.unwrap();

        let record = breaker.snapshot("a").await.unwrap();
        assert_eq!(record.last_failure_reason.as_deref(), Some("upstream 429"));
    }

    #[tokio::test]
    async fn transitions_are_broadcast() {
        let breaker = breaker();
        let mut events = breaker.subscribe();

        for _ in 0..5 {
            breaker.record_failure("a", "upstream 500").await.unwrap();
        }

        let transition = events.recv().await.unwrap();
        assert_eq!(transition.account_id, "a");
        assert_eq!(transition.from, CircuitState::Closed);
        assert_eq!(transition.to, CircuitState::Open);
        assert_eq!(transition.reason.as_deref(), Some("upstream 500"));
    }

    #[tokio::test]
    async fn accounts_are_independent() {
        let breaker = breaker();
        for _ in 0..5 {
            breaker.record_failure("a", "upstream 500").await.unwrap();
        }

        assert_eq!(breaker.check_state("a").await.unwrap(), CircuitState::Open);
        assert_eq!(
            breaker.check_state("b").await.unwrap(),
            CircuitState::Closed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn restore_seeds_open_with_fresh_cooldown() {
        let breaker = breaker();
        breaker.restore("a", CircuitState::Open).await.unwrap();

        assert_eq!(breaker.check_state("a").await.unwrap(), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(
            breaker.check_state("a").await.unwrap(),
            CircuitState::HalfOpen
        );
    }

    #[tokio::test]
    async fn restore_does_not_clobber_live_state() {
        let breaker = breaker();
        for _ in 0..5 {
            breaker.record_failure("a", "upstream 500").await.unwrap();
        }

        // A stale audit replay must not overwrite fresher fast-store state
        breaker.restore("a", CircuitState::Closed).await.unwrap();
        assert_eq!(breaker.check_state("a").await.unwrap(), CircuitState::Open);
    }

    #[tokio::test]
    async fn lower_thresholds_are_respected() {
        let breaker = breaker_with(BreakerConfig {
            failure_threshold: 2,
            cooldown: Duration::from_secs(60),
            success_threshold: 1,
        });

        breaker.record_failure("a", "boom").await.unwrap();
        assert_eq!(
            breaker.check_state("a").await.unwrap(),
            CircuitState::Closed
        );
        let state = breaker.record_failure("a", "boom").await.unwrap();
        assert_eq!(state, CircuitState::Open);
    }
}
