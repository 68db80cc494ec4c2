//! Account pool selection and outcome recording
//!
//! Owns the registry view and decides, for every inbound unit of work, which
//! credential set (if any) may be used right now. Selection filters the
//! organization's active accounts through the circuit breaker, the in-flight
//! concurrency gate, and the capacity tracker, ranks survivors least-loaded
//! first, and atomically reserves capacity on the winner so a concurrent
//! caller observes the updated usage.
//!
//! Exhaustion is a structured result, never an error: callers get the count
//! of accounts checked and a per-account exclusion reason, and can tell a
//! retryable condition (capacity, open circuits, store outage) from a
//! configuration-fatal one (no active accounts at all).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use account_store::{Account, AccountStatus, AccountStore, Tier};

use crate::breaker::{CircuitBreaker, CircuitTransition};
use crate::capacity::{CapacityStore, Metric};
use crate::error::{Error, Result, StoreError};
use crate::retry::{RetryPolicy, with_retry};

/// Why an account was excluded from a selection round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    /// Circuit is OPEN — the account recently failed repeatedly
    CircuitOpen,
    /// The estimated cost does not fit the account's remaining window quota
    CapacityExhausted,
    /// The account is at its tier's max concurrent in-flight requests
    ConcurrencyLimit,
    /// The tracking store could not be reached for this account
    StoreUnavailable,
}

impl ExclusionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExclusionReason::CircuitOpen => "circuit_open",
            ExclusionReason::CapacityExhausted => "capacity_exhausted",
            ExclusionReason::ConcurrencyLimit => "concurrency_limit",
            ExclusionReason::StoreUnavailable => "store_unavailable",
        }
    }
}

/// One excluded account and why.
#[derive(Debug, Clone, Serialize)]
pub struct Exclusion {
    pub account_id: String,
    pub reason: ExclusionReason,
}

/// What kind of exhaustion the caller is looking at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionKind {
    /// The organization has no active accounts registered — waiting will not
    /// help; this is a configuration problem
    NoActiveAccounts,
    /// Every candidate was excluded because the tracking store was down
    StoreUnavailable,
    /// Candidates exist but all were excluded by circuit, concurrency, or
    /// capacity checks — retryable after backoff
    NoEligibleAccounts,
}

/// Structured "no account available" result.
#[derive(Debug, Clone, Serialize)]
pub struct ExhaustionReport {
    pub kind: ExhaustionKind,
    pub accounts_checked: usize,
    pub exclusions: Vec<Exclusion>,
}

impl ExhaustionReport {
    /// Whether waiting and resubmitting can succeed, as opposed to a
    /// configuration-fatal condition.
    pub fn is_retryable(&self) -> bool {
        self.kind != ExhaustionKind::NoActiveAccounts
    }
}

/// A selected account with its credential and the reservation backing it.
#[derive(Debug, Clone)]
pub struct SelectedAccount {
    pub account_id: String,
    pub organization_id: String,
    pub name: String,
    /// Credential for the caller's upstream request. Never logged.
    pub credential: String,
    pub tier: Tier,
    /// Ticket to quote back in `record_outcome`
    pub reservation_id: String,
    /// Token units reserved against the estimate
    pub estimated_cost: u64,
}

/// Result of a selection attempt.
#[derive(Debug)]
pub enum SelectionOutcome {
    Selected(SelectedAccount),
    Exhausted(ExhaustionReport),
}

/// Outcome of the caller's upstream call, reported exactly once per selection.
#[derive(Debug, Clone)]
pub struct Outcome {
    /// The ticket issued by `select`
    pub reservation_id: String,
    pub success: bool,
    /// Real cost in token units. `None` on failure means the call never
    /// happened and the whole reservation is refunded.
    pub actual_cost: Option<u64>,
    /// Caller-supplied failure classification for diagnostics
    pub failure_reason: Option<String>,
}

/// A reservation awaiting its outcome report.
struct PendingReservation {
    account_id: String,
    tokens: u64,
    issued_at: Instant,
}

/// The account pool service.
pub struct AccountPool {
    registry: Arc<AccountStore>,
    capacity: Arc<dyn CapacityStore>,
    breaker: Arc<CircuitBreaker>,
    /// Trailing window duration, also the lifetime of unreported reservations
    window: Duration,
    pending: RwLock<HashMap<String, PendingReservation>>,
    in_flight: RwLock<HashMap<String, Arc<AtomicU64>>>,
    retry: RetryPolicy,
}

impl AccountPool {
    pub fn new(
        registry: Arc<AccountStore>,
        capacity: Arc<dyn CapacityStore>,
        breaker: Arc<CircuitBreaker>,
        window: Duration,
    ) -> Self {
        Self {
            registry,
            capacity,
            breaker,
            window,
            pending: RwLock::new(HashMap::new()),
            in_flight: RwLock::new(HashMap::new()),
            retry: RetryPolicy::default(),
        }
    }

    /// Register a new account for an organization.
    ///
    /// Validates input, persists the account, and initializes its circuit to
    /// CLOSED. Registering the same credential twice is an idempotent no-op
    /// returning the existing account.
    pub async fn register_account(
        &self,
        organization_id: &str,
        name: &str,
        credential: &str,
        tier: Tier,
    ) -> Result<Account> {
        if organization_id.trim().is_empty() {
            return Err(Error::Validation("organization_id must not be empty".into()));
        }
        if name.trim().is_empty() {
            return Err(Error::Validation("name must not be empty".into()));
        }
        if credential.trim().is_empty() {
            return Err(Error::Validation("credential must not be empty".into()));
        }

        if let Some(existing) = self.registry.find_by_credential(credential).await {
            debug!(
                account_id = existing.id,
                organization_id, "credential already registered, returning existing account"
            );
            return Ok(existing);
        }

        let account = Account {
            id: Uuid::new_v4().to_string(),
            organization_id: organization_id.to_string(),
            name: name.to_string(),
            credential: credential.to_string(),
            tier,
            status: AccountStatus::Active,
        };
        self.registry.insert(account.clone()).await?;
        if let Err(e) = self.breaker.reset(&account.id).await {
            warn!(account_id = account.id, error = %e, "could not initialize circuit state");
        }

        info!(
            account_id = account.id,
            organization_id,
            tier = tier.as_str(),
            "registered account"
        );
        Ok(account)
    }

    /// Select an account able to absorb `estimated_cost` token units now.
    ///
    /// The winner's capacity is reserved atomically before returning, so a
    /// concurrent caller observes the updated usage. The caller must report
    /// the result via [`record_outcome`](Self::record_outcome) exactly once;
    /// unreported reservations lapse with the window.
    pub async fn select(&self, organization_id: &str, estimated_cost: u64) -> SelectionOutcome {
        let started = Instant::now();
        self.expire_pending().await;

        let accounts = self.registry.for_organization(organization_id).await;
        let active: Vec<Account> = accounts.into_iter().filter(Account::is_active).collect();
        if active.is_empty() {
            info!(organization_id, "selection failed: no active accounts registered");
            metrics::counter!("pool_selections_total", "outcome" => "exhausted").increment(1);
            return SelectionOutcome::Exhausted(ExhaustionReport {
                kind: ExhaustionKind::NoActiveAccounts,
                accounts_checked: 0,
                exclusions: vec![],
            });
        }

        let accounts_checked = active.len();
        let mut exclusions: Vec<Exclusion> = Vec::new();
        // (utilization fraction, account) for accounts passing every check
        let mut candidates: Vec<(f64, Account)> = Vec::new();

        for account in active {
            match self.screen(&account, estimated_cost).await {
                Ok(utilization) => candidates.push((utilization, account)),
                Err(reason) => {
                    metrics::counter!("pool_exclusions_total", "reason" => reason.as_str())
                        .increment(1);
                    exclusions.push(Exclusion {
                        account_id: account.id,
                        reason,
                    });
                }
            }
        }

        // Least loaded first, account id as the deterministic tie-break
        candidates.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.id.cmp(&b.1.id))
        });

        for (utilization, account) in candidates {
            match self.reserve(&account, estimated_cost).await {
                Ok(Some(selected)) => {
                    debug!(
                        organization_id,
                        account_id = selected.account_id,
                        estimated_cost,
                        utilization,
                        "selected account"
                    );
                    metrics::counter!("pool_selections_total", "outcome" => "selected")
                        .increment(1);
                    metrics::histogram!("pool_selection_duration_seconds")
                        .record(started.elapsed().as_secs_f64());
                    return SelectionOutcome::Selected(selected);
                }
                Ok(None) => {
                    // Lost a reservation race since the advisory check
                    metrics::counter!("pool_exclusions_total", "reason" => "capacity_exhausted")
                        .increment(1);
                    exclusions.push(Exclusion {
                        account_id: account.id,
                        reason: ExclusionReason::CapacityExhausted,
                    });
                }
                Err(e) => {
                    warn!(account_id = account.id, error = %e, "tracking store unreachable during reserve");
                    metrics::counter!("pool_exclusions_total", "reason" => "store_unavailable")
                        .increment(1);
                    exclusions.push(Exclusion {
                        account_id: account.id,
                        reason: ExclusionReason::StoreUnavailable,
                    });
                }
            }
        }

        let kind = if !exclusions.is_empty()
            && exclusions
                .iter()
                .all(|e| e.reason == ExclusionReason::StoreUnavailable)
        {
            ExhaustionKind::StoreUnavailable
        } else {
            ExhaustionKind::NoEligibleAccounts
        };
        info!(
            organization_id,
            accounts_checked,
            kind = ?kind,
            "selection exhausted"
        );
        metrics::counter!("pool_selections_total", "outcome" => "exhausted").increment(1);
        metrics::histogram!("pool_selection_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        SelectionOutcome::Exhausted(ExhaustionReport {
            kind,
            accounts_checked,
            exclusions,
        })
    }

    /// Eligibility checks for one candidate, in order: circuit, concurrency,
    /// advisory capacity fit. Returns the utilization fraction used for
    /// ranking, or the exclusion reason for the first check that failed.
    async fn screen(
        &self,
        account: &Account,
        estimated_cost: u64,
    ) -> std::result::Result<f64, ExclusionReason> {
        match self.breaker.check_state(&account.id).await {
            Ok(state) if state.is_eligible() => {}
            Ok(_) => return Err(ExclusionReason::CircuitOpen),
            Err(e) => {
                warn!(account_id = account.id, error = %e, "circuit store unreachable, excluding account");
                return Err(ExclusionReason::StoreUnavailable);
            }
        }

        let limits = account.tier.limits();
        if self.in_flight_count(&account.id).await >= limits.max_concurrent {
            return Err(ExclusionReason::ConcurrencyLimit);
        }

        let (requests, tokens) = match (
            self.capacity.usage(&account.id, Metric::Requests).await,
            self.capacity.usage(&account.id, Metric::Tokens).await,
        ) {
            (Ok(requests), Ok(tokens)) => (requests, tokens),
            (Err(e), _) | (_, Err(e)) => {
                warn!(account_id = account.id, error = %e, "capacity store unreachable, excluding account");
                return Err(ExclusionReason::StoreUnavailable);
            }
        };

        if requests + 1 > limits.requests_per_minute
            || tokens + estimated_cost > limits.tokens_per_minute
        {
            return Err(ExclusionReason::CapacityExhausted);
        }

        let utilization = f64::max(
            requests as f64 / limits.requests_per_minute as f64,
            tokens as f64 / limits.tokens_per_minute as f64,
        );
        Ok(utilization)
    }

    /// Atomically reserve one request unit and the estimated token cost.
    ///
    /// Ok(None) means the account lost a capacity race since the advisory
    /// check; any partial reservation is rolled back.
    async fn reserve(
        &self,
        account: &Account,
        estimated_cost: u64,
    ) -> std::result::Result<Option<SelectedAccount>, StoreError> {
        let limits = account.tier.limits();

        if !self
            .capacity
            .try_reserve(&account.id, Metric::Requests, 1, limits.requests_per_minute)
            .await?
        {
            return Ok(None);
        }
        match self
            .capacity
            .try_reserve(
                &account.id,
                Metric::Tokens,
                estimated_cost,
                limits.tokens_per_minute,
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                let _ = self.capacity.release(&account.id, Metric::Requests, 1).await;
                return Ok(None);
            }
            Err(e) => {
                let _ = self.capacity.release(&account.id, Metric::Requests, 1).await;
                return Err(e);
            }
        }

        let reservation_id = Uuid::new_v4().to_string();
        self.pending.write().await.insert(
            reservation_id.clone(),
            PendingReservation {
                account_id: account.id.clone(),
                tokens: estimated_cost,
                issued_at: Instant::now(),
            },
        );
        self.in_flight_counter(&account.id)
            .await
            .fetch_add(1, Ordering::Relaxed);

        Ok(Some(SelectedAccount {
            account_id: account.id.clone(),
            organization_id: account.organization_id.clone(),
            name: account.name.clone(),
            credential: account.credential.clone(),
            tier: account.tier,
            reservation_id,
            estimated_cost,
        }))
    }

    /// Reconcile a reservation with the real outcome of the upstream call.
    ///
    /// Always succeeds from the caller's perspective: store errors are
    /// retried with jittered backoff and then logged, never surfaced — the
    /// request being bookkept already completed. An unknown or expired
    /// reservation id is a stale report: logged as a warning, with the
    /// circuit feedback still applied.
    pub async fn record_outcome(&self, account_id: &str, outcome: Outcome) {
        let pending = {
            let mut pending = self.pending.write().await;
            match pending.remove(&outcome.reservation_id) {
                Some(p) if p.account_id == account_id => Some(p),
                Some(p) => {
                    warn!(
                        account_id,
                        reservation_account = p.account_id,
                        reservation_id = outcome.reservation_id,
                        "outcome reported against the wrong account, ignoring reservation"
                    );
                    pending.insert(outcome.reservation_id.clone(), p);
                    None
                }
                None => {
                    warn!(
                        account_id,
                        reservation_id = outcome.reservation_id,
                        "stale reservation: already expired or never issued"
                    );
                    None
                }
            }
        };

        if let Some(p) = pending {
            self.decrement_in_flight(account_id).await;
            self.reconcile_capacity(account_id, &p, &outcome).await;
        }

        // Circuit feedback applies even when the reservation lapsed: the
        // upstream call still happened.
        let result = if outcome.success {
            with_retry(&self.retry, "record_success", || {
                self.breaker.record_success(account_id)
            })
            .await
            .map(|_| ())
        } else {
            let reason = outcome.failure_reason.as_deref().unwrap_or("unspecified");
            with_retry(&self.retry, "record_failure", || {
                self.breaker.record_failure(account_id, reason)
            })
            .await
            .map(|_| ())
        };
        if let Err(e) = result {
            warn!(account_id, error = %e, "could not record outcome in circuit store");
        }

        let label = if outcome.success { "success" } else { "failure" };
        metrics::counter!("pool_outcomes_total", "result" => label).increment(1);
    }

    /// Adjust the capacity ledger from the estimate to the real consumption.
    async fn reconcile_capacity(&self, account_id: &str, p: &PendingReservation, outcome: &Outcome) {
        match outcome.actual_cost {
            Some(actual) => {
                let result = with_retry(&self.retry, "commit", || {
                    self.capacity
                        .commit(account_id, Metric::Tokens, p.tokens, actual)
                })
                .await;
                if let Err(e) = result {
                    warn!(account_id, error = %e, "could not reconcile token reservation");
                }
            }
            None if !outcome.success => {
                // The call never happened: refund the whole reservation
                let released = with_retry(&self.retry, "release", || async {
                    self.capacity
                        .release(account_id, Metric::Tokens, p.tokens)
                        .await?;
                    self.capacity.release(account_id, Metric::Requests, 1).await
                })
                .await;
                if let Err(e) = released {
                    warn!(account_id, error = %e, "could not refund reservation");
                }
            }
            // Success without a cost report: keep the estimate as charged
            None => {}
        }
    }

    /// Administratively remove an account from rotation.
    pub async fn disable_account(&self, account_id: &str) -> Result<Account> {
        let account = self
            .registry
            .set_status(account_id, AccountStatus::Disabled)
            .await?;
        info!(account_id, "account disabled");
        Ok(account)
    }

    /// Return an administratively disabled account to rotation.
    pub async fn enable_account(&self, account_id: &str) -> Result<Account> {
        let account = self
            .registry
            .set_status(account_id, AccountStatus::Active)
            .await?;
        info!(account_id, "account enabled");
        Ok(account)
    }

    /// Subscribe to the circuit transition feed (opened / half-opened /
    /// closed), for alerting.
    pub fn subscribe_transitions(&self) -> tokio::sync::broadcast::Receiver<CircuitTransition> {
        self.breaker.subscribe()
    }

    /// Pool health summary.
    ///
    /// Per-account circuit state, utilization percentage per metric, and
    /// in-flight count. Status mapping: every account eligible → healthy,
    /// some eligible → degraded, none → unhealthy. Credentials are never
    /// included.
    pub async fn health(&self) -> serde_json::Value {
        let ids = {
            let mut ids = self.registry.account_ids().await;
            ids.sort();
            ids
        };

        let mut accounts = Vec::new();
        let mut eligible_count = 0usize;

        for id in &ids {
            let Some(account) = self.registry.get(id).await else {
                continue;
            };
            let limits = account.tier.limits();

            let circuit = match self.breaker.check_state(id).await {
                Ok(state) => state.as_str().to_string(),
                Err(_) => "unknown".to_string(),
            };
            let requests_pct = match self.capacity.usage(id, Metric::Requests).await {
                Ok(usage) => Some(usage.saturating_mul(100) / limits.requests_per_minute.max(1)),
                Err(_) => None,
            };
            let tokens_pct = match self.capacity.usage(id, Metric::Tokens).await {
                Ok(usage) => Some(usage.saturating_mul(100) / limits.tokens_per_minute.max(1)),
                Err(_) => None,
            };

            let eligible = account.is_active() && (circuit == "closed" || circuit == "half_open");
            if eligible {
                eligible_count += 1;
            }
            let in_flight = self.in_flight_count(id).await;

            accounts.push(serde_json::json!({
                "id": account.id,
                "organization_id": account.organization_id,
                "name": account.name,
                "tier": account.tier.as_str(),
                "status": account.status.label(),
                "circuit": circuit,
                "in_flight": in_flight,
                "utilization": {
                    "requests_pct": requests_pct,
                    "tokens_pct": tokens_pct,
                }
            }));
        }

        let total = accounts.len();
        let pool_status = if total > 0 && eligible_count == total {
            "healthy"
        } else if eligible_count > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": pool_status,
            "accounts_total": total,
            "accounts_eligible": eligible_count,
            "accounts": accounts,
        })
    }

    /// Drop pending reservations older than the window; their capacity
    /// entries have already lapsed, so only the in-flight slot needs freeing.
    async fn expire_pending(&self) {
        let now = Instant::now();
        let expired: Vec<(String, String)> = {
            let mut pending = self.pending.write().await;
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| now.duration_since(p.issued_at) >= self.window)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p.account_id)))
                .collect()
        };

        for (reservation_id, account_id) in expired {
            warn!(
                account_id,
                reservation_id, "reservation expired without an outcome report"
            );
            self.decrement_in_flight(&account_id).await;
        }
    }

    async fn in_flight_counter(&self, account_id: &str) -> Arc<AtomicU64> {
        {
            let counters = self.in_flight.read().await;
            if let Some(counter) = counters.get(account_id) {
                return counter.clone();
            }
        }
        let mut counters = self.in_flight.write().await;
        counters
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    async fn in_flight_count(&self, account_id: &str) -> u64 {
        self.in_flight
            .read()
            .await
            .get(account_id)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    async fn decrement_in_flight(&self, account_id: &str) {
        let counter = self.in_flight_counter(account_id).await;
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }
}
