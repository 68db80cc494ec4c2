//! Account pool for a rate-limited upstream API
//!
//! Routes units of work across a pool of credential-bearing accounts,
//! maximizing throughput while respecting each account's quota and isolating
//! failing accounts without human intervention. Three components compose
//! bottom-up:
//!
//! - [`capacity`]: sliding-window usage ledgers with atomic reserve-or-reject
//! - [`breaker`]: per-account CLOSED/OPEN/HALF_OPEN availability gate
//! - [`pool`]: the selection/report contract callers consume
//!
//! Flow per unit of work:
//! 1. Caller asks the pool for an account able to absorb the estimated cost
//! 2. Pool filters active accounts by circuit eligibility, concurrency, and
//!    window capacity, ranks survivors least-loaded first, and atomically
//!    reserves capacity on the winner
//! 3. Caller performs the upstream call with the returned credential
//! 4. Caller reports the outcome once; the pool reconciles the reservation to
//!    the real cost and feeds the circuit breaker
//!
//! All exhaustion is data ([`pool::ExhaustionReport`]), never an error, so
//! callers implement backoff without exception-driven control flow.

pub mod audit;
pub mod breaker;
pub mod capacity;
pub mod error;
pub mod pool;
pub mod retry;

pub use audit::spawn_audit_task;
pub use breaker::{
    BreakerConfig, CircuitBreaker, CircuitRecord, CircuitState, CircuitStore, CircuitTransition,
    MemoryCircuitStore,
};
pub use capacity::{CapacityStore, MemoryCapacityStore, Metric};
pub use error::{Error, Result, StoreError};
pub use pool::{
    AccountPool, Exclusion, ExclusionReason, ExhaustionKind, ExhaustionReport, Outcome,
    SelectedAccount, SelectionOutcome,
};
pub use retry::{RetryPolicy, with_retry};
