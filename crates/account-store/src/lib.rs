//! Durable state for the upstream account pool
//!
//! Two pieces of long-lived state live here:
//!
//! - [`AccountStore`]: the account registry — credentials, tier, status — in a
//!   JSON file written atomically with 0600 permissions. The registry is the
//!   single source of truth for which accounts exist; the pool reads it at
//!   selection time.
//! - [`TransitionLog`]: an append-only JSONL audit of circuit breaker
//!   transitions. It doubles as the durable fallback for live circuit state:
//!   replaying it at startup recovers the last known state per account when
//!   the fast store is empty.
//!
//! Accounts are never hard-deleted. Removing one from rotation is a status
//! flip to `disabled`, so historical usage and audit records keep resolving.

pub mod account;
pub mod error;
pub mod registry;
pub mod transitions;

pub use account::{Account, AccountStatus, Tier, TierLimits};
pub use error::{Error, Result};
pub use registry::AccountStore;
pub use transitions::{TransitionLog, TransitionRecord};
