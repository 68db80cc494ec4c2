//! Error types for pool operations

/// The shared low-latency store could not be reached.
///
/// Always treated as a transient, per-account condition: the affected account
/// is excluded from the current selection and the error never propagates to
/// the caller's in-flight request.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("tracking store unavailable: {0}")]
    Unavailable(String),
}

/// Errors from pool operations that are surfaced to callers.
///
/// Exhaustion is deliberately absent: "no account available" is data
/// (`SelectionOutcome::Exhausted`), not a fault.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("registry error: {0}")]
    Registry(#[from] account_store::Error),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
