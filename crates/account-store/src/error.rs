//! Error types for durable stores

/// Errors from registry and audit log operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("registry parse error: {0}")]
    Parse(String),

    #[error("account not found: {0}")]
    NotFound(String),

    #[error("unknown tier: {0}")]
    UnknownTier(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
