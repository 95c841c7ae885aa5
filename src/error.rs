/// Unified error types for Aurora Lens
use thiserror::Error;

/// Main error type for the AppView read layer
#[derive(Error, Debug)]
pub enum AppViewError {
    /// Database errors from the record store
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Cache backend errors (callers usually degrade to a miss instead)
    #[error("Cache error: {0}")]
    Cache(String),

    /// Record store or cache connection failure for a primary load
    #[error("Upstream unavailable: {0}")]
    Upstream(String),

    /// Requested entity absent where absence is meaningful
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation errors (bad URIs, out-of-range parameters)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for AppView operations
pub type AppViewResult<T> = Result<T, AppViewError>;
