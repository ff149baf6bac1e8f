//! Error types for the connection pool.

use kvpool_core::ResourceType;
use thiserror::Error;

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors returned by [`ConnectionPool::acquire`](crate::ConnectionPool::acquire).
///
/// None of these are retried by the pool itself.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The type has no settings for the active environment.
    #[error("{0} not available, check the settings file")]
    TypeUnavailable(ResourceType),

    /// Settings could not be resolved or the backend refused the connection.
    #[error("failed to open KVS connection {name}: {reason}")]
    OpenFailed { name: String, reason: String },

    /// The pool has been shut down.
    #[error("connection pool for {0} is shut down")]
    Closed(ResourceType),
}
