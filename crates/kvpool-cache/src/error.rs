//! Error types for the cache store.

use thiserror::Error;

/// Result type alias for cache store operations.
pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to open cache database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("compaction error: {0}")]
    Compact(String),

    #[error("cache key must not be empty")]
    EmptyKey,

    #[error("cache ttl must be positive, got {0} ms")]
    InvalidTtl(i64),
}
