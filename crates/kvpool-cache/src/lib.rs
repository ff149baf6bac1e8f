//! kvpool-cache: expiring key/blob cache persisted with redb.
//!
//! A single table maps opaque byte keys to `(expire_at_ms, payload)`.
//! [`CacheStore::gc`] drops expired entries and, once the file grows past
//! its size threshold, evicts the oldest entries until it shrinks.

pub mod error;
pub mod gc;
pub mod store;

pub use error::{CacheError, CacheResult};
pub use gc::{GcReport, spawn_gc_task};
pub use store::CacheStore;
