//! kvpool-conn: pooled connections to key/value backends.
//!
//! One [`ConnectionPool`] serves every [`ResourceType`]. Each available type
//! owns a fixed number of named slots that move between three places:
//!
//! ```text
//!          acquire (warm hit)
//!   warm ─────────────────────► in use
//!    │ ▲                           │
//!    │ └───── release / drop ──────┘
//!    │
//!    │ reclaim (idle > 30s), or found broken on acquire
//!    ▼
//!   cold ──── acquire (open) ──► in use
//! ```
//!
//! A slot name lives in exactly one of {warm, cold, one caller} at a time;
//! moving the `Slot` value itself between stacks makes that hold by
//! construction. Capacity per type is bounded by a semaphore, so `acquire`
//! waits (FIFO) rather than spinning when every slot is in use.
//!
//! [`ResourceType`]: kvpool_core::ResourceType

pub mod backend;
pub mod error;
pub mod pool;
pub mod reclaimer;
pub mod redis;
pub mod tcp;

pub use backend::{BackendFactory, ConnectionBackend, ConnectionFactory};
pub use error::{PoolError, PoolResult};
pub use pool::{
    ConnectionPool, IDLE_THRESHOLD, OpenFailurePolicy, PoolConfig, PoolStats, PooledConnection,
    SWEEP_INTERVAL,
};
pub use reclaimer::IdleReclaimer;
pub use tcp::ConnectOptions;
