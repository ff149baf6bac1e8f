//! Connection pool shared by every resource type.
//!
//! Each available type gets a sub-pool holding a warm stack of open idle
//! connections, a cold stack of reserved-but-closed slots and a semaphore
//! with one permit per slot that is not in use. Types without settings for
//! the active environment get no sub-pool and fail fast on `acquire`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use kvpool_core::{AppConfig, NamedStack, ResourceType, SettingsResolver};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::backend::{ConnectionBackend, ConnectionFactory};
use crate::error::{PoolError, PoolResult};

/// Warm connections unused for longer than this are closed by the reclaimer.
pub const IDLE_THRESHOLD: Duration = Duration::from_secs(30);

/// Period of the idle reclaimer sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// What happens to a slot whose connection failed to open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OpenFailurePolicy {
    /// Return the slot to the cold stack so a later `acquire` retries it.
    #[default]
    Restore,
    /// Drop the slot; the type's capacity shrinks by one for the pool's lifetime.
    Discard,
}

/// Configuration for the connection pool.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Environment whose settings are resolved for every open.
    pub environment: String,
    /// Slots per available type.
    pub capacity: usize,
    /// Idle time after which warm connections are reclaimed (default: 30s).
    pub idle_threshold: Duration,
    /// Reclaimer period (default: 10s).
    pub sweep_interval: Duration,
    pub open_failure: OpenFailurePolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            capacity: kvpool_core::config::DEFAULT_MAX_WORKERS,
            idle_threshold: IDLE_THRESHOLD,
            sweep_interval: SWEEP_INTERVAL,
            open_failure: OpenFailurePolicy::default(),
        }
    }
}

impl PoolConfig {
    /// Environment and capacity from `kvpool.toml`; capacity matches the worker count.
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            environment: config.server.environment.clone(),
            capacity: config.server.max_workers(),
            ..Self::default()
        }
    }
}

/// Point-in-time counts for one type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    /// Open connections waiting on the warm stack.
    pub idle: usize,
    /// Reserved slots on the cold stack.
    pub closed: usize,
    /// Connections currently held by callers.
    pub in_use: usize,
    /// Slots owned by the type.
    pub capacity: usize,
}

// ── Slot ─────────────────────────────────────────────────────────────

/// A named connection slot. Open while `backend` is `Some`.
struct Slot {
    name: String,
    backend: Option<Box<dyn ConnectionBackend>>,
}

impl Slot {
    fn new(name: String) -> Self {
        Self {
            name,
            backend: None,
        }
    }

    fn is_open(&self) -> bool {
        self.backend.as_ref().is_some_and(|b| b.is_open())
    }

    fn close(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.close();
        }
    }
}

// ── TypePool ─────────────────────────────────────────────────────────

struct TypePool {
    ty: ResourceType,
    warm: NamedStack<Slot>,
    cold: NamedStack<Slot>,
    permits: Arc<Semaphore>,
    capacity: AtomicUsize,
    in_use: AtomicUsize,
    /// Milliseconds since `epoch` of the most recent release.
    last_released_ms: AtomicU64,
    epoch: Instant,
}

impl TypePool {
    fn new(ty: ResourceType, capacity: usize) -> Self {
        // Pushed in reverse so `kvsNN_0` is handed out first.
        let cold = (0..capacity)
            .rev()
            .map(|i| Slot::new(format!("kvs{:02}_{}", ty.index(), i)))
            .collect();
        Self {
            ty,
            warm: NamedStack::with_capacity(capacity),
            cold,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity: AtomicUsize::new(capacity),
            in_use: AtomicUsize::new(0),
            last_released_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_released_ms.load(Ordering::Acquire);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    fn put_back(&self, mut slot: Slot) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        if self.permits.is_closed() {
            // Pool already shut down; don't leave an open connection behind.
            slot.close();
            tracing::debug!(name = %slot.name, ty = %self.ty, "closed connection released after shutdown");
            return;
        }
        self.warm.push(slot);
        self.last_released_ms.store(self.now_ms(), Ordering::Release);
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.warm.len(),
            closed: self.cold.len(),
            in_use: self.in_use.load(Ordering::Acquire),
            capacity: self.capacity.load(Ordering::Acquire),
        }
    }
}

// ── PooledConnection ─────────────────────────────────────────────────

/// An open connection held by exactly one caller.
///
/// Returned to the warm stack when passed to [`ConnectionPool::release`] or
/// dropped; its semaphore permit is returned right after.
pub struct PooledConnection {
    pool: Arc<TypePool>,
    slot: Option<Slot>,
    // Dropped after `Drop::drop` has pushed the slot back.
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Slot name, unique within the type (`kvs01_0`, ...).
    pub fn name(&self) -> &str {
        self.slot.as_ref().map_or("", |s| s.name.as_str())
    }

    pub fn resource_type(&self) -> ResourceType {
        self.pool.ty
    }

    pub fn is_open(&self) -> bool {
        self.slot.as_ref().is_some_and(Slot::is_open)
    }

    /// The underlying transport.
    pub fn backend_mut(&mut self) -> Result<&mut dyn ConnectionBackend, String> {
        match self.slot.as_mut().and_then(|s| s.backend.as_mut()) {
            Some(backend) => Ok(&mut **backend),
            None => Err("connection backend unavailable".to_string()),
        }
    }

    /// Send bytes over the connection.
    pub fn send(&mut self, data: &[u8]) -> Result<usize, String> {
        self.backend_mut()?.send(data)
    }

    /// Receive up to `max_bytes` from the connection.
    pub fn recv(&mut self, max_bytes: usize) -> Result<Vec<u8>, String> {
        self.backend_mut()?.recv(max_bytes)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.put_back(slot);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("name", &self.name())
            .field("ty", &self.pool.ty)
            .finish_non_exhaustive()
    }
}

// ── Opener ───────────────────────────────────────────────────────────

/// Everything needed to open a cold slot, detached from the pool borrow.
struct Opener {
    resolver: Arc<dyn SettingsResolver>,
    factory: Arc<dyn ConnectionFactory>,
    environment: String,
    policy: OpenFailurePolicy,
}

impl Opener {
    async fn open(
        self,
        pool: &Arc<TypePool>,
        mut slot: Slot,
        permit: OwnedSemaphorePermit,
    ) -> PoolResult<PooledConnection> {
        let ty = pool.ty;
        let opened = match self.resolver.resolve(ty, &self.environment) {
            Ok(settings) => {
                let factory = self.factory;
                tokio::task::spawn_blocking(move || factory.connect(ty, &settings))
                    .await
                    .unwrap_or_else(|e| Err(format!("connect task failed: {e}")))
            }
            Err(e) => Err(e.to_string()),
        };

        match opened {
            Ok(backend) => {
                slot.backend = Some(backend);
                tracing::info!(name = %slot.name, %ty, "opened KVS connection");
                Ok(ConnectionPool::hand_out(pool, slot, permit))
            }
            Err(reason) => {
                tracing::error!(name = %slot.name, %ty, %reason, "failed to open KVS connection");
                let name = slot.name.clone();
                match self.policy {
                    OpenFailurePolicy::Restore => {
                        pool.cold.push(slot);
                        drop(permit);
                    }
                    OpenFailurePolicy::Discard => {
                        let remaining = pool.capacity.fetch_sub(1, Ordering::AcqRel) - 1;
                        permit.forget();
                        tracing::warn!(%name, %ty, remaining, "discarded connection slot");
                    }
                }
                Err(PoolError::OpenFailed { name, reason })
            }
        }
    }
}

// ── ConnectionPool ───────────────────────────────────────────────────

/// Bounded pool of backend connections for every [`ResourceType`].
///
/// Per type, at most `capacity` connections exist and at most `capacity`
/// callers hold one. A caller that finds every slot in use waits (FIFO)
/// until another caller releases; there is no timeout.
pub struct ConnectionPool {
    config: PoolConfig,
    resolver: Arc<dyn SettingsResolver>,
    factory: Arc<dyn ConnectionFactory>,
    pools: [Option<Arc<TypePool>>; ResourceType::COUNT],
}

impl ConnectionPool {
    /// Build sub-pools for every type the resolver reports available.
    ///
    /// All slots start cold; nothing is opened until the first `acquire`.
    pub fn new(
        config: PoolConfig,
        resolver: Arc<dyn SettingsResolver>,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        let pools = std::array::from_fn(|i| {
            let ty = ResourceType::ALL[i];
            if !resolver.is_available(ty, &config.environment) {
                return None;
            }
            tracing::debug!(%ty, capacity = config.capacity, "created connection slots");
            Some(Arc::new(TypePool::new(ty, config.capacity)))
        });

        Self {
            config,
            resolver,
            factory,
            pools,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.config.environment
    }

    pub fn is_available(&self, ty: ResourceType) -> bool {
        self.pools[ty.index()].is_some()
    }

    /// Types with a sub-pool, in index order.
    pub fn available_types(&self) -> Vec<ResourceType> {
        self.pools.iter().flatten().map(|p| p.ty).collect()
    }

    fn pool(&self, ty: ResourceType) -> Option<&Arc<TypePool>> {
        self.pools[ty.index()].as_ref()
    }

    /// Borrow a connection of type `ty`.
    ///
    /// Prefers the most recently released open connection. Broken warm
    /// connections are closed and their slot reopened from cold.
    pub async fn acquire(&self, ty: ResourceType) -> PoolResult<PooledConnection> {
        let Some(pool) = self.pool(ty) else {
            tracing::error!(%ty, environment = %self.config.environment, "KVS not available, check the settings file");
            return Err(PoolError::TypeUnavailable(ty));
        };

        let permit = Arc::clone(&pool.permits)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed(ty))?;

        loop {
            if let Some(mut slot) = pool.warm.pop() {
                if slot.is_open() {
                    tracing::trace!(name = %slot.name, %ty, "reused warm connection");
                    return Ok(Self::hand_out(pool, slot, permit));
                }
                tracing::debug!(name = %slot.name, %ty, "warm connection broken, moving slot to cold");
                slot.close();
                pool.cold.push(slot);
                continue;
            }

            if let Some(slot) = pool.cold.pop() {
                return self.open(pool, slot, permit).await;
            }

            if pool.permits.is_closed() {
                return Err(PoolError::Closed(ty));
            }
            // A slot is between stacks (reclaim or reopen in flight).
            tokio::task::yield_now().await;
        }
    }

    /// Return a connection to its warm stack.
    pub fn release(&self, conn: PooledConnection) {
        tracing::trace!(name = %conn.name(), ty = %conn.resource_type(), "released connection");
        drop(conn);
    }

    /// Open `slot` on its own task so a cancelled `acquire` cannot lose it.
    ///
    /// An abandoned open still completes; its connection then goes back to
    /// the warm stack like any released one.
    async fn open(
        &self,
        pool: &Arc<TypePool>,
        slot: Slot,
        permit: OwnedSemaphorePermit,
    ) -> PoolResult<PooledConnection> {
        let name = slot.name.clone();
        let opener = Opener {
            resolver: Arc::clone(&self.resolver),
            factory: Arc::clone(&self.factory),
            environment: self.config.environment.clone(),
            policy: self.config.open_failure,
        };
        let pool = Arc::clone(pool);
        let task = tokio::spawn(async move { opener.open(&pool, slot, permit).await });

        match task.await {
            Ok(result) => result,
            Err(e) => Err(PoolError::OpenFailed {
                name,
                reason: format!("open task failed: {e}"),
            }),
        }
    }

    fn hand_out(pool: &Arc<TypePool>, slot: Slot, permit: OwnedSemaphorePermit) -> PooledConnection {
        pool.in_use.fetch_add(1, Ordering::AcqRel);
        PooledConnection {
            pool: Arc::clone(pool),
            slot: Some(slot),
            _permit: permit,
        }
    }

    /// Close warm connections of every type idle beyond the threshold.
    ///
    /// Idleness is tracked per type: a release of any connection of a type
    /// keeps all of that type's warm connections alive. Returns the number
    /// of connections closed.
    pub fn reclaim_idle(&self) -> usize {
        let mut total = 0;
        for pool in self.pools.iter().flatten() {
            let mut reclaimed = 0;
            while pool.idle_for() > self.config.idle_threshold {
                let Some(mut slot) = pool.warm.pop() else {
                    break;
                };
                slot.close();
                tracing::debug!(name = %slot.name, ty = %pool.ty, "closed idle connection");
                pool.cold.push(slot);
                reclaimed += 1;
            }
            if reclaimed > 0 {
                tracing::info!(
                    ty = %pool.ty,
                    reclaimed,
                    remaining_idle = pool.warm.len(),
                    "reclaimed idle connections"
                );
            }
            total += reclaimed;
        }
        total
    }

    /// Counts for `ty`, or `None` when the type is unavailable.
    pub fn stats(&self, ty: ResourceType) -> Option<PoolStats> {
        self.pool(ty).map(|p| p.stats())
    }

    /// Log per-type counts at `tracing::info` level.
    pub fn log_stats(&self) {
        for pool in self.pools.iter().flatten() {
            let stats = pool.stats();
            tracing::info!(
                ty = %pool.ty,
                idle = stats.idle,
                closed = stats.closed,
                in_use = stats.in_use,
                capacity = stats.capacity,
                "pool statistics"
            );
        }
    }

    /// Close every warm connection and empty both stacks of every type.
    ///
    /// Pending and later `acquire` calls fail with [`PoolError::Closed`].
    /// Connections still in use are closed when they come back.
    pub fn shutdown(&self) {
        for pool in self.pools.iter().flatten() {
            pool.permits.close();

            let in_use = pool.in_use.load(Ordering::Acquire);
            if in_use > 0 {
                tracing::warn!(ty = %pool.ty, in_use, "shutting down pool with connections in use");
            }

            let warm = pool.warm.take_all();
            let closed = warm.len();
            for mut slot in warm {
                slot.close();
            }
            pool.cold.take_all();

            if closed > 0 {
                tracing::debug!(ty = %pool.ty, closed, "closed idle connections during shutdown");
            }
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("available", &self.available_types())
            .finish_non_exhaustive()
    }
}
