//! Idle reclaimer: background task closing warm connections nobody uses.
//!
//! Every `sweep_interval` the task calls [`ConnectionPool::reclaim_idle`],
//! which moves warm connections of types idle beyond the threshold back to
//! the cold stack.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::pool::ConnectionPool;

/// Handle to a running reclaimer task.
pub struct IdleReclaimer {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl IdleReclaimer {
    /// Start sweeping `pool` on its configured interval.
    pub fn spawn(pool: Arc<ConnectionPool>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_reclaim_loop(pool, shutdown_rx));
        Self {
            handle,
            shutdown_tx,
        }
    }

    /// Signal the task to stop and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}

async fn run_reclaim_loop(pool: Arc<ConnectionPool>, mut shutdown: watch::Receiver<bool>) {
    let period = pool.config().sweep_interval;
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; nothing can be idle yet.
    ticker.tick().await;

    debug!(?period, "idle reclaimer starting");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                pool.reclaim_idle();
            }
            _ = shutdown.changed() => {
                debug!("idle reclaimer shutting down");
                break;
            }
        }
    }
}
