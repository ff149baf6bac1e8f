//! Cache garbage collection and its periodic task.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::error::CacheResult;
use crate::store::{CacheStore, now_ms};

/// Eviction passes attempted per `gc` once the file is over threshold.
const MAX_EVICTION_PASSES: usize = 3;

/// Share of entries evicted per pass, in tenths.
const EVICTION_TENTHS: u64 = 3;

/// Outcome of one [`CacheStore::gc`] run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Expired entries removed.
    pub expired: u64,
    /// Live entries evicted to bring the file under its threshold.
    pub evicted: u64,
    /// File size after collection; `None` for in-memory stores.
    pub size_after: Option<u64>,
}

impl CacheStore {
    /// Drop expired entries and compact. If the file is still larger than
    /// the threshold, evict the oldest 30% of entries and compact, up to
    /// three times, stopping once the file is below 80% of the threshold.
    pub fn gc(&self) -> CacheResult<GcReport> {
        let mut report = GcReport {
            expired: self.remove_older_than(now_ms())?,
            ..GcReport::default()
        };
        self.compact()?;

        let threshold = self.threshold_file_size();
        if threshold > 0 && self.db_size().is_some_and(|size| size > threshold) {
            let low_water = threshold / 10 * 8;
            for _ in 0..MAX_EVICTION_PASSES {
                let count = self.count()?;
                if count == 0 {
                    break;
                }
                let batch = (count * EVICTION_TENTHS / 10).max(1);
                report.evicted += self.remove_older(batch)?;
                self.compact()?;
                if self.db_size().is_some_and(|size| size < low_water) {
                    break;
                }
            }
        }

        report.size_after = self.db_size();
        if report.expired > 0 || report.evicted > 0 {
            info!(
                expired = report.expired,
                evicted = report.evicted,
                size = ?report.size_after,
                "cache garbage collected"
            );
        }
        Ok(report)
    }
}

/// Run [`CacheStore::gc`] every `period` until `shutdown` flips.
pub fn spawn_gc_task(
    store: CacheStore,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        debug!(?period, "cache gc task starting");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let store = store.clone();
                    match tokio::task::spawn_blocking(move || store.gc()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => error!(error = %e, "cache gc failed"),
                        Err(e) => error!(error = %e, "cache gc task panicked"),
                    }
                }
                _ = shutdown.changed() => {
                    debug!("cache gc task shutting down");
                    break;
                }
            }
        }
    })
}
