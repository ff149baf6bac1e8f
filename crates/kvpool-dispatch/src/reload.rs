//! Reload watcher: restart the server when the application is rebuilt.
//!
//! While auto-reload is enabled the watcher polls an [`ArtifactProbe`]
//! every [`RELOAD_POLL_INTERVAL`]. When a newer artifact shows up it asks
//! the [`RestartRequester`] to exit with [`RESTART_EXIT_CODE`], which the
//! process supervisor treats as "restart me".

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Exit status asking the supervisor to restart the server.
pub const RESTART_EXIT_CODE: i32 = 127;

/// How often the artifact is checked.
pub const RELOAD_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Reports whether a newer application artifact than the running one exists.
pub trait ArtifactProbe: Send + Sync {
    fn is_newer_artifact_available(&self) -> bool;
}

/// Asks the surrounding process to restart.
pub trait RestartRequester: Send + Sync {
    fn request_restart(&self, code: i32);
}

/// Compares an artifact's modification time with the one seen at startup.
#[derive(Debug, Clone)]
pub struct ArtifactMtimeProbe {
    path: PathBuf,
    loaded_at: SystemTime,
}

impl ArtifactMtimeProbe {
    /// Record the artifact's current modification time as the loaded version.
    ///
    /// A missing artifact counts as loaded now.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let loaded_at = modified(&path).unwrap_or_else(SystemTime::now);
        Self { path, loaded_at }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl ArtifactProbe for ArtifactMtimeProbe {
    fn is_newer_artifact_available(&self) -> bool {
        modified(&self.path).is_some_and(|mtime| mtime > self.loaded_at)
    }
}

/// Exits the process with the requested code.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExit;

impl RestartRequester for ProcessExit {
    fn request_restart(&self, code: i32) {
        std::process::exit(code);
    }
}

/// Handle to a running watcher task.
pub struct ReloadWatcher {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl ReloadWatcher {
    pub fn spawn(
        probe: Arc<dyn ArtifactProbe>,
        restarter: Arc<dyn RestartRequester>,
        period: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_watch_loop(probe, restarter, period, shutdown_rx));
        Self {
            handle,
            shutdown_tx,
        }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Signal the task to stop without waiting for it.
    pub fn cancel(self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Signal the task to stop and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}

async fn run_watch_loop(
    probe: Arc<dyn ArtifactProbe>,
    restarter: Arc<dyn RestartRequester>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    debug!(?period, "reload watcher starting");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if probe.is_newer_artifact_available() {
                    info!(code = RESTART_EXIT_CODE, "detected newer application artifact, requesting restart");
                    restarter.request_restart(RESTART_EXIT_CODE);
                    break;
                }
            }
            _ = shutdown.changed() => {
                debug!("reload watcher shutting down");
                break;
            }
        }
    }
}
