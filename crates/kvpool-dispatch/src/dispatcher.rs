//! Worker dispatcher: the accept loop and its fixed worker set.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::DispatchError;
use crate::handler::RequestHandler;
use crate::reload::{ArtifactProbe, RELOAD_POLL_INTERVAL, ReloadWatcher, RestartRequester};
use crate::worker::WorkerSet;

/// Longest `stop` waits for running workers before tearing them down.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct AcceptTask {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

struct ReloadHooks {
    probe: Arc<dyn ArtifactProbe>,
    restarter: Arc<dyn RestartRequester>,
    period: Duration,
}

/// Binds inbound connections to a fixed set of reusable workers.
///
/// All `max_workers` workers are spawned by [`new`](Self::new), which must
/// run inside a tokio runtime. At most `max_workers` connections are being
/// processed at any time; while every worker is busy the accept loop waits
/// instead of queueing or rejecting.
pub struct WorkerDispatcher<H: RequestHandler> {
    workers: Arc<WorkerSet<H>>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    accept: Mutex<Option<AcceptTask>>,
    stopped: AtomicBool,
    auto_reload: AtomicBool,
    reload_hooks: Option<ReloadHooks>,
    reload: Mutex<Option<ReloadWatcher>>,
    drain_timeout: Duration,
}

impl<H: RequestHandler> WorkerDispatcher<H> {
    pub fn new(max_workers: usize, handler: H) -> Self {
        let max_workers = max_workers.max(1);
        let (workers, handles) = WorkerSet::spawn(max_workers, Arc::new(handler));
        debug!(max_workers, "worker set created");

        Self {
            workers,
            worker_handles: Mutex::new(handles),
            accept: Mutex::new(None),
            stopped: AtomicBool::new(false),
            auto_reload: AtomicBool::new(false),
            reload_hooks: None,
            reload: Mutex::new(None),
            drain_timeout: DRAIN_TIMEOUT,
        }
    }

    /// Hooks used by the reload watcher once auto-reload is enabled.
    pub fn with_reload(
        mut self,
        probe: Arc<dyn ArtifactProbe>,
        restarter: Arc<dyn RestartRequester>,
    ) -> Self {
        self.reload_hooks = Some(ReloadHooks {
            probe,
            restarter,
            period: RELOAD_POLL_INTERVAL,
        });
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn max_workers(&self) -> usize {
        self.workers.max_workers()
    }

    /// Workers currently processing a connection.
    pub fn running(&self) -> usize {
        self.workers.running()
    }

    /// Workers waiting for a connection.
    pub fn idle(&self) -> usize {
        self.workers.idle()
    }

    pub fn is_listening(&self) -> bool {
        self.accept
            .lock()
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    pub fn is_auto_reload(&self) -> bool {
        self.auto_reload.load(Ordering::Acquire)
    }

    /// Turn auto-reload on or off, starting or stopping the reload watcher.
    ///
    /// While enabled, `stop` does not wait for running workers.
    pub fn set_auto_reload(&self, enabled: bool) {
        self.auto_reload.store(enabled, Ordering::Release);

        let mut reload = self.reload.lock();
        if !enabled {
            if let Some(watcher) = reload.take() {
                watcher.cancel();
                info!("auto-reload disabled");
            }
            return;
        }

        if reload.as_ref().is_some_and(ReloadWatcher::is_running) {
            return;
        }
        match &self.reload_hooks {
            Some(hooks) => {
                *reload = Some(ReloadWatcher::spawn(
                    Arc::clone(&hooks.probe),
                    Arc::clone(&hooks.restarter),
                    hooks.period,
                ));
                info!("auto-reload enabled");
            }
            None => warn!("auto-reload enabled without an artifact to watch"),
        }
    }

    /// Start accepting on a listening socket already bound by the caller.
    pub fn start(&self, listener: std::net::TcpListener) -> Result<(), DispatchError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(DispatchError::Stopped);
        }
        let mut accept = self.accept.lock();
        if accept.is_some() {
            return Err(DispatchError::AlreadyStarted);
        }

        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(accept_loop(Arc::clone(&self.workers), listener, shutdown_rx));
        *accept = Some(AcceptTask {
            handle,
            shutdown_tx,
        });

        info!(%addr, max_workers = self.max_workers(), "dispatcher listening");
        Ok(())
    }

    /// Stop accepting, drain running workers and tear the worker set down.
    ///
    /// Waits up to the drain timeout for running workers unless auto-reload
    /// is enabled. Workers still running afterwards are aborted.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        let accept = self.accept.lock().take();
        if let Some(task) = accept {
            let _ = task.shutdown_tx.send(true);
            let _ = task.handle.await;
            debug!("accept loop stopped");
        }

        let reload = self.reload.lock().take();
        if let Some(watcher) = reload {
            watcher.stop().await;
        }

        if !self.is_auto_reload() {
            self.drain().await;
        }

        self.workers.close();
        let handles = std::mem::take(&mut *self.worker_handles.lock());
        for handle in &handles {
            handle.abort();
        }
        info!(aborted = self.running(), "dispatcher stopped");
    }

    async fn drain(&self) {
        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        info!(drain_timeout = ?self.drain_timeout, running = self.running(), "draining workers");

        loop {
            let running = self.running();
            if running == 0 {
                debug!("all workers drained");
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(running, "drain timeout expired, aborting running workers");
                return;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }
}

impl<H: RequestHandler> Drop for WorkerDispatcher<H> {
    fn drop(&mut self) {
        if let Some(task) = self.accept.get_mut().take() {
            task.handle.abort();
        }
        if let Some(watcher) = self.reload.get_mut().take() {
            watcher.cancel();
        }
        for handle in self.worker_handles.get_mut().drain(..) {
            handle.abort();
        }
    }
}

async fn accept_loop<H: RequestHandler>(
    workers: Arc<WorkerSet<H>>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let stream = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    trace!(%peer, "accepted connection");
                    stream
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
            _ = shutdown.changed() => break,
        };

        // Blocks accepting while every worker is busy.
        let worker = tokio::select! {
            worker = workers.next_idle() => worker,
            _ = shutdown.changed() => break,
        };
        let Some(worker) = worker else {
            break;
        };
        workers.dispatch(worker, stream).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use tokio::io::AsyncWriteExt;

    use crate::handler::WorkerContext;

    /// Writes the worker id and closes.
    struct IdHandler;

    impl RequestHandler for IdHandler {
        async fn handle(
            &self,
            mut stream: tokio::net::TcpStream,
            ctx: WorkerContext,
        ) -> anyhow::Result<()> {
            stream.write_all(ctx.worker_id.to_string().as_bytes()).await?;
            Ok(())
        }
    }

    /// Never finishes a request.
    struct StuckHandler {
        started: Arc<AtomicUsize>,
    }

    impl RequestHandler for StuckHandler {
        async fn handle(
            &self,
            _stream: tokio::net::TcpStream,
            _ctx: WorkerContext,
        ) -> anyhow::Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn loopback() -> std::net::TcpListener {
        std::net::TcpListener::bind("127.0.0.1:0").unwrap()
    }

    #[tokio::test]
    async fn new_creates_idle_workers() {
        let dispatcher = WorkerDispatcher::new(4, IdHandler);
        assert_eq!(dispatcher.max_workers(), 4);
        assert_eq!(dispatcher.idle(), 4);
        assert_eq!(dispatcher.running(), 0);
        assert!(!dispatcher.is_listening());
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let dispatcher = WorkerDispatcher::new(1, IdHandler);
        dispatcher.start(loopback()).unwrap();
        assert!(dispatcher.is_listening());
        assert!(matches!(
            dispatcher.start(loopback()),
            Err(DispatchError::AlreadyStarted)
        ));

        dispatcher.stop().await;
        assert!(!dispatcher.is_listening());
        assert!(matches!(
            dispatcher.start(loopback()),
            Err(DispatchError::Stopped)
        ));
    }

    #[tokio::test]
    async fn serves_connection_on_first_worker() {
        use tokio::io::AsyncReadExt;

        let listener = loopback();
        let addr = listener.local_addr().unwrap();
        let dispatcher = WorkerDispatcher::new(2, IdHandler);
        dispatcher.start(listener).unwrap();

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut reply = String::new();
        client.read_to_string(&mut reply).await.unwrap();
        assert_eq!(reply, "0");

        dispatcher.stop().await;
    }

    async fn wait_for(started: &AtomicUsize, n: usize) {
        while started.load(Ordering::SeqCst) < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_drain_timeout() {
        let started = Arc::new(AtomicUsize::new(0));
        let listener = loopback();
        let addr = listener.local_addr().unwrap();
        let dispatcher = WorkerDispatcher::new(
            2,
            StuckHandler {
                started: started.clone(),
            },
        );
        dispatcher.start(listener).unwrap();

        let _client = tokio::net::TcpStream::connect(addr).await.unwrap();
        wait_for(&started, 1).await;
        assert_eq!(dispatcher.running(), 1);

        let begin = tokio::time::Instant::now();
        dispatcher.stop().await;
        assert!(begin.elapsed() >= DRAIN_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_reload_skips_drain() {
        let started = Arc::new(AtomicUsize::new(0));
        let listener = loopback();
        let addr = listener.local_addr().unwrap();
        let dispatcher = WorkerDispatcher::new(
            2,
            StuckHandler {
                started: started.clone(),
            },
        );
        dispatcher.set_auto_reload(true);
        assert!(dispatcher.is_auto_reload());
        dispatcher.start(listener).unwrap();

        let _client = tokio::net::TcpStream::connect(addr).await.unwrap();
        wait_for(&started, 1).await;

        let begin = tokio::time::Instant::now();
        dispatcher.stop().await;
        assert!(begin.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn auto_reload_toggles_watcher() {
        struct Never;
        impl ArtifactProbe for Never {
            fn is_newer_artifact_available(&self) -> bool {
                false
            }
        }
        struct Panic;
        impl RestartRequester for Panic {
            fn request_restart(&self, code: i32) {
                panic!("unexpected restart with {code}");
            }
        }

        let dispatcher =
            WorkerDispatcher::new(1, IdHandler).with_reload(Arc::new(Never), Arc::new(Panic));
        dispatcher.set_auto_reload(true);
        assert!(dispatcher.reload.lock().is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;
        dispatcher.set_auto_reload(false);
        assert!(dispatcher.reload.lock().is_none());
        dispatcher.stop().await;
    }
}
