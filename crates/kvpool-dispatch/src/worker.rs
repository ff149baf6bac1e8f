//! Worker tasks and the idle set they return to.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::FutureExt;
use kvpool_core::NamedStack;
use tokio::net::TcpStream;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, trace, warn};

use crate::handler::{RequestHandler, WorkerContext};

/// Handle to an idle worker; sending a stream on `tx` starts it.
pub(crate) struct Worker {
    id: usize,
    tx: mpsc::Sender<TcpStream>,
}

/// The fixed worker set shared by the accept loop and the workers.
///
/// `idle_permits` carries one permit per worker on the `idle` stack. A
/// worker pushes itself before adding its permit, so a permit holder always
/// finds a worker to pop.
pub(crate) struct WorkerSet<H> {
    max_workers: usize,
    idle: NamedStack<Worker>,
    idle_permits: Semaphore,
    running: AtomicUsize,
    handler: Arc<H>,
}

impl<H: RequestHandler> WorkerSet<H> {
    /// Spawn `max_workers` worker tasks, all idle.
    pub(crate) fn spawn(max_workers: usize, handler: Arc<H>) -> (Arc<Self>, Vec<JoinHandle<()>>) {
        let set = Arc::new(Self {
            max_workers,
            idle: NamedStack::with_capacity(max_workers),
            idle_permits: Semaphore::new(0),
            running: AtomicUsize::new(0),
            handler,
        });

        let mut handles = Vec::with_capacity(max_workers);
        // Reverse order so worker 0 is dispatched first.
        for id in (0..max_workers).rev() {
            let (tx, rx) = mpsc::channel(1);
            handles.push(tokio::spawn(worker_loop(id, rx, tx.clone(), Arc::clone(&set))));
            set.make_idle(Worker { id, tx });
        }
        handles.reverse();

        (set, handles)
    }

    pub(crate) fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub(crate) fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn idle(&self) -> usize {
        self.idle.len()
    }

    fn make_idle(&self, worker: Worker) {
        self.idle.push(worker);
        self.idle_permits.add_permits(1);
    }

    /// Wait for an idle worker. `None` once the set is closed.
    ///
    /// Cancel-safe: the permit is only consumed together with a popped worker.
    pub(crate) async fn next_idle(&self) -> Option<Worker> {
        let permit = self.idle_permits.acquire().await.ok()?;
        loop {
            if let Some(worker) = self.idle.pop() {
                permit.forget();
                return Some(worker);
            }
            tokio::task::yield_now().await;
        }
    }

    /// Start `worker` on `stream`.
    pub(crate) async fn dispatch(&self, worker: Worker, stream: TcpStream) {
        self.running.fetch_add(1, Ordering::AcqRel);
        let id = worker.id;
        if worker.tx.send(stream).await.is_err() {
            // The worker task is gone; its slot is lost with it.
            self.running.fetch_sub(1, Ordering::AcqRel);
            error!(worker = id, "worker task exited, dropping connection");
            return;
        }
        trace!(worker = id, "dispatched connection");
    }

    /// Refuse further `next_idle` calls.
    pub(crate) fn close(&self) {
        self.idle_permits.close();
    }
}

async fn worker_loop<H: RequestHandler>(
    id: usize,
    mut rx: mpsc::Receiver<TcpStream>,
    tx: mpsc::Sender<TcpStream>,
    set: Arc<WorkerSet<H>>,
) {
    trace!(worker = id, "worker started");

    while let Some(stream) = rx.recv().await {
        let ctx = WorkerContext { worker_id: id };
        let outcome = AssertUnwindSafe(set.handler.handle(stream, ctx))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(worker = id, error = %e, "request handler failed"),
            Err(panic) => error!(
                worker = id,
                panic = panic_message(panic.as_ref()),
                "request handler panicked"
            ),
        }
        set.running.fetch_sub(1, Ordering::AcqRel);
        set.make_idle(Worker {
            id,
            tx: tx.clone(),
        });
    }

    trace!(worker = id, "worker stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Noop;

    impl RequestHandler for Noop {
        async fn handle(&self, _stream: TcpStream, _ctx: WorkerContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn all_workers_start_idle() {
        let (set, handles) = WorkerSet::spawn(3, Arc::new(Noop));
        assert_eq!(set.max_workers(), 3);
        assert_eq!(set.idle(), 3);
        assert_eq!(set.running(), 0);
        assert_eq!(set.next_idle().await.map(|w| w.id), Some(0));
        handles.iter().for_each(JoinHandle::abort);
    }

    #[tokio::test]
    async fn cancelled_wait_returns_its_permit() {
        let (set, handles) = WorkerSet::spawn(1, Arc::new(Noop));
        let worker = set.next_idle().await;
        assert!(worker.is_some());

        // A permit with no worker behind it keeps `next_idle` retrying.
        set.idle_permits.add_permits(1);
        let waited = tokio::time::timeout(Duration::from_millis(20), set.next_idle()).await;
        assert!(waited.is_err());
        assert_eq!(set.idle_permits.available_permits(), 1);

        handles.iter().for_each(JoinHandle::abort);
    }

    #[test]
    fn panic_message_reads_common_payloads() {
        let literal: Box<dyn Any + Send> = Box::new("boom");
        let owned: Box<dyn Any + Send> = Box::new(String::from("bang"));
        let other: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(literal.as_ref()), "boom");
        assert_eq!(panic_message(owned.as_ref()), "bang");
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}
