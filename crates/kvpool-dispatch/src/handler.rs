//! The request-processing seam run by each worker.

use std::future::Future;

use tokio::net::TcpStream;

/// Identity of the worker running a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerContext {
    /// Stable worker index in `0..max_workers`.
    pub worker_id: usize,
}

/// Processes one inbound connection to completion.
///
/// The worker is busy until the returned future resolves; an error is
/// logged and the worker goes back to the idle set either way.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(
        &self,
        stream: TcpStream,
        ctx: WorkerContext,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}
