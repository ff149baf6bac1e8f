//! kvpool-dispatch: bounded request processing for the kvpool server.
//!
//! [`WorkerDispatcher`] owns a fixed set of workers created up front. The
//! accept loop hands each inbound connection to an idle worker and blocks
//! while none is idle, so at most `max_workers` requests run at once.
//! [`ReloadWatcher`] polls for a rebuilt application artifact and asks the
//! process supervisor for a restart.

pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod reload;
mod worker;

pub use dispatcher::{DRAIN_TIMEOUT, WorkerDispatcher};
pub use error::DispatchError;
pub use handler::{RequestHandler, WorkerContext};
pub use reload::{
    ArtifactMtimeProbe, ArtifactProbe, ProcessExit, RELOAD_POLL_INTERVAL, RESTART_EXIT_CODE,
    ReloadWatcher, RestartRequester,
};
