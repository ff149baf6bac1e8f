//! Error types for the dispatcher.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatcher is already listening")]
    AlreadyStarted,

    #[error("dispatcher has been stopped")]
    Stopped,

    #[error("failed to register listening socket: {0}")]
    Io(#[from] std::io::Error),
}
