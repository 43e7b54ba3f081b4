use thiserror::Error;

use crate::message::CorrelationId;

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Connection or channel level failure: broken link, closed channel, invalid state.
    /// Recovered by reconnecting; reaches a caller only if a publish still fails after recovery
    #[error("Broker transport error: {0}")]
    Transport(String),
    /// No matching reply arrived before the caller deadline
    #[error("Timed out waiting for a reply to {0}")]
    Timeout(CorrelationId),
    /// Any non-transport fault inside the consumer loop. Never returned to a waiting caller
    #[error("Unexpected broker error: {0}")]
    Unexpected(String),
    /// Client was disposed, or its owning context has ended
    #[error("RPC client is disposed")]
    Disposed,
    /// Correlation id isn't tracked, or someone is already waiting for it
    #[error("Unknown request {0}")]
    UnknownRequest(CorrelationId),
    /// Invalid client configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// If the error is a connection-level failure, which should be handled by reconnecting
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
