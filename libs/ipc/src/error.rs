//! Error types for the message channel.

use thiserror::Error;

/// Errors that can occur when exchanging messages.
#[derive(Debug, Error)]
pub enum IpcError {
    /// The peer end of the channel is gone.
    #[error("channel closed")]
    Closed,

    /// The message could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An encoded message exceeds the frame limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// A frame arrived with more descriptors than the protocol allows.
    #[error("unexpected descriptors in frame: {0}")]
    UnexpectedDescriptors(usize),

    /// Underlying socket error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl IpcError {
    /// Returns true if the peer has gone away.
    pub fn is_closed(&self) -> bool {
        matches!(self, IpcError::Closed)
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        IpcError::Serialization(err.to_string())
    }
}

impl From<nix::Error> for IpcError {
    fn from(err: nix::Error) -> Self {
        IpcError::Io(std::io::Error::from(err))
    }
}
