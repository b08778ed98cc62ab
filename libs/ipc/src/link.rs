//! Transport-independent channel abstractions.

use std::os::fd::OwnedFd;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::IpcError;

/// A received message and the descriptor that travelled with it.
#[derive(Debug)]
pub struct Delivery<M> {
    pub message: M,
    pub handle: Option<OwnedFd>,
}

impl<M> Delivery<M> {
    /// A delivery with no descriptor.
    pub fn bare(message: M) -> Self {
        Self {
            message,
            handle: None,
        }
    }
}

/// Outbound half of a channel.
///
/// Sending consumes the descriptor: once `send` returns, the sender's copy
/// is closed and the receiver holds the only reference on this side of
/// the boundary.
#[async_trait]
pub trait Link<M>: Send + Sync {
    /// Send one message, optionally with a descriptor attached.
    async fn send(&self, message: M, handle: Option<OwnedFd>) -> Result<(), IpcError>;
}

/// One side of a bidirectional channel: sends `Out`, receives `In`.
pub struct Endpoint<Out, In> {
    /// Shared outbound half.
    pub link: Arc<dyn Link<Out>>,
    /// Inbound deliveries; yields `None` once the peer is gone.
    pub inbound: mpsc::UnboundedReceiver<Delivery<In>>,
}

impl<Out, In> Endpoint<Out, In> {
    /// Split into the outbound and inbound halves.
    pub fn split(self) -> (Arc<dyn Link<Out>>, mpsc::UnboundedReceiver<Delivery<In>>) {
        (self.link, self.inbound)
    }
}
