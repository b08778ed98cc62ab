//! In-process transport.
//!
//! Messages go through the same JSON encoding as the socket transport, so a
//! schema bug shows up here too. Descriptors are handed over as-is; within a
//! single process that is exactly a move.

use std::marker::PhantomData;
use std::os::fd::OwnedFd;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::message::{decode, encode, PrimaryMessage, WorkerMessage};
use crate::{Delivery, Endpoint, IpcError, Link};

/// Outbound half backed by an unbounded channel.
struct MemoryLink<M> {
    tx: mpsc::UnboundedSender<Delivery<M>>,
    _marker: PhantomData<fn(M)>,
}

#[async_trait]
impl<M> Link<M> for MemoryLink<M>
where
    M: Serialize + DeserializeOwned + Send + 'static,
{
    async fn send(&self, message: M, handle: Option<OwnedFd>) -> Result<(), IpcError> {
        let frame = encode(&message)?;
        let message = decode(&frame)?;
        self.tx
            .send(Delivery { message, handle })
            .map_err(|_| IpcError::Closed)
    }
}

/// Create a connected pair of endpoints: `(primary side, worker side)`.
pub fn pair() -> (
    Endpoint<PrimaryMessage, WorkerMessage>,
    Endpoint<WorkerMessage, PrimaryMessage>,
) {
    let (to_worker_tx, to_worker_rx) = mpsc::unbounded_channel();
    let (to_primary_tx, to_primary_rx) = mpsc::unbounded_channel();

    let primary = Endpoint {
        link: std::sync::Arc::new(MemoryLink {
            tx: to_worker_tx,
            _marker: PhantomData,
        }),
        inbound: to_primary_rx,
    };
    let worker = Endpoint {
        link: std::sync::Arc::new(MemoryLink {
            tx: to_primary_tx,
            _marker: PhantomData,
        }),
        inbound: to_worker_rx,
    };

    (primary, worker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use portshare_id::CorrelationId;
    use std::os::fd::AsRawFd;

    #[tokio::test]
    async fn test_pair_delivers_both_ways() {
        let (primary, worker) = pair();
        let (primary_link, mut primary_rx) = primary.split();
        let (worker_link, mut worker_rx) = worker.split();

        let id = CorrelationId::generate();
        worker_link
            .send(WorkerMessage::listen(id, 0, "127.0.0.1"), None)
            .await
            .unwrap();
        let got = primary_rx.recv().await.unwrap();
        assert_eq!(got.message.id, id);
        assert!(got.handle.is_none());

        primary_link
            .send(PrimaryMessage::bound(id, 5000, "127.0.0.1"), None)
            .await
            .unwrap();
        let got = worker_rx.recv().await.unwrap();
        assert_eq!(got.message, PrimaryMessage::bound(id, 5000, "127.0.0.1"));
    }

    #[tokio::test]
    async fn test_descriptor_travels_with_message() {
        let (primary, mut worker) = pair();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let fd = OwnedFd::from(listener);
        let raw = fd.as_raw_fd();

        primary
            .link
            .send(
                PrimaryMessage::bound(CorrelationId::generate(), addr.port(), "127.0.0.1"),
                Some(fd),
            )
            .await
            .unwrap();

        let got = worker.inbound.recv().await.unwrap();
        let handle = got.handle.unwrap();
        assert_eq!(handle.as_raw_fd(), raw);
        let listener = std::net::TcpListener::from(handle);
        assert_eq!(listener.local_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_send_after_peer_dropped() {
        let (primary, worker) = pair();
        drop(worker);
        let err = primary
            .link
            .send(
                PrimaryMessage::bound(CorrelationId::generate(), 1, "h"),
                None,
            )
            .await
            .unwrap_err();
        assert!(err.is_closed());
    }
}
