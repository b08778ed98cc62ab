//! Primary side of the coordinator.

use std::collections::HashMap;
use std::sync::Arc;

use portshare_id::{CorrelationId, WorkerId};
use portshare_ipc::{
    Endpoint, HandleTransfer, IpcError, Link, ListenParams, PrimaryMessage, WorkerBody,
    WorkerMessage,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Instrument};

use crate::binder::{Binding, PortBinder, VirtualBinding};
use crate::proxy::{ProxiedConnection, VirtualListener};

/// A connected worker's channel.
pub struct WorkerSession {
    pub worker_id: WorkerId,
    pub endpoint: Endpoint<PrimaryMessage, WorkerMessage>,
}

/// Serves listen requests from every worker through one binder.
#[derive(Clone)]
pub struct PrimaryCoordinator {
    binder: Arc<dyn PortBinder>,
}

impl PrimaryCoordinator {
    pub fn new(binder: Arc<dyn PortBinder>) -> Self {
        Self { binder }
    }

    pub fn binder(&self) -> &Arc<dyn PortBinder> {
        &self.binder
    }

    /// Serve each session handed in until the sender side closes.
    pub async fn run(&self, mut sessions: mpsc::Receiver<WorkerSession>) {
        while let Some(session) = sessions.recv().await {
            let span = tracing::info_span!("worker", worker = %session.worker_id);
            let coordinator = self.clone();
            tokio::spawn(async move { coordinator.serve_worker(session).await }.instrument(span));
        }
    }

    /// Serve one worker until its channel closes.
    ///
    /// Requests are handled in arrival order. Virtual ports the worker
    /// registered are closed when it disconnects.
    pub async fn serve_worker(&self, session: WorkerSession) {
        let (link, mut inbound) = session.endpoint.split();
        let mut virtuals: HashMap<CorrelationId, VirtualListener> = HashMap::new();
        info!(worker = %session.worker_id, "Worker connected");

        while let Some(delivery) = inbound.recv().await {
            if delivery.handle.is_some() {
                warn!("Ignoring descriptor sent by worker");
            }
            let WorkerMessage { id, body } = delivery.message;

            match body {
                WorkerBody::Listen(params) => {
                    self.handle_listen(&link, id, params, &mut virtuals).await;
                }
                WorkerBody::Close(params) => match virtuals.remove(&id) {
                    Some(listener) => {
                        listener.close();
                    }
                    None => debug!(%id, port = params.port, "Close for unknown listener"),
                },
            }
        }

        info!(
            worker = %session.worker_id,
            virtual_ports = virtuals.len(),
            "Worker disconnected"
        );
        // Dropping the listeners unregisters their ports.
    }

    async fn handle_listen(
        &self,
        link: &Arc<dyn Link<PrimaryMessage>>,
        id: CorrelationId,
        params: ListenParams,
        virtuals: &mut HashMap<CorrelationId, VirtualListener>,
    ) {
        let ListenParams { port, host } = params;
        debug!(%id, port, host = %host, "Listen request");

        let sent = match self.binder.listen(port, &host) {
            Ok(Binding::Direct(socket)) => {
                let bound = socket.port();
                let transfer = socket.into_transfer();
                debug_assert!(!transfer.keep_open());
                link.send(
                    PrimaryMessage::bound(id, bound, host.as_str()),
                    transfer.into_descriptor(),
                )
                .await
            }
            Ok(Binding::Virtual(VirtualBinding {
                listener,
                connections,
            })) => {
                let physical = listener.physical_addr();
                let transfer = HandleTransfer::Share { physical };
                let sent = link
                    .send(
                        PrimaryMessage::bound_shared(id, listener.port(), host.as_str(), physical),
                        transfer.into_descriptor(),
                    )
                    .await;
                if sent.is_ok() {
                    spawn_forwarder(Arc::clone(link), id, connections);
                    virtuals.insert(id, listener);
                }
                sent
            }
            Err(e) => {
                warn!(%id, port, host = %host, error = %e, "Listen failed");
                let message = PrimaryMessage::bind_failed(
                    id,
                    port,
                    host.as_str(),
                    e.reason_code(),
                    e.to_string(),
                );
                link.send(message, None).await
            }
        };

        if let Err(e) = sent {
            warn!(%id, error = %e, "Failed to send bind acknowledgement");
        }
    }
}

/// Forward connections routed to a virtual port to the worker owning it.
///
/// Ends when the listener is closed and its queue drained, or when the
/// worker's channel is gone.
fn spawn_forwarder(
    link: Arc<dyn Link<PrimaryMessage>>,
    id: CorrelationId,
    mut connections: mpsc::Receiver<ProxiedConnection>,
) {
    tokio::spawn(
        async move {
            while let Some(connection) = connections.recv().await {
                let (peer, destination) = (connection.peer, connection.destination);
                let handle = match connection.into_handle() {
                    Ok(handle) => handle,
                    Err(e) => {
                        warn!(error = %e, "Failed to detach connection");
                        continue;
                    }
                };

                match link
                    .send(PrimaryMessage::connection(id, peer, destination), Some(handle))
                    .await
                {
                    Ok(()) => debug!(%peer, "Connection forwarded"),
                    Err(IpcError::Closed) => break,
                    Err(e) => warn!(%peer, error = %e, "Failed to forward connection"),
                }
            }
        }
        .instrument(tracing::debug_span!("forwarder", id = %id)),
    );
}
