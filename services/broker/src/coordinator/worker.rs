//! Worker side of the coordinator.
//!
//! Each `listen` gets a fresh correlation id and a pending entry holding
//! its result channel. The message pump resolves entries as `bind`
//! acknowledgements arrive. An entry is removed exactly once, either by
//! its acknowledgement or, when the primary goes away, by the pump's
//! shutdown. Timed-out entries stay behind as tombstones so a late
//! acknowledgement is recognised and discarded.
//!
//! Tombstones are never evicted. Instead, once `max_expired` of them are
//! outstanding the primary is treated as unresponsive and new requests
//! fail fast without being sent, so the table holds at most
//! `max_expired` tombstones plus the requests actually in flight.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use portshare_id::CorrelationId;
use portshare_ipc::{
    BindParams, ConnectionParams, Delivery, IpcError, Link, PrimaryBody, PrimaryMessage,
    WorkerMessage,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::binder::BoundSocket;
use crate::error::BrokerError;
use crate::proxy::multiplexer::DEFAULT_BACKLOG;
use crate::proxy::ProxiedConnection;

type ListenResult = Result<Listening, BrokerError>;

/// Default bound on timed-out requests the primary has yet to answer.
pub const DEFAULT_MAX_EXPIRED: usize = 1024;

enum Pending {
    Waiting(oneshot::Sender<ListenResult>),
    /// The caller gave up; the acknowledgement is still owed.
    Expired,
}

#[derive(Default)]
struct Requests {
    entries: HashMap<CorrelationId, Pending>,
    /// Number of `Pending::Expired` entries.
    expired: usize,
}

struct Inner {
    link: Arc<dyn Link<WorkerMessage>>,
    pending: Mutex<Requests>,
    /// Virtual listeners by the id of the request that created them.
    routes: Mutex<HashMap<CorrelationId, mpsc::Sender<ProxiedConnection>>>,
    request_timeout: Option<Duration>,
    max_expired: usize,
}

impl Inner {
    fn pending(&self) -> MutexGuard<'_, Requests> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn routes(&self) -> MutexGuard<'_, HashMap<CorrelationId, mpsc::Sender<ProxiedConnection>>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new request under an id no live entry uses.
    ///
    /// Refused while `max_expired` timed-out requests are unanswered.
    fn enqueue(&self) -> Result<(CorrelationId, oneshot::Receiver<ListenResult>), BrokerError> {
        let mut pending = self.pending();
        if pending.expired >= self.max_expired {
            return Err(BrokerError::Unresponsive {
                expired: pending.expired,
            });
        }

        let (tx, rx) = oneshot::channel();
        let id = loop {
            let id = CorrelationId::generate();
            if !pending.entries.contains_key(&id) && !self.routes().contains_key(&id) {
                break id;
            }
        };
        pending.entries.insert(id, Pending::Waiting(tx));
        Ok((id, rx))
    }

    /// Turn a still-waiting entry into a tombstone.
    fn expire(&self, id: &CorrelationId) {
        let mut guard = self.pending();
        let pending = &mut *guard;
        if let Some(entry) = pending.entries.get_mut(id) {
            if matches!(entry, Pending::Waiting(_)) {
                *entry = Pending::Expired;
                pending.expired += 1;
            }
        }
    }

    /// Take the entry for `id`, keeping the tombstone count in step.
    fn take(&self, id: &CorrelationId) -> Option<Pending> {
        let mut pending = self.pending();
        let entry = pending.entries.remove(id);
        if matches!(entry, Some(Pending::Expired)) {
            pending.expired -= 1;
        }
        entry
    }

    /// Resolve every waiting request with `Closed`.
    fn fail_all(&self) {
        let drained: Vec<(CorrelationId, Pending)> = {
            let mut pending = self.pending();
            pending.expired = 0;
            pending.entries.drain().collect()
        };
        for (id, entry) in drained {
            if let Pending::Waiting(tx) = entry {
                debug!(%id, "Failing request: primary channel closed");
                let _ = tx.send(Err(BrokerError::Transport(IpcError::Closed)));
            }
        }
        self.routes().clear();
    }
}

/// What a successful `listen` yields.
#[derive(Debug)]
pub enum Listening {
    /// A real listening socket, now owned by this process.
    Direct(BoundSocket),
    /// A virtual port on the primary's physical socket.
    Virtual(VirtualHandle),
}

impl Listening {
    pub fn port(&self) -> u16 {
        match self {
            Listening::Direct(socket) => socket.port(),
            Listening::Virtual(handle) => handle.port(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Listening::Direct(socket) => socket.local_addr(),
            Listening::Virtual(handle) => handle.local_addr(),
        }
    }
}

/// Worker view of a virtual port.
///
/// Connections forwarded by the primary arrive through [`accept`]. Closing
/// (or dropping) the handle tells the primary to unregister the port.
///
/// [`accept`]: VirtualHandle::accept
pub struct VirtualHandle {
    id: CorrelationId,
    port: u16,
    host: String,
    physical: SocketAddr,
    connections: mpsc::Receiver<ProxiedConnection>,
    inner: Arc<Inner>,
    closed: AtomicBool,
}

impl std::fmt::Debug for VirtualHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualHandle")
            .field("id", &self.id)
            .field("port", &self.port)
            .field("host", &self.host)
            .field("physical", &self.physical)
            .finish()
    }
}

impl VirtualHandle {
    /// Id of the listen request that created this port.
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// The virtual port on the physical host.
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(self.physical.ip(), self.port)
    }

    /// Next forwarded connection; `None` once closed and drained.
    pub async fn accept(&mut self) -> Option<ProxiedConnection> {
        self.connections.recv().await
    }

    /// Stop routing and notify the primary. Returns `false` if already
    /// closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.routes().remove(&self.id);

        let link = Arc::clone(&self.inner.link);
        let message = WorkerMessage::close(self.id, self.port);
        let (id, port) = (self.id, self.port);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = link.send(message, None).await {
                        debug!(%id, port, error = %e, "Close notification not delivered");
                    }
                });
            }
            Err(_) => warn!(%id, port, "No runtime; primary not notified of close"),
        }
        true
    }
}

impl Drop for VirtualHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Worker-side coordinator. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct WorkerCoordinator {
    inner: Arc<Inner>,
}

impl WorkerCoordinator {
    /// Create a coordinator sending on `link`. `request_timeout` bounds how
    /// long `listen` waits; `None` waits for as long as the primary lives.
    pub fn new(link: Arc<dyn Link<WorkerMessage>>, request_timeout: Option<Duration>) -> Self {
        Self::with_max_expired(link, request_timeout, DEFAULT_MAX_EXPIRED)
    }

    /// Like [`WorkerCoordinator::new`], refusing new requests with
    /// [`BrokerError::Unresponsive`] while `max_expired` timed-out requests
    /// are still unanswered.
    pub fn with_max_expired(
        link: Arc<dyn Link<WorkerMessage>>,
        request_timeout: Option<Duration>,
        max_expired: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                link,
                pending: Mutex::new(Requests::default()),
                routes: Mutex::new(HashMap::new()),
                request_timeout,
                max_expired,
            }),
        }
    }

    /// Entries awaiting an acknowledgement, tombstones included.
    pub fn pending_count(&self) -> usize {
        self.inner.pending().entries.len()
    }

    /// Timed-out requests whose acknowledgement is still owed.
    pub fn expired_count(&self) -> usize {
        self.inner.pending().expired
    }

    /// Ask the primary to bind `host:port` and wait for the result.
    pub async fn listen(&self, port: u16, host: &str) -> Result<Listening, BrokerError> {
        let (id, rx) = self.inner.enqueue().inspect_err(|e| {
            warn!(port, host, error = %e, "Listen refused: primary not answering");
        })?;
        debug!(%id, port, host, "Sending listen request");

        if let Err(e) = self
            .inner
            .link
            .send(WorkerMessage::listen(id, port, host), None)
            .await
        {
            self.inner.take(&id);
            return Err(e.into());
        }

        let outcome = match self.inner.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.inner.expire(&id);
                    warn!(%id, port, host, "Listen request timed out");
                    return Err(BrokerError::Timeout(limit));
                }
            },
            None => rx.await,
        };

        outcome.unwrap_or(Err(BrokerError::Transport(IpcError::Closed)))
    }

    /// Apply one message from the primary.
    ///
    /// Fails only with [`BrokerError::ProtocolViolation`]: an acknowledgement
    /// whose id was never issued (or was already resolved).
    pub fn handle_message(&self, delivery: Delivery<PrimaryMessage>) -> Result<(), BrokerError> {
        let Delivery { message, handle } = delivery;
        match message.body {
            PrimaryBody::Bind(params) => self.resolve(message.id, params, handle),
            PrimaryBody::Connection(params) => {
                self.route_connection(message.id, params, handle);
                Ok(())
            }
        }
    }

    fn resolve(
        &self,
        id: CorrelationId,
        params: BindParams,
        handle: Option<OwnedFd>,
    ) -> Result<(), BrokerError> {
        let tx = match self.inner.take(&id) {
            Some(Pending::Waiting(tx)) => tx,
            Some(Pending::Expired) => {
                debug!(%id, port = params.port, "Discarding late acknowledgement");
                return Ok(());
            }
            None => return Err(BrokerError::ProtocolViolation(id)),
        };

        let outcome = self.outcome(id, params, handle);
        if let Err(Ok(listening)) = tx.send(outcome) {
            // Caller went away; dropping releases the port.
            debug!(%id, port = listening.port(), "Listener no longer wanted");
        }
        Ok(())
    }

    fn outcome(
        &self,
        id: CorrelationId,
        params: BindParams,
        handle: Option<OwnedFd>,
    ) -> ListenResult {
        let BindParams {
            port,
            host,
            error,
            code,
            shared,
        } = params;

        if let Some(message) = error {
            return Err(BrokerError::Rejected {
                code: code.unwrap_or_else(|| "bind_error".to_string()),
                message,
            });
        }

        if let Some(physical) = shared {
            let (tx, rx) = mpsc::channel(DEFAULT_BACKLOG);
            self.inner.routes().insert(id, tx);
            debug!(%id, port, %physical, "Virtual port acknowledged");
            return Ok(Listening::Virtual(VirtualHandle {
                id,
                port,
                host,
                physical,
                connections: rx,
                inner: Arc::clone(&self.inner),
                closed: AtomicBool::new(false),
            }));
        }

        let Some(handle) = handle else {
            return Err(BrokerError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "bind acknowledgement carried no descriptor",
            )));
        };
        let socket = BoundSocket::from_handle(handle)?;
        debug!(%id, bound = %socket.local_addr(), "Listening socket received");
        Ok(Listening::Direct(socket))
    }

    fn route_connection(
        &self,
        id: CorrelationId,
        params: ConnectionParams,
        handle: Option<OwnedFd>,
    ) {
        let Some(handle) = handle else {
            warn!(%id, "Connection message without descriptor");
            return;
        };
        let Some(route) = self.inner.routes().get(&id).cloned() else {
            // Closed locally while the connection was in flight.
            debug!(%id, peer = %params.peer, "Dropping connection for closed listener");
            return;
        };

        match ProxiedConnection::from_handle(handle, params.peer, params.destination) {
            Ok(connection) => {
                if route.try_send(connection).is_err() {
                    warn!(%id, peer = %params.peer, "Dropping connection: backlog full");
                }
            }
            Err(e) => warn!(%id, error = %e, "Failed to adopt forwarded connection"),
        }
    }

    /// Pump messages until the primary's channel closes.
    ///
    /// Waiting requests are failed with a transport error at that point.
    pub async fn run(
        &self,
        mut inbound: mpsc::UnboundedReceiver<Delivery<PrimaryMessage>>,
    ) -> Result<(), BrokerError> {
        while let Some(delivery) = inbound.recv().await {
            self.handle_message(delivery)?;
        }
        info!("Primary channel closed");
        self.inner.fail_all();
        Ok(())
    }

    /// Run the pump in the background. A protocol violation aborts the
    /// process: the request bookkeeping can no longer be trusted.
    pub fn spawn(
        &self,
        inbound: mpsc::UnboundedReceiver<Delivery<PrimaryMessage>>,
    ) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(
            async move {
                if let Err(e) = coordinator.run(inbound).await {
                    error!(error = %e, "Fatal protocol violation, aborting");
                    std::process::abort();
                }
            }
            .instrument(tracing::info_span!("worker_pump")),
        )
    }
}
