//! Virtual ports multiplexed over one physical listener.
//!
//! The physical socket is bound once and never handed to a worker. Each
//! accepted connection starts with a PROXY header; its destination port
//! selects a [`VirtualListener`] registered in the table, and the connection
//! is delivered on that listener's channel. Connections for ports nobody
//! registered are closed.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use portshare_networking::{PortAllocator, PortRange};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use super::proxy_protocol::HeaderDecoder;
use crate::binder::{Binding, DirectPortBinder, PortBinder, VirtualBinding};
use crate::config::BrokerOptions;
use crate::error::BrokerError;

/// Default bound on connections waiting for their PROXY header.
pub const DEFAULT_MAX_PENDING: usize = 10_000;

/// Default per-virtual-port queue of routed, not yet accepted connections.
pub const DEFAULT_BACKLOG: usize = 1024;

/// Ephemeral virtual ports come from here when no range is configured.
pub const DEFAULT_VIRTUAL_LOW: u16 = 1024;
pub const DEFAULT_VIRTUAL_HIGH: u16 = u16::MAX;

/// Configuration for a multiplexer.
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// Physical port (`0` lets the OS choose).
    pub port: u16,
    /// Physical host.
    pub host: String,
    /// Range virtual ports are validated against and drawn from.
    pub port_range: Option<PortRange>,
    /// Candidates tried per ephemeral registration.
    pub max_attempts: usize,
    /// Maximum connections decoding a header at once.
    pub max_pending: usize,
    /// Queue depth per virtual port.
    pub backlog: usize,
}

impl MultiplexerConfig {
    pub fn new(port: u16, host: impl Into<String>) -> Self {
        Self {
            port,
            host: host.into(),
            port_range: None,
            max_attempts: portshare_networking::DEFAULT_MAX_ATTEMPTS,
            max_pending: DEFAULT_MAX_PENDING,
            backlog: DEFAULT_BACKLOG,
        }
    }

    /// `None` unless a proxy port is configured.
    pub fn from_options(options: &BrokerOptions) -> Option<Self> {
        let port = options.proxy_port?;
        Some(Self {
            port_range: options.port_range,
            max_attempts: options.max_attempts,
            ..Self::new(port, options.proxy_host.clone())
        })
    }
}

/// Statistics for a multiplexer.
#[derive(Debug, Default)]
pub struct MultiplexerStats {
    /// Connections accepted on the physical socket.
    pub connections_accepted: AtomicU64,
    /// Connections delivered to a virtual listener.
    pub connections_dispatched: AtomicU64,
    /// Connections whose destination port had no listener.
    pub connections_unrouted: AtomicU64,
    /// Connections with a missing, invalid or late PROXY header.
    pub connections_malformed: AtomicU64,
    /// Connections dropped because a limit was reached.
    pub connections_rejected: AtomicU64,
}

/// A routed connection, header already consumed.
#[derive(Debug)]
pub struct ProxiedConnection {
    pub stream: TcpStream,
    /// Original client address from the header.
    pub peer: SocketAddr,
    /// Original destination from the header.
    pub destination: SocketAddr,
}

impl ProxiedConnection {
    /// Detach from the runtime for transfer to another process.
    pub fn into_handle(self) -> io::Result<OwnedFd> {
        Ok(OwnedFd::from(self.stream.into_std()?))
    }

    /// Adopt a connection received from another process.
    pub fn from_handle(
        handle: OwnedFd,
        peer: SocketAddr,
        destination: SocketAddr,
    ) -> io::Result<Self> {
        let stream = std::net::TcpStream::from(handle);
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream: TcpStream::from_std(stream)?,
            peer,
            destination,
        })
    }
}

// =============================================================================
// Virtual Table
// =============================================================================

struct VirtualServer {
    /// Distinguishes successive registrations of the same port.
    serial: u64,
    connections: mpsc::Sender<ProxiedConnection>,
}

#[derive(Default)]
struct VirtualTable {
    servers: Mutex<HashMap<u16, VirtualServer>>,
    next_serial: AtomicU64,
}

impl VirtualTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<u16, VirtualServer>> {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route(&self, port: u16) -> Option<mpsc::Sender<ProxiedConnection>> {
        self.lock().get(&port).map(|s| s.connections.clone())
    }

    /// Remove `port` only if it is still the registration `serial`.
    fn remove(&self, port: u16, serial: u64) -> bool {
        let mut servers = self.lock();
        match servers.get(&port) {
            Some(server) if server.serial == serial => {
                servers.remove(&port);
                true
            }
            _ => false,
        }
    }
}

/// Handle to a registered virtual port.
///
/// Closing (or dropping) the handle unregisters the port; connections
/// already queued on its channel are still delivered.
#[derive(Debug)]
pub struct VirtualListener {
    port: u16,
    host: String,
    physical: SocketAddr,
    serial: u64,
    table: Weak<VirtualTable>,
    closed: AtomicBool,
}

impl VirtualListener {
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

    /// Address of the shared physical socket.
    pub fn physical_addr(&self) -> SocketAddr {
        self.physical
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Unregister the port. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(table) = self.table.upgrade() {
            if table.remove(self.port, self.serial) {
                info!(port = self.port, host = %self.host, "Virtual port closed");
            }
        }
        true
    }
}

impl Drop for VirtualListener {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// Multiplexer
// =============================================================================

/// Registers virtual ports and routes connections arriving on the shared
/// physical socket.
pub struct ProxyPortMultiplexer {
    local_addr: SocketAddr,
    port_range: Option<PortRange>,
    ephemeral_range: PortRange,
    allocator: PortAllocator,
    backlog: usize,
    table: Arc<VirtualTable>,
    stats: Arc<MultiplexerStats>,
    accept_task: JoinHandle<()>,
}

impl ProxyPortMultiplexer {
    /// Bind the physical socket and start accepting.
    ///
    /// The physical bind goes through [`DirectPortBinder`]; it is not
    /// subject to the virtual port range.
    pub async fn bind(
        config: MultiplexerConfig,
        decoder: Arc<dyn HeaderDecoder>,
    ) -> Result<Self, BrokerError> {
        let socket = DirectPortBinder::default().bind(config.port, &config.host)?;
        let local_addr = socket.local_addr();
        let listener = socket.into_tokio()?;

        let ephemeral_range = match config.port_range {
            Some(range) => range,
            None => PortRange::new(DEFAULT_VIRTUAL_LOW, DEFAULT_VIRTUAL_HIGH)?,
        };

        let table = Arc::new(VirtualTable::default());
        let stats = Arc::new(MultiplexerStats::default());

        let acceptor = Arc::new(Acceptor {
            listener,
            table: Arc::clone(&table),
            stats: Arc::clone(&stats),
            decoder,
            pending: Arc::new(Semaphore::new(config.max_pending)),
        });
        let accept_task = tokio::spawn(
            acceptor
                .run()
                .instrument(tracing::info_span!("multiplexer", physical = %local_addr)),
        );

        info!(
            physical = %local_addr,
            port_range = ?config.port_range.map(|r| r.to_string()),
            "Multiplexer bound"
        );

        Ok(Self {
            local_addr,
            port_range: config.port_range,
            ephemeral_range,
            allocator: PortAllocator::new(config.max_attempts),
            backlog: config.backlog.max(1),
            table,
            stats,
            accept_task,
        })
    }

    /// Address of the physical socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &MultiplexerStats {
        &self.stats
    }

    /// Whether a virtual port is currently registered.
    pub fn is_registered(&self, port: u16) -> bool {
        self.table.lock().contains_key(&port)
    }

    /// Register a virtual port; `0` draws a free one from the range.
    ///
    /// The check for a free port and the insert happen under one lock, so
    /// concurrent registrations never share a port.
    pub fn register(&self, port: u16, host: &str) -> Result<VirtualBinding, BrokerError> {
        let mut servers = self.table.lock();

        let port = if port == 0 {
            self.allocator.allocate(&self.ephemeral_range, |candidate| {
                Ok::<_, BrokerError>((!servers.contains_key(&candidate)).then_some(candidate))
            })?
        } else {
            if let Some(range) = &self.port_range {
                range.validate(port)?;
            }
            if servers.contains_key(&port) {
                return Err(BrokerError::bind(
                    port,
                    host,
                    io::Error::new(io::ErrorKind::AddrInUse, "virtual port already registered"),
                ));
            }
            port
        };

        let serial = self.table.next_serial.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.backlog);
        servers.insert(
            port,
            VirtualServer {
                serial,
                connections: tx,
            },
        );
        drop(servers);

        info!(port, host, physical = %self.local_addr, "Virtual port registered");

        Ok(VirtualBinding {
            listener: VirtualListener {
                port,
                host: host.to_string(),
                physical: self.local_addr,
                serial,
                table: Arc::downgrade(&self.table),
                closed: AtomicBool::new(false),
            },
            connections: rx,
        })
    }
}

impl PortBinder for ProxyPortMultiplexer {
    fn listen(&self, port: u16, host: &str) -> Result<Binding, BrokerError> {
        self.register(port, host).map(Binding::Virtual)
    }

    fn keep_open(&self) -> bool {
        true
    }
}

impl Drop for ProxyPortMultiplexer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Accept loop state, shared with per-connection tasks.
struct Acceptor {
    listener: TcpListener,
    table: Arc<VirtualTable>,
    stats: Arc<MultiplexerStats>,
    decoder: Arc<dyn HeaderDecoder>,
    pending: Arc<Semaphore>,
}

impl Acceptor {
    async fn run(self: Arc<Self>) {
        info!("Multiplexer started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);

                    let permit = match Arc::clone(&self.pending).try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(
                                peer_addr = %peer_addr,
                                "Connection rejected: too many pending headers"
                            );
                            continue;
                        }
                    };

                    let acceptor = Arc::clone(&self);
                    tokio::spawn(
                        async move {
                            acceptor.dispatch(stream).await;
                            drop(permit);
                        }
                        .instrument(tracing::debug_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Decode the header and hand the connection to its virtual listener.
    /// Every failure path drops (closes) the stream.
    async fn dispatch(&self, mut stream: TcpStream) {
        let header = match self.decoder.decode(&mut stream).await {
            Ok(header) => header,
            Err(e) => {
                self.stats
                    .connections_malformed
                    .fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "Dropping connection without valid PROXY header");
                return;
            }
        };

        let port = header.destination_port();
        let Some(route) = self.table.route(port) else {
            self.stats
                .connections_unrouted
                .fetch_add(1, Ordering::Relaxed);
            debug!(port, src = %header.src_addr, "No virtual listener for port");
            return;
        };

        let connection = ProxiedConnection {
            stream,
            peer: header.src_addr,
            destination: header.dst_addr,
        };
        match route.try_send(connection) {
            Ok(()) => {
                self.stats
                    .connections_dispatched
                    .fetch_add(1, Ordering::Relaxed);
                debug!(port, src = %header.src_addr, "Connection dispatched");
            }
            Err(TrySendError::Full(_)) => {
                self.stats
                    .connections_rejected
                    .fetch_add(1, Ordering::Relaxed);
                warn!(port, "Connection rejected: virtual port backlog full");
            }
            Err(TrySendError::Closed(_)) => {
                self.stats
                    .connections_unrouted
                    .fetch_add(1, Ordering::Relaxed);
                debug!(port, "Virtual listener went away");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{ProxyHeader, ProxyProtocolDecoder, ProxyVersion};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn multiplexer(range: Option<PortRange>) -> ProxyPortMultiplexer {
        let mut config = MultiplexerConfig::new(0, "127.0.0.1");
        config.port_range = range;
        let decoder = Arc::new(ProxyProtocolDecoder::new(
            ProxyVersion::V1,
            Duration::from_millis(500),
        ));
        ProxyPortMultiplexer::bind(config, decoder).await.unwrap()
    }

    async fn wait_for(counter: &AtomicU64, value: u64) {
        for _ in 0..100 {
            if counter.load(Ordering::Relaxed) >= value {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("counter never reached {}", value);
    }

    #[tokio::test]
    async fn test_register_explicit_and_conflict() {
        let mux = multiplexer(Some(PortRange::new(7000, 7010).unwrap())).await;

        let binding = mux.register(7003, "0.0.0.0").unwrap();
        assert_eq!(binding.listener.port(), 7003);
        assert!(mux.is_registered(7003));

        let err = mux.register(7003, "0.0.0.0").unwrap_err();
        assert!(err.is_address_in_use());

        let err = mux.register(8000, "0.0.0.0").unwrap_err();
        assert!(matches!(err, BrokerError::OutOfRange { port: 8000, .. }));
    }

    #[tokio::test]
    async fn test_register_ephemeral_until_exhausted() {
        let mux = multiplexer(Some(PortRange::new(7000, 7004).unwrap())).await;

        let bindings: Vec<VirtualBinding> =
            (0..4).map(|_| mux.register(0, "0.0.0.0").unwrap()).collect();
        let mut ports: Vec<u16> = bindings.iter().map(|b| b.listener.port()).collect();
        ports.sort_unstable();
        assert_eq!(ports, vec![7000, 7001, 7002, 7003]);

        let err = mux.register(0, "0.0.0.0").unwrap_err();
        assert_eq!(err.reason_code(), "allocation_exhausted");
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_frees_port() {
        let mux = multiplexer(None).await;
        let binding = mux.register(7001, "0.0.0.0").unwrap();

        assert!(binding.listener.close());
        assert!(!binding.listener.close());
        assert!(binding.listener.is_closed());
        assert!(!mux.is_registered(7001));

        // A stale handle must not remove a newer registration.
        let again = mux.register(7001, "0.0.0.0").unwrap();
        drop(binding);
        assert!(mux.is_registered(7001));
        drop(again);
        assert!(!mux.is_registered(7001));
    }

    #[tokio::test]
    async fn test_local_addr_uses_physical_host() {
        let mux = multiplexer(None).await;
        let binding = mux.register(7001, "0.0.0.0").unwrap();
        assert_eq!(
            binding.listener.local_addr(),
            SocketAddr::new(mux.local_addr().ip(), 7001)
        );
    }

    #[tokio::test]
    async fn test_routes_by_destination_port() {
        let mux = multiplexer(None).await;
        let mut a = mux.register(7001, "0.0.0.0").unwrap();
        let mut b = mux.register(7002, "0.0.0.0").unwrap();

        let header = ProxyHeader::new(
            "203.0.113.7:40000".parse().unwrap(),
            "198.51.100.1:7002".parse().unwrap(),
        );
        let mut client = TcpStream::connect(mux.local_addr()).await.unwrap();
        client.write_all(&header.encode_v1()).await.unwrap();
        client.write_all(b"ping").await.unwrap();

        let mut conn = b.connections.recv().await.unwrap();
        assert_eq!(conn.peer, header.src_addr);
        assert_eq!(conn.destination, header.dst_addr);

        let mut buf = [0u8; 4];
        conn.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert!(a.connections.try_recv().is_err());
        assert_eq!(mux.stats().connections_dispatched.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_unrouted_connection_is_closed() {
        let mux = multiplexer(None).await;

        let header = ProxyHeader::new(
            "203.0.113.7:40000".parse().unwrap(),
            "198.51.100.1:9999".parse().unwrap(),
        );
        let mut client = TcpStream::connect(mux.local_addr()).await.unwrap();
        client.write_all(&header.encode_v1()).await.unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap_or(0), 0);
        wait_for(&mux.stats().connections_unrouted, 1).await;
    }

    #[tokio::test]
    async fn test_malformed_header_is_closed() {
        let mux = multiplexer(None).await;
        let mut client = TcpStream::connect(mux.local_addr()).await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap_or(0), 0);
        wait_for(&mux.stats().connections_malformed, 1).await;
    }

    #[tokio::test]
    async fn test_silent_client_times_out() {
        let mux = multiplexer(None).await;
        let mut client = TcpStream::connect(mux.local_addr()).await.unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap_or(0), 0);
        wait_for(&mux.stats().connections_malformed, 1).await;
    }
}
