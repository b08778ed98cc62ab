//! Port binders.
//!
//! A binder turns a `(port, host)` request into something a worker can
//! accept connections on:
//!
//! - [`DirectPortBinder`] binds a real OS socket per request and hands it
//!   over outright
//! - [`ProxyPortMultiplexer`](crate::proxy::ProxyPortMultiplexer) registers
//!   a virtual port on one shared physical socket and keeps that socket open
//!
//! The primary only sees the [`PortBinder`] trait.

mod direct;

use std::io;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use portshare_ipc::HandleTransfer;
use portshare_networking::PortAllocator;
use tokio::sync::mpsc;
use tracing::info;

pub use direct::DirectPortBinder;

use crate::config::BrokerOptions;
use crate::error::BrokerError;
use crate::proxy::{
    MultiplexerConfig, ProxiedConnection, ProxyPortMultiplexer, ProxyProtocolDecoder,
    VirtualListener,
};

/// A listening OS socket owned by this process.
#[derive(Debug)]
pub struct BoundSocket {
    listener: std::net::TcpListener,
    local_addr: SocketAddr,
}

impl BoundSocket {
    /// Wrap a bound, listening socket.
    pub fn new(listener: std::net::TcpListener) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Adopt a listening socket received from another process.
    pub fn from_handle(handle: OwnedFd) -> io::Result<Self> {
        Self::new(std::net::TcpListener::from(handle))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Hand the socket over; nothing is retained on this side.
    pub fn into_transfer(self) -> HandleTransfer {
        HandleTransfer::Move(OwnedFd::from(self.listener))
    }

    pub fn into_std(self) -> std::net::TcpListener {
        self.listener
    }

    /// Register with the tokio runtime.
    pub fn into_tokio(self) -> io::Result<tokio::net::TcpListener> {
        self.listener.set_nonblocking(true)?;
        tokio::net::TcpListener::from_std(self.listener)
    }
}

/// A virtual port registration and the connections routed to it.
#[derive(Debug)]
pub struct VirtualBinding {
    pub listener: VirtualListener,
    pub connections: mpsc::Receiver<ProxiedConnection>,
}

/// Result of a successful listen.
#[derive(Debug)]
pub enum Binding {
    Direct(BoundSocket),
    Virtual(VirtualBinding),
}

impl Binding {
    /// Port actually bound or registered.
    pub fn port(&self) -> u16 {
        match self {
            Binding::Direct(socket) => socket.port(),
            Binding::Virtual(binding) => binding.listener.port(),
        }
    }
}

/// Binds ports on behalf of workers. Runs in the primary only.
pub trait PortBinder: Send + Sync {
    /// Bind `host:port`; port `0` selects an ephemeral port.
    fn listen(&self, port: u16, host: &str) -> Result<Binding, BrokerError>;

    /// Whether the primary keeps its socket open after acknowledging.
    fn keep_open(&self) -> bool;
}

/// Build the binder selected by `options`: multiplexed when a proxy port
/// is configured, direct otherwise.
pub async fn from_options(options: &BrokerOptions) -> Result<Arc<dyn PortBinder>, BrokerError> {
    options.validate()?;
    let allocator = PortAllocator::new(options.max_attempts);

    match MultiplexerConfig::from_options(options) {
        Some(config) => {
            let decoder = Arc::new(ProxyProtocolDecoder::new(
                options.proxy_version,
                options.header_timeout,
            ));
            let multiplexer = ProxyPortMultiplexer::bind(config, decoder).await?;
            info!(
                physical = %multiplexer.local_addr(),
                version = %options.proxy_version,
                "Using multiplexed binder"
            );
            Ok(Arc::new(multiplexer))
        }
        None => {
            info!(
                port_range = ?options.port_range.map(|r| r.to_string()),
                "Using direct binder"
            );
            Ok(Arc::new(DirectPortBinder::new(options.port_range, allocator)))
        }
    }
}
