//! Direct binding: one OS socket per request.

use std::io;
use std::net::TcpListener;

use portshare_networking::{PortAllocator, PortRange};
use tracing::{debug, info};

use super::{BoundSocket, Binding, PortBinder};
use crate::error::BrokerError;

/// Binds real sockets, drawing ephemeral ports from an optional range.
#[derive(Debug, Clone, Default)]
pub struct DirectPortBinder {
    range: Option<PortRange>,
    allocator: PortAllocator,
}

impl DirectPortBinder {
    pub fn new(range: Option<PortRange>, allocator: PortAllocator) -> Self {
        Self { range, allocator }
    }

    pub fn range(&self) -> Option<PortRange> {
        self.range
    }

    /// Bind `host:port`.
    ///
    /// - port `0` with a range: try up to `max_attempts` distinct candidates,
    ///   skipping those already in use
    /// - port `0` without a range: let the OS pick
    /// - explicit port: must lie in the range (if any); bound exactly once
    pub fn bind(&self, port: u16, host: &str) -> Result<BoundSocket, BrokerError> {
        if port != 0 {
            if let Some(range) = &self.range {
                range.validate(port)?;
            }
            return bind_once(host, port).map_err(|e| BrokerError::bind(port, host, e));
        }

        let Some(range) = &self.range else {
            return bind_once(host, 0).map_err(|e| BrokerError::bind(0, host, e));
        };

        self.allocator.allocate(range, |candidate| {
            match bind_once(host, candidate) {
                Ok(socket) => Ok(Some(socket)),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    debug!(port = candidate, host, "Candidate in use, retrying");
                    Ok(None)
                }
                Err(e) => Err(BrokerError::bind(candidate, host, e)),
            }
        })
    }
}

impl PortBinder for DirectPortBinder {
    fn listen(&self, port: u16, host: &str) -> Result<Binding, BrokerError> {
        let socket = self.bind(port, host)?;
        info!(
            requested = port,
            bound = %socket.local_addr(),
            "Port bound"
        );
        Ok(Binding::Direct(socket))
    }

    fn keep_open(&self) -> bool {
        false
    }
}

fn bind_once(host: &str, port: u16) -> io::Result<BoundSocket> {
    BoundSocket::new(TcpListener::bind((host, port))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A range whose `width` candidates are all free right now.
    fn free_range(width: u16) -> PortRange {
        'search: for low in (30000..60000u16).step_by(97) {
            let mut held = Vec::new();
            for port in low..low + width {
                match TcpListener::bind(("127.0.0.1", port)) {
                    Ok(listener) => held.push(listener),
                    Err(_) => continue 'search,
                }
            }
            return PortRange::new(low, low + width).unwrap();
        }
        panic!("no free port window");
    }

    #[test]
    fn test_os_chooses_without_range() {
        let binder = DirectPortBinder::default();
        let socket = binder.bind(0, "127.0.0.1").unwrap();
        assert_ne!(socket.port(), 0);
    }

    #[test]
    fn test_ephemeral_from_range() {
        let range = free_range(10);
        let binder = DirectPortBinder::new(Some(range), PortAllocator::default());
        let socket = binder.bind(0, "127.0.0.1").unwrap();
        assert!(socket.port() >= range.low() && socket.port() < range.high());
    }

    #[test]
    fn test_single_port_range_never_escapes() {
        let port = free_range(1).low();
        let range = PortRange::new(port, port).unwrap();
        let binder = DirectPortBinder::new(Some(range), PortAllocator::default());

        let socket = binder.bind(0, "127.0.0.1").unwrap();
        assert_eq!(socket.port(), port);

        // The only candidate is taken: exhaustion, not an OS-chosen port.
        let err = binder.bind(0, "127.0.0.1").unwrap_err();
        assert_eq!(err.reason_code(), "allocation_exhausted");
    }

    #[test]
    fn test_explicit_out_of_range() {
        let binder = DirectPortBinder::new(
            Some(PortRange::new(5000, 5010).unwrap()),
            PortAllocator::default(),
        );
        let err = binder.bind(80, "127.0.0.1").unwrap_err();
        assert!(matches!(err, BrokerError::OutOfRange { port: 80, .. }));
    }

    #[test]
    fn test_explicit_conflict_is_bind_error() {
        let binder = DirectPortBinder::default();
        let first = binder.bind(0, "127.0.0.1").unwrap();

        let err = binder.bind(first.port(), "127.0.0.1").unwrap_err();
        assert!(err.is_address_in_use());
        assert_eq!(err.reason_code(), "bind_error");
    }

    #[test]
    fn test_saturated_range_exhausts() {
        let range = free_range(4);
        let binder = DirectPortBinder::new(Some(range), PortAllocator::default());

        let held: Vec<BoundSocket> = (0..4).map(|_| binder.bind(0, "127.0.0.1").unwrap()).collect();
        let mut ports: Vec<u16> = held.iter().map(BoundSocket::port).collect();
        ports.sort_unstable();
        assert_eq!(ports, (range.low()..range.high()).collect::<Vec<_>>());

        let err = binder.bind(0, "127.0.0.1").unwrap_err();
        assert!(matches!(
            err,
            BrokerError::AllocationExhausted { attempts: 4, .. }
        ));
    }
}
