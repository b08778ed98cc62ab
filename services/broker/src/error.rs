//! Error taxonomy for the broker.
//!
//! Every failure a caller can observe is a [`BrokerError`] variant with a
//! stable [`reason_code`](BrokerError::reason_code). The same code travels
//! to workers inside failed bind acknowledgements, so a worker can tell a
//! port conflict from an exhausted range without parsing messages.

use std::io;
use std::time::Duration;

use portshare_id::CorrelationId;
use portshare_ipc::IpcError;
use portshare_networking::NetworkError;
use thiserror::Error;

/// Invalid broker configuration. Reported before any socket is bound.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A numeric option had a non-numeric value.
    #[error("{name} must be numeric, got {value:?}")]
    NotNumeric { name: &'static str, value: String },

    /// The port range is malformed or inverted.
    #[error("invalid port range: {0}")]
    PortRange(#[from] NetworkError),

    /// Unknown PROXY protocol version.
    #[error("unknown PROXY protocol version: {0:?} (expected v1 or v2)")]
    ProxyVersion(String),

    /// Unknown process role.
    #[error("unknown role: {0:?} (expected primary or worker)")]
    Role(String),

    /// Options could not be parsed or are inconsistent.
    #[error("invalid options: {0}")]
    Invalid(String),
}

/// Errors surfaced by binders, the multiplexer and the coordinator.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// `listen` was invoked in the primary process.
    #[error("listen must be called from a worker, not the primary")]
    Role,

    /// The OS refused the bind, or a virtual port is already registered.
    #[error("failed to bind {host}:{port}: {source}")]
    Bind {
        port: u16,
        host: String,
        #[source]
        source: io::Error,
    },

    /// Explicit port outside the configured range.
    #[error("port {port} not in range {low}-{high}")]
    OutOfRange { port: u16, low: u16, high: u16 },

    /// No free port was found within the attempt budget.
    #[error("no free port in {range} after {attempts} attempts")]
    AllocationExhausted { range: String, attempts: usize },

    /// A bind acknowledgement arrived for an id with no pending request.
    #[error("bind acknowledgement for unknown request {0}")]
    ProtocolViolation(CorrelationId),

    /// The primary/worker channel failed.
    #[error("transport error: {0}")]
    Transport(#[from] IpcError),

    /// No acknowledgement arrived within the request timeout.
    #[error("no acknowledgement within {0:?}")]
    Timeout(Duration),

    /// Too many timed-out requests are still unanswered; not sent.
    #[error("primary unresponsive: {expired} timed-out requests unanswered")]
    Unresponsive { expired: usize },

    /// The primary reported a failure for this request.
    #[error("rejected by primary ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl BrokerError {
    /// Build a bind error for `host:port`.
    pub fn bind(port: u16, host: &str, source: io::Error) -> Self {
        BrokerError::Bind {
            port,
            host: host.to_string(),
            source,
        }
    }

    /// Stable machine-readable reason code.
    ///
    /// For [`BrokerError::Rejected`] this is the code relayed by the primary.
    pub fn reason_code(&self) -> &str {
        match self {
            BrokerError::Config(_) => "config_error",
            BrokerError::Role => "role_error",
            BrokerError::Bind { .. } => "bind_error",
            BrokerError::OutOfRange { .. } => "out_of_range",
            BrokerError::AllocationExhausted { .. } => "allocation_exhausted",
            BrokerError::ProtocolViolation(_) => "protocol_violation",
            BrokerError::Transport(_) => "transport_error",
            BrokerError::Timeout(_) => "timeout",
            BrokerError::Unresponsive { .. } => "primary_unresponsive",
            BrokerError::Rejected { code, .. } => code,
            BrokerError::Io(_) => "io_error",
        }
    }

    /// Returns true if the port was already taken.
    pub fn is_address_in_use(&self) -> bool {
        match self {
            BrokerError::Bind { source, .. } => source.kind() == io::ErrorKind::AddrInUse,
            BrokerError::Rejected { code, .. } => code == "bind_error",
            _ => false,
        }
    }
}

impl From<NetworkError> for BrokerError {
    fn from(err: NetworkError) -> Self {
        match err {
            NetworkError::OutOfRange { port, low, high } => {
                BrokerError::OutOfRange { port, low, high }
            }
            NetworkError::PoolExhausted { range, attempts } => {
                BrokerError::AllocationExhausted { range, attempts }
            }
            other => BrokerError::Config(ConfigError::PortRange(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_error_mapping() {
        let err: BrokerError = NetworkError::PoolExhausted {
            range: "5000-5010".to_string(),
            attempts: 10,
        }
        .into();
        assert_eq!(err.reason_code(), "allocation_exhausted");

        let err: BrokerError = NetworkError::OutOfRange {
            port: 80,
            low: 5000,
            high: 5010,
        }
        .into();
        assert!(matches!(err, BrokerError::OutOfRange { port: 80, .. }));

        let err: BrokerError = NetworkError::InvalidRange { low: 2, high: 1 }.into();
        assert_eq!(err.reason_code(), "config_error");
    }

    #[test]
    fn test_rejected_relays_code() {
        let err = BrokerError::Rejected {
            code: "bind_error".to_string(),
            message: "address in use".to_string(),
        };
        assert_eq!(err.reason_code(), "bind_error");
        assert!(err.is_address_in_use());
    }

    #[test]
    fn test_bind_in_use() {
        let err = BrokerError::bind(
            5000,
            "0.0.0.0",
            io::Error::from(io::ErrorKind::AddrInUse),
        );
        assert!(err.is_address_in_use());
        assert!(err.to_string().contains("0.0.0.0:5000"));
    }
}
