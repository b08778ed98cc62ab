//! Wire messages exchanged between primary and workers.

use std::net::SocketAddr;
use std::os::fd::OwnedFd;

use portshare_id::CorrelationId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{IpcError, MAX_FRAME_BYTES};

// =============================================================================
// Worker -> Primary
// =============================================================================

/// A message sent by a worker to the primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerMessage {
    /// Correlation id of the request this message belongs to.
    pub id: CorrelationId,

    #[serde(flatten)]
    pub body: WorkerBody,
}

/// Worker message payloads, keyed by their JSON field name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerBody {
    /// Ask the primary to bind a port.
    Listen(ListenParams),
    /// Release a virtual listener registered by an earlier `listen`.
    Close(CloseParams),
}

/// Parameters of a listen request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenParams {
    /// Requested port; `0` asks for an ephemeral one.
    pub port: u16,
    /// Host to bind.
    pub host: String,
}

/// Parameters of a close notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseParams {
    pub port: u16,
}

impl WorkerMessage {
    /// Build a listen request.
    pub fn listen(id: CorrelationId, port: u16, host: impl Into<String>) -> Self {
        Self {
            id,
            body: WorkerBody::Listen(ListenParams {
                port,
                host: host.into(),
            }),
        }
    }

    /// Build a close notification.
    pub fn close(id: CorrelationId, port: u16) -> Self {
        Self {
            id,
            body: WorkerBody::Close(CloseParams { port }),
        }
    }
}

// =============================================================================
// Primary -> Worker
// =============================================================================

/// A message sent by the primary to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryMessage {
    /// Correlation id of the request this message answers.
    pub id: CorrelationId,

    #[serde(flatten)]
    pub body: PrimaryBody,
}

/// Primary message payloads, keyed by their JSON field name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryBody {
    /// Result of a listen request. Exactly one per request id.
    Bind(BindParams),
    /// A connection routed to a virtual listener.
    Connection(ConnectionParams),
}

/// Acknowledgement of a listen request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindParams {
    /// Port actually bound (the chosen one for ephemeral requests).
    pub port: u16,
    pub host: String,

    /// Failure description; no descriptor accompanies an error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Machine-readable failure class (e.g. `bind_error`), set with `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Physical address the virtual port is multiplexed over.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared: Option<SocketAddr>,
}

/// Addresses of a forwarded connection, as decoded from its PROXY header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Original client address.
    pub peer: SocketAddr,
    /// Original destination; its port is the virtual port.
    pub destination: SocketAddr,
}

impl PrimaryMessage {
    /// Build a successful bind acknowledgement.
    pub fn bound(id: CorrelationId, port: u16, host: impl Into<String>) -> Self {
        Self {
            id,
            body: PrimaryBody::Bind(BindParams {
                port,
                host: host.into(),
                error: None,
                code: None,
                shared: None,
            }),
        }
    }

    /// Build a bind acknowledgement for a virtual port on `physical`.
    pub fn bound_shared(
        id: CorrelationId,
        port: u16,
        host: impl Into<String>,
        physical: SocketAddr,
    ) -> Self {
        Self {
            id,
            body: PrimaryBody::Bind(BindParams {
                port,
                host: host.into(),
                error: None,
                code: None,
                shared: Some(physical),
            }),
        }
    }

    /// Build a failed bind acknowledgement.
    pub fn bind_failed(
        id: CorrelationId,
        port: u16,
        host: impl Into<String>,
        code: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            id,
            body: PrimaryBody::Bind(BindParams {
                port,
                host: host.into(),
                error: Some(error.into()),
                code: Some(code.into()),
                shared: None,
            }),
        }
    }

    /// Build a connection notification.
    pub fn connection(id: CorrelationId, peer: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            id,
            body: PrimaryBody::Connection(ConnectionParams { peer, destination }),
        }
    }
}

// =============================================================================
// Handle Transfer
// =============================================================================

/// How a bound socket crosses the process boundary.
#[derive(Debug)]
pub enum HandleTransfer {
    /// Exclusive ownership moves to the worker. The primary's copy is
    /// closed as soon as the message is sent.
    Move(OwnedFd),
    /// The primary keeps the physical socket open and the worker gets a
    /// logical view of it. No descriptor is sent.
    Share { physical: SocketAddr },
}

impl HandleTransfer {
    /// Whether the primary retains its reference after sending.
    pub fn keep_open(&self) -> bool {
        matches!(self, HandleTransfer::Share { .. })
    }

    /// The descriptor to attach to the outgoing message, if any.
    pub fn into_descriptor(self) -> Option<OwnedFd> {
        match self {
            HandleTransfer::Move(fd) => Some(fd),
            HandleTransfer::Share { .. } => None,
        }
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Encode a message as one JSON frame.
pub fn encode<M: Serialize>(message: &M) -> Result<Vec<u8>, IpcError> {
    let bytes = serde_json::to_vec(message)?;
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(IpcError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    Ok(bytes)
}

/// Decode one JSON frame.
pub fn decode<M: DeserializeOwned>(frame: &[u8]) -> Result<M, IpcError> {
    Ok(serde_json::from_slice(frame)?)
}
