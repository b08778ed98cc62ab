//! # portshare-ipc
//!
//! Message schema and transports for the primary/worker channel.
//!
//! ## Design Principles
//!
//! - Processes share nothing; every interaction is a message
//! - A message may carry at most one OS descriptor alongside it
//! - Exactly one `bind` reply is sent per `listen` request id
//! - The schema is plain JSON so either side can be inspected with a
//!   packet capture or a log line
//!
//! ## Messages
//!
//! Worker to primary:
//! - `{ "id": "...", "listen": { "port": 0, "host": "0.0.0.0" } }`
//! - `{ "id": "...", "close": { "port": 5003 } }`
//!
//! Primary to worker:
//! - `{ "id": "...", "bind": { "port": 5003, "host": "0.0.0.0" } }` with a
//!   listening descriptor attached, or `"error"` set and no descriptor, or
//!   `"shared"` set when the port is virtual
//! - `{ "id": "...", "connection": { "peer": "...", "destination": "..." } }`
//!   with the accepted connection's descriptor attached
//!
//! ## Transports
//!
//! - [`memory`]: in-process pair, used by tests and single-process setups
//! - [`unix`]: `SOCK_SEQPACKET` socket pair with `SCM_RIGHTS` passing

mod error;
mod link;
mod message;

pub mod memory;
pub mod unix;

pub use error::IpcError;
pub use link::{Delivery, Endpoint, Link};
pub use message::*;

/// Largest encoded message accepted on any transport.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;
