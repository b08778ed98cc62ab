//! Port multiplexing over one physical socket.
//!
//! This module provides:
//! - PROXY protocol v1/v2 header decoding and encoding
//! - The virtual port table and its listeners
//! - The accept loop that routes each connection by its header's
//!   destination port

pub mod multiplexer;
pub mod proxy_protocol;

pub use multiplexer::{
    MultiplexerConfig, MultiplexerStats, ProxiedConnection, ProxyPortMultiplexer,
    VirtualListener,
};
pub use proxy_protocol::{
    HeaderDecoder, ProxyHeader, ProxyHeaderError, ProxyProtocolDecoder, ProxyVersion,
};
