//! # portshare-broker
//!
//! Port brokering for a group of one primary process and N workers.
//!
//! Workers never bind sockets themselves. They ask the primary, which binds
//! either a real port per request ([`DirectPortBinder`]) or a virtual port
//! multiplexed over one physical socket fronted by a PROXY-protocol load
//! balancer ([`ProxyPortMultiplexer`]), and hands back the result.
//!
//! ## Layout
//!
//! - [`config`]: options and env-driven configuration
//! - [`binder`]: the [`PortBinder`] trait and direct binding
//! - [`proxy`]: PROXY header codec and the multiplexer
//! - [`coordinator`]: primary/worker request coordination

pub mod binder;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod proxy;

pub use binder::{Binding, BoundSocket, DirectPortBinder, PortBinder, VirtualBinding};
pub use config::{BrokerOptions, Config, Role};
pub use coordinator::{
    Coordinator, Listening, PrimaryCoordinator, VirtualHandle, WorkerCoordinator, WorkerSession,
};
pub use error::{BrokerError, ConfigError};
pub use proxy::{
    HeaderDecoder, MultiplexerConfig, MultiplexerStats, ProxiedConnection, ProxyHeader,
    ProxyHeaderError, ProxyPortMultiplexer, ProxyProtocolDecoder, ProxyVersion, VirtualListener,
};
