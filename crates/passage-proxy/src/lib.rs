//! Connection-serving core of a forwarding proxy.
//!
//! `passage-proxy` accepts client TCP connections, negotiates an HTTP
//! `CONNECT` tunnel, opens the outbound connection and then transfers bytes
//! in both directions under per-connection traffic limiting and an
//! idle-connection timeout. A companion DNS resolver agent caches
//! name→address mappings and coalesces concurrent lookups for the same name.
//!
//! # Architecture
//!
//! ```text
//! Client
//!   |
//!   | CONNECT host:port
//!   v
//! ProxyServer (accept loop)
//!   |
//!   +-- resolve host --> DnsResolver (agent task)
//!   |                        |
//!   |                        +-- cache hit? --> reply immediately
//!   |                        +-- miss --> coalesce + one lookup per name
//!   |
//!   +-- connect to target
//!   |
//!   v
//! Connection (one task per client)
//!   |
//!   +-- ConnectHandler: write "200 Connection established"
//!   |        |
//!   |        v  (replace: sockets + limiter move to the successor)
//!   +-- DataTransferHandler: full-duplex pump until EOF, error,
//!            idle timeout or traffic-limit throttling
//! ```
//!
//! # Components
//!
//! - [`ProxyServer`]: acceptor; owns the listener and per-connection tasks
//! - [`Connection`] / [`ConnectionHandler`]: handler lifecycle for one client
//! - [`ConnectHandler`]: writes the tunnel-established response, hands off
//! - [`DataTransferHandler`]: byte pump with traffic accounting
//! - [`TrafficLimiter`]: per-connection reserve/release byte budgets
//! - [`DnsResolver`] / [`ResolverHandle`]: coalescing resolver agent
//!
//! # Concurrency model
//!
//! Each connection is served by exactly one task; its two transfer
//! directions interleave only at await points inside that task, so no state
//! shared within a connection needs more than an atomic or a briefly held
//! mutex. The resolver is a single task multiplexing its mailbox, lookup
//! completions, parameter updates and a periodic cache sweep. Components
//! communicate by message passing only.

mod connect;
mod handler;
mod limiter;
mod resolver;
mod server;
mod transfer;

pub use connect::ConnectHandler;
pub use handler::{
    Connection, ConnectionHandler, HandlerContext, RemoveReason, Ticker, TransferConfig,
    Transition,
};
pub use limiter::{RateLimiter, Reservation, TrafficDirection, TrafficLimiter, UnboundedLimiter};
pub use resolver::{
    DnsParamsUpdate, DnsResolver, DnsStats, IpFamily, NameLookup, RequestId, ResolveError,
    ResolveReply, ResolveRequest, ResolverConfig, ResolverHandle, SystemLookup,
};
pub use server::{ProxyHandle, ProxyServer, ProxyServerConfig};
pub use transfer::DataTransferHandler;

use std::net::SocketAddr;

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors that can occur in proxy operations.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Failed to bind the listener.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The outbound connection could not be established.
    #[error("connection to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The target name did not resolve to a usable address.
    #[error("name resolution failed for {name}: {source}")]
    Resolve {
        name: String,
        #[source]
        source: resolver::ResolveError,
    },

    /// The client sent something that is not a CONNECT tunnel request.
    #[error("malformed CONNECT request: {0}")]
    BadRequest(String),

    /// The client used an HTTP method other than CONNECT.
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    /// A configuration value is outside its allowed range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O failure outside an established tunnel.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
