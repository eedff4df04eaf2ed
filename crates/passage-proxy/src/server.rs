//! Acceptor and per-connection wiring.
//!
//! The server accepts clients, reads the CONNECT request line (the full
//! HTTP/1.x surface is out of scope — anything that is not a well-formed
//! CONNECT gets a fixed negative response), opens the outbound connection
//! through the resolver, and hands both sockets to the handler chain.
//!
//! # Connection Flow
//!
//! ```text
//! accept client
//!      |
//!      v
//! read "CONNECT host:port HTTP/1.x" + headers
//!      |                     |
//!      |                     +-- not CONNECT --> 405, close
//!      |                     +-- malformed ----> 400, close
//!      v
//! resolve host (cache / coalesced lookup), connect with timeout
//!      |                     |
//!      |                     +-- unreachable --> 502, close
//!      v
//! Connection::serve: ConnectHandler -> DataTransferHandler
//! ```

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::connect::ConnectHandler;
use crate::handler::{Connection, HandlerContext, RemoveReason, TransferConfig};
use crate::limiter::{RateLimiter, TrafficLimiter, UnboundedLimiter};
use crate::resolver::{IpFamily, ResolveError, ResolverHandle};
use crate::{ProxyError, Result};

const RESPONSE_BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
const RESPONSE_METHOD_NOT_ALLOWED: &[u8] = b"HTTP/1.1 405 Method Not Allowed\r\n\r\n";
const RESPONSE_BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

/// Configuration for the proxy server.
#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    /// Address to bind the proxy to.
    /// Default: `127.0.0.1:3128`
    pub bind_addr: SocketAddr,

    /// Timeout for establishing the outbound connection.
    /// Default: 30 seconds
    pub connect_timeout: Duration,

    /// Maximum concurrent connections; further clients are dropped.
    /// Default: 1000
    pub max_connections: usize,

    /// Per-direction byte budget granted on each timer tick.
    /// `None` disables traffic limiting. Default: `None`
    pub bytes_per_tick: Option<usize>,

    /// Settings consumed by the connection handlers.
    pub transfer: TransferConfig,
}

impl Default for ProxyServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3128".parse().expect("hardcoded loopback address"),
            connect_timeout: Duration::from_secs(30),
            max_connections: 1000,
            bytes_per_tick: None,
            transfer: TransferConfig::default(),
        }
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<tokio::task::JoinHandle<Result<()>>>,
    local_addr: SocketAddr,
}

impl ProxyHandle {
    /// The address the server actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Check if the server is still running.
    pub fn is_running(&self) -> bool {
        self.join_handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Shut down the proxy server gracefully.
    ///
    /// Signals the accept loop to stop. If the signal cannot be delivered
    /// the task is aborted instead.
    ///
    /// # Errors
    /// Currently infallible; always returns `Ok`.
    pub async fn shutdown(mut self) -> Result<()> {
        let signal_sent = self
            .shutdown_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false);

        if let Some(handle) = self.join_handle.take() {
            if signal_sent {
                match tokio::time::timeout(Duration::from_secs(2), handle).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) if e.is_cancelled() => {}
                    Ok(Err(_)) => {} // Task panicked, already logged
                    Err(_) => {
                        // Task didn't respond in time; it will stop on its own.
                    }
                }
            } else {
                handle.abort();
            }
        }

        Ok(())
    }
}

/// HTTP CONNECT proxy server.
///
/// Owns the accept loop; every accepted client runs in its own task under a
/// panic boundary.
pub struct ProxyServer {
    config: ProxyServerConfig,
    transfer: Arc<TransferConfig>,
    resolver: ResolverHandle,
    connection_count: Arc<AtomicUsize>,
    next_id: AtomicU64,
}

impl ProxyServer {
    /// Create a new proxy server.
    ///
    /// # Errors
    /// * `ProxyError::InvalidConfig` - zero `io_chunk_size`, zero
    ///   `tick_interval` or a zero rate.
    pub fn new(config: ProxyServerConfig, resolver: ResolverHandle) -> Result<Self> {
        if config.transfer.io_chunk_size == 0 {
            return Err(ProxyError::InvalidConfig(
                "io_chunk_size must be positive".to_string(),
            ));
        }
        if config.transfer.tick_interval.is_zero() {
            return Err(ProxyError::InvalidConfig(
                "tick_interval must be positive".to_string(),
            ));
        }
        if let Some(0) = config.bytes_per_tick {
            return Err(ProxyError::InvalidConfig(
                "bytes_per_tick must be positive when set".to_string(),
            ));
        }

        let transfer = Arc::new(config.transfer.clone());
        Ok(Self {
            config,
            transfer,
            resolver,
            connection_count: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicU64::new(0),
        })
    }

    /// Current number of in-flight connections.
    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Relaxed)
    }

    /// Bind and run the accept loop until the task is cancelled.
    ///
    /// # Errors
    /// * `ProxyError::Bind` - binding `config.bind_addr` failed.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| ProxyError::Bind {
                addr: self.config.bind_addr,
                source: e,
            })?;
        self.run_on(listener).await
    }

    /// Run the accept loop on a pre-bound listener.
    pub async fn run_on(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr().map_err(ProxyError::Io)?;
        info!(addr = %local_addr, "proxy listening");
        loop {
            let (client, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept error");
                    continue;
                }
            };

            let current = self.connection_count.load(Ordering::Relaxed);
            if current >= self.config.max_connections {
                warn!(peer = %peer, "connection limit reached, rejecting");
                drop(client);
                continue;
            }
            self.connection_count.fetch_add(1, Ordering::Relaxed);

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let resolver = self.resolver.clone();
            let transfer = Arc::clone(&self.transfer);
            let connect_timeout = self.config.connect_timeout;
            let bytes_per_tick = self.config.bytes_per_tick;
            let connection_count = Arc::clone(&self.connection_count);

            tokio::spawn(async move {
                serve_client(
                    client,
                    peer,
                    id,
                    resolver,
                    transfer,
                    connect_timeout,
                    bytes_per_tick,
                )
                .await;
                connection_count.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    /// Bind and start the server in the background, returning a control
    /// handle with the actual listen address.
    ///
    /// # Errors
    /// * `ProxyError::Bind` - binding `config.bind_addr` failed.
    pub async fn start(self) -> Result<ProxyHandle> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| ProxyError::Bind {
                addr: self.config.bind_addr,
                source: e,
            })?;
        let local_addr = listener.local_addr().map_err(|e| ProxyError::Bind {
            addr: self.config.bind_addr,
            source: e,
        })?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join_handle = tokio::spawn(async move {
            tokio::select! {
                result = self.run_on(listener) => result,
                _ = shutdown_rx => Ok(()),
            }
        });

        Ok(ProxyHandle {
            shutdown_tx: Some(shutdown_tx),
            join_handle: Some(join_handle),
            local_addr,
        })
    }
}

/// Negotiate, connect outbound, and drive the handler chain for one client.
#[allow(clippy::too_many_arguments)]
async fn serve_client(
    mut client: TcpStream,
    peer: SocketAddr,
    id: u64,
    resolver: ResolverHandle,
    transfer: Arc<TransferConfig>,
    connect_timeout: Duration,
    bytes_per_tick: Option<usize>,
) {
    debug!(id, peer = %peer, "client connected");

    // The negotiation is bounded by the same idle policy the handlers apply
    // later, so a silent client cannot hold its slot forever.
    let negotiated = tokio::time::timeout(
        transfer.idle_connection_timeout,
        read_connect_request(&mut client),
    )
    .await;

    let (host, port) = match negotiated {
        Ok(Ok(target)) => target,
        Ok(Err(e)) => {
            debug!(id, error = %e, "CONNECT negotiation failed");
            let response = match &e {
                ProxyError::UnsupportedMethod(_) => RESPONSE_METHOD_NOT_ALLOWED,
                _ => RESPONSE_BAD_REQUEST,
            };
            let _ = client.write_all(response).await;
            return;
        }
        Err(_) => {
            debug!(id, "CONNECT negotiation timed out");
            return;
        }
    };
    let target_label = format!("{host}:{port}");

    let target = match open_target(&host, port, &resolver, connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(id, target = %target_label, error = %e, "cannot reach target");
            let _ = client.write_all(RESPONSE_BAD_GATEWAY).await;
            return;
        }
    };

    let limiter: Arc<dyn TrafficLimiter> = match bytes_per_tick {
        Some(quota) => Arc::new(RateLimiter::new(quota)),
        None => Arc::new(UnboundedLimiter::new()),
    };

    let ctx = HandlerContext::new(id, transfer);
    let handler = ConnectHandler::new(client, target, limiter, target_label);
    let connection = Connection::new(ctx, Box::new(handler));

    // The handler chain runs in its own task so a panic inside handler code
    // is contained to this connection.
    match tokio::spawn(connection.serve()).await {
        Ok(reason) => debug!(id, reason = %reason, "connection finished"),
        Err(e) if e.is_panic() => {
            warn!(
                id,
                reason = %RemoveReason::UnhandledException,
                "connection handler panicked"
            );
        }
        Err(_) => {}
    }
}

/// Read the CONNECT request line and skip the headers.
///
/// Header content is not used; everything up to the blank line is consumed
/// so the socket is positioned at the start of tunnel payload.
async fn read_connect_request(client: &mut TcpStream) -> Result<(String, u16)> {
    let mut reader = BufReader::new(client);

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Err(ProxyError::BadRequest(
            "connection closed before request line".to_string(),
        ));
    }

    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| ProxyError::BadRequest("empty request line".to_string()))?;
    let target = parts
        .next()
        .ok_or_else(|| ProxyError::BadRequest("missing request target".to_string()))?;
    if parts.next().is_none() {
        return Err(ProxyError::BadRequest("missing HTTP version".to_string()));
    }
    if method != "CONNECT" {
        return Err(ProxyError::UnsupportedMethod(method.to_string()));
    }
    let target = parse_target(target)?;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Err(ProxyError::BadRequest(
                "connection closed inside headers".to_string(),
            ));
        }
        if line.trim().is_empty() {
            break;
        }
    }

    Ok(target)
}

/// Split `host:port`, unbracketing IPv6 literals (`[2001:db8::1]:443`).
fn parse_target(target: &str) -> Result<(String, u16)> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| ProxyError::BadRequest(format!("target without port: {target}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| ProxyError::BadRequest(format!("invalid port in target: {target}")))?;
    let host = host
        .strip_prefix('[')
        .and_then(|stripped| stripped.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(ProxyError::BadRequest(format!(
            "target without host: {target}"
        )));
    }
    Ok((host.to_string(), port))
}

/// Resolve (when needed) and connect to the target with a timeout.
async fn open_target(
    host: &str,
    port: u16,
    resolver: &ResolverHandle,
    connect_timeout: Duration,
) -> Result<TcpStream> {
    let address = match host.parse::<IpAddr>() {
        Ok(literal) => literal,
        Err(_) => resolve_name(host, resolver).await?,
    };
    let addr = SocketAddr::new(address, port);

    match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ProxyError::Connect { addr, source: e }),
        Err(_) => Err(ProxyError::Connect {
            addr,
            source: io::Error::new(io::ErrorKind::TimedOut, "connection timed out"),
        }),
    }
}

/// V4 first; fall back to V6 when the name has no V4 address.
async fn resolve_name(host: &str, resolver: &ResolverHandle) -> Result<IpAddr> {
    match resolver.resolve(host, IpFamily::V4).await {
        Ok(address) => Ok(address),
        Err(ResolveError::NoAddressForFamily { .. }) => resolver
            .resolve(host, IpFamily::V6)
            .await
            .map_err(|e| ProxyError::Resolve {
                name: host.to_string(),
                source: e,
            }),
        Err(e) => Err(ProxyError::Resolve {
            name: host.to_string(),
            source: e,
        }),
    }
}
