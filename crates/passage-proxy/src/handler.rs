//! Connection handler lifecycle.
//!
//! Every accepted connection is served by exactly one task that drives a
//! chain of handlers. A handler owns the connection's sockets and runs until
//! it either removes the connection (with a [`RemoveReason`]) or replaces
//! itself with a successor, moving the sockets and the traffic limiter into
//! it in a single step. Because [`ConnectionHandler::run`] consumes the
//! handler, a predecessor can never observe or race its successor.
//!
//! # Lifecycle
//!
//! ```text
//! Connection::new(ctx, handler)
//!       |
//!       v
//! Connection::serve()
//!       |
//!       v
//! handler.run(ctx, ticker) --+-- Transition::Replace(next) --> next.run(...)
//!       |                    |
//!       |                    +-- Transition::Remove(reason)
//!       v
//! RemoveReason (logged, returned to the acceptor)
//! ```

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::debug;

/// Why a connection was removed from service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveReason {
    /// A peer closed its side cleanly.
    NormalCompletion,
    /// An in-flight operation was cut short by local teardown.
    CurrentOperationCanceled,
    /// A read or write failed, or an I/O invariant was violated.
    IoError,
    /// No successful read within the idle-connection timeout.
    NoActivityForTooLong,
    /// A state the handler believes unreachable.
    UnexpectedAndUnsupportedCase,
    /// Handler code panicked; the supervisor tore the connection down.
    UnhandledException,
}

impl fmt::Display for RemoveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RemoveReason::NormalCompletion => "normal_completion",
            RemoveReason::CurrentOperationCanceled => "current_operation_canceled",
            RemoveReason::IoError => "io_error",
            RemoveReason::NoActivityForTooLong => "no_activity_for_too_long",
            RemoveReason::UnexpectedAndUnsupportedCase => "unexpected_and_unsupported_case",
            RemoveReason::UnhandledException => "unhandled_exception",
        };
        f.write_str(name)
    }
}

/// Configuration slice consumed by connection handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    /// Maximum bytes moved per read step, per direction.
    pub io_chunk_size: usize,

    /// A connection with no successful read for this long is closed.
    pub idle_connection_timeout: Duration,

    /// Cadence of the supervision timer that checks the idle timeout and
    /// retries throttled directions.
    pub tick_interval: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            io_chunk_size: 32 * 1024,
            idle_connection_timeout: Duration::from_secs(300),
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// Read-mostly context shared by every handler of one connection.
///
/// The context outlives all handlers; handlers never hold anything the
/// context points back to.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// Connection id, unique within one server.
    pub id: u64,

    /// Configuration snapshot taken when the connection was accepted.
    pub config: Arc<TransferConfig>,
}

impl HandlerContext {
    pub fn new(id: u64, config: Arc<TransferConfig>) -> Self {
        Self { id, config }
    }
}

/// Periodic supervision timer owned by one connection.
///
/// The timer survives handler replacement, so a successor continues on the
/// same cadence without a fresh initial delay.
pub struct Ticker {
    interval: Interval,
}

impl Ticker {
    /// A ticker whose first tick fires one full `period` from now.
    pub fn new(period: Duration) -> Self {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    /// Wait for the next tick; returns the tick's timestamp.
    pub async fn tick(&mut self) -> Instant {
        self.interval.tick().await
    }
}

/// What a handler decided after running.
pub enum Transition {
    /// Install this successor for the same connection id. The predecessor
    /// has already moved its sockets and limiter into it.
    Replace(Box<dyn ConnectionHandler>),
    /// Tear the connection down with the given reason.
    Remove(RemoveReason),
}

/// One stage in the life of a proxied connection.
#[async_trait]
pub trait ConnectionHandler: Send {
    /// Stable diagnostic label.
    fn name(&self) -> &'static str;

    /// Service the connection until this stage is over.
    ///
    /// Called exactly once, after the handler became current for its
    /// connection id and before any tick is delivered to it. Implementations
    /// consume `ticker` for their timeout and throttling policy, and leave
    /// owned sockets shut down (best-effort, errors swallowed) on every
    /// `Remove` path.
    async fn run(self: Box<Self>, ctx: &HandlerContext, ticker: &mut Ticker) -> Transition;
}

/// Container that owns the current handler for one connection id.
pub struct Connection {
    ctx: HandlerContext,
    handler: Box<dyn ConnectionHandler>,
}

impl Connection {
    pub fn new(ctx: HandlerContext, handler: Box<dyn ConnectionHandler>) -> Self {
        Self { ctx, handler }
    }

    /// Drive handlers until one removes the connection.
    ///
    /// Replacement is atomic: the predecessor is consumed (its resources
    /// moved into the successor) before the successor runs, and the shared
    /// ticker is handed over so no tick reaches a half-installed handler.
    pub async fn serve(self) -> RemoveReason {
        let Connection { ctx, mut handler } = self;
        let mut ticker = Ticker::new(ctx.config.tick_interval);
        loop {
            let name = handler.name();
            debug!(id = ctx.id, handler = name, "handler started");
            match handler.run(&ctx, &mut ticker).await {
                Transition::Replace(next) => {
                    debug!(id = ctx.id, from = name, to = next.name(), "handler replaced");
                    handler = next;
                }
                Transition::Remove(reason) => {
                    debug!(id = ctx.id, handler = name, reason = %reason, "connection removed");
                    return reason;
                }
            }
        }
    }
}

/// Write all of `data`, looping until every byte is accepted or an error
/// occurs. Returns the number of bytes written, which equals `data.len()`
/// on success.
pub(crate) async fn write_whole<W>(writer: &mut W, data: &[u8]) -> io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while written < data.len() {
        match writer.write(&data[written..]).await {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "socket accepted no bytes",
                ))
            }
            Ok(n) => written += n,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}
