//! CONNECT tunnel establishment response.
//!
//! Once the outbound connection is open, the only thing left before raw byte
//! transfer is telling the client the tunnel exists. This handler writes the
//! fixed positive response and then replaces itself with the data-transfer
//! handler, moving both sockets and the traffic limiter across in one step.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::handler::{
    write_whole, ConnectionHandler, HandlerContext, RemoveReason, Ticker, Transition,
};
use crate::limiter::TrafficLimiter;
use crate::transfer::DataTransferHandler;

/// Fixed positive response for an established tunnel. No other headers are
/// emitted.
pub(crate) const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Connection handler that answers a negotiated CONNECT request and hands
/// the connection over to data transfer.
pub struct ConnectHandler {
    client: TcpStream,
    target: TcpStream,
    limiter: Arc<dyn TrafficLimiter>,
    /// `host:port` the tunnel was requested for. Logging only.
    target_label: String,
    created_at: Instant,
}

impl ConnectHandler {
    pub fn new(
        client: TcpStream,
        target: TcpStream,
        limiter: Arc<dyn TrafficLimiter>,
        target_label: String,
    ) -> Self {
        Self {
            client,
            target,
            limiter,
            target_label,
            created_at: Instant::now(),
        }
    }
}

enum WriteOutcome {
    Done(io::Result<usize>),
    TimedOut,
}

#[async_trait]
impl ConnectionHandler for ConnectHandler {
    fn name(&self) -> &'static str {
        "connect-method-handler"
    }

    async fn run(self: Box<Self>, ctx: &HandlerContext, ticker: &mut Ticker) -> Transition {
        let Self {
            mut client,
            mut target,
            limiter,
            target_label,
            created_at,
        } = *self;

        info!(id = ctx.id, target = %target_label, "serving CONNECT request");

        // The response is tiny, but a client that never drains its socket
        // must not pin the connection open forever; the idle timeout bounds
        // the write.
        let outcome = {
            let write = write_whole(&mut client, CONNECT_ESTABLISHED);
            tokio::pin!(write);
            loop {
                tokio::select! {
                    result = &mut write => break WriteOutcome::Done(result),
                    now = ticker.tick() => {
                        if now.duration_since(created_at) > ctx.config.idle_connection_timeout {
                            break WriteOutcome::TimedOut;
                        }
                    }
                }
            }
        };

        match outcome {
            WriteOutcome::Done(Ok(_)) => {
                // Tunnel is up; move everything into the data-transfer stage.
                match DataTransferHandler::new(client, target, limiter, ctx.config.io_chunk_size)
                {
                    Ok(next) => Transition::Replace(Box::new(next)),
                    Err(e) => {
                        error!(id = ctx.id, error = %e, "cannot build data-transfer handler");
                        Transition::Remove(RemoveReason::UnexpectedAndUnsupportedCase)
                    }
                }
            }
            WriteOutcome::Done(Err(e)) => {
                debug!(id = ctx.id, error = %e, "error writing CONNECT response");
                let _ = client.shutdown().await;
                let _ = target.shutdown().await;
                Transition::Remove(RemoveReason::IoError)
            }
            WriteOutcome::TimedOut => {
                warn!(
                    id = ctx.id,
                    "timeout writing positive response to CONNECT request"
                );
                let _ = client.shutdown().await;
                let _ = target.shutdown().await;
                Transition::Remove(RemoveReason::NoActivityForTooLong)
            }
        }
    }
}
