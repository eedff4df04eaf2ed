//! Full-duplex data transfer between an established pair of sockets.
//!
//! Each direction owns a single buffer of `io_chunk_size` bytes and cycles
//! strictly through reserve → read → forward: a new read is never started
//! while the previous payload is still being written to the opposite socket.
//! That bounds memory at two buffers per connection and makes traffic
//! accounting exact — bytes charged to the limiter equal bytes that crossed
//! the sockets.
//!
//! A supervision timer closes the connection when no read succeeded within
//! the idle timeout and wakes directions that were throttled by the traffic
//! limiter.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::handler::{
    write_whole, ConnectionHandler, HandlerContext, RemoveReason, Ticker, Transition,
};
use crate::limiter::{TrafficDirection, TrafficLimiter};
use crate::{ProxyError, Result};

/// Connection handler for the phase where the tunnel is established and
/// bytes only need to move back and forth.
pub struct DataTransferHandler {
    client: TcpStream,
    target: TcpStream,
    limiter: Arc<dyn TrafficLimiter>,
    io_chunk_size: usize,
}

impl DataTransferHandler {
    /// # Errors
    /// * `ProxyError::InvalidConfig` - `io_chunk_size` is zero.
    pub fn new(
        client: TcpStream,
        target: TcpStream,
        limiter: Arc<dyn TrafficLimiter>,
        io_chunk_size: usize,
    ) -> Result<Self> {
        if io_chunk_size == 0 {
            return Err(ProxyError::InvalidConfig(
                "io_chunk_size must be positive".to_string(),
            ));
        }
        Ok(Self {
            client,
            target,
            limiter,
            io_chunk_size,
        })
    }

    async fn transfer(&mut self, ctx: &HandlerContext, ticker: &mut Ticker) -> RemoveReason {
        let shared = TransferShared::new();
        let limiter = Arc::clone(&self.limiter);
        let chunk = self.io_chunk_size;

        let (client_read, client_write) = self.client.split();
        let (target_read, target_write) = self.target.split();

        // Payload read from the client goes out the target socket and vice
        // versa, so each direction pairs a read half with the opposite
        // write half.
        let mut user_end = DirectionState::new(
            client_read,
            target_write,
            "user-end",
            TrafficDirection::FromUser,
            chunk,
        );
        let mut target_end = DirectionState::new(
            target_read,
            client_write,
            "target-end",
            TrafficDirection::FromTarget,
            chunk,
        );

        tokio::select! {
            reason = pump_direction(&mut user_end, limiter.as_ref(), &shared, &shared.user, ctx) => reason,
            reason = pump_direction(&mut target_end, limiter.as_ref(), &shared, &shared.target, ctx) => reason,
            reason = supervise(&shared, limiter.as_ref(), ticker, ctx) => reason,
        }
    }

    /// Close both sockets, swallowing errors.
    async fn release(&mut self) {
        let _ = self.client.shutdown().await;
        let _ = self.target.shutdown().await;
    }
}

#[async_trait]
impl ConnectionHandler for DataTransferHandler {
    fn name(&self) -> &'static str {
        "data-transfer-handler"
    }

    async fn run(mut self: Box<Self>, ctx: &HandlerContext, ticker: &mut Ticker) -> Transition {
        let reason = self.transfer(ctx, ticker).await;
        self.release().await;
        Transition::Remove(reason)
    }
}

/// Flags one direction shares with the supervision timer.
#[derive(Debug)]
struct DirectionFlags {
    alive: AtomicBool,
    throttled: AtomicBool,
}

impl DirectionFlags {
    fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
            throttled: AtomicBool::new(false),
        }
    }
}

/// State shared between the two direction pumps and the timer.
struct TransferShared {
    /// Time of the last successful read from either side.
    last_read_at: Mutex<Instant>,
    /// Wakes throttled directions on each timer tick.
    tick: Notify,
    user: DirectionFlags,
    target: DirectionFlags,
}

impl TransferShared {
    fn new() -> Self {
        Self {
            last_read_at: Mutex::new(Instant::now()),
            tick: Notify::new(),
            user: DirectionFlags::new(),
            target: DirectionFlags::new(),
        }
    }

    fn last_read_at(&self) -> Instant {
        *self
            .last_read_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn touch(&self) {
        *self
            .last_read_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();
    }
}

/// One half of the proxied connection.
struct DirectionState<'a> {
    /// Socket half this direction reads from.
    read: ReadHalf<'a>,
    /// Opposite socket half the payload is forwarded to.
    write: WriteHalf<'a>,
    /// Diagnostic label.
    name: &'static str,
    /// Accounting tag for the traffic limiter.
    direction: TrafficDirection,
    /// Single reusable payload buffer.
    buf: Vec<u8>,
    /// Valid prefix of `buf` awaiting the forwarding write.
    data_size: usize,
}

impl<'a> DirectionState<'a> {
    fn new(
        read: ReadHalf<'a>,
        write: WriteHalf<'a>,
        name: &'static str,
        direction: TrafficDirection,
        io_chunk_size: usize,
    ) -> Self {
        Self {
            read,
            write,
            name,
            direction,
            buf: vec![0u8; io_chunk_size],
            data_size: 0,
        }
    }
}

/// Move bytes for one direction until it terminates.
///
/// The returned reason removes the whole connection: a read for this
/// direction only starts after everything previously read was written to the
/// opposite socket, so once this side is done there is nothing left to flush.
async fn pump_direction(
    dir: &mut DirectionState<'_>,
    limiter: &dyn TrafficLimiter,
    shared: &TransferShared,
    flags: &DirectionFlags,
    ctx: &HandlerContext,
) -> RemoveReason {
    loop {
        let reservation = limiter.reserve_read_portion(dir.direction, dir.buf.len());
        if reservation.capacity() == 0 {
            reservation.release(limiter, dir.direction, &Ok(0));
            flags.throttled.store(true, Ordering::Relaxed);
            // Park until the next timer tick re-grants quota; the tick
            // refills the limiter before waking us.
            shared.tick.notified().await;
            continue;
        }
        flags.throttled.store(false, Ordering::Relaxed);

        let capacity = reservation.capacity();
        let outcome = dir.read.read(&mut dir.buf[..capacity]).await;
        reservation.release(limiter, dir.direction, &outcome);

        let bytes = match outcome {
            Ok(0) => {
                flags.alive.store(false, Ordering::Relaxed);
                return RemoveReason::NormalCompletion;
            }
            Ok(bytes) => bytes,
            Err(e) => {
                flags.alive.store(false, Ordering::Relaxed);
                return classify_read_error(dir.name, &e, ctx);
            }
        };

        dir.data_size = bytes;
        shared.touch();

        match write_whole(&mut dir.write, &dir.buf[..dir.data_size]).await {
            Ok(written) if written != dir.data_size => {
                // write_whole promises all-or-error; anything else means the
                // accounting below it can no longer be trusted.
                error!(
                    id = ctx.id,
                    direction = dir.name,
                    written,
                    expected = dir.data_size,
                    "unexpected write result"
                );
                flags.alive.store(false, Ordering::Relaxed);
                return RemoveReason::IoError;
            }
            Ok(_) => {
                dir.data_size = 0;
            }
            Err(e) => {
                debug!(
                    id = ctx.id,
                    direction = dir.name,
                    error = %e,
                    "error writing data"
                );
                flags.alive.store(false, Ordering::Relaxed);
                return RemoveReason::IoError;
            }
        }
    }
}

/// Sort a failed read into the removal taxonomy.
///
/// A socket that was already shut down locally reports the failure as an
/// aborted operation rather than a genuine transport error.
fn classify_read_error(direction: &'static str, e: &io::Error, ctx: &HandlerContext) -> RemoveReason {
    match e.kind() {
        io::ErrorKind::ConnectionAborted | io::ErrorKind::NotConnected => {
            RemoveReason::CurrentOperationCanceled
        }
        _ => {
            debug!(id = ctx.id, direction, error = %e, "error reading data");
            RemoveReason::IoError
        }
    }
}

/// Periodic supervision: idle timeout, dead-pair check, throttle wake-up.
async fn supervise(
    shared: &TransferShared,
    limiter: &dyn TrafficLimiter,
    ticker: &mut Ticker,
    ctx: &HandlerContext,
) -> RemoveReason {
    loop {
        let now = ticker.tick().await;

        // Both directions down without the connection going away with them
        // should be impossible; check anyway.
        if !shared.user.alive.load(Ordering::Relaxed)
            && !shared.target.alive.load(Ordering::Relaxed)
        {
            warn!(id = ctx.id, "both connections are closed");
            return RemoveReason::UnexpectedAndUnsupportedCase;
        }

        if now.duration_since(shared.last_read_at()) > ctx.config.idle_connection_timeout {
            warn!(id = ctx.id, "no data read for long time");
            return RemoveReason::NoActivityForTooLong;
        }

        // Refill before waking throttled directions so their retry sees the
        // fresh budget.
        limiter.refill();
        shared.tick.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Connection, TransferConfig};
    use crate::limiter::{RateLimiter, Reservation, UnboundedLimiter};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    // ========================================================================
    // Infrastructure
    // ========================================================================

    /// A connected (client, server) socket pair over loopback.
    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), async {
            listener.accept().await.unwrap().0
        });
        (connected.unwrap(), accepted)
    }

    fn spawn_transfer(
        client: TcpStream,
        target: TcpStream,
        limiter: Arc<dyn TrafficLimiter>,
        config: TransferConfig,
    ) -> JoinHandle<RemoveReason> {
        let handler =
            DataTransferHandler::new(client, target, limiter, config.io_chunk_size).unwrap();
        let ctx = HandlerContext::new(1, Arc::new(config));
        tokio::spawn(Connection::new(ctx, Box::new(handler)).serve())
    }

    fn fast_config() -> TransferConfig {
        TransferConfig {
            io_chunk_size: 4 * 1024,
            idle_connection_timeout: Duration::from_secs(5),
            tick_interval: Duration::from_millis(50),
        }
    }

    /// Limiter whose `from_user` grants follow a script; once the script is
    /// exhausted (and for `from_target` always) it grants the full request.
    struct ScriptedLimiter {
        user_grants: Mutex<VecDeque<usize>>,
        user_attempts: AtomicUsize,
        charged: UnboundedLimiter,
    }

    impl ScriptedLimiter {
        fn new(user_grants: Vec<usize>) -> Self {
            Self {
                user_grants: Mutex::new(user_grants.into()),
                user_attempts: AtomicUsize::new(0),
                charged: UnboundedLimiter::new(),
            }
        }
    }

    impl TrafficLimiter for ScriptedLimiter {
        fn reserve_read_portion(
            &self,
            direction: TrafficDirection,
            desired: usize,
        ) -> Reservation {
            let granted = match direction {
                TrafficDirection::FromUser => {
                    self.user_attempts.fetch_add(1, Ordering::SeqCst);
                    self.user_grants
                        .lock()
                        .unwrap()
                        .pop_front()
                        .unwrap_or(desired)
                }
                TrafficDirection::FromTarget => desired,
            };
            Reservation::new(granted.min(desired))
        }

        fn finalize(&self, direction: TrafficDirection, reserved: usize, consumed: usize) {
            self.charged.finalize(direction, reserved, consumed);
        }

        fn refill(&self) {}

        fn consumed(&self, direction: TrafficDirection) -> u64 {
            self.charged.consumed(direction)
        }
    }

    // ========================================================================
    // Construction
    // ========================================================================

    #[tokio::test]
    async fn test_new_rejects_zero_chunk_size() {
        let (client, _client_peer) = tcp_pair().await;
        let (target, _target_peer) = tcp_pair().await;
        let result =
            DataTransferHandler::new(client, target, Arc::new(UnboundedLimiter::new()), 0);
        assert!(matches!(result, Err(ProxyError::InvalidConfig(_))));
    }

    // ========================================================================
    // Bidirectional transfer
    // ========================================================================

    #[tokio::test]
    async fn test_bidirectional_echo() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (mut user_side, client_end) = tcp_pair().await;
        let (target_end, mut target_side) = tcp_pair().await;
        let limiter = Arc::new(UnboundedLimiter::new());
        let task = spawn_transfer(client_end, target_end, limiter.clone(), fast_config());

        user_side.write_all(b"ABC").await.unwrap();
        let mut from_user = [0u8; 3];
        target_side.read_exact(&mut from_user).await.unwrap();
        assert_eq!(&from_user, b"ABC");

        target_side.write_all(b"HELLO").await.unwrap();
        let mut from_target = [0u8; 5];
        user_side.read_exact(&mut from_target).await.unwrap();
        assert_eq!(&from_target, b"HELLO");

        // Client closes; the transfer ends cleanly.
        drop(user_side);
        assert_eq!(task.await.unwrap(), RemoveReason::NormalCompletion);

        // Byte conservation: limiter charges equal the bytes moved.
        assert_eq!(limiter.consumed(TrafficDirection::FromUser), 3);
        assert_eq!(limiter.consumed(TrafficDirection::FromTarget), 5);
    }

    #[tokio::test]
    async fn test_payload_larger_than_chunk_size() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let config = TransferConfig {
            io_chunk_size: 4,
            ..fast_config()
        };
        let (mut user_side, client_end) = tcp_pair().await;
        let (target_end, mut target_side) = tcp_pair().await;
        let limiter = Arc::new(UnboundedLimiter::new());
        let task = spawn_transfer(client_end, target_end, limiter.clone(), config);

        let payload: Vec<u8> = (0..100u8).collect();
        user_side.write_all(&payload).await.unwrap();

        let mut received = vec![0u8; payload.len()];
        target_side.read_exact(&mut received).await.unwrap();
        assert_eq!(received, payload);

        drop(user_side);
        assert_eq!(task.await.unwrap(), RemoveReason::NormalCompletion);
        assert_eq!(
            limiter.consumed(TrafficDirection::FromUser),
            payload.len() as u64
        );
    }

    #[tokio::test]
    async fn test_client_eof_completes_normally() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (mut user_side, client_end) = tcp_pair().await;
        let (target_end, mut target_side) = tcp_pair().await;
        let task = spawn_transfer(
            client_end,
            target_end,
            Arc::new(UnboundedLimiter::new()),
            fast_config(),
        );

        user_side.shutdown().await.unwrap();
        assert_eq!(task.await.unwrap(), RemoveReason::NormalCompletion);

        // Teardown propagates to the target side as EOF.
        let mut buf = [0u8; 1];
        assert_eq!(target_side.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_target_eof_completes_normally() {
        use tokio::io::AsyncWriteExt;

        let (_user_side, client_end) = tcp_pair().await;
        let (target_end, mut target_side) = tcp_pair().await;
        let task = spawn_transfer(
            client_end,
            target_end,
            Arc::new(UnboundedLimiter::new()),
            fast_config(),
        );

        target_side.shutdown().await.unwrap();
        assert_eq!(task.await.unwrap(), RemoveReason::NormalCompletion);
    }

    #[tokio::test]
    async fn test_connection_reset_is_io_error() {
        let (user_side, client_end) = tcp_pair().await;
        let (target_end, _target_side) = tcp_pair().await;
        let task = spawn_transfer(
            client_end,
            target_end,
            Arc::new(UnboundedLimiter::new()),
            fast_config(),
        );

        // Linger 0 turns the close into a RST instead of a FIN.
        user_side.set_linger(Some(Duration::from_secs(0))).unwrap();
        drop(user_side);

        assert_eq!(task.await.unwrap(), RemoveReason::IoError);
    }

    // ========================================================================
    // Idle timeout
    // ========================================================================

    #[tokio::test]
    async fn test_idle_connection_removed() {
        let config = TransferConfig {
            io_chunk_size: 1024,
            idle_connection_timeout: Duration::from_millis(100),
            tick_interval: Duration::from_millis(30),
        };
        let (_user_side, client_end) = tcp_pair().await;
        let (target_end, _target_side) = tcp_pair().await;
        let task = spawn_transfer(
            client_end,
            target_end,
            Arc::new(UnboundedLimiter::new()),
            config,
        );

        let reason = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("idle connection was not removed")
            .unwrap();
        assert_eq!(reason, RemoveReason::NoActivityForTooLong);
    }

    #[tokio::test]
    async fn test_activity_defers_idle_timeout() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let config = TransferConfig {
            io_chunk_size: 1024,
            idle_connection_timeout: Duration::from_millis(200),
            tick_interval: Duration::from_millis(30),
        };
        let (mut user_side, client_end) = tcp_pair().await;
        let (target_end, mut target_side) = tcp_pair().await;
        let task = spawn_transfer(
            client_end,
            target_end,
            Arc::new(UnboundedLimiter::new()),
            config,
        );

        // Keep the connection busy well past the idle timeout.
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            user_side.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            target_side.read_exact(&mut buf).await.unwrap();
        }
        assert!(!task.is_finished(), "active connection was removed early");

        drop(user_side);
        assert_eq!(task.await.unwrap(), RemoveReason::NormalCompletion);
    }

    // ========================================================================
    // Throttling
    // ========================================================================

    #[tokio::test]
    async fn test_throttled_direction_resumes_on_tick() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let config = TransferConfig {
            io_chunk_size: 1024,
            idle_connection_timeout: Duration::from_secs(5),
            tick_interval: Duration::from_millis(50),
        };
        // First attempt is denied, the retry is granted 16 bytes.
        let limiter = Arc::new(ScriptedLimiter::new(vec![0, 16]));
        let (mut user_side, client_end) = tcp_pair().await;
        let (target_end, mut target_side) = tcp_pair().await;
        let started = std::time::Instant::now();
        let task = spawn_transfer(client_end, target_end, limiter.clone(), config);

        user_side.write_all(&[7u8; 16]).await.unwrap();

        let mut received = [0u8; 16];
        target_side.read_exact(&mut received).await.unwrap();
        assert_eq!(received, [7u8; 16]);

        // The payload could only flow after a tick woke the direction.
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(limiter.consumed(TrafficDirection::FromUser), 16);

        drop(user_side);
        assert_eq!(task.await.unwrap(), RemoveReason::NormalCompletion);
    }

    #[tokio::test]
    async fn test_rate_limited_transfer_moves_all_bytes() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let config = TransferConfig {
            io_chunk_size: 1024,
            idle_connection_timeout: Duration::from_secs(5),
            tick_interval: Duration::from_millis(20),
        };
        // 64 bytes per tick; 256 bytes take several refills.
        let limiter = Arc::new(RateLimiter::new(64));
        let (mut user_side, client_end) = tcp_pair().await;
        let (target_end, mut target_side) = tcp_pair().await;
        let task = spawn_transfer(client_end, target_end, limiter.clone(), config);

        let payload: Vec<u8> = (0..=255u8).collect();
        user_side.write_all(&payload).await.unwrap();

        let mut received = vec![0u8; payload.len()];
        target_side.read_exact(&mut received).await.unwrap();
        assert_eq!(received, payload);
        assert_eq!(
            limiter.consumed(TrafficDirection::FromUser),
            payload.len() as u64
        );

        drop(user_side);
        assert_eq!(task.await.unwrap(), RemoveReason::NormalCompletion);
    }
}
