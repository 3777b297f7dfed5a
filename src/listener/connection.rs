use std::future::{poll_fn, Future};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::limiter::{LimitError, RateLimiter};
use crate::metrics::metrics;

use super::registry::{ConnectionId, ConnectionRegistry};
use super::transport::Transport;
use super::{Limits, ListenerError};

/// Closes a [`LimitedConnection`] from another task
///
/// Cancels any in-flight token wait and removes the connection from its
/// registry. Deregistration happens at most once no matter how many clones
/// call [`close`](Self::close).
#[derive(Clone)]
pub struct CloseHandle {
    id: ConnectionId,
    token: CancellationToken,
    registry: Arc<ConnectionRegistry>,
}

impl CloseHandle {
    /// Returns `true` if this call performed the close
    pub fn close(&self) -> bool {
        self.token.cancel();
        let removed = self.registry.deregister(self.id);
        if removed {
            metrics().record_connection_closed();
        }
        removed
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

/// Pending acquisition of both limiters for one I/O call
type Grant = Pin<Box<dyn Future<Output = Result<(), LimitError>> + Send>>;

/// The two limiters of a connection and how to wait on them
struct Limiters {
    /// Per-connection limiter (also held by the registry)
    local: Arc<RateLimiter>,
    /// Listener-wide limiter
    global: Arc<RateLimiter>,
    cancel: CancellationToken,
    /// Upper bound on the token wait of a single read/write
    acquire_timeout: Option<Duration>,
}

impl Limiters {
    /// Take `tokens` from the global limiter, then the per-connection one
    ///
    /// The global grant is returned if the per-connection wait fails or the
    /// future is dropped before it completes.
    fn grant(&self, tokens: u64) -> Grant {
        let global = self.global.clone();
        let local = self.local.clone();
        let cancel = self.cancel.clone();
        let deadline = self.acquire_timeout.map(|timeout| Instant::now() + timeout);

        Box::pin(async move {
            let started = Instant::now();
            if let Err(e) = acquire(&global, tokens, &cancel, deadline).await {
                metrics().record_acquire_failure(&e);
                return Err(e);
            }
            let global_wait = started.elapsed();

            let refund = Refund {
                limiter: &global,
                tokens,
                armed: true,
            };
            if let Err(e) = acquire(&local, tokens, &cancel, deadline).await {
                metrics().record_acquire_failure(&e);
                return Err(e);
            }
            refund.disarm();

            metrics().record_throttle_wait("global", global_wait);
            metrics().record_throttle_wait("connection", started.elapsed() - global_wait);
            Ok(())
        })
    }

    /// Return tokens granted by both limiters but not used
    fn refund(&self, tokens: u64) {
        if tokens > 0 {
            self.global.refund(tokens);
            self.local.refund(tokens);
        }
    }

    /// Largest single grant both limiters can satisfy
    fn burst(&self) -> usize {
        let burst = self
            .local
            .config()
            .capacity()
            .min(self.global.config().capacity());
        usize::try_from(burst).unwrap_or(usize::MAX)
    }
}

async fn acquire(
    limiter: &RateLimiter,
    tokens: u64,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
) -> Result<(), LimitError> {
    match deadline {
        Some(deadline) => limiter.acquire_until(tokens, cancel, deadline).await,
        None => limiter.acquire(tokens, cancel).await,
    }
}

/// Gives tokens back to a limiter unless disarmed
struct Refund<'a> {
    limiter: &'a RateLimiter,
    tokens: u64,
    armed: bool,
}

impl Refund<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Refund<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.limiter.refund(self.tokens);
        }
    }
}

/// Token state of one I/O direction
enum Gate {
    Idle,
    Waiting { tokens: u64, grant: Grant },
    /// Tokens held for an I/O call the transport has not completed yet
    Granted { tokens: u64 },
}

impl Gate {
    /// Hold exactly `want` tokens from both limiters
    fn poll_admit(
        &mut self,
        cx: &mut Context<'_>,
        want: u64,
        limiters: &Limiters,
    ) -> Poll<Result<(), LimitError>> {
        loop {
            match self {
                Gate::Idle => {
                    *self = Gate::Waiting {
                        tokens: want,
                        grant: limiters.grant(want),
                    };
                }
                Gate::Waiting { tokens, grant } => {
                    let tokens = *tokens;
                    match ready!(grant.as_mut().poll(cx)) {
                        Ok(()) => *self = Gate::Granted { tokens },
                        Err(e) => {
                            *self = Gate::Idle;
                            return Poll::Ready(Err(e));
                        }
                    }
                }
                Gate::Granted { tokens } => {
                    let tokens = *tokens;
                    if tokens >= want {
                        limiters.refund(tokens - want);
                        *self = Gate::Granted { tokens: want };
                        return Poll::Ready(Ok(()));
                    }
                    // The caller grew its buffer since the grant; start over
                    limiters.refund(tokens);
                    *self = Gate::Idle;
                }
            }
        }
    }

    /// The I/O call finished; its tokens are spent
    fn consume(&mut self) {
        *self = Gate::Idle;
    }

    /// Abandon any grant in progress and return held tokens
    fn reset(&mut self, limiters: &Limiters) {
        if let Gate::Granted { tokens } = std::mem::replace(self, Gate::Idle) {
            limiters.refund(tokens);
        }
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Read,
    Write,
}

/// An inherent read/write in progress; dropping it abandons its grant
struct Call<'a, T: Transport> {
    conn: &'a mut LimitedConnection<T>,
    direction: Direction,
}

impl<T: Transport> Drop for Call<'_, T> {
    fn drop(&mut self) {
        let conn = &mut *self.conn;
        match self.direction {
            Direction::Read => conn.read_gate.reset(&conn.limiters),
            Direction::Write => conn.write_gate.reset(&conn.limiters),
        }
    }
}

/// A transport connection throttled by a private and a shared limiter
///
/// Every read and write first takes `len(buf)` tokens from the listener-wide
/// limiter, then from the per-connection limiter, then touches the transport.
///
/// The inherent [`read`](Self::read) and [`write`](Self::write) reject buffers
/// larger than a burst. Through [`AsyncRead`]/[`AsyncWrite`] such buffers are
/// served partially instead, so the connection works with `tokio::io::copy`,
/// `BufReader` and friends.
pub struct LimitedConnection<T: Transport> {
    /// Underlying stream, `None` once closed
    stream: Option<T>,
    limiters: Limiters,
    read_gate: Gate,
    write_gate: Gate,
    /// Close signal and registry back-reference
    handle: CloseHandle,
    peer_addr: Option<SocketAddr>,
}

impl<T: Transport> LimitedConnection<T> {
    pub(super) fn new(
        stream: T,
        id: ConnectionId,
        local: Arc<RateLimiter>,
        global: Arc<RateLimiter>,
        registry: Arc<ConnectionRegistry>,
        acquire_timeout: Option<Duration>,
    ) -> Self {
        let peer_addr = stream.peer_addr();
        let token = CancellationToken::new();
        Self {
            stream: Some(stream),
            limiters: Limiters {
                local,
                global,
                cancel: token.clone(),
                acquire_timeout,
            },
            read_gate: Gate::Idle,
            write_gate: Gate::Idle,
            handle: CloseHandle {
                id,
                token,
                registry,
            },
            peer_addr,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Handle for closing this connection from another task
    pub fn close_handle(&self) -> CloseHandle {
        self.handle.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none() || self.handle.is_closed()
    }

    /// Current (per-connection, global) rates in bytes/second
    pub fn current_limits(&self) -> Limits {
        Limits {
            per_connection: self.limiters.local.config().rate(),
            global: self.limiters.global.config().rate(),
        }
    }

    /// Read into `buf` after `buf.len()` tokens are granted by both limiters
    ///
    /// A buffer larger than either burst capacity is rejected with
    /// [`LimitError::OverCapacity`]. An empty buffer bypasses throttling.
    /// Dropping the returned future before it completes gives the tokens back.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ListenerError> {
        let mut call = Call {
            conn: self,
            direction: Direction::Read,
        };
        let n = poll_fn(|cx| -> Poll<Result<usize, ListenerError>> {
            let mut read_buf = ReadBuf::new(&mut *buf);
            ready!(call.conn.poll_read_limited(cx, &mut read_buf))?;
            Poll::Ready(Ok(read_buf.filled().len()))
        })
        .await?;
        Ok(n)
    }

    /// Write `buf` after `buf.len()` tokens are granted by both limiters
    ///
    /// Tokens are taken for the whole buffer up front; a short write from the
    /// transport is reported through the returned count only.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, ListenerError> {
        let mut call = Call {
            conn: self,
            direction: Direction::Write,
        };
        let n = poll_fn(|cx| call.conn.poll_write_limited(cx, buf)).await?;
        Ok(n)
    }

    /// Write the whole buffer in chunks no larger than the smaller burst
    pub async fn write_all(&mut self, mut buf: &[u8]) -> Result<(), ListenerError> {
        while !buf.is_empty() {
            let chunk = buf.len().min(self.limiters.burst());
            let n = self.write(&buf[..chunk]).await?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero).into());
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Flush buffered data in the transport
    pub async fn flush(&mut self) -> Result<(), ListenerError> {
        let stream = self.stream.as_mut().ok_or(ListenerError::Closed)?;
        stream.flush().await?;
        Ok(())
    }

    /// Deregister and shut the transport down
    ///
    /// Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<(), ListenerError> {
        poll_fn(|cx| self.poll_close(cx)).await
    }

    fn poll_read_limited(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<(), ListenerError>> {
        if self.is_closed() {
            return Poll::Ready(Err(ListenerError::Closed));
        }
        let want = buf.remaining() as u64;
        if want > 0 {
            ready!(self.read_gate.poll_admit(cx, want, &self.limiters))?;
        }

        let Some(stream) = self.stream.as_mut() else {
            return Poll::Ready(Err(ListenerError::Closed));
        };
        let before = buf.filled().len();
        let result = ready!(Pin::new(stream).poll_read(cx, buf));
        if want > 0 {
            self.read_gate.consume();
        }
        result?;
        metrics().record_bytes("read", buf.filled().len() - before);
        Poll::Ready(Ok(()))
    }

    fn poll_write_limited(
        &mut self,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, ListenerError>> {
        if self.is_closed() {
            return Poll::Ready(Err(ListenerError::Closed));
        }
        let want = buf.len() as u64;
        if want > 0 {
            ready!(self.write_gate.poll_admit(cx, want, &self.limiters))?;
        }

        let Some(stream) = self.stream.as_mut() else {
            return Poll::Ready(Err(ListenerError::Closed));
        };
        let result = ready!(Pin::new(stream).poll_write(cx, buf));
        if want > 0 {
            self.write_gate.consume();
        }
        let n = result?;
        metrics().record_bytes("write", n);
        Poll::Ready(Ok(n))
    }

    fn poll_close(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), ListenerError>> {
        if self.handle.close() {
            info!(conn_id = %self.id(), peer = ?self.peer_addr, "Connection closed");
        }
        self.read_gate.reset(&self.limiters);
        self.write_gate.reset(&self.limiters);

        let Some(stream) = self.stream.as_mut() else {
            debug!(conn_id = %self.id(), "Connection already closed");
            return Poll::Ready(Ok(()));
        };
        let result = ready!(Pin::new(stream).poll_shutdown(cx));
        self.stream = None;

        match result {
            Ok(()) => Poll::Ready(Ok(())),
            // The peer may already be gone; the stream is released either way
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Poll::Ready(Ok(())),
            Err(e) => Poll::Ready(Err(e.into())),
        }
    }
}

impl<T: Transport> AsyncRead for LimitedConnection<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let burst = this.limiters.burst();
        if buf.remaining() <= burst {
            return this.poll_read_limited(cx, buf).map_err(io::Error::from);
        }

        // Larger buffers are filled up to one burst
        let mut chunk = ReadBuf::new(buf.initialize_unfilled_to(burst));
        ready!(this.poll_read_limited(cx, &mut chunk)).map_err(io::Error::from)?;
        let n = chunk.filled().len();
        buf.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl<T: Transport> AsyncWrite for LimitedConnection<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let chunk = buf.len().min(this.limiters.burst());
        this.poll_write_limited(cx, &buf[..chunk])
            .map_err(io::Error::from)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_flush(cx),
            None => Poll::Ready(Err(ListenerError::Closed.into())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_close(cx).map_err(io::Error::from)
    }
}

impl<T: Transport> Drop for LimitedConnection<T> {
    fn drop(&mut self) {
        self.read_gate.reset(&self.limiters);
        self.write_gate.reset(&self.limiters);
        if self.handle.close() {
            debug!(conn_id = %self.id(), "Connection dropped without close");
        }
    }
}

impl<T: Transport> std::fmt::Debug for LimitedConnection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimitedConnection")
            .field("id", &self.handle.id)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .field("limits", &self.current_limits())
            .finish()
    }
}
