//! Bandwidth-limiting listener
//!
//! [`LimitingListener`] wraps an [`Acceptor`] and hands out
//! [`LimitedConnection`]s that are throttled by two token buckets:
//! - a private bucket per connection (`per_connection` bytes/second)
//! - a bucket shared by every connection of the listener (`global` bytes/second)
//!
//! Both rates double as burst capacities. [`LimitingListener::set_limits`]
//! changes them at runtime for the listener and every open connection.

mod connection;
mod registry;
mod transport;

pub use connection::{CloseHandle, LimitedConnection};
pub use registry::{ConnectionId, ConnectionRegistry};
pub use transport::{Acceptor, Transport};

use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::limiter::{BucketConfig, LimitError, RateLimiter};
use crate::metrics::metrics;

/// Default keep-alive period for accepted connections
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Error type for accepting and using limited connections
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error(transparent)]
    Limit(#[from] LimitError),

    #[error("Unsupported connection: transport cannot enable keep-alive")]
    UnsupportedConnection,

    #[error("Connection or listener is closed")]
    Closed,

    #[error("Transport error: {0}")]
    Io(#[from] io::Error),
}

impl ListenerError {
    /// Whether this error came from a cancelled token wait
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ListenerError::Limit(LimitError::Cancelled))
    }
}

impl From<ListenerError> for io::Error {
    fn from(err: ListenerError) -> Self {
        match err {
            ListenerError::Io(e) => e,
            ListenerError::Limit(LimitError::Cancelled) => {
                io::Error::new(io::ErrorKind::Interrupted, err)
            }
            ListenerError::Limit(LimitError::DeadlineExceeded) => {
                io::Error::new(io::ErrorKind::TimedOut, err)
            }
            ListenerError::Limit(_) => io::Error::new(io::ErrorKind::InvalidInput, err),
            ListenerError::UnsupportedConnection => io::Error::new(io::ErrorKind::Unsupported, err),
            ListenerError::Closed => io::Error::new(io::ErrorKind::NotConnected, err),
        }
    }
}

/// Per-connection and global rates in bytes/second
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub per_connection: u64,
    pub global: u64,
}

impl Limits {
    pub fn new(per_connection: u64, global: u64) -> Self {
        Self {
            per_connection,
            global,
        }
    }

    /// Bucket configs for (per-connection, global), rate doubling as burst
    fn buckets(&self) -> Result<(BucketConfig, BucketConfig), LimitError> {
        Ok((
            BucketConfig::per_second(self.per_connection)?,
            BucketConfig::per_second(self.global)?,
        ))
    }
}

/// Listener construction options
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    /// Initial limits
    pub limits: Limits,
    /// Keep-alive period applied to accepted connections
    pub keepalive_interval: Duration,
    /// Reject connections whose transport cannot enable keep-alive
    pub require_keepalive: bool,
    /// Upper bound on the token wait of one read/write; `None` waits indefinitely
    pub acquire_timeout: Option<Duration>,
}

impl ListenerOptions {
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            require_keepalive: true,
            acquire_timeout: None,
        }
    }
}

impl From<&Config> for ListenerOptions {
    fn from(config: &Config) -> Self {
        Self {
            limits: Limits::new(config.limits.per_connection, config.limits.global),
            keepalive_interval: Duration::from_millis(config.keepalive.interval_ms),
            require_keepalive: config.keepalive.required,
            acquire_timeout: config.acquire_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Listener that throttles every connection it accepts
pub struct LimitingListener<A: Acceptor> {
    /// Taken and dropped by `close`, which releases the listening socket once
    /// no `accept` call still holds a clone
    acceptor: Mutex<Option<Arc<A>>>,
    /// Limiter shared by all connections
    global: Arc<RateLimiter>,
    /// Open connections, for propagating limit changes
    registry: Arc<ConnectionRegistry>,
    /// Defaults for new connections; held across accept-registration and
    /// set_limits so neither can interleave with the other
    defaults: Mutex<Limits>,
    keepalive_interval: Duration,
    require_keepalive: bool,
    acquire_timeout: Option<Duration>,
    /// Cancelled by `close`
    shutdown: CancellationToken,
}

impl<A: Acceptor> LimitingListener<A> {
    /// Wrap `acceptor` with the given rates (bytes/second, also burst size)
    pub fn new(acceptor: A, per_connection: u64, global: u64) -> Result<Self, LimitError> {
        Self::with_options(acceptor, ListenerOptions::new(Limits::new(per_connection, global)))
    }

    pub fn with_options(acceptor: A, options: ListenerOptions) -> Result<Self, LimitError> {
        let (_, global) = options.limits.buckets()?;
        metrics().set_limits(options.limits);

        info!(
            per_connection = options.limits.per_connection,
            global = options.limits.global,
            require_keepalive = options.require_keepalive,
            acquire_timeout = ?options.acquire_timeout,
            "Limiting listener created"
        );

        Ok(Self {
            acceptor: Mutex::new(Some(Arc::new(acceptor))),
            global: Arc::new(RateLimiter::new(global)),
            registry: Arc::new(ConnectionRegistry::new()),
            defaults: Mutex::new(options.limits),
            keepalive_interval: options.keepalive_interval,
            require_keepalive: options.require_keepalive,
            acquire_timeout: options.acquire_timeout,
            shutdown: CancellationToken::new(),
        })
    }

    /// Accept the next connection and register it
    pub async fn accept(&self) -> Result<LimitedConnection<A::Stream>, ListenerError> {
        let acceptor = self.acceptor.lock().clone().ok_or(ListenerError::Closed)?;
        let mut stream = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(ListenerError::Closed),
            result = acceptor.accept() => result?,
        };
        drop(acceptor);

        if let Err(e) = self.apply_keepalive(&stream) {
            // Release the raw stream before reporting the failure
            if let Err(shutdown_err) = stream.shutdown().await {
                debug!(error = %shutdown_err, "Failed to shut down rejected connection");
            }
            return Err(e);
        }

        let connection = {
            let defaults = self.defaults.lock();
            let (per_connection, _) = defaults.buckets()?;
            let local = Arc::new(RateLimiter::new(per_connection));
            let id = self.registry.register(local.clone());
            LimitedConnection::new(
                stream,
                id,
                local,
                self.global.clone(),
                self.registry.clone(),
                self.acquire_timeout,
            )
        };

        metrics().record_connection_accepted();
        info!(
            conn_id = %connection.id(),
            peer = ?connection.peer_addr(),
            limits = ?connection.current_limits(),
            "Connection accepted"
        );
        Ok(connection)
    }

    fn apply_keepalive(&self, stream: &A::Stream) -> Result<(), ListenerError> {
        match stream.set_keepalive(self.keepalive_interval) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Unsupported => {
                if self.require_keepalive {
                    warn!(peer = ?stream.peer_addr(), "Rejecting connection without keep-alive support");
                    Err(ListenerError::UnsupportedConnection)
                } else {
                    debug!(peer = ?stream.peer_addr(), "Transport has no keep-alive, continuing");
                    Ok(())
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Change the global rate and the per-connection rate of every open and
    /// future connection
    ///
    /// Only swaps limiter parameters; never waits on in-flight I/O. Invalid
    /// rates are rejected before anything changes.
    #[instrument(skip(self))]
    pub fn set_limits(&self, per_connection: u64, global: u64) -> Result<(), LimitError> {
        let limits = Limits::new(per_connection, global);
        let (per_connection_bucket, global_bucket) = limits.buckets()?;

        let mut defaults = self.defaults.lock();
        self.global.reconfigure(global_bucket);
        *defaults = limits;

        let mut updated = 0usize;
        self.registry.for_each(|_, limiter| {
            limiter.reconfigure(per_connection_bucket);
            updated += 1;
        });
        drop(defaults);

        metrics().record_limit_update(limits);
        info!(updated_connections = updated, "Limits updated");
        Ok(())
    }

    /// Default limits for the next accepted connection
    pub fn limits(&self) -> Limits {
        *self.defaults.lock()
    }

    /// Number of open connections
    pub fn active_connections(&self) -> usize {
        self.registry.len()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Stop accepting and release the underlying acceptor
    ///
    /// Pending `accept` calls return [`ListenerError::Closed`]. Already
    /// accepted connections stay open.
    pub fn close(&self) -> Result<(), ListenerError> {
        self.shutdown.cancel();
        if let Some(acceptor) = self.acceptor.lock().take() {
            drop(acceptor);
            info!(active_connections = self.registry.len(), "Limiting listener closed");
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
