use std::future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Lower bound on a single wait, so float rounding on a nearly-full bucket
/// cannot turn the acquire loop into a spin.
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Error type for token acquisition and limiter configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LimitError {
    #[error("Invalid limiter configuration: {field} must be positive, got {value}")]
    InvalidConfig { field: &'static str, value: u64 },

    #[error("Requested {requested} tokens exceeds bucket capacity {capacity}")]
    OverCapacity { requested: u64, capacity: u64 },

    #[error("Token acquisition cancelled")]
    Cancelled,

    #[error("Deadline exceeded while waiting for tokens")]
    DeadlineExceeded,
}

/// Validated bucket parameters
///
/// Both values are strictly positive, so a limiter built from a `BucketConfig`
/// can always make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketConfig {
    capacity: u64,
    rate: u64,
}

impl BucketConfig {
    /// Create a config with the given burst size and refill rate (tokens/second)
    pub fn new(capacity: u64, rate: u64) -> Result<Self, LimitError> {
        if capacity == 0 {
            return Err(LimitError::InvalidConfig {
                field: "capacity",
                value: capacity,
            });
        }
        if rate == 0 {
            return Err(LimitError::InvalidConfig {
                field: "rate",
                value: rate,
            });
        }
        Ok(Self { capacity, rate })
    }

    /// Config whose burst equals one second worth of tokens
    pub fn per_second(rate: u64) -> Result<Self, LimitError> {
        Self::new(rate, rate)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }
}

/// Mutable bucket state, always accessed under the limiter mutex
#[derive(Debug)]
struct Bucket {
    config: BucketConfig,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn full(config: BucketConfig, now: Instant) -> Self {
        Self {
            config,
            tokens: config.capacity as f64,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let replenished = elapsed * self.config.rate as f64;
        self.tokens = (self.tokens + replenished).min(self.config.capacity as f64);
        self.last_refill = now;
    }

    /// Take `n` tokens, or return how long until they would be available
    fn take(&mut self, n: u64, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        let requested = n as f64;
        if requested <= self.tokens {
            self.tokens -= requested;
            return Ok(());
        }
        let deficit = requested - self.tokens;
        Err(Duration::from_secs_f64(deficit / self.config.rate as f64).max(MIN_WAIT))
    }
}

/// Token bucket rate limiter
///
/// Tokens accrue continuously at `rate` per second up to `capacity`. Waiters
/// sleep until their deficit would be covered and are woken early whenever the
/// limiter is reconfigured, so an in-flight wait always recomputes with the
/// current parameters.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    reconfigured: Notify,
}

impl RateLimiter {
    /// Create a limiter with a full bucket
    pub fn new(config: BucketConfig) -> Self {
        Self {
            bucket: Mutex::new(Bucket::full(config, Instant::now())),
            reconfigured: Notify::new(),
        }
    }

    /// Wait until `n` tokens are available and consume them
    ///
    /// Zero tokens always succeed immediately. A request larger than the current
    /// capacity fails with [`LimitError::OverCapacity`] instead of blocking forever.
    /// Cancellation returns [`LimitError::Cancelled`] without consuming anything.
    pub async fn acquire(&self, n: u64, cancel: &CancellationToken) -> Result<(), LimitError> {
        self.acquire_inner(n, cancel, None).await
    }

    /// Like [`acquire`](Self::acquire), but gives up at `deadline`
    pub async fn acquire_until(
        &self,
        n: u64,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<(), LimitError> {
        self.acquire_inner(n, cancel, Some(deadline)).await
    }

    async fn acquire_inner(
        &self,
        n: u64,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<(), LimitError> {
        if n == 0 {
            return Ok(());
        }

        loop {
            if cancel.is_cancelled() {
                return Err(LimitError::Cancelled);
            }

            // Register for reconfiguration before inspecting the bucket so a
            // concurrent reconfigure cannot slip between the check and the wait.
            let notified = self.reconfigured.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait = {
                let mut bucket = self.bucket.lock();
                if n > bucket.config.capacity {
                    return Err(LimitError::OverCapacity {
                        requested: n,
                        capacity: bucket.config.capacity,
                    });
                }
                match bucket.take(n, Instant::now()) {
                    Ok(()) => return Ok(()),
                    Err(wait) => wait,
                }
            };

            trace!(tokens = n, wait = ?wait, "Waiting for tokens");

            let expiry = async {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LimitError::Cancelled),
                _ = expiry => return Err(LimitError::DeadlineExceeded),
                _ = &mut notified => {}
                _ = sleep(wait) => {}
            }
        }
    }

    /// Replace capacity and rate
    ///
    /// Tokens accrued so far are credited at the old rate, then clamped to the
    /// new capacity. Waiters are woken to recompute against the new parameters.
    pub fn reconfigure(&self, config: BucketConfig) {
        {
            let mut bucket = self.bucket.lock();
            bucket.refill(Instant::now());
            bucket.config = config;
            bucket.tokens = bucket.tokens.min(config.capacity as f64);
        }
        self.reconfigured.notify_waiters();
    }

    /// Return `n` tokens that were acquired but not used
    pub fn refund(&self, n: u64) {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());
        bucket.tokens = (bucket.tokens + n as f64).min(bucket.config.capacity as f64);
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> BucketConfig {
        self.bucket.lock().config
    }

    /// Tokens available right now (after refill)
    pub fn available(&self) -> u64 {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());
        bucket.tokens as u64
    }
}
