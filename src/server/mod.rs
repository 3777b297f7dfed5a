//! Sink server: accepts throttled connections and drains them
//!
//! Every connection is read until EOF and the byte counts feed a
//! [`ThroughputMeter`]. Scheduled limit changes are timed from the first
//! accepted connection.

mod meter;

pub use meter::{ThroughputMeter, ThroughputSnapshot};

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{Config, LimitUpdateConfig};
use crate::listener::{Acceptor, LimitedConnection, LimitingListener, ListenerError, Transport};

/// Pause after a failed accept before trying again
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Sink server settings
#[derive(Debug, Clone)]
pub struct SinkOptions {
    /// Bytes requested per read
    pub read_buffer_size: usize,
    /// Interval between throughput log lines
    pub report_interval: Duration,
    /// Limit changes relative to the first accepted connection
    pub schedule: Vec<LimitUpdateConfig>,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            read_buffer_size: 1024,
            report_interval: Duration::from_secs(5),
            schedule: Vec::new(),
        }
    }
}

impl From<&Config> for SinkOptions {
    fn from(config: &Config) -> Self {
        Self {
            read_buffer_size: config.server.read_buffer_size,
            report_interval: Duration::from_millis(config.report.interval_ms),
            schedule: config.sorted_schedule(),
        }
    }
}

pub struct SinkServer<A: Acceptor> {
    listener: Arc<LimitingListener<A>>,
    meter: Arc<ThroughputMeter>,
    options: SinkOptions,
}

impl<A: Acceptor + 'static> SinkServer<A> {
    pub fn new(listener: LimitingListener<A>, options: SinkOptions) -> Self {
        Self {
            listener: Arc::new(listener),
            meter: Arc::new(ThroughputMeter::new()),
            options,
        }
    }

    pub fn listener(&self) -> &Arc<LimitingListener<A>> {
        &self.listener
    }

    pub fn meter(&self) -> &Arc<ThroughputMeter> {
        &self.meter
    }

    /// Accept and drain connections until `shutdown` fires
    ///
    /// Returns once the listener is closed and every connection task finished.
    pub async fn run(&self, shutdown: CancellationToken) {
        let tracker = TaskTracker::new();

        tracker.spawn(report_loop(
            self.meter.clone(),
            self.options.report_interval,
            shutdown.clone(),
        ));

        loop {
            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                result = self.listener.accept() => result,
            };

            let conn = match result {
                Ok(conn) => conn,
                Err(ListenerError::Closed) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            };

            if self.meter.mark_started() && !self.options.schedule.is_empty() {
                tracker.spawn(run_schedule(
                    self.listener.clone(),
                    self.meter.clone(),
                    self.options.schedule.clone(),
                    shutdown.clone(),
                ));
            }

            tracker.spawn(drain_connection(
                conn,
                self.meter.clone(),
                self.options.read_buffer_size,
                shutdown.clone(),
            ));
        }

        info!("Shutting down sink server");
        if let Err(e) = self.listener.close() {
            warn!(error = %e, "Failed to close listener");
        }
        tracker.close();
        tracker.wait().await;

        let snapshot = self.meter.snapshot();
        info!(
            total_bytes = snapshot.total_bytes,
            avg_bytes_per_sec = snapshot.average_rate(),
            "Sink server stopped"
        );
    }
}

/// Read from `conn` until EOF, error or shutdown
async fn drain_connection<T: Transport>(
    mut conn: LimitedConnection<T>,
    meter: Arc<ThroughputMeter>,
    buffer_size: usize,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; buffer_size];
    loop {
        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            result = conn.read(&mut buf) => result,
        };
        match result {
            Ok(0) => {
                debug!(conn_id = %conn.id(), "Peer closed connection");
                break;
            }
            Ok(n) => meter.record(n as u64),
            Err(e) if e.is_cancelled() => break,
            Err(e) => {
                debug!(conn_id = %conn.id(), error = %e, "Read failed");
                break;
            }
        }
    }

    if let Err(e) = conn.close().await {
        debug!(conn_id = %conn.id(), error = %e, "Error closing connection");
    }
}

/// Apply limit changes at their offsets from the first connection
async fn run_schedule<A: Acceptor>(
    listener: Arc<LimitingListener<A>>,
    meter: Arc<ThroughputMeter>,
    schedule: Vec<LimitUpdateConfig>,
    shutdown: CancellationToken,
) {
    let Some(start) = meter.started_at() else {
        return;
    };

    for update in schedule {
        let at = start + Duration::from_secs(update.after_secs);
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = sleep_until(at) => {}
        }

        info!(
            after_secs = update.after_secs,
            per_connection = update.per_connection,
            global = update.global,
            "Applying scheduled limits"
        );
        match listener.set_limits(update.per_connection, update.global) {
            Ok(()) => meter.mark_limit_update(),
            Err(e) => warn!(error = %e, "Scheduled limit update rejected"),
        }
    }
}

/// Log throughput periodically
async fn report_loop(meter: Arc<ThroughputMeter>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let snapshot = meter.snapshot();
                if snapshot.elapsed.is_zero() {
                    continue;
                }
                info!(
                    total_bytes = snapshot.total_bytes,
                    elapsed_secs = snapshot.elapsed.as_secs_f64(),
                    avg_bytes_per_sec = snapshot.average_rate(),
                    since_update_bytes_per_sec = ?snapshot.rate_since_update(),
                    "Throughput"
                );
            }
        }
    }
}
