use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Byte counter shared by all connection tasks of a sink server
#[derive(Debug, Default)]
pub struct ThroughputMeter {
    total: AtomicU64,
    since_update: AtomicU64,
    marks: Mutex<Marks>,
}

#[derive(Debug, Default)]
struct Marks {
    started_at: Option<Instant>,
    updated_at: Option<Instant>,
}

/// Point-in-time view of a [`ThroughputMeter`]
#[derive(Debug, Clone, Copy)]
pub struct ThroughputSnapshot {
    pub total_bytes: u64,
    /// Bytes counted since the most recent limit change
    pub bytes_since_update: u64,
    /// Time since the first connection
    pub elapsed: Duration,
    /// Time since the most recent limit change
    pub since_update: Option<Duration>,
}

impl ThroughputSnapshot {
    /// Average bytes/second since the first connection
    pub fn average_rate(&self) -> f64 {
        rate(self.total_bytes, self.elapsed)
    }

    /// Average bytes/second since the most recent limit change
    pub fn rate_since_update(&self) -> Option<f64> {
        self.since_update.map(|d| rate(self.bytes_since_update, d))
    }
}

fn rate(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        bytes as f64 / secs
    } else {
        0.0
    }
}

impl ThroughputMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, n: u64) {
        self.total.fetch_add(n, Ordering::Relaxed);
        // Reads are attributed to the latest limit window as soon as it opens
        if self.marks.lock().updated_at.is_some() {
            self.since_update.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Start the clock; `true` only for the first call
    pub fn mark_started(&self) -> bool {
        let mut marks = self.marks.lock();
        if marks.started_at.is_some() {
            return false;
        }
        marks.started_at = Some(Instant::now());
        true
    }

    /// Open a new limit window
    pub fn mark_limit_update(&self) {
        let mut marks = self.marks.lock();
        marks.updated_at = Some(Instant::now());
        self.since_update.store(0, Ordering::Relaxed);
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.marks.lock().started_at
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ThroughputSnapshot {
        let marks = self.marks.lock();
        ThroughputSnapshot {
            total_bytes: self.total.load(Ordering::Relaxed),
            bytes_since_update: self.since_update.load(Ordering::Relaxed),
            elapsed: marks.started_at.map(|t| t.elapsed()).unwrap_or_default(),
            since_update: marks.updated_at.map(|t| t.elapsed()),
        }
    }
}
