//! Throughput scenarios on virtual time
//!
//! Each test saturates one or more connections for 30 seconds and checks the
//! admitted byte counts against the token bucket bounds:
//! `rate * T - burst <= admitted <= rate * T + burst`.

use std::sync::Arc;
use std::time::Duration;

use throttle_rs::{LimitedConnection, Limits, Transport};
use tokio::time::Instant;

use crate::{assert_close, channel_listener, spawn_writer, SCENARIO_DURATION};

const READ_SIZE: usize = 1024;

/// Bytes read per window boundary
struct Drained {
    before: u64,
    after: u64,
    elapsed: Duration,
}

impl Drained {
    fn total(&self) -> u64 {
        self.before + self.after
    }
}

/// Read for `window`, splitting the byte count at `split`
async fn drain<T: Transport>(
    conn: &mut LimitedConnection<T>,
    window: Duration,
    split: Duration,
) -> Drained {
    let start = Instant::now();
    let mut buf = [0u8; READ_SIZE];
    let mut drained = Drained {
        before: 0,
        after: 0,
        elapsed: Duration::ZERO,
    };
    while start.elapsed() < window {
        let n = conn.read(&mut buf).await.expect("read failed") as u64;
        if start.elapsed() < split {
            drained.before += n;
        } else {
            drained.after += n;
        }
    }
    drained.elapsed = start.elapsed();
    drained
}

fn assert_bucket_bounds(admitted: u64, rate: u64, burst: u64, elapsed: Duration, what: &str) {
    let secs = elapsed.as_secs_f64();
    let upper = rate as f64 * secs + burst as f64;
    let lower = rate as f64 * secs - burst as f64;
    assert!(
        (admitted as f64) <= upper,
        "{}: admitted {} above bound {}",
        what,
        admitted,
        upper
    );
    assert!(
        (admitted as f64) >= lower,
        "{}: admitted {} below bound {}",
        what,
        admitted,
        lower
    );
}

#[tokio::test(start_paused = true)]
async fn test_one_client_per_connection_cap() {
    let (listener, dialer) = channel_listener(Limits::new(3 * 1024, 10 * 1024));
    let writer = spawn_writer(dialer.dial().await);
    let mut conn = listener.accept().await.unwrap();

    let drained = drain(&mut conn, SCENARIO_DURATION, SCENARIO_DURATION).await;
    conn.close().await.unwrap();
    writer.await.unwrap();

    assert_bucket_bounds(
        drained.total(),
        3 * 1024,
        3 * 1024,
        drained.elapsed,
        "single client",
    );
    let average = drained.total() as f64 / drained.elapsed.as_secs_f64();
    assert_close(average, 3072.0, 0.1, "single client bytes/sec");
    assert_eq!(listener.active_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_two_clients_share_global_cap() {
    let (listener, dialer) = channel_listener(Limits::new(6 * 1024, 10 * 1024));

    let mut writers = Vec::new();
    let mut readers = Vec::new();
    for _ in 0..2 {
        writers.push(spawn_writer(dialer.dial().await));
        let mut conn = listener.accept().await.unwrap();
        readers.push(tokio::spawn(async move {
            let drained = drain(&mut conn, SCENARIO_DURATION, SCENARIO_DURATION).await;
            conn.close().await.unwrap();
            drained
        }));
    }

    let mut aggregate = 0u64;
    let mut elapsed = Duration::ZERO;
    for reader in readers {
        let drained = reader.await.unwrap();
        // Each connection stays under its own cap
        let per_conn_upper = 6144.0 * drained.elapsed.as_secs_f64() + 6144.0;
        assert!(
            drained.total() as f64 <= per_conn_upper,
            "connection admitted {} above bound {}",
            drained.total(),
            per_conn_upper
        );
        aggregate += drained.total();
        elapsed = elapsed.max(drained.elapsed);
    }
    for writer in writers {
        writer.await.unwrap();
    }

    assert_bucket_bounds(aggregate, 10 * 1024, 10 * 1024, elapsed, "aggregate");
    let average = aggregate as f64 / elapsed.as_secs_f64() / 2.0;
    assert_close(average, 5120.0, 0.1, "average bytes/sec per client");
}

#[tokio::test(start_paused = true)]
async fn test_per_connection_cap_binds_before_global() {
    // Two clients at 3 KiB/s each never reach the 10 KiB/s global cap
    let (listener, dialer) = channel_listener(Limits::new(3 * 1024, 10 * 1024));

    let mut writers = Vec::new();
    let mut readers = Vec::new();
    for _ in 0..2 {
        writers.push(spawn_writer(dialer.dial().await));
        let mut conn = listener.accept().await.unwrap();
        readers.push(tokio::spawn(async move {
            let drained = drain(&mut conn, SCENARIO_DURATION, SCENARIO_DURATION).await;
            conn.close().await.unwrap();
            drained
        }));
    }

    let mut aggregate = 0u64;
    let mut elapsed = Duration::ZERO;
    for reader in readers {
        let drained = reader.await.unwrap();
        assert_bucket_bounds(drained.total(), 3 * 1024, 3 * 1024, drained.elapsed, "client");
        aggregate += drained.total();
        elapsed = elapsed.max(drained.elapsed);
    }
    for writer in writers {
        writer.await.unwrap();
    }

    let average = aggregate as f64 / elapsed.as_secs_f64();
    assert_close(average, 6144.0, 0.1, "aggregate bytes/sec");
}

#[tokio::test(start_paused = true)]
async fn test_many_clients_never_exceed_global_cap() {
    let (listener, dialer) = channel_listener(Limits::new(6 * 1024, 10 * 1024));
    let window = Duration::from_secs(20);

    let mut writers = Vec::new();
    let mut readers = Vec::new();
    for _ in 0..5 {
        writers.push(spawn_writer(dialer.dial().await));
        let mut conn = listener.accept().await.unwrap();
        readers.push(tokio::spawn(async move {
            let drained = drain(&mut conn, window, window).await;
            conn.close().await.unwrap();
            drained
        }));
    }

    let mut aggregate = 0u64;
    let mut elapsed = Duration::ZERO;
    for reader in readers {
        let drained = reader.await.unwrap();
        aggregate += drained.total();
        elapsed = elapsed.max(drained.elapsed);
    }
    for writer in writers {
        writer.await.unwrap();
    }

    let upper = 10240.0 * elapsed.as_secs_f64() + 10240.0;
    assert!(
        aggregate as f64 <= upper,
        "aggregate {} above global bound {}",
        aggregate,
        upper
    );
}

#[tokio::test(start_paused = true)]
async fn test_set_limits_mid_transfer() {
    let (listener, dialer) = channel_listener(Limits::new(3 * 1024, 10 * 1024));
    let listener = Arc::new(listener);
    let writer = spawn_writer(dialer.dial().await);
    let mut conn = listener.accept().await.unwrap();

    let update_at = SCENARIO_DURATION / 2;
    let updater = {
        let listener = listener.clone();
        tokio::spawn(async move {
            tokio::time::sleep(update_at).await;
            listener.set_limits(6 * 1024, 10 * 1024).unwrap();
        })
    };

    let drained = drain(&mut conn, SCENARIO_DURATION, update_at).await;
    updater.await.unwrap();

    assert_eq!(conn.current_limits(), Limits::new(6 * 1024, 10 * 1024));
    conn.close().await.unwrap();
    writer.await.unwrap();

    let first = drained.before as f64 / update_at.as_secs_f64();
    let second_window = drained.elapsed - update_at;
    let second = drained.after as f64 / second_window.as_secs_f64();

    assert_close(first, 3072.0, 0.1, "bytes/sec before update");
    assert_close(second, 6144.0, 0.1, "bytes/sec after update");
}

#[tokio::test(start_paused = true)]
async fn test_lowering_limits_takes_effect() {
    let (listener, dialer) = channel_listener(Limits::new(8 * 1024, 16 * 1024));
    let writer = spawn_writer(dialer.dial().await);
    let mut conn = listener.accept().await.unwrap();

    // Warm up at the high rate, then drop to 2 KiB/s
    drain(&mut conn, Duration::from_secs(5), Duration::from_secs(5)).await;
    listener.set_limits(2 * 1024, 16 * 1024).unwrap();

    let drained = drain(&mut conn, Duration::from_secs(20), Duration::from_secs(20)).await;
    conn.close().await.unwrap();
    writer.await.unwrap();

    // Tokens left over from the old burst are clamped to the new capacity
    assert_bucket_bounds(
        drained.total(),
        2 * 1024,
        2 * 1024,
        drained.elapsed,
        "after lowering",
    );
}
