//! Sink server end to end over in-memory connections

use std::sync::Arc;
use std::time::Duration;

use throttle_rs::config::LimitUpdateConfig;
use throttle_rs::server::{SinkOptions, SinkServer};
use throttle_rs::Limits;
use tokio_util::sync::CancellationToken;

use crate::{assert_close, channel_listener, spawn_writer, SCENARIO_DURATION};

fn options(schedule: Vec<LimitUpdateConfig>) -> SinkOptions {
    SinkOptions {
        read_buffer_size: 1024,
        report_interval: Duration::from_secs(5),
        schedule,
    }
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_limit_change() {
    let (listener, dialer) = channel_listener(Limits::new(3 * 1024, 10 * 1024));
    let server = Arc::new(SinkServer::new(
        listener,
        options(vec![LimitUpdateConfig {
            after_secs: 15,
            per_connection: 6 * 1024,
            global: 10 * 1024,
        }]),
    ));
    let shutdown = CancellationToken::new();

    let run = {
        let server = server.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { server.run(shutdown).await })
    };

    let writer = spawn_writer(dialer.dial().await);
    tokio::time::sleep(SCENARIO_DURATION).await;

    let snapshot = server.meter().snapshot();
    assert_eq!(server.listener().limits(), Limits::new(6 * 1024, 10 * 1024));
    assert_eq!(server.listener().active_connections(), 1);

    let after = snapshot.rate_since_update().expect("schedule applied");
    assert_close(after, 6144.0, 0.1, "bytes/sec after scheduled update");

    let before_bytes = snapshot.total_bytes - snapshot.bytes_since_update;
    let before_secs = (snapshot.elapsed - snapshot.since_update.unwrap()).as_secs_f64();
    assert_close(
        before_bytes as f64 / before_secs,
        3072.0,
        0.1,
        "bytes/sec before scheduled update",
    );

    shutdown.cancel();
    run.await.unwrap();
    writer.await.unwrap();

    assert!(server.listener().is_closed());
    assert_eq!(server.listener().active_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_drains_until_peer_closes() {
    let (listener, dialer) = channel_listener(Limits::new(4 * 1024, 10 * 1024));
    let server = Arc::new(SinkServer::new(listener, options(Vec::new())));
    let shutdown = CancellationToken::new();

    let run = {
        let server = server.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { server.run(shutdown).await })
    };

    // 10 KiB at 4 KiB/s with a 4 KiB burst takes 1.5 seconds
    let mut client = dialer.dial().await;
    tokio::io::AsyncWriteExt::write_all(&mut client, &[1u8; 10 * 1024])
        .await
        .unwrap();
    drop(client);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(server.meter().total(), 10 * 1024);
    assert_eq!(server.listener().active_connections(), 0);
    assert!(server.meter().snapshot().rate_since_update().is_none());

    shutdown.cancel();
    run.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_without_connections() {
    let (listener, _dialer) = channel_listener(Limits::new(1024, 2048));
    let server = SinkServer::new(listener, options(Vec::new()));
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    server.run(shutdown).await;
    assert!(server.listener().is_closed());
    assert_eq!(server.meter().total(), 0);
    assert!(server.meter().started_at().is_none());
}
