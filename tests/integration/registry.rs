//! Registry consistency under concurrent accept, close and limit changes

use std::collections::HashSet;
use std::sync::Arc;

use throttle_rs::Limits;

use crate::channel_listener;

const CONNECTIONS: usize = 64;
const UPDATES: u64 = 100;

/// Limits large enough that nothing in these tests waits on a bucket
fn roomy(step: u64) -> Limits {
    Limits::new((1 << 20) + step, (1 << 24) + step)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_accept_close_and_set_limits() {
    let (listener, dialer) = channel_listener(roomy(0));
    let listener = Arc::new(listener);

    let dial_task = tokio::spawn(async move {
        let mut clients = Vec::with_capacity(CONNECTIONS);
        for _ in 0..CONNECTIONS {
            clients.push(dialer.dial().await);
        }
        clients
    });

    let accept_task = {
        let listener = listener.clone();
        tokio::spawn(async move {
            let mut kept = Vec::new();
            let mut closers = Vec::new();
            for i in 0..CONNECTIONS {
                let mut conn = listener.accept().await.unwrap();
                if i % 2 == 0 {
                    closers.push(tokio::spawn(async move {
                        conn.close().await.unwrap();
                        conn.id()
                    }));
                } else {
                    kept.push(conn);
                }
            }
            let mut closed = Vec::new();
            for closer in closers {
                closed.push(closer.await.unwrap());
            }
            (kept, closed)
        })
    };

    let update_task = {
        let listener = listener.clone();
        tokio::spawn(async move {
            for step in 1..=UPDATES {
                let limits = roomy(step);
                listener.set_limits(limits.per_connection, limits.global).unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    let _clients = dial_task.await.unwrap();
    let (mut kept, closed) = accept_task.await.unwrap();
    update_task.await.unwrap();

    let last = roomy(UPDATES);
    assert_eq!(listener.limits(), last);
    assert_eq!(listener.active_connections(), kept.len());
    for conn in &kept {
        assert!(listener.registry().contains(conn.id()));
        assert_eq!(conn.current_limits(), last);
    }
    for id in &closed {
        assert!(!listener.registry().contains(*id));
    }

    let ids: HashSet<_> = kept.iter().map(|c| c.id()).chain(closed).collect();
    assert_eq!(ids.len(), CONNECTIONS);

    for conn in &mut kept {
        conn.close().await.unwrap();
    }
    assert_eq!(listener.active_connections(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_closes_deregister_once() {
    let (listener, dialer) = channel_listener(roomy(0));
    let mut clients = Vec::new();
    let mut tasks = Vec::new();

    for _ in 0..16 {
        clients.push(dialer.dial().await);
        let mut conn = listener.accept().await.unwrap();
        let handle = conn.close_handle();

        let by_handle = tokio::spawn(async move { handle.close() });
        let by_conn = tokio::spawn(async move {
            conn.close().await.unwrap();
            conn.close().await.unwrap();
            conn.is_closed()
        });
        tasks.push((by_handle, by_conn));
    }

    for (by_handle, by_conn) in tasks {
        by_handle.await.unwrap();
        assert!(by_conn.await.unwrap());
    }
    assert_eq!(listener.active_connections(), 0);
    assert!(listener.registry().is_empty());
}

#[tokio::test]
async fn test_dropped_connections_leave_registry() {
    let (listener, dialer) = channel_listener(roomy(0));
    let mut clients = Vec::new();
    let mut conns = Vec::new();

    for _ in 0..8 {
        clients.push(dialer.dial().await);
        conns.push(listener.accept().await.unwrap());
    }
    assert_eq!(listener.active_connections(), 8);

    conns.truncate(3);
    assert_eq!(listener.active_connections(), 3);

    listener.set_limits(2048, 4096).unwrap();
    for conn in &conns {
        assert_eq!(conn.current_limits(), Limits::new(2048, 4096));
    }

    drop(conns);
    assert!(listener.registry().is_empty());
}
