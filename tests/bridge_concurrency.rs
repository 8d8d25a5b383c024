//! Concurrency tests for the bridge, connection actor and pool
//!
//! Many callers share one connection; the server must never see two
//! requests in flight, and every caller must get its own reply.

use bcs_bridge::prelude::*;
use bcs_bridge::transport::mock::MockBcsServer;
use bcs_bridge::transport::{commands, Request};
use std::sync::{Arc, Barrier};
use std::thread;

fn pool(server: &MockBcsServer) -> Arc<ConnectionPool> {
    Arc::new(ConnectionPool::new(
        Bridge::start().unwrap(),
        Arc::new(server.clone()),
        Duration::from_millis(500),
    ))
}

fn channel_signal(pool: &ConnectionPool, index: usize) -> Signal {
    let descriptor = DeviceDescriptor::new(format!("ch{index}"), ItemType::AnalogInput)
        .with_original_name(format!("AI {index}"))
        .with_timeout(Duration::from_secs(5));
    Signal::new(
        descriptor,
        pool.get_or_open(&Endpoint::default()),
        MotionSettings::default(),
    )
}

// =============================================================================
// Serialization
// =============================================================================

#[test]
fn test_threads_share_one_connection_without_interleaving() {
    const THREADS: usize = 8;
    const READS: usize = 5;

    let server = MockBcsServer::new();
    server.set_latency(Duration::from_millis(2));
    for i in 0..THREADS {
        server.set_channel(&format!("AI {i}"), i as f64);
    }
    let pool = pool(&server);
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|i| {
            let signal = channel_signal(&pool, i);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..READS {
                    let value = signal.get_blocking().unwrap();
                    assert_eq!(value, i as f64, "thread {i} got another caller's reply");
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(server.max_in_flight(), 1);
    assert_eq!(server.call_count(commands::GET_FREE_RUN), THREADS * READS);
    assert_eq!(server.connect_attempts(), 1);
}

#[tokio::test]
async fn test_requests_are_sent_in_submission_order() {
    let server = MockBcsServer::new();
    for i in 0..10 {
        server.set_channel(&format!("AI {i}"), i as f64);
    }
    let pool = tokio::task::spawn_blocking({
        let server = server.clone();
        move || pool(&server)
    })
    .await
    .unwrap();
    let connection = pool.get_or_open(&Endpoint::default());
    connection.ensure_connected().await.unwrap();

    let names: Vec<String> = (0..10).map(|i| format!("AI {i}")).collect();
    let calls = names.iter().map(|name| {
        connection.call(
            Request::get_free_run(&[name.as_str()]),
            Duration::from_secs(1),
        )
    });
    let replies = futures::future::join_all(calls).await;

    for (i, reply) in replies.into_iter().enumerate() {
        let reply = reply.unwrap();
        assert_eq!(reply.data()[0], serde_json::json!(i as f64));
    }
    let sent: Vec<String> = server
        .requests()
        .iter()
        .filter(|r| r.command() == commands::GET_FREE_RUN)
        .map(|r| r.target_names()[0].clone())
        .collect();
    assert_eq!(sent, names);
}

#[tokio::test]
async fn test_request_expiring_in_queue_is_never_sent() {
    let server = MockBcsServer::new();
    server.set_channel("AI 0", 1.0);
    server.set_channel("AI 1", 2.0);
    let pool = tokio::task::spawn_blocking({
        let server = server.clone();
        move || pool(&server)
    })
    .await
    .unwrap();
    let connection = pool.get_or_open(&Endpoint::default());
    connection.ensure_connected().await.unwrap();
    server.set_latency(Duration::from_millis(100));

    let (slow, starved) = tokio::join!(
        connection.call(Request::get_free_run(&["AI 0"]), Duration::from_secs(1)),
        connection.call(Request::get_free_run(&["AI 1"]), Duration::from_millis(20)),
    );

    assert!(slow.unwrap().success());
    assert!(matches!(starved, Err(BridgeError::Timeout { .. })));
    assert_eq!(server.call_count(commands::GET_FREE_RUN), 1);
    assert_eq!(connection.state(), ConnectionState::Connected);
}

// =============================================================================
// Connection establishment
// =============================================================================

#[test]
fn test_concurrent_ensure_connected_makes_one_attempt() {
    const THREADS: usize = 6;

    let server = MockBcsServer::new();
    server.set_connect_delay(Duration::from_millis(50));
    let pool = pool(&server);
    let connection = pool.get_or_open(&Endpoint::default());
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let connection = Arc::clone(&connection);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                connection.ensure_connected_blocking()
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap().unwrap();
    }

    assert_eq!(server.connect_attempts(), 1);
    assert_eq!(connection.state(), ConnectionState::Connected);
}

#[test]
fn test_unreachable_server_then_recovery() {
    let server = MockBcsServer::new();
    server.set_reachable(false);
    server.set_channel("AI 0", 4.0);
    let pool = pool(&server);
    let signal = channel_signal(&pool, 0);

    let err = signal.get_blocking().unwrap_err();
    assert!(matches!(err, BridgeError::Connection { .. }));
    assert_eq!(signal.connection().state(), ConnectionState::Faulted);

    server.set_reachable(true);
    assert_eq!(signal.get_blocking().unwrap(), 4.0);
    assert_eq!(signal.connection().state(), ConnectionState::Connected);
    assert_eq!(server.connect_attempts(), 2);
}

// =============================================================================
// Reentrancy
// =============================================================================

#[tokio::test]
async fn test_blocking_call_inside_runtime_is_refused() {
    let server = MockBcsServer::new();
    server.set_channel("AI 0", 1.0);
    let pool = tokio::task::spawn_blocking({
        let server = server.clone();
        move || pool(&server)
    })
    .await
    .unwrap();
    let signal = channel_signal(&pool, 0);

    assert!(matches!(signal.get_blocking(), Err(BridgeError::Reentrant)));
    assert!(server.requests().is_empty());

    // The async form works from the same context
    assert_eq!(signal.get().await.unwrap(), 1.0);
}

#[test]
fn test_blocking_call_on_bridge_thread_is_refused() {
    let server = MockBcsServer::new();
    server.set_channel("AI 0", 1.0);
    let pool = pool(&server);
    let signal = channel_signal(&pool, 0);

    let nested = {
        let signal = signal.clone();
        pool.bridge()
            .block_on(async move { Ok(signal.get_blocking()) })
            .unwrap()
    };
    assert!(matches!(nested, Err(BridgeError::Reentrant)));
    assert_eq!(signal.get_blocking().unwrap(), 1.0);
}

// =============================================================================
// Pool
// =============================================================================

#[test]
fn test_pool_shared_across_threads() {
    let server = MockBcsServer::new();
    let pool = pool(&server);

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.get_or_open(&Endpoint::new("10.0.0.9", 5577)))
        })
        .collect();
    let connections: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    for connection in &connections[1..] {
        assert!(Arc::ptr_eq(&connections[0], connection));
    }
    assert_eq!(pool.len(), 1);
    assert_eq!(server.connect_attempts(), 0);
}
