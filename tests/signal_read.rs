//! Integration tests for readable channels
//!
//! Analog inputs read through `GetFreeRun`; motor-backed signals read the raw
//! motor position and turn writes into moves.

use bcs_bridge::prelude::*;
use bcs_bridge::transport::mock::MockBcsServer;
use bcs_bridge::transport::{commands, TransportFactory};
use std::sync::Arc;

async fn signal(server: &MockBcsServer, descriptor: DeviceDescriptor) -> Signal {
    let bridge = tokio::task::spawn_blocking(Bridge::start)
        .await
        .unwrap()
        .unwrap();
    let endpoint = Endpoint::default();
    let connection = Connection::open(
        endpoint.clone(),
        server.create(&endpoint),
        bridge,
        Duration::from_millis(200),
    );
    let settings = MotionSettings {
        poll_interval: Duration::from_millis(10),
        default_move_timeout: Some(Duration::from_secs(2)),
    };
    Signal::new(descriptor, Arc::new(connection), settings)
}

fn analog_input() -> DeviceDescriptor {
    DeviceDescriptor::new("i0", ItemType::AnalogInput)
        .with_original_name("AI 0")
        .with_units("V")
}

// =============================================================================
// Analog inputs
// =============================================================================

#[tokio::test]
async fn test_analog_get_and_read() {
    let server = MockBcsServer::new();
    server.set_channel("AI 0", 1.25);
    let signal = signal(&server, analog_input()).await;

    assert_eq!(signal.get().await.unwrap(), 1.25);

    server.set_channel("AI 0", 1.5);
    let reading = signal.read().await.unwrap();
    assert_eq!(reading.len(), 1);
    assert_eq!(reading["i0"].value, 1.5);
    assert!(reading["i0"].timestamp > 0.0);

    let requests = server.requests();
    let reads: Vec<_> = requests
        .iter()
        .filter(|r| r.command() == commands::GET_FREE_RUN)
        .collect();
    assert_eq!(reads.len(), 2);
    assert_eq!(reads[0].target_names(), ["AI 0"]);
}

#[tokio::test]
async fn test_analog_describe() {
    let server = MockBcsServer::new();
    let signal = signal(&server, analog_input()).await;

    let description = signal.describe();
    assert_eq!(description["i0"].source, "BCS:AI 0");
    assert_eq!(description["i0"].units, "V");
    assert!(server.requests().is_empty());
}

#[tokio::test]
async fn test_remote_failure() {
    let server = MockBcsServer::new();
    server.set_channel("AI 0", 1.0);
    server.fail_next(commands::GET_FREE_RUN, "DAQ busy");
    let signal = signal(&server, analog_input()).await;

    match signal.get().await.unwrap_err() {
        BridgeError::Remote {
            target,
            command,
            description,
        } => {
            assert_eq!(target, "AI 0");
            assert_eq!(command, commands::GET_FREE_RUN);
            assert_eq!(description, "DAQ busy");
        }
        other => panic!("expected Remote, got {other:?}"),
    }

    // The failure is not sticky
    assert_eq!(signal.get().await.unwrap(), 1.0);
}

#[tokio::test]
async fn test_unknown_channel_is_not_found() {
    let server = MockBcsServer::new();
    let signal = signal(&server, analog_input()).await;

    let err = signal.get().await.unwrap_err();
    assert!(matches!(err, BridgeError::NotFound { ref target } if target == "AI 0"));
}

#[tokio::test]
async fn test_empty_data_is_no_data() {
    let server = MockBcsServer::new();
    server.add_empty_channel("AI 0");
    let signal = signal(&server, analog_input()).await;

    let err = signal.get().await.unwrap_err();
    assert!(matches!(err, BridgeError::NoData { .. }));
    assert_eq!(err.kind(), "no_data");
}

#[tokio::test]
async fn test_analog_set_is_unsupported() {
    let server = MockBcsServer::new();
    server.set_channel("AI 0", 1.0);
    let signal = signal(&server, analog_input()).await;

    assert!(matches!(
        signal.set(2.0).await,
        Err(BridgeError::Unsupported { .. })
    ));
    assert!(server.requests().is_empty());
}

// =============================================================================
// Motor-backed signals
// =============================================================================

#[tokio::test]
async fn test_motor_signal_get_and_set() {
    let server = MockBcsServer::new();
    server.add_motor("Motor3", 2.0);
    server.set_completion_polls("Motor3", 1);
    let descriptor = DeviceDescriptor::new("m3", ItemType::Motor)
        .with_original_name("Motor3")
        .with_units("mm");
    let signal = signal(&server, descriptor).await;

    assert_eq!(signal.get().await.unwrap(), 2.0);
    assert_eq!(server.call_count(commands::GET_MOTOR_FULL), 1);

    let status = signal.set(5.0).await.unwrap();
    status.wait().await.unwrap();
    assert!(status.success());
    assert_eq!(signal.get().await.unwrap(), 5.0);
    assert_eq!(signal.motor().map(|m| m.get()), Some(5.0));
    assert_eq!(server.call_count(commands::MOVE_MOTOR), 1);
}

#[test]
fn test_blocking_reads_from_plain_thread() {
    let server = MockBcsServer::new();
    server.set_channel("AI 0", 0.75);
    let endpoint = Endpoint::default();
    let connection = Connection::open(
        endpoint.clone(),
        server.create(&endpoint),
        Bridge::start().unwrap(),
        Duration::from_millis(200),
    );
    let signal = Signal::new(
        analog_input(),
        Arc::new(connection),
        MotionSettings::default(),
    );

    let worker = {
        let signal = signal.clone();
        std::thread::spawn(move || signal.read_blocking())
    };
    let reading = worker.join().unwrap().unwrap();
    assert_eq!(reading["i0"].value, 0.75);
    assert_eq!(signal.get_blocking().unwrap(), 0.75);
}
