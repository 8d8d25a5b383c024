//! Simulated BCS server.
//!
//! Provides an in-process stand-in for the LabVIEW server so the bridge and
//! devices can be exercised without hardware. All waiting uses
//! `tokio::time::sleep`, never `std::thread::sleep`.
//!
//! # Simulated behavior
//!
//! - Motors accept `MoveMotor`, then report `Move Complete = false` for a
//!   configurable number of `GetMotorFull` polls before snapping to the goal.
//! - Analog channels return a fixed value from `GetFreeRun`, or no data.
//! - Unknown names come back in `not_found`.
//! - Failures can be scripted per command (`success = false`), moves can be
//!   made to report `timed_out`, and the server can be made unreachable or
//!   unresponsive.
//!
//! Every request is logged, and the server tracks how many requests it was
//! handling at once so tests can check that callers never interleave.
//!
//! The same state can be served through the in-process [`MockTransport`] or
//! over a real ZeroMQ REP socket with [`MockBcsServer::serve_zmq`].

use super::message::commands;
use super::{Endpoint, Request, Response, Transport, TransportFactory};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, trace};
use zeromq::{RepSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

// =============================================================================
// Server state
// =============================================================================

#[derive(Debug, Clone)]
struct SimMotor {
    position: f64,
    goal: f64,
    moving: bool,
    completion_polls: u32,
    polls_remaining: u32,
    stalled: bool,
}

impl SimMotor {
    fn new(position: f64) -> Self {
        Self {
            position,
            goal: position,
            moving: false,
            completion_polls: 0,
            polls_remaining: 0,
            stalled: false,
        }
    }

    fn start(&mut self, goal: f64) {
        self.goal = goal;
        self.moving = true;
        self.polls_remaining = self.completion_polls;
    }

    /// Advance by one status poll and return the status record.
    fn poll(&mut self) -> Value {
        if self.moving && !self.stalled {
            if self.polls_remaining == 0 {
                self.position = self.goal;
                self.moving = false;
            } else {
                let steps = f64::from(self.polls_remaining) + 1.0;
                self.position += (self.goal - self.position) / steps;
                self.polls_remaining -= 1;
            }
        }
        json!({
            commands::MOTOR_STATE: { commands::MOVE_COMPLETE: !self.moving },
            commands::RAW_MOTOR_POSITION: self.position,
        })
    }
}

#[derive(Debug, Default)]
struct ServerState {
    motors: HashMap<String, SimMotor>,
    channels: HashMap<String, Option<f64>>,
    scripted_failures: HashMap<String, VecDeque<String>>,
    move_timeouts: HashSet<String>,
    latency: Duration,
    connect_delay: Duration,
    unreachable: bool,
    unresponsive: bool,
    connect_attempts: usize,
    log: Vec<Request>,
    in_flight: usize,
    max_in_flight: usize,
}

impl ServerState {
    fn respond(&mut self, request: &Request) -> Response {
        if let Some(description) = self
            .scripted_failures
            .get_mut(request.command())
            .and_then(VecDeque::pop_front)
        {
            return Response::failure(description);
        }

        let names = request.target_names();
        match request.command() {
            commands::TEST_CONNECTION => Response::ok(),
            commands::GET_FREE_RUN => {
                let mut data = Vec::new();
                let mut not_found = Vec::new();
                for name in names {
                    match self.channels.get(name) {
                        Some(Some(value)) => data.push(json!(value)),
                        Some(None) => {}
                        None => not_found.push(name.clone()),
                    }
                }
                Response::ok().with_data(data).with_not_found(not_found)
            }
            commands::GET_MOTOR_FULL => {
                let mut data = Vec::new();
                let mut not_found = Vec::new();
                for name in names {
                    match self.motors.get_mut(name) {
                        Some(motor) => data.push(motor.poll()),
                        None => not_found.push(name.clone()),
                    }
                }
                Response::ok().with_data(data).with_not_found(not_found)
            }
            commands::MOVE_MOTOR => {
                let goals: Vec<f64> = request
                    .args()
                    .get(commands::ARG_GOALS)
                    .and_then(Value::as_array)
                    .map(|goals| goals.iter().filter_map(Value::as_f64).collect())
                    .unwrap_or_default();
                if goals.len() != names.len() {
                    return Response::failure("motors and goals differ in length");
                }
                let mut not_found = Vec::new();
                let mut timed_out = Vec::new();
                for (name, goal) in names.iter().zip(goals) {
                    if self.move_timeouts.contains(name) {
                        timed_out.push(name.clone());
                        continue;
                    }
                    match self.motors.get_mut(name) {
                        Some(motor) => motor.start(goal),
                        None => not_found.push(name.clone()),
                    }
                }
                Response::ok()
                    .with_not_found(not_found)
                    .with_timed_out(timed_out)
            }
            commands::STOP_MOTOR => {
                let mut not_found = Vec::new();
                for name in names {
                    match self.motors.get_mut(name) {
                        Some(motor) => motor.moving = false,
                        None => not_found.push(name.clone()),
                    }
                }
                Response::ok().with_not_found(not_found)
            }
            other => Response::failure(format!("Unknown command '{other}'")),
        }
    }
}

// Decrements the in-flight count even when the caller gives up mid-request.
struct InFlight(Arc<Mutex<ServerState>>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.lock().in_flight -= 1;
    }
}

// =============================================================================
// MockBcsServer
// =============================================================================

/// Shared handle to a simulated server. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct MockBcsServer {
    state: Arc<Mutex<ServerState>>,
}

impl MockBcsServer {
    /// Empty server with no devices, no latency, and reachable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a motor at `position` that completes on the first poll after a move.
    pub fn add_motor(&self, name: &str, position: f64) {
        self.state
            .lock()
            .motors
            .insert(name.to_string(), SimMotor::new(position));
    }

    /// Number of `GetMotorFull` polls reporting incomplete before a move finishes.
    pub fn set_completion_polls(&self, name: &str, polls: u32) {
        if let Some(motor) = self.state.lock().motors.get_mut(name) {
            motor.completion_polls = polls;
        }
    }

    /// Make a motor accept moves but never complete them.
    pub fn stall_motor(&self, name: &str) {
        if let Some(motor) = self.state.lock().motors.get_mut(name) {
            motor.stalled = true;
        }
    }

    /// Report `name` in `timed_out` for every `MoveMotor`.
    pub fn time_out_moves(&self, name: &str) {
        self.state.lock().move_timeouts.insert(name.to_string());
    }

    /// Add or update an analog channel.
    pub fn set_channel(&self, name: &str, value: f64) {
        self.state
            .lock()
            .channels
            .insert(name.to_string(), Some(value));
    }

    /// Add a channel the server knows about but returns no data for.
    pub fn add_empty_channel(&self, name: &str) {
        self.state.lock().channels.insert(name.to_string(), None);
    }

    /// Answer the next `command` with `success = false`.
    pub fn fail_next(&self, command: &str, description: &str) {
        self.state
            .lock()
            .scripted_failures
            .entry(command.to_string())
            .or_default()
            .push_back(description.to_string());
    }

    /// Delay applied to every request.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Delay applied to every connection attempt.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = delay;
    }

    /// Refuse connection attempts.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unreachable = !reachable;
    }

    /// Accept requests but never answer them.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.state.lock().unresponsive = unresponsive;
    }

    /// Current simulated position of a motor.
    pub fn motor_position(&self, name: &str) -> Option<f64> {
        self.state.lock().motors.get(name).map(|m| m.position)
    }

    /// Whether the simulated motor is still moving.
    pub fn motor_moving(&self, name: &str) -> Option<bool> {
        self.state.lock().motors.get(name).map(|m| m.moving)
    }

    /// Connection attempts seen so far.
    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    /// How many requests with this command were received.
    pub fn call_count(&self, command: &str) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|r| r.command() == command)
            .count()
    }

    /// Every request received, in arrival order.
    pub fn requests(&self) -> Vec<Request> {
        self.state.lock().log.clone()
    }

    /// Highest number of requests handled concurrently.
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().max_in_flight
    }

    /// Handle one request as the server would.
    pub async fn handle(&self, request: &Request) -> Response {
        let (latency, unresponsive) = {
            let mut state = self.state.lock();
            state.log.push(request.clone());
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            (state.latency, state.unresponsive)
        };
        let _guard = InFlight(Arc::clone(&self.state));
        trace!(request = %request, "mock server received");

        if unresponsive {
            std::future::pending::<()>().await;
        }
        if !latency.is_zero() {
            sleep(latency).await;
        }
        // Release the state lock before `_guard` drops and takes it again.
        let mut state = self.state.lock();
        let response = state.respond(request);
        drop(state);
        response
    }

    /// Serve this state on a ZeroMQ REP socket bound to `address` until the
    /// socket fails.
    pub async fn serve_zmq(self, address: String) -> Result<()> {
        let socket_error = |e: zeromq::ZmqError| BridgeError::Connection {
            endpoint: address.clone(),
            message: e.to_string(),
        };

        let mut socket = RepSocket::new();
        socket.bind(&address).await.map_err(socket_error)?;
        debug!(%address, "mock server listening");

        loop {
            let message = socket.recv().await.map_err(socket_error)?;
            let reply = match message.get(0).map(|frame| Request::decode(frame)) {
                Some(Ok(request)) => self.handle(&request).await,
                Some(Err(e)) => Response::failure(e.to_string()),
                None => Response::failure("empty request"),
            };
            socket
                .send(ZmqMessage::from(reply.encode()?))
                .await
                .map_err(socket_error)?;
        }
    }

    fn begin_connect(&self) -> (Duration, bool) {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        (state.connect_delay, state.unreachable)
    }
}

impl TransportFactory for MockBcsServer {
    fn create(&self, _endpoint: &Endpoint) -> Box<dyn Transport> {
        Box::new(MockTransport::new(self.clone()))
    }
}

// =============================================================================
// MockTransport
// =============================================================================

/// In-process transport talking to a [`MockBcsServer`].
pub struct MockTransport {
    server: MockBcsServer,
    endpoint: Option<Endpoint>,
}

impl MockTransport {
    /// Unconnected transport for `server`.
    pub fn new(server: MockBcsServer) -> Self {
        Self {
            server,
            endpoint: None,
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self, endpoint: &Endpoint, connect_timeout: Duration) -> Result<()> {
        self.endpoint = None;
        let (delay, unreachable) = self.server.begin_connect();

        let attempt = async {
            sleep(delay).await;
            if unreachable {
                return Err(endpoint.connection_error("connection refused"));
            }
            self.server.handle(&Request::test_connection()).await;
            Ok(())
        };
        match timeout(connect_timeout, attempt).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(endpoint.connection_error(format!(
                    "server did not answer within {connect_timeout:?}"
                )))
            }
        }
        self.endpoint = Some(endpoint.clone());
        Ok(())
    }

    async fn call(&mut self, request: &Request, call_timeout: Duration) -> Result<Response> {
        let Some(endpoint) = self.endpoint.clone() else {
            return Err(BridgeError::Connection {
                endpoint: "<unconnected>".into(),
                message: "not connected".into(),
            });
        };
        match timeout(call_timeout, self.server.handle(request)).await {
            Ok(response) => Ok(response),
            Err(_) => {
                self.endpoint = None;
                debug!(%endpoint, request = %request, "mock reply timed out");
                Err(BridgeError::Timeout {
                    context: request.to_string(),
                    waited: call_timeout,
                })
            }
        }
    }

    async fn disconnect(&mut self) {
        self.endpoint = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn motor_completes_after_configured_polls() {
        let server = MockBcsServer::new();
        server.add_motor("Motor3", 0.0);
        server.set_completion_polls("Motor3", 2);

        let reply = server.handle(&Request::move_motor(&["Motor3"], &[10.0])).await;
        assert!(reply.success());

        let poll = Request::get_motor_full(&["Motor3"]);
        for _ in 0..2 {
            let reply = server.handle(&poll).await;
            assert_eq!(reply.data()[0][commands::MOTOR_STATE][commands::MOVE_COMPLETE], false);
        }
        let reply = server.handle(&poll).await;
        assert_eq!(reply.data()[0][commands::MOTOR_STATE][commands::MOVE_COMPLETE], true);
        assert_eq!(reply.data()[0][commands::RAW_MOTOR_POSITION], 10.0);
    }

    #[tokio::test]
    async fn consecutive_requests_are_answered() {
        let server = MockBcsServer::new();
        server.set_channel("AI 0", 0.5);
        let request = Request::get_free_run(&["AI 0"]);

        for _ in 0..2 {
            let reply = timeout(Duration::from_secs(1), server.handle(&request))
                .await
                .expect("server stopped answering");
            assert_eq!(reply.data(), [json!(0.5)]);
        }
        assert_eq!(server.call_count(commands::GET_FREE_RUN), 2);
        assert_eq!(server.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn unknown_names_are_reported_not_found() {
        let server = MockBcsServer::new();
        server.set_channel("AI 0", 1.25);

        let reply = server.handle(&Request::get_free_run(&["AI 0", "Ghost"])).await;
        assert!(reply.success());
        assert_eq!(reply.data().len(), 1);
        assert_eq!(reply.not_found(), ["Ghost"]);
    }

    #[tokio::test]
    async fn scripted_failure_applies_once() {
        let server = MockBcsServer::new();
        server.add_motor("Motor3", 0.0);
        server.fail_next(commands::MOVE_MOTOR, "Motor disabled");

        let request = Request::move_motor(&["Motor3"], &[1.0]);
        let first = server.handle(&request).await;
        assert!(!first.success());
        assert_eq!(first.error_description(), "Motor disabled");
        assert!(server.handle(&request).await.success());
    }

    #[tokio::test]
    async fn transport_requires_connect_and_honors_timeout() {
        let server = MockBcsServer::new();
        let mut transport = MockTransport::new(server.clone());
        let endpoint = Endpoint::default();
        let request = Request::test_connection();

        let err = transport.call(&request, Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, BridgeError::Connection { .. }));

        transport.connect(&endpoint, Duration::from_millis(100)).await.unwrap();
        assert_eq!(server.connect_attempts(), 1);

        server.set_unresponsive(true);
        let err = transport.call(&request, Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { .. }));
        assert_eq!(server.max_in_flight(), 1);

        // the timed-out transport must reconnect before it can be used again
        let err = transport.call(&request, Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, BridgeError::Connection { .. }));
    }

    #[tokio::test]
    async fn unreachable_server_refuses_connect() {
        let server = MockBcsServer::new();
        server.set_reachable(false);
        let mut transport = MockTransport::new(server);
        let err = transport
            .connect(&Endpoint::default(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Connection { .. }));
    }
}
