//! BCS motor.
//!
//! A move is a command RPC followed by status polling:
//!
//! 1. `MoveMotor` is sent. If the server rejects it (`success=false`, the
//!    motor in `not_found` or `timed_out`) or the RPC itself fails, the move
//!    handle settles immediately and no polling happens.
//! 2. Otherwise a monitor task on the bridge polls `GetMotorFull` every
//!    `poll_interval`, caching each observed position, until the motor
//!    reports `Move Complete`, the deadline passes, or a poll fails.
//!
//! Both steps run as one task on the bridge. `move_to` returns once the
//! command step is over, so a rejected move comes back already settled, and
//! dropping the `move_to` future never strands a half-started move.
//!
//! Every RPC of a move races the move deadline. When the deadline wins the
//! move settles as timed out at once and the late reply is discarded.
//!
//! `stop()` sends one `StopMotor` and clears `is_moving`. It does not settle
//! the pending handle; the monitor settles it when the server reports the
//! motor has come to rest.

use crate::bridge::Connection;
use crate::error::{BridgeError, Result};
use crate::hardware::capabilities::{
    Describable, Description, DescriptionMap, Movable, Readable, ReadingMap,
};
use crate::hardware::descriptor::DeviceDescriptor;
use crate::hardware::expect_data;
use crate::hardware::motion::{MoveOperation, MoveOutcome, MoveStatus};
use crate::transport::{commands, Request, Response};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

/// Default status polling interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Motion monitoring parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionSettings {
    /// Time between status polls
    pub poll_interval: Duration,
    /// Deadline applied when `move_to` is given none; `None` waits forever
    pub default_move_timeout: Option<Duration>,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            default_move_timeout: None,
        }
    }
}

/// One `GetMotorFull` status record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotorSnapshot {
    /// Raw motor position, when the record carried one
    pub position: Option<f64>,
    /// `Motor State / Move Complete`; absent reads as not complete
    pub move_complete: bool,
}

impl MotorSnapshot {
    /// Parse a status record for `target`.
    pub fn parse(target: &str, record: &Value) -> Result<Self> {
        let Some(fields) = record.as_object() else {
            return Err(BridgeError::InvalidResponse {
                target: target.to_string(),
                message: format!("motor status is not an object: {record}"),
            });
        };
        Ok(Self {
            position: fields.get(commands::RAW_MOTOR_POSITION).and_then(Value::as_f64),
            move_complete: fields
                .get(commands::MOTOR_STATE)
                .and_then(|state| state.get(commands::MOVE_COMPLETE))
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }
}

struct MotorShared {
    descriptor: DeviceDescriptor,
    connection: Arc<Connection>,
    settings: MotionSettings,
    position: Mutex<f64>,
    is_moving: AtomicBool,
    active: Mutex<Option<Arc<MoveOperation>>>,
}

/// A positionable BCS motor. Clones share state.
#[derive(Clone)]
pub struct Motor {
    shared: Arc<MotorShared>,
}

impl Motor {
    /// Motor described by `descriptor`, talking over `connection`.
    pub fn new(
        descriptor: DeviceDescriptor,
        connection: Arc<Connection>,
        settings: MotionSettings,
    ) -> Self {
        Self {
            shared: Arc::new(MotorShared {
                descriptor,
                connection,
                settings,
                position: Mutex::new(0.0),
                is_moving: AtomicBool::new(false),
                active: Mutex::new(None),
            }),
        }
    }

    /// Descriptor the motor was built from.
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.shared.descriptor
    }

    /// Connection the motor talks over.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.shared.connection
    }

    /// Motion monitoring parameters.
    pub fn settings(&self) -> MotionSettings {
        self.shared.settings
    }

    /// Last observed position, from an explicit read or the most recent
    /// monitor poll. Never performs I/O.
    pub fn get(&self) -> f64 {
        *self.shared.position.lock()
    }

    /// Handle of the current (or most recent) move.
    pub fn active_move(&self) -> Option<MoveStatus> {
        self.shared
            .active
            .lock()
            .as_ref()
            .map(|op| MoveStatus::new(Arc::clone(op), self.shared.connection.bridge().clone()))
    }

    /// Command a move to `target` and return its handle once the server has
    /// answered the move command.
    ///
    /// `timeout` bounds the whole move; `None` falls back to
    /// `default_move_timeout`. Fails only when a previous move is still
    /// pending. A rejected command comes back as an already settled handle;
    /// an accepted one keeps being monitored on the bridge.
    pub async fn start_move(&self, target: f64, timeout: Option<Duration>) -> Result<MoveStatus> {
        let shared = &self.shared;
        let name = &shared.descriptor.name;
        let timeout = timeout.or(shared.settings.default_move_timeout);
        let operation = Arc::new(MoveOperation::new(name.clone(), target, timeout));

        {
            let mut active = shared.active.lock();
            if active.as_ref().is_some_and(|op| !op.is_settled()) {
                warn!(device = %name, goal = target, "move rejected: previous move still pending");
                return Err(BridgeError::MoveInProgress {
                    target: name.clone(),
                });
            }
            *active = Some(Arc::clone(&operation));
        }
        shared.is_moving.store(true, Ordering::Release);

        info!(device = %name, goal = target, ?timeout, "starting move");
        let bridge = shared.connection.bridge();
        let (commanded, answered) = oneshot::channel();
        bridge.spawn(drive(Arc::clone(shared), Arc::clone(&operation), commanded));
        if answered.await.is_err() {
            shared.finish(
                &operation,
                Some(MoveOutcome::Failed(BridgeError::Runtime(
                    "bridge stopped before the move was commanded".into(),
                ))),
            );
        }
        Ok(MoveStatus::new(operation, bridge.clone()))
    }

    /// Issue one status query, updating the cached position.
    #[instrument(skip(self), fields(device = %self.shared.descriptor.name), err)]
    pub async fn query(&self) -> Result<MotorSnapshot> {
        let snapshot = self.shared.query().await?;
        if let Some(position) = snapshot.position {
            *self.shared.position.lock() = position;
        }
        Ok(snapshot)
    }

    /// Ask the server to halt the motor.
    ///
    /// Sends exactly one `StopMotor` and clears `is_moving`, whether or not a
    /// move is pending. A pending handle is left to the monitor.
    #[instrument(skip(self), fields(device = %self.shared.descriptor.name), err)]
    pub async fn halt(&self) -> Result<()> {
        let shared = &self.shared;
        let target = shared.descriptor.original_name.as_str();
        let result = shared
            .connection
            .call(Request::stop_motor(&[target]), shared.descriptor.timeout)
            .await;
        shared.is_moving.store(false, Ordering::Release);

        let response = result?;
        if !response.success() {
            return Err(BridgeError::Remote {
                target: target.to_string(),
                command: commands::STOP_MOTOR.into(),
                description: response.error_description(),
            });
        }
        if response.not_found().iter().any(|n| n == target) {
            return Err(BridgeError::NotFound {
                target: target.to_string(),
            });
        }
        info!("stop requested");
        Ok(())
    }

    // =========================================================================
    // Blocking API
    // =========================================================================

    /// Start a move and, when `wait` is set, block until it settles.
    ///
    /// With `wait`, a settlement failure is returned as the error; the handle
    /// is returned either way on success.
    pub fn move_blocking(
        &self,
        target: f64,
        timeout: Option<Duration>,
        wait: bool,
    ) -> Result<MoveStatus> {
        let motor = self.clone();
        let status =
            self.bridge_block_on(async move { motor.start_move(target, timeout).await })?;
        if wait {
            status.wait_blocking()?;
        }
        Ok(status)
    }

    /// Move to `value` and block until settled, using the default deadline.
    pub fn set(&self, value: f64) -> Result<MoveStatus> {
        self.move_blocking(value, None, true)
    }

    /// Blocking [`halt`](Motor::halt).
    pub fn stop_blocking(&self) -> Result<()> {
        let motor = self.clone();
        self.bridge_block_on(async move { motor.halt().await })
    }

    /// Blocking [`Readable::read`].
    pub fn read_blocking(&self) -> Result<ReadingMap> {
        let motor = self.clone();
        self.bridge_block_on(async move { motor.read().await })
    }

    /// Blocking [`Readable::fetch`].
    pub fn fetch_blocking(&self) -> Result<f64> {
        let motor = self.clone();
        self.bridge_block_on(async move { motor.fetch().await })
    }

    fn bridge_block_on<F, T>(&self, future: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.shared.connection.bridge().block_on(future)
    }
}

impl MotorShared {
    async fn query(&self) -> Result<MotorSnapshot> {
        let target = self.descriptor.original_name.as_str();
        let response = self
            .connection
            .call(Request::get_motor_full(&[target]), self.descriptor.timeout)
            .await?;
        let data = expect_data(target, commands::GET_MOTOR_FULL, &response)?;
        MotorSnapshot::parse(target, &data[0])
    }

    fn check_move_reply(&self, response: &Response) -> Result<()> {
        let target = &self.descriptor.original_name;
        if !response.success() {
            return Err(BridgeError::Remote {
                target: target.clone(),
                command: commands::MOVE_MOTOR.into(),
                description: response.error_description(),
            });
        }
        if response.not_found().iter().any(|n| n == target) {
            return Err(BridgeError::NotFound {
                target: target.clone(),
            });
        }
        if response.timed_out().iter().any(|n| n == target) {
            return Err(BridgeError::Timeout {
                context: format!("server reported {} timed out for '{target}'", commands::MOVE_MOTOR),
                waited: self.descriptor.timeout,
            });
        }
        Ok(())
    }

    /// Clear `is_moving` if `operation` is still the active move, then settle.
    fn finish(&self, operation: &Arc<MoveOperation>, outcome: Option<MoveOutcome>) {
        {
            let active = self.active.lock();
            if active.as_ref().is_some_and(|op| Arc::ptr_eq(op, operation)) {
                self.is_moving.store(false, Ordering::Release);
            }
        }
        if let Some(outcome) = outcome {
            if operation.settle(outcome.clone()) {
                match outcome {
                    MoveOutcome::Succeeded => info!(
                        device = %self.descriptor.name,
                        elapsed_ms = operation.elapsed().as_millis() as u64,
                        "move complete"
                    ),
                    MoveOutcome::TimedOut(error) | MoveOutcome::Failed(error) => warn!(
                        device = %self.descriptor.name,
                        kind = error.kind(),
                        %error,
                        "move did not succeed"
                    ),
                    MoveOutcome::Pending => {}
                }
            }
        }
    }

    /// Settle `operation` as timed out by its own deadline.
    fn expire(&self, operation: &Arc<MoveOperation>) {
        let error = BridgeError::Timeout {
            context: format!(
                "move of '{}' to {} did not complete",
                self.descriptor.name,
                operation.target()
            ),
            waited: operation.elapsed(),
        };
        self.finish(operation, Some(MoveOutcome::TimedOut(error)));
    }
}

/// Run `rpc` unless the move deadline passes first; `None` means it passed.
async fn before_deadline<T>(
    operation: &MoveOperation,
    rpc: impl Future<Output = Result<T>>,
) -> Option<Result<T>> {
    let Some(deadline) = operation.deadline() else {
        return Some(rpc.await);
    };
    tokio::select! {
        result = rpc => Some(result),
        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => None,
    }
}

/// Command the move, report back through `commanded`, then monitor the move
/// to settlement.
async fn drive(
    shared: Arc<MotorShared>,
    operation: Arc<MoveOperation>,
    commanded: oneshot::Sender<()>,
) {
    let target = shared.descriptor.original_name.as_str();
    let request = Request::move_motor(&[target], &[operation.target()]);
    let reply = before_deadline(
        &operation,
        shared.connection.call(request, shared.descriptor.timeout),
    )
    .await;

    let accepted = match reply {
        None => {
            shared.expire(&operation);
            false
        }
        Some(reply) => match reply.and_then(|response| shared.check_move_reply(&response)) {
            Ok(()) => true,
            Err(error) => {
                shared.finish(&operation, Some(MoveOutcome::from_error(error)));
                false
            }
        },
    };
    // The caller may have stopped waiting.
    let _ = commanded.send(());
    if !accepted {
        return;
    }
    debug!(device = %shared.descriptor.name, "move accepted, monitoring");

    loop {
        if operation.is_settled() {
            debug!(device = %shared.descriptor.name, "move abandoned, monitor exiting");
            shared.finish(&operation, None);
            return;
        }
        if operation.is_expired(Instant::now()) {
            shared.expire(&operation);
            return;
        }

        let Some(polled) = before_deadline(&operation, shared.query()).await else {
            shared.expire(&operation);
            return;
        };
        match polled {
            Ok(snapshot) => {
                operation.observe(snapshot.position, snapshot.move_complete);
                if let Some(position) = snapshot.position {
                    *shared.position.lock() = position;
                }
                if snapshot.move_complete {
                    shared.finish(&operation, Some(MoveOutcome::Succeeded));
                    return;
                }
            }
            Err(error) => {
                shared.finish(&operation, Some(MoveOutcome::Failed(error)));
                return;
            }
        }

        let next_poll = Instant::now() + shared.settings.poll_interval;
        let wake = operation
            .deadline()
            .map_or(next_poll, |deadline| deadline.min(next_poll));
        tokio::time::sleep_until(tokio::time::Instant::from_std(wake)).await;
    }
}

#[async_trait]
impl Movable for Motor {
    async fn move_to(&self, target: f64, timeout: Option<Duration>) -> Result<MoveStatus> {
        self.start_move(target, timeout).await
    }

    async fn stop(&self) -> Result<()> {
        self.halt().await
    }

    fn position(&self) -> f64 {
        self.get()
    }

    fn is_moving(&self) -> bool {
        self.shared.is_moving.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Readable for Motor {
    fn name(&self) -> &str {
        &self.shared.descriptor.name
    }

    async fn fetch(&self) -> Result<f64> {
        let snapshot = self.query().await?;
        Ok(snapshot.position.unwrap_or_else(|| self.get()))
    }
}

impl Describable for Motor {
    fn describe(&self) -> DescriptionMap {
        let descriptor = &self.shared.descriptor;
        let mut description = DescriptionMap::new();
        description.insert(
            descriptor.name.clone(),
            Description {
                source: descriptor.source(),
                dtype: "number".into(),
                shape: vec![],
                units: descriptor.units.clone(),
            },
        );
        description
    }
}

impl std::fmt::Debug for Motor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Motor")
            .field("name", &self.shared.descriptor.name)
            .field("position", &self.get())
            .field("is_moving", &self.is_moving())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snapshot_parsing() {
        let record = json!({
            "Motor State": {"Move Complete": true},
            "Raw Motor Position": 42.0,
        });
        let snapshot = MotorSnapshot::parse("Motor3", &record).unwrap();
        assert_eq!(snapshot.position, Some(42.0));
        assert!(snapshot.move_complete);

        let partial = MotorSnapshot::parse("Motor3", &json!({})).unwrap();
        assert_eq!(partial.position, None);
        assert!(!partial.move_complete);

        assert!(MotorSnapshot::parse("Motor3", &json!(3.0)).is_err());
    }

    #[test]
    fn default_settings() {
        let settings = MotionSettings::default();
        assert_eq!(settings.poll_interval, Duration::from_millis(100));
        assert_eq!(settings.default_move_timeout, None);
    }
}
