//! BCS readable channel.
//!
//! A `Signal` reads one scalar: an analog input through `GetFreeRun`, or a
//! motor's raw position through `GetMotorFull`. Writes are only meaningful for
//! motor-backed signals, where they start a move; analog inputs refuse them
//! before any request is sent.

use crate::bridge::Connection;
use crate::error::{BridgeError, Result};
use crate::hardware::capabilities::{Describable, Description, DescriptionMap, Readable, ReadingMap};
use crate::hardware::descriptor::{DeviceDescriptor, ItemType};
use crate::hardware::expect_data;
use crate::hardware::motion::MoveStatus;
use crate::hardware::motor::{MotionSettings, Motor};
use crate::transport::{commands, Request};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{instrument, warn};

/// A readable BCS channel.
#[derive(Clone)]
pub struct Signal {
    descriptor: DeviceDescriptor,
    connection: Arc<Connection>,
    motion: Option<Motor>,
}

impl Signal {
    /// Signal described by `descriptor`. Motor-backed signals get a motor
    /// built with `settings` to carry out writes.
    pub fn new(
        descriptor: DeviceDescriptor,
        connection: Arc<Connection>,
        settings: MotionSettings,
    ) -> Self {
        let motion = (descriptor.item_type == ItemType::Motor)
            .then(|| Motor::new(descriptor.clone(), Arc::clone(&connection), settings));
        Self {
            descriptor,
            connection,
            motion,
        }
    }

    /// Descriptor the signal was built from.
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Connection the signal talks over.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Motor behind a motor-backed signal.
    pub fn motor(&self) -> Option<&Motor> {
        self.motion.as_ref()
    }

    /// Current value from the server.
    pub async fn get(&self) -> Result<f64> {
        self.fetch().await
    }

    /// Write `value`.
    ///
    /// Analog inputs return `Unsupported` without contacting the server.
    /// Motor-backed signals start a move and return its handle.
    pub async fn set(&self, value: f64) -> Result<MoveStatus> {
        match &self.motion {
            Some(motor) => motor.start_move(value, None).await,
            None => Err(self.refuse_write(value)),
        }
    }

    /// Blocking [`set`](Signal::set). Does not wait for the move to settle.
    pub fn set_blocking(&self, value: f64) -> Result<MoveStatus> {
        match &self.motion {
            Some(motor) => motor.move_blocking(value, None, false),
            None => Err(self.refuse_write(value)),
        }
    }

    /// Blocking [`get`](Signal::get).
    pub fn get_blocking(&self) -> Result<f64> {
        let signal = self.clone();
        self.connection
            .bridge()
            .block_on(async move { signal.fetch().await })
    }

    /// Blocking [`Readable::read`].
    pub fn read_blocking(&self) -> Result<ReadingMap> {
        let signal = self.clone();
        self.connection
            .bridge()
            .block_on(async move { signal.read().await })
    }

    fn refuse_write(&self, value: f64) -> BridgeError {
        warn!(device = %self.descriptor.name, value, "rejecting write to read-only channel");
        BridgeError::Unsupported {
            target: self.descriptor.name.clone(),
            operation: format!("set on {}", self.descriptor.item_type),
        }
    }

    async fn fetch_analog(&self) -> Result<f64> {
        let target = self.descriptor.original_name.as_str();
        let response = self
            .connection
            .call(Request::get_free_run(&[target]), self.descriptor.timeout)
            .await?;
        let data = expect_data(target, commands::GET_FREE_RUN, &response)?;
        data[0]
            .as_f64()
            .ok_or_else(|| BridgeError::InvalidResponse {
                target: target.to_string(),
                message: format!("expected a number, got {}", data[0]),
            })
    }
}

#[async_trait]
impl Readable for Signal {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    #[instrument(skip(self), fields(device = %self.descriptor.name), err)]
    async fn fetch(&self) -> Result<f64> {
        match &self.motion {
            Some(motor) => motor.fetch().await,
            None => self.fetch_analog().await,
        }
    }
}

impl Describable for Signal {
    fn describe(&self) -> DescriptionMap {
        let mut description = DescriptionMap::new();
        description.insert(
            self.descriptor.name.clone(),
            Description {
                source: self.descriptor.source(),
                dtype: "number".into(),
                shape: vec![],
                units: self.descriptor.units.clone(),
            },
        );
        description
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.descriptor.name)
            .field("item_type", &self.descriptor.item_type)
            .finish()
    }
}
