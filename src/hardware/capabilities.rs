//! Device Capabilities
//!
//! Fine-grained capability traits implemented by BCS devices. Orchestration
//! code works against these traits rather than against concrete device types:
//!
//! - A motor implements: `Movable + Readable + Describable`
//! - An analog input implements: `Readable + Describable`
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Returns the crate's typed `Result`
//! - Focuses on ONE thing
//!
//! Every device also exposes blocking wrappers (`*_blocking`) that route
//! through the bridge; those are inherent methods, not part of the traits.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn scan<M, R>(motor: &M, detector: &R, points: &[f64]) -> Result<Vec<f64>>
//! where
//!     M: Movable,
//!     R: Readable,
//! {
//!     let mut values = Vec::new();
//!     for &point in points {
//!         motor.move_to(point, None).await?.wait().await?;
//!         values.push(detector.fetch().await?);
//!     }
//!     Ok(values)
//! }
//! ```

use crate::error::Result;
use crate::hardware::motion::MoveStatus;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// A value with the local time it was acquired.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Value in device units
    pub value: f64,
    /// Acquisition time, seconds since the Unix epoch
    pub timestamp: f64,
}

impl Reading {
    /// Stamp `value` with the current local time.
    pub fn now(value: f64) -> Self {
        let now = chrono::Utc::now();
        Self {
            value,
            timestamp: now.timestamp_micros() as f64 / 1e6,
        }
    }
}

/// Readings keyed by device name.
pub type ReadingMap = BTreeMap<String, Reading>;

/// Data-key description of one device output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Description {
    /// Where the value comes from, e.g. `BCS:Motor3`
    pub source: String,
    /// Value type; always `number` for BCS devices
    pub dtype: String,
    /// Empty for scalars
    pub shape: Vec<usize>,
    /// Engineering units, possibly empty
    pub units: String,
}

/// Descriptions keyed by device name.
pub type DescriptionMap = BTreeMap<String, Description>;

/// Capability: Motion Control
///
/// Devices that can be commanded to a position and report when they arrive.
///
/// # Contract
/// - `move_to` sends the move command and returns a handle once the server
///   has answered it; the handle settles when the device reports completion,
///   the deadline passes, or an error occurs
/// - At most one move is pending per device; a second `move_to` while one is
///   pending fails with `MoveInProgress`
/// - `position` is the last observed position and never performs I/O
#[async_trait]
pub trait Movable: Send + Sync {
    /// Command a move to `target`.
    ///
    /// # Arguments
    /// * `target` - Goal position in device units
    /// * `timeout` - Deadline for settlement; `None` uses the device default
    ///
    /// # Returns
    /// - Ok(handle) once the command is answered; a rejected command comes
    ///   back as an already settled handle
    /// - Err(MoveInProgress) if a previous move has not settled
    async fn move_to(&self, target: f64, timeout: Option<Duration>) -> Result<MoveStatus>;

    /// Ask the server to halt the device.
    ///
    /// Advisory: does not settle a pending move handle.
    async fn stop(&self) -> Result<()>;

    /// Last observed position.
    fn position(&self) -> f64;

    /// Whether a commanded move has not yet been observed to finish.
    fn is_moving(&self) -> bool;
}

/// Capability: Scalar Readout
///
/// Devices producing a single scalar value on demand.
#[async_trait]
pub trait Readable: Send + Sync {
    /// Local device name, used as the reading key.
    fn name(&self) -> &str;

    /// Fetch the current value from the server.
    async fn fetch(&self) -> Result<f64>;

    /// Fetch and timestamp the current value.
    ///
    /// # Default Implementation
    /// Wraps [`fetch`](Readable::fetch) with the local acquisition time.
    async fn read(&self) -> Result<ReadingMap> {
        let value = self.fetch().await?;
        let mut readings = ReadingMap::new();
        readings.insert(self.name().to_string(), Reading::now(value));
        Ok(readings)
    }
}

/// Capability: Self-description
pub trait Describable {
    /// Describe the keys produced by `read`.
    fn describe(&self) -> DescriptionMap;
}
