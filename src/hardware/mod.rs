//! BCS devices.
//!
//! Devices are thin views over a pooled [`Connection`](crate::bridge::Connection):
//! a [`Motor`](motor::Motor) for positionable axes and a
//! [`Signal`](signal::Signal) for readable channels. Both implement the
//! capability traits in [`capabilities`] and offer blocking wrappers for
//! callers outside any async runtime.

pub mod capabilities;
pub mod descriptor;
pub mod motion;
pub mod motor;
pub mod registry;
pub mod signal;

use crate::error::{BridgeError, Result};
use crate::transport::Response;
use serde_json::Value;

/// Interpret a read reply for a single device: `success=false` is a remote
/// error, any `not_found` entry means the device is unknown, and an empty
/// `data` list means there is nothing to read.
pub(crate) fn expect_data<'a>(
    target: &str,
    command: &str,
    response: &'a Response,
) -> Result<&'a [Value]> {
    if !response.success() {
        return Err(BridgeError::Remote {
            target: target.to_string(),
            command: command.to_string(),
            description: response.error_description(),
        });
    }
    if !response.not_found().is_empty() {
        return Err(BridgeError::NotFound {
            target: target.to_string(),
        });
    }
    let data = response.data();
    if data.is_empty() {
        return Err(BridgeError::NoData {
            target: target.to_string(),
        });
    }
    Ok(data)
}
