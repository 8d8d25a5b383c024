//! Device descriptors and the catalog seam.
//!
//! A descriptor says which server a device lives on, what the server calls it,
//! and how the bridge should treat it. Where descriptors come from (a static
//! configuration file, or a live `GetBCSConfiguration` query) is behind the
//! [`DeviceCatalog`] trait.

use crate::transport::Endpoint;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default per-request timeout.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Kind of BCS item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemType {
    /// Positionable motor
    Motor,
    /// Read-only analog input channel
    #[serde(alias = "ai")]
    AnalogInput,
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemType::Motor => write!(f, "motor"),
            ItemType::AnalogInput => write!(f, "analogInput"),
        }
    }
}

/// Everything needed to build one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDescriptor {
    /// Local, framework-facing name
    pub name: String,
    /// Name the server knows the device by
    pub original_name: String,
    /// Motor or analog input
    pub item_type: ItemType,
    /// Engineering units, possibly empty
    pub units: String,
    /// Server hosting the device
    pub endpoint: Endpoint,
    /// Per-request timeout
    pub timeout: Duration,
}

impl DeviceDescriptor {
    /// Descriptor with default endpoint, timeout and no units; `name` is used
    /// for both the local and server names.
    pub fn new(name: impl Into<String>, item_type: ItemType) -> Self {
        let name = name.into();
        Self {
            original_name: name.clone(),
            name,
            item_type,
            units: String::new(),
            endpoint: Endpoint::default(),
            timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    /// Set the server-side name.
    pub fn with_original_name(mut self, original_name: impl Into<String>) -> Self {
        self.original_name = original_name.into();
        self
    }

    /// Set the units.
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = units.into();
        self
    }

    /// Set the endpoint.
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Value of the `source` field in descriptions.
    pub fn source(&self) -> String {
        format!("BCS:{}", self.original_name)
    }
}

/// Source of device descriptors.
pub trait DeviceCatalog {
    /// All devices the catalog knows about.
    fn descriptors(&self) -> Vec<DeviceDescriptor>;
}

impl DeviceCatalog for Vec<DeviceDescriptor> {
    fn descriptors(&self) -> Vec<DeviceDescriptor> {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_type_accepts_short_alias() {
        let parsed: ItemType = serde_json::from_str("\"ai\"").unwrap();
        assert_eq!(parsed, ItemType::AnalogInput);
        let parsed: ItemType = serde_json::from_str("\"analogInput\"").unwrap();
        assert_eq!(parsed, ItemType::AnalogInput);
        let parsed: ItemType = serde_json::from_str("\"motor\"").unwrap();
        assert_eq!(parsed, ItemType::Motor);
    }

    #[test]
    fn builder_defaults() {
        let descriptor = DeviceDescriptor::new("sample_x", ItemType::Motor)
            .with_original_name("Sample X")
            .with_units("mm");
        assert_eq!(descriptor.source(), "BCS:Sample X");
        assert_eq!(descriptor.timeout, DEFAULT_RPC_TIMEOUT);
        assert_eq!(descriptor.endpoint, Endpoint::default());
    }
}
