//! Device Registry
//!
//! Central place where devices are built from descriptors and looked up by
//! name. Devices that live on the same server share one pooled connection.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      DeviceRegistry                         │
//! │   Motor("sample_x")   Motor("sample_y")   Signal("i0")      │
//! ├─────────────────────────────────────────────────────────────┤
//! │                ConnectionPool (per Endpoint)                │
//! │        Connection(10.0.0.5:5577)   Connection(...)          │
//! ├─────────────────────────────────────────────────────────────┤
//! │                 Bridge (bcs-bridge thread)                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use bcs_bridge::config::BridgeConfig;
//! use bcs_bridge::hardware::registry::DeviceRegistry;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = BridgeConfig::load()?;
//!     let registry = DeviceRegistry::from_config(&config)?;
//!
//!     for info in registry.list_devices() {
//!         println!("{}: {} ({:?})", info.name, info.original_name, info.capabilities);
//!     }
//!
//!     if let Some(motor) = registry.get_motor("sample_x") {
//!         motor.set(12.5)?;
//!     }
//!     Ok(())
//! }
//! ```

use crate::bridge::{ConnectionPool, ConnectionState};
use crate::config::BridgeConfig;
use crate::hardware::capabilities::{Describable, DescriptionMap, Movable, Readable};
use crate::hardware::descriptor::{DeviceCatalog, DeviceDescriptor, ItemType};
use crate::hardware::motor::{MotionSettings, Motor};
use crate::hardware::signal::Signal;
use crate::transport::Endpoint;
use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Device Identification
// =============================================================================

/// Capabilities a device can have (for introspection)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Can move to positions
    Movable,
    /// Can read a scalar value
    Readable,
}

impl ItemType {
    /// Capabilities devices of this kind provide.
    pub fn capabilities(&self) -> Vec<Capability> {
        match self {
            ItemType::Motor => vec![Capability::Movable, Capability::Readable],
            ItemType::AnalogInput => vec![Capability::Readable],
        }
    }
}

/// Information about a registered device (returned by list operations)
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    /// Local name
    pub name: String,
    /// Server-side name
    pub original_name: String,
    /// Motor or analog input
    pub item_type: ItemType,
    /// Capabilities this device supports
    pub capabilities: Vec<Capability>,
    /// Units
    pub units: String,
    /// Server the device lives on
    pub endpoint: Endpoint,
}

// =============================================================================
// Registered Device (Internal)
// =============================================================================

#[derive(Debug, Clone)]
enum RegisteredDevice {
    Motor(Motor),
    Signal(Signal),
}

impl RegisteredDevice {
    fn descriptor(&self) -> &DeviceDescriptor {
        match self {
            RegisteredDevice::Motor(motor) => motor.descriptor(),
            RegisteredDevice::Signal(signal) => signal.descriptor(),
        }
    }

    fn info(&self) -> DeviceInfo {
        let descriptor = self.descriptor();
        DeviceInfo {
            name: descriptor.name.clone(),
            original_name: descriptor.original_name.clone(),
            item_type: descriptor.item_type,
            capabilities: descriptor.item_type.capabilities(),
            units: descriptor.units.clone(),
            endpoint: descriptor.endpoint.clone(),
        }
    }
}

// =============================================================================
// Device Registry
// =============================================================================

/// Central registry for BCS devices
///
/// - Builds motors for `motor` descriptors and signals for analog inputs
/// - Shares one connection per endpoint through the pool
/// - Rejects duplicate local names
pub struct DeviceRegistry {
    pool: Arc<ConnectionPool>,
    settings: MotionSettings,
    devices: BTreeMap<String, RegisteredDevice>,
}

impl DeviceRegistry {
    /// Empty registry building devices on `pool`.
    pub fn new(pool: Arc<ConnectionPool>, settings: MotionSettings) -> Self {
        Self {
            pool,
            settings,
            devices: BTreeMap::new(),
        }
    }

    /// Validate `config`, start a ZeroMQ pool, and register its device catalog.
    pub fn from_config(config: &BridgeConfig) -> Result<Self> {
        config.validate().context("invalid bridge configuration")?;
        let pool = ConnectionPool::with_zmq(config.server.connect_timeout())
            .context("failed to start the bridge")?;
        let mut registry = Self::new(Arc::new(pool), config.motion.settings());
        registry.register_catalog(config)?;
        Ok(registry)
    }

    /// Register every descriptor in `catalog`.
    pub fn register_catalog(&mut self, catalog: &dyn DeviceCatalog) -> Result<()> {
        for descriptor in catalog.descriptors() {
            let name = descriptor.name.clone();
            self.register(descriptor)
                .with_context(|| format!("failed to register '{name}'"))?;
        }
        Ok(())
    }

    /// Register one device.
    ///
    /// # Errors
    /// Returns error if the local name is already registered
    pub fn register(&mut self, descriptor: DeviceDescriptor) -> Result<()> {
        if self.devices.contains_key(&descriptor.name) {
            return Err(anyhow!("Device '{}' is already registered", descriptor.name));
        }

        let connection = self.pool.get_or_open(&descriptor.endpoint);
        let name = descriptor.name.clone();
        let device = match descriptor.item_type {
            ItemType::Motor => {
                RegisteredDevice::Motor(Motor::new(descriptor, connection, self.settings))
            }
            ItemType::AnalogInput => {
                RegisteredDevice::Signal(Signal::new(descriptor, connection, self.settings))
            }
        };
        tracing::debug!(device = %name, "registered device");
        self.devices.insert(name, device);
        Ok(())
    }

    /// Remove a device. Returns whether it was registered.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.devices.remove(name).is_some()
    }

    /// List all registered devices
    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        self.devices.values().map(RegisteredDevice::info).collect()
    }

    /// Get device info by name
    pub fn get_device_info(&self, name: &str) -> Option<DeviceInfo> {
        self.devices.get(name).map(RegisteredDevice::info)
    }

    /// Check if a device is registered
    pub fn contains(&self, name: &str) -> bool {
        self.devices.contains_key(name)
    }

    /// Get count of registered devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// The pool devices draw connections from.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    // =========================================================================
    // Device Access
    // =========================================================================

    /// Motor by local name
    pub fn get_motor(&self, name: &str) -> Option<Motor> {
        match self.devices.get(name)? {
            RegisteredDevice::Motor(motor) => Some(motor.clone()),
            RegisteredDevice::Signal(_) => None,
        }
    }

    /// Signal by local name
    pub fn get_signal(&self, name: &str) -> Option<Signal> {
        match self.devices.get(name)? {
            RegisteredDevice::Signal(signal) => Some(signal.clone()),
            RegisteredDevice::Motor(_) => None,
        }
    }

    /// Device as Movable (if it supports this capability)
    pub fn get_movable(&self, name: &str) -> Option<Arc<dyn Movable>> {
        self.get_motor(name).map(|motor| Arc::new(motor) as Arc<dyn Movable>)
    }

    /// Device as Readable (every device supports this capability)
    pub fn get_readable(&self, name: &str) -> Option<Arc<dyn Readable>> {
        match self.devices.get(name)? {
            RegisteredDevice::Motor(motor) => Some(Arc::new(motor.clone())),
            RegisteredDevice::Signal(signal) => Some(Arc::new(signal.clone())),
        }
    }

    /// Names of devices supporting `capability`
    pub fn devices_with_capability(&self, capability: Capability) -> Vec<String> {
        self.devices
            .iter()
            .filter(|(_, d)| d.descriptor().item_type.capabilities().contains(&capability))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Merged descriptions of every device.
    pub fn describe_all(&self) -> DescriptionMap {
        self.devices
            .values()
            .flat_map(|device| match device {
                RegisteredDevice::Motor(motor) => motor.describe(),
                RegisteredDevice::Signal(signal) => signal.describe(),
            })
            .collect()
    }

    /// Connection state of every endpoint in use.
    pub fn connection_states(&self) -> BTreeMap<String, ConnectionState> {
        self.devices
            .values()
            .filter_map(|device| {
                let endpoint = &device.descriptor().endpoint;
                self.pool
                    .get_existing(endpoint)
                    .map(|connection| (endpoint.to_string(), connection.state()))
            })
            .collect()
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.devices.keys().collect::<Vec<_>>())
            .finish()
    }
}
