//! # BCS Bridge
//!
//! Connects experiment-orchestration code to a LabVIEW BCS instrument server
//! over a ZeroMQ request/reply socket. The server exposes motors and analog
//! input channels by name; this crate presents them as typed devices.
//!
//! ## Crate Structure
//!
//! - **`transport`**: the request/reply [`Transport`](transport::Transport)
//!   trait, wire messages, the ZeroMQ transport, and a simulated server.
//! - **`bridge`**: the single long-lived execution context all I/O runs on,
//!   per-endpoint [`Connection`](bridge::Connection)s that serialize requests,
//!   and the [`ConnectionPool`](bridge::ConnectionPool) that shares them.
//! - **`hardware`**: [`Motor`](hardware::motor::Motor) and
//!   [`Signal`](hardware::signal::Signal) devices, their capability traits,
//!   move handles, and the device registry.
//! - **`config`**: layered configuration and the static device catalog.
//! - **`logging`**: tracing subscriber setup.
//! - **`error`**: the [`BridgeError`] taxonomy.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use bcs_bridge::prelude::*;
//!
//! let config = BridgeConfig::load()?;
//! logging::init_from_config(&config)?;
//! let registry = DeviceRegistry::from_config(&config)?;
//!
//! let motor = registry.get_motor("sample_x").ok_or_else(|| anyhow::anyhow!("no sample_x"))?;
//! let status = motor.move_blocking(12.5, Some(Duration::from_secs(30)), true)?;
//! assert!(status.success());
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod transport;

pub use error::{BridgeError, Result};

/// Commonly used types.
pub mod prelude {
    pub use crate::bridge::{Bridge, Connection, ConnectionPool, ConnectionState};
    pub use crate::config::BridgeConfig;
    pub use crate::error::{BridgeError, Result};
    pub use crate::hardware::capabilities::{
        Describable, Description, DescriptionMap, Movable, Readable, Reading, ReadingMap,
    };
    pub use crate::hardware::descriptor::{DeviceCatalog, DeviceDescriptor, ItemType};
    pub use crate::hardware::motion::{MoveOutcome, MoveStatus};
    pub use crate::hardware::motor::{MotionSettings, Motor};
    pub use crate::hardware::registry::DeviceRegistry;
    pub use crate::hardware::signal::Signal;
    pub use crate::logging;
    pub use crate::transport::Endpoint;
    pub use std::time::Duration;
}
