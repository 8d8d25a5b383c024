//! Configuration using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults
//! 2. `config/bcs_bridge.toml` (or an explicit path)
//! 3. Environment variables prefixed with `BCS_BRIDGE_`, `__` separating
//!    nested keys (e.g. `BCS_BRIDGE_SERVER__HOST=10.0.0.5`)
//!
//! The `devices` list doubles as a static device catalog.
//!
//! # Example
//! ```no_run
//! use bcs_bridge::config::BridgeConfig;
//!
//! let config = BridgeConfig::load()?;
//! config.validate()?;
//! println!("BCS server: {}", config.server.endpoint());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::error::{BridgeError, Result};
use crate::hardware::descriptor::{DeviceCatalog, DeviceDescriptor, ItemType};
use crate::hardware::motor::MotionSettings;
use crate::transport::{Endpoint, DEFAULT_HOST, DEFAULT_PORT};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/bcs_bridge.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "BCS_BRIDGE_";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BridgeConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Default server and timeouts
    #[serde(default)]
    pub server: ServerConfig,
    /// Motion monitoring
    #[serde(default)]
    pub motion: MotionConfig,
    /// Static device catalog
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Default BCS server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host name or address
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connect plus probe timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Per-request timeout in milliseconds
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,
}

/// Motion monitoring configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionConfig {
    /// Status polling interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Deadline for moves given none, in milliseconds; absent waits forever
    #[serde(default)]
    pub default_move_timeout_ms: Option<u64>,
}

/// One device in the static catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Local name
    pub name: String,
    /// Server-side name; defaults to `name`
    #[serde(default)]
    pub original_name: Option<String>,
    /// `motor` or `analogInput` (`ai`)
    pub item_type: ItemType,
    /// Engineering units
    #[serde(default)]
    pub units: String,
    /// Server host override
    #[serde(default)]
    pub host: Option<String>,
    /// Server port override
    #[serde(default)]
    pub port: Option<u16>,
    /// Per-request timeout override in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

// Default value functions
fn default_name() -> String {
    "BCS Bridge".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_rpc_timeout() -> u64 {
    10_000
}

fn default_poll_interval() -> u64 {
    100
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout(),
            rpc_timeout_ms: default_rpc_timeout(),
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            default_move_timeout_ms: None,
        }
    }
}

impl ServerConfig {
    /// Default endpoint.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    /// Connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Per-request timeout.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

impl MotionConfig {
    /// Settings handed to motors.
    pub fn settings(&self) -> MotionSettings {
        MotionSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            default_move_timeout: self.default_move_timeout_ms.map(Duration::from_millis),
        }
    }
}

impl BridgeConfig {
    /// Load from the default file and environment.
    pub fn load() -> std::result::Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and environment.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> std::result::Result<Self, figment::Error> {
        Self::figment(path).extract()
    }

    /// The layered provider stack, for callers that want to add layers.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(BridgeConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(BridgeError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.server.host.trim().is_empty() {
            return Err(BridgeError::Configuration("server.host is empty".into()));
        }
        if self.server.port == 0 {
            return Err(BridgeError::Configuration("server.port must be non-zero".into()));
        }
        if self.server.connect_timeout_ms == 0 || self.server.rpc_timeout_ms == 0 {
            return Err(BridgeError::Configuration(
                "server timeouts must be greater than zero".into(),
            ));
        }
        if self.motion.poll_interval_ms == 0 {
            return Err(BridgeError::Configuration(
                "motion.poll_interval_ms must be greater than zero".into(),
            ));
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if device.name.trim().is_empty() {
                return Err(BridgeError::Configuration("device with empty name".into()));
            }
            if !names.insert(device.name.as_str()) {
                return Err(BridgeError::Configuration(format!(
                    "Duplicate device name: {}",
                    device.name
                )));
            }
            if device.port == Some(0) || device.timeout_ms == Some(0) {
                return Err(BridgeError::Configuration(format!(
                    "device '{}' has a zero port or timeout",
                    device.name
                )));
            }
        }

        Ok(())
    }

    fn descriptor_for(&self, entry: &DeviceEntry) -> DeviceDescriptor {
        let endpoint = Endpoint::new(
            entry.host.clone().unwrap_or_else(|| self.server.host.clone()),
            entry.port.unwrap_or(self.server.port),
        );
        let timeout = entry
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.server.rpc_timeout());

        DeviceDescriptor::new(entry.name.clone(), entry.item_type)
            .with_original_name(
                entry
                    .original_name
                    .clone()
                    .unwrap_or_else(|| entry.name.clone()),
            )
            .with_units(entry.units.clone())
            .with_endpoint(endpoint)
            .with_timeout(timeout)
    }
}

impl DeviceCatalog for BridgeConfig {
    fn descriptors(&self) -> Vec<DeviceDescriptor> {
        self.devices
            .iter()
            .map(|entry| self.descriptor_for(entry))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn entry(name: &str, item_type: ItemType) -> DeviceEntry {
        DeviceEntry {
            name: name.to_string(),
            original_name: None,
            item_type,
            units: String::new(),
            host: None,
            port: None,
            timeout_ms: None,
        }
    }

    #[test]
    fn defaults_are_valid() {
        let config = BridgeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.endpoint(), Endpoint::new("127.0.0.1", 5577));
        assert_eq!(config.server.rpc_timeout(), Duration::from_secs(10));
        assert_eq!(config.motion.settings(), MotionSettings::default());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = BridgeConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(matches!(
            config.validate(),
            Err(BridgeError::Configuration(_))
        ));
    }

    #[test]
    fn test_duplicate_device_names() {
        let mut config = BridgeConfig::default();
        config.devices = vec![
            entry("Motor3", ItemType::Motor),
            entry("Motor3", ItemType::AnalogInput),
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_poll_interval_rejected() {
        let mut config = BridgeConfig::default();
        config.motion.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn catalog_inherits_server_defaults() {
        let mut config = BridgeConfig::default();
        config.server.host = "bl7-labview".to_string();
        let mut diode = entry("diode", ItemType::AnalogInput);
        diode.original_name = Some("AI 3".to_string());
        diode.port = Some(6000);
        diode.timeout_ms = Some(250);
        config.devices = vec![entry("Motor3", ItemType::Motor), diode];

        let descriptors = config.descriptors();
        assert_eq!(descriptors[0].original_name, "Motor3");
        assert_eq!(descriptors[0].endpoint, Endpoint::new("bl7-labview", 5577));
        assert_eq!(descriptors[0].timeout, Duration::from_secs(10));
        assert_eq!(descriptors[1].original_name, "AI 3");
        assert_eq!(descriptors[1].endpoint, Endpoint::new("bl7-labview", 6000));
        assert_eq!(descriptors[1].timeout, Duration::from_millis(250));
    }

    #[test]
    #[serial]
    fn load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
name = "Beamline 7"
log_level = "debug"

[server]
host = "10.0.0.5"

[motion]
poll_interval_ms = 50
default_move_timeout_ms = 60000

[[devices]]
name = "sample_x"
original_name = "Sample X"
item_type = "motor"
units = "mm"

[[devices]]
name = "i0"
item_type = "ai"
"#
        )
        .unwrap();

        let config = BridgeConfig::load_from(file.path()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.application.name, "Beamline 7");
        assert_eq!(config.server.host, "10.0.0.5");
        assert_eq!(config.server.port, 5577);
        assert_eq!(
            config.motion.settings().default_move_timeout,
            Some(Duration::from_secs(60))
        );
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[1].item_type, ItemType::AnalogInput);
    }

    #[test]
    #[serial]
    fn environment_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("bridge.toml", "[server]\nhost = \"10.0.0.5\"\n")?;
            jail.set_env("BCS_BRIDGE_SERVER__PORT", "6001");
            jail.set_env("BCS_BRIDGE_APPLICATION__LOG_LEVEL", "warn");

            let config = BridgeConfig::load_from("bridge.toml")?;
            assert_eq!(config.server.host, "10.0.0.5");
            assert_eq!(config.server.port, 6001);
            assert_eq!(config.application.log_level, "warn");
            Ok(())
        });
    }

    #[test]
    #[serial]
    fn shipped_config_is_valid() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/bcs_bridge.toml");
        let config = BridgeConfig::load_from(path).unwrap();
        config.validate().unwrap();

        let descriptors = config.descriptors();
        assert_eq!(descriptors.len(), 4);
        assert_eq!(descriptors[0].original_name, "Motor3");
        assert_eq!(descriptors[3].item_type, ItemType::AnalogInput);
    }

    #[test]
    #[serial]
    fn missing_file_falls_back_to_defaults() {
        let config = BridgeConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config.server, ServerConfig::default());
        assert!(config.devices.is_empty());
    }
}
