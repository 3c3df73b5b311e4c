//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. Environment variables (prefixed with `LABCTL_`, `__` separates nested keys)
//!
//! # Environment Variable Overrides
//!
//! ```text
//! LABCTL_APPLICATION__LOG_LEVEL=debug
//! LABCTL_TIMING__HEARTBEAT_INTERVAL_MS=5000
//! ```
//!
//! # Example
//!
//! ```toml
//! [application]
//! name = "optics bench"
//! log_level = "info"
//!
//! [timing]
//! heartbeat_interval_ms = 10000
//!
//! [[devices]]
//! name = "laser"
//! device_type = "laser_1064nm"
//! serial = { port = "/dev/ttyUSB0", baud_rate = 9600 }
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or environment could not be read or deserialized
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// Parsed values break a semantic constraint
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Session timing knobs shared by every device
    #[serde(default)]
    pub timing: TimingConfig,
    /// Devices registered at startup
    #[serde(default)]
    pub devices: Vec<DeviceDescriptor>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit logs as JSON lines instead of human-readable text
    #[serde(default)]
    pub log_json: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

/// Timing of the per-device worker and heartbeat loops, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Delay between heartbeat probes
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// How long the monitor waits for a heartbeat reply
    #[serde(default = "default_reply_timeout")]
    pub heartbeat_timeout_ms: u64,
    /// How long a caller waits for the reply to a normal operation
    #[serde(default = "default_reply_timeout")]
    pub command_timeout_ms: u64,
    /// Settling time between opening the port and the handshake heartbeat
    #[serde(default)]
    pub handshake_delay_ms: u64,
    /// Bound on waiting for the worker and monitor to exit on disconnect
    #[serde(default = "default_join_timeout")]
    pub join_timeout_ms: u64,
    /// Worker sleep when both queues are empty
    #[serde(default = "default_idle_poll")]
    pub idle_poll_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval(),
            heartbeat_timeout_ms: default_reply_timeout(),
            command_timeout_ms: default_reply_timeout(),
            handshake_delay_ms: 0,
            join_timeout_ms: default_join_timeout(),
            idle_poll_ms: default_idle_poll(),
        }
    }
}

/// [`TimingConfig`] resolved into durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimings {
    /// Delay between heartbeat probes
    pub heartbeat_interval: Duration,
    /// Wait for one heartbeat reply
    pub heartbeat_timeout: Duration,
    /// Wait for the reply to a normal operation
    pub command_timeout: Duration,
    /// Settling time before the handshake
    pub handshake_delay: Duration,
    /// Bound on joining each task at teardown
    pub join_timeout: Duration,
    /// Worker sleep with empty queues
    pub idle_poll: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        TimingConfig::default().to_timings()
    }
}

impl TimingConfig {
    /// Convert the millisecond fields to [`SessionTimings`].
    pub fn to_timings(&self) -> SessionTimings {
        SessionTimings {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            command_timeout: Duration::from_millis(self.command_timeout_ms),
            handshake_delay: Duration::from_millis(self.handshake_delay_ms),
            join_timeout: Duration::from_millis(self.join_timeout_ms),
            idle_poll: Duration::from_millis(self.idle_poll_ms),
        }
    }
}

/// Parity modes for serial communication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    #[default]
    #[serde(alias = "None", alias = "NONE", alias = "n", alias = "N")]
    None,
    /// Even parity
    #[serde(alias = "Even", alias = "EVEN", alias = "e", alias = "E")]
    Even,
    /// Odd parity
    #[serde(alias = "Odd", alias = "ODD", alias = "o", alias = "O")]
    Odd,
}

/// Connection settings for one serial link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Path to the serial device (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate (9600, 115200, etc.)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Data bits (5-8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Stop bits (1 or 2)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Parity setting
    #[serde(default)]
    pub parity: Parity,
    /// Read timeout in milliseconds
    #[serde(default = "default_serial_timeout")]
    pub timeout_ms: u64,
}

impl SerialSettings {
    /// Settings for `port` with 9600 8N1 and a one second read timeout.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: Parity::None,
            timeout_ms: default_serial_timeout(),
        }
    }

    /// Read timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(&self, device: &str) -> Result<(), ConfigError> {
        if self.port.trim().is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "device '{device}': serial port must not be empty"
            )));
        }
        if self.baud_rate == 0 {
            return Err(ConfigError::ValidationError(format!(
                "device '{device}': baud rate must be non-zero"
            )));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(ConfigError::ValidationError(format!(
                "device '{device}': data bits must be 5-8, got {}",
                self.data_bits
            )));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(ConfigError::ValidationError(format!(
                "device '{device}': stop bits must be 1 or 2, got {}",
                self.stop_bits
            )));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(format!(
                "device '{device}': read timeout must be non-zero"
            )));
        }
        Ok(())
    }
}

/// Immutable description of one device: name, type tag, and link settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Unique device name
    pub name: String,
    /// Device type tag (light_source, laser_1064nm, motor_three_axis, ccd_camera)
    pub device_type: String,
    /// Serial link settings
    pub serial: SerialSettings,
}

impl DeviceDescriptor {
    /// Build a descriptor from its parts.
    pub fn new(
        name: impl Into<String>,
        device_type: impl Into<String>,
        serial: SerialSettings,
    ) -> Self {
        Self {
            name: name.into(),
            device_type: device_type.into(),
            serial,
        }
    }
}

impl LabConfig {
    /// Load configuration from `path`, overlaid with `LABCTL_` environment variables.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let config: LabConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("LABCTL_").split("__"))
            .extract()
            .map_err(Box::new)?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment overlay).
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: LabConfig = Figment::new()
            .merge(Toml::string(toml))
            .extract()
            .map_err(Box::new)?;

        config.validate()?;
        Ok(config)
    }

    /// Check semantic constraints that parsing cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.timing;
        for (name, value) in [
            ("heartbeat_interval_ms", t.heartbeat_interval_ms),
            ("heartbeat_timeout_ms", t.heartbeat_timeout_ms),
            ("command_timeout_ms", t.command_timeout_ms),
            ("join_timeout_ms", t.join_timeout_ms),
            ("idle_poll_ms", t.idle_poll_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "timing.{name} must be non-zero"
                )));
            }
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate device name '{}'",
                    device.name
                )));
            }
            device.serial.validate(&device.name)?;
        }
        Ok(())
    }
}

fn default_app_name() -> String {
    "labctl".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_heartbeat_interval() -> u64 {
    10_000
}

fn default_reply_timeout() -> u64 {
    2_000
}

fn default_join_timeout() -> u64 {
    3_000
}

fn default_idle_poll() -> u64 {
    10
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_serial_timeout() -> u64 {
    1_000
}
