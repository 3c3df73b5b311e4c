//! Custom error types for the device subsystem.
//!
//! This module defines the primary error type, `DeviceError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failure that can occur while talking to an instrument.
//!
//! ## Error Hierarchy
//!
//! `DeviceError` consolidates the failure kinds of the subsystem:
//!
//! - **`Transport`**: open, write, or read failures on the serial link, including a read
//!   that timed out without receiving a single byte.
//! - **`Protocol`**: a reply failed structural or content validation, or a requested value
//!   is outside the documented range. Range violations are raised before any bytes are sent.
//! - **`Liveness`**: a heartbeat reply failed verification. Sessions are faulted and torn
//!   down when this happens; it is never retried.
//! - **`Concurrency`**: a queued operation received no reply within its bound, or the
//!   command channel went away while the caller was waiting.
//! - **`UnsupportedType`**, **`AlreadyExists`**, **`NotFound`**: registry bookkeeping errors.
//!
//! By using `#[from]`, `DeviceError` can be created from the nested error types,
//! so the `?` operator works across layers.

use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the subsystem error type.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Physical link failures.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The port could not be opened
    #[error("Failed to open serial port '{port}': {reason}")]
    Open {
        /// Port path
        port: String,
        /// Driver message
        reason: String,
    },

    /// Read or write failed on an open port
    #[error("Serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The framed reply did not complete in time
    #[error("No reply received within {0:?}")]
    Timeout(Duration),

    /// Exchange attempted on a closed link
    #[error("Serial port not open")]
    NotOpen,

    /// Built without `instrument_serial`
    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    FeatureDisabled,
}

/// Failures of the queue between callers and the worker loop.
#[derive(Error, Debug)]
pub enum ConcurrencyError {
    /// The caller stopped waiting for its reply
    #[error("Operation timed out after {0:?} waiting for a reply")]
    Timeout(Duration),

    /// The worker has exited; no reply will come
    #[error("Command channel closed")]
    ChannelClosed,
}

/// Any failure of a device operation.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Link failure; faults the session
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Bad argument or malformed reply
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Heartbeat missing or mismatched; faults the session
    #[error("Heartbeat verification failed: {0}")]
    Liveness(String),

    /// Timeout or closed command channel
    #[error("Concurrency error: {0}")]
    Concurrency(#[from] ConcurrencyError),

    /// Unknown type tag
    #[error("Unsupported device type: '{0}'")]
    UnsupportedType(String),

    /// Name already registered
    #[error("Device '{0}' already exists")]
    AlreadyExists(String),

    /// Name not registered
    #[error("Device '{0}' not found")]
    NotFound(String),

    /// Command sent to a session that is not connected
    #[error("Device '{0}' is not connected")]
    NotConnected(String),

    /// The device class has no such command
    #[error("Device '{device}' does not support command '{command}'")]
    UnsupportedCommand {
        /// Device class tag
        device: String,
        /// Operation name
        command: String,
    },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl DeviceError {
    /// Shorthand for [`DeviceError::Protocol`].
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Whether this error, seen by the worker loop, leaves the link unusable.
    ///
    /// Only transport failures fault a session. A slow device that misses a
    /// normal-operation deadline does not.
    pub fn faults_session(&self) -> bool {
        matches!(
            self,
            DeviceError::Transport(TransportError::Io(_) | TransportError::NotOpen)
        )
    }

    /// Whether this is the bounded-wait timeout of a queued operation.
    pub fn is_timeout(&self) -> bool {
        matches!(self, DeviceError::Concurrency(ConcurrencyError::Timeout(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DeviceError::protocol("laser power 1500 out of range");
        assert_eq!(
            err.to_string(),
            "Protocol error: laser power 1500 out of range"
        );
    }

    #[test]
    fn test_transport_errors_fault_session() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "unplugged");
        assert!(DeviceError::from(TransportError::Io(io)).faults_session());
        assert!(DeviceError::from(TransportError::NotOpen).faults_session());
    }

    #[test]
    fn test_timeouts_do_not_fault_session() {
        let err = DeviceError::from(ConcurrencyError::Timeout(Duration::from_secs(2)));
        assert!(err.is_timeout());
        assert!(!err.faults_session());
        let timeout = DeviceError::from(TransportError::Timeout(Duration::from_secs(1)));
        assert!(!timeout.faults_session());
    }
}
