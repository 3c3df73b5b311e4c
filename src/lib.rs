//! Device communication and control for serial laboratory instruments.
//!
//! The crate drives a light source, a pulsed 1064 nm laser, a three-axis motor
//! stage and a CCD camera over RS-232/RS-485. Layers, bottom up:
//!
//! - [`transport`]: atomic write-then-read exchanges on one link
//! - [`protocol`]: per-instrument command encoding and reply validation
//! - [`session`]: connection lifecycle, the prioritized command channel, and
//!   heartbeat monitoring
//! - [`registry`]: named sessions, the surface an outer API layer calls
//!
//! ```no_run
//! use labctl::config::{DeviceDescriptor, SerialSettings, SessionTimings};
//! use labctl::protocol::Command;
//! use labctl::registry::DeviceRegistry;
//!
//! # async fn demo() -> labctl::error::DeviceResult<()> {
//! let registry = DeviceRegistry::with_serial(SessionTimings::default());
//! registry.add(DeviceDescriptor::new(
//!     "laser",
//!     "laser_1064nm",
//!     SerialSettings::new("/dev/ttyUSB0"),
//! ))?;
//! if registry.connect("laser").await? {
//!     registry
//!         .execute("laser", &Command::SetLaserPower { milliwatts: 50 })
//!         .await?;
//! }
//! registry.disconnect("laser").await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;

pub use config::{DeviceDescriptor, LabConfig, SerialSettings, SessionTimings};
pub use error::{DeviceError, DeviceResult};
pub use protocol::{Command, DeviceKind, Reply};
pub use registry::DeviceRegistry;
pub use session::{ConnectionState, DeviceSession};
