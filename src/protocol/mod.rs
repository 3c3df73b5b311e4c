//! Device protocols
//!
//! Each supported instrument type has a [`DeviceProtocol`] that turns typed
//! [`Command`]s into wire [`Request`]s and validates the raw reply bytes. The
//! protocols are pure: they never touch a transport, so range violations are
//! rejected before a single byte is written.
//!
//! | Type tag            | Protocol                            | Heartbeat discriminant |
//! |---------------------|-------------------------------------|------------------------|
//! | `light_source`      | [`LightSource`] (ASCII, echo)       | `0x01`                 |
//! | `ccd_camera`        | [`CcdCamera`] (heartbeat only)      | `0x02`                 |
//! | `laser_1064nm`      | [`Laser1064nm`] (binary LE)         | `0x03`                 |
//! | `motor_three_axis`  | [`MotorThreeAxis`] (ASCII framed)   | `0x04`                 |

pub mod ccd_camera;
pub mod heartbeat;
pub mod laser_1064nm;
pub mod light_source;
pub mod motor;

pub use ccd_camera::CcdCamera;
pub use laser_1064nm::{frequency_code, Laser1064nm, QuantizedFrequency};
pub use light_source::LightSource;
pub use motor::{Axis, MotorThreeAxis, MoveMode};

use crate::error::{DeviceError, DeviceResult};
use crate::transport::ReplyFraming;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Supported instrument types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Composite light source (indication laser, visible light, black body)
    LightSource,
    /// Pulsed 1064 nm laser
    #[serde(rename = "laser_1064nm")]
    Laser1064nm,
    /// 3-axis motor stage
    MotorThreeAxis,
    /// CCD camera heartbeat channel
    CcdCamera,
}

impl DeviceKind {
    /// All supported kinds.
    pub const ALL: [DeviceKind; 4] = [
        DeviceKind::LightSource,
        DeviceKind::Laser1064nm,
        DeviceKind::MotorThreeAxis,
        DeviceKind::CcdCamera,
    ];

    /// Type tag used in configuration and requests.
    pub fn tag(self) -> &'static str {
        match self {
            DeviceKind::LightSource => "light_source",
            DeviceKind::Laser1064nm => "laser_1064nm",
            DeviceKind::MotorThreeAxis => "motor_three_axis",
            DeviceKind::CcdCamera => "ccd_camera",
        }
    }

    /// First byte of this device class's heartbeat exchange.
    pub fn discriminant(self) -> u8 {
        match self {
            DeviceKind::LightSource => 0x01,
            DeviceKind::CcdCamera => 0x02,
            DeviceKind::Laser1064nm => 0x03,
            DeviceKind::MotorThreeAxis => 0x04,
        }
    }

    /// The protocol implementation for this kind.
    pub fn protocol(self) -> Arc<dyn DeviceProtocol> {
        match self {
            DeviceKind::LightSource => Arc::new(LightSource),
            DeviceKind::Laser1064nm => Arc::new(Laser1064nm),
            DeviceKind::MotorThreeAxis => Arc::new(MotorThreeAxis),
            DeviceKind::CcdCamera => Arc::new(CcdCamera),
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for DeviceKind {
    type Err = DeviceError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        DeviceKind::ALL
            .into_iter()
            .find(|kind| kind.tag() == tag)
            .ok_or_else(|| DeviceError::UnsupportedType(tag.to_string()))
    }
}

/// Resend policy for the one command that retries until acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryUntil {
    /// Pause between attempts
    pub interval: Duration,
    /// Give up once this much time has passed since the first attempt
    pub budget: Duration,
}

/// Wire form of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Short operation name for logs
    pub kind: &'static str,
    /// Bytes to write
    pub payload: Vec<u8>,
    /// When the reply is complete
    pub framing: ReplyFraming,
    /// Set only for commands that resend until acknowledged
    pub retry: Option<RetryUntil>,
}

impl Request {
    /// A single-shot request.
    pub fn new(kind: &'static str, payload: Vec<u8>, framing: ReplyFraming) -> Self {
        Self {
            kind,
            payload,
            framing,
            retry: None,
        }
    }

    /// Resend this request per `policy` until the reply decodes.
    pub fn retry_until(mut self, policy: RetryUntil) -> Self {
        self.retry = Some(policy);
        self
    }
}

/// Typed device operations.
///
/// Deserializes from the JSON the boundary layer receives, e.g.
/// `{"op": "set_laser_power", "milliwatts": 50}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    /// Light source: indication-laser power, 0..=1000
    SetIndicationPower { power: u16 },
    /// Light source: visible-light level, 0..=100
    SetVisibleLight { level: u16 },
    /// Light source: black-body temperature set-point, 0..=40000
    SetBlackBodyTemperature { setpoint: u32 },
    /// Light source: send the set-point and read back the measured temperature
    ReadBlackBodyTemperature { setpoint: u32 },
    /// Laser: reset the receive stack (resent until acknowledged)
    ResetReceiveStack,
    /// Laser: output power in mW, 0..=100
    SetLaserPower { milliwatts: u16 },
    /// Laser: repetition frequency in Hz, quantized to the device table
    SetFrequency { hz: u32 },
    /// Laser: pulse width, 10..=100
    SetPulseWidth { width: u16 },
    /// Laser: read head temperature
    ReadLaserTemperature,
    /// Motor: move one axis
    MoveAxis {
        axis: Axis,
        mode: MoveMode,
        steps: i32,
    },
    /// Motor: query one axis position
    QueryPosition { axis: Axis },
}

impl Command {
    /// Operation name as it appears in requests and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::SetIndicationPower { .. } => "set_indication_power",
            Command::SetVisibleLight { .. } => "set_visible_light",
            Command::SetBlackBodyTemperature { .. } => "set_black_body_temperature",
            Command::ReadBlackBodyTemperature { .. } => "read_black_body_temperature",
            Command::ResetReceiveStack => "reset_receive_stack",
            Command::SetLaserPower { .. } => "set_laser_power",
            Command::SetFrequency { .. } => "set_frequency",
            Command::SetPulseWidth { .. } => "set_pulse_width",
            Command::ReadLaserTemperature => "read_laser_temperature",
            Command::MoveAxis { .. } => "move_axis",
            Command::QueryPosition { .. } => "query_position",
        }
    }
}

/// Decoded result of a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Reply {
    /// The device acknowledged the command
    Ack,
    /// Temperature in degrees Celsius
    Temperature(f64),
    /// Axis position in motor steps
    Position(i64),
}

/// Encoding and validation for one instrument type.
pub trait DeviceProtocol: Send + Sync + fmt::Debug {
    /// Which instrument type this protocol speaks to.
    fn kind(&self) -> DeviceKind;

    /// The liveness probe.
    fn heartbeat(&self) -> Request;

    /// Whether `reply` is a healthy answer to [`DeviceProtocol::heartbeat`].
    fn verify_heartbeat(&self, reply: &[u8]) -> bool;

    /// Encode `command`, rejecting out-of-range values.
    fn encode(&self, command: &Command) -> DeviceResult<Request>;

    /// Validate and decode the reply to `command`.
    fn decode(&self, command: &Command, reply: &[u8]) -> DeviceResult<Reply>;
}

/// Error for a command this device type does not implement.
pub(crate) fn unsupported(kind: DeviceKind, command: &Command) -> DeviceError {
    DeviceError::UnsupportedCommand {
        device: kind.tag().to_string(),
        command: command.name().to_string(),
    }
}

/// Reject `value` outside `range` before anything is sent.
pub(crate) fn check_range<T>(
    what: &str,
    value: T,
    range: std::ops::RangeInclusive<T>,
) -> DeviceResult<T>
where
    T: PartialOrd + fmt::Display + Copy,
{
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(DeviceError::protocol(format!(
            "{what} {value} out of range {}..={}",
            range.start(),
            range.end()
        )))
    }
}

/// Succeed only if the device echoed the request back verbatim.
pub(crate) fn expect_echo(request: &[u8], reply: &[u8]) -> DeviceResult<Reply> {
    if reply == request {
        Ok(Reply::Ack)
    } else {
        Err(DeviceError::protocol(format!(
            "expected echo {request:02X?}, got {reply:02X?}"
        )))
    }
}
