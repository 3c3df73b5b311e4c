//! Three-axis motor stage protocol.
//!
//! Commands are ASCII addressed to controller 1:
//!
//! - move: `/1aM{axis}{A|P}{value}R\r` (`A` absolute, `P` relative)
//! - query position: `/1aM{axis}?\r`
//!
//! Replies are framed as
//!
//! ```text
//! 0xFF '/' '0' 'S' <ascii payload> 0x03 '\r' '\n' 0xFF
//! ```
//!
//! and any frame that fails the structural check is rejected regardless of
//! its payload.

use super::{heartbeat, unsupported, Command, DeviceKind, DeviceProtocol, Reply, Request};
use crate::error::{DeviceError, DeviceResult};
use crate::transport::ReplyFraming;
use serde::{Deserialize, Serialize};
use std::fmt;

const FRAME_MARK: u8 = 0xFF;
const ADDRESS: &[u8] = b"/0";
const STATUS: u8 = b'S';
const PAYLOAD_START: usize = 4;
const TERMINATOR: &[u8] = b"\x03\r\n";
const REPLY_END: &[u8] = b"\x03\r\n\xFF";

/// Stage axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    /// Horizontal translation (axis 1)
    Horizontal,
    /// Vertical translation (axis 2)
    Vertical,
    /// Target wheel (axis 3)
    TargetWheel,
}

impl Axis {
    /// Axis number on the wire.
    pub fn number(self) -> u8 {
        match self {
            Axis::Horizontal => 1,
            Axis::Vertical => 2,
            Axis::TargetWheel => 3,
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Absolute or relative move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveMode {
    /// Move to an absolute position
    Absolute,
    /// Move by an offset from the current position
    Relative,
}

impl MoveMode {
    fn letter(self) -> char {
        match self {
            MoveMode::Absolute => 'A',
            MoveMode::Relative => 'P',
        }
    }
}

/// Encode a move command.
///
/// Absolute targets must be non-negative; relative moves may go either way.
pub fn encode_move(axis: Axis, mode: MoveMode, steps: i32) -> DeviceResult<Vec<u8>> {
    if mode == MoveMode::Absolute && steps < 0 {
        return Err(DeviceError::protocol(format!(
            "absolute position {steps} on axis {axis} must be non-negative"
        )));
    }
    Ok(format!("/1aM{axis}{}{steps}R\r", mode.letter()).into_bytes())
}

/// Encode a position query.
pub fn encode_position_query(axis: Axis) -> Vec<u8> {
    format!("/1aM{axis}?\r").into_bytes()
}

/// Check the reply frame structure and return its ASCII payload.
pub fn validate_frame(reply: &[u8]) -> DeviceResult<&[u8]> {
    let malformed = |why: &str| DeviceError::protocol(format!("motor reply {why}: {reply:02X?}"));

    if reply.len() < PAYLOAD_START + REPLY_END.len() {
        return Err(malformed("too short"));
    }
    if reply[0] != FRAME_MARK {
        return Err(malformed("missing leading 0xFF"));
    }
    if &reply[1..3] != ADDRESS || reply[3] != STATUS {
        return Err(malformed("missing '/0S' header"));
    }
    if reply[reply.len() - 1] != FRAME_MARK {
        return Err(malformed("missing trailing 0xFF"));
    }

    let body = &reply[PAYLOAD_START..reply.len() - 1];
    let payload = body
        .strip_suffix(TERMINATOR)
        .ok_or_else(|| malformed("missing 0x03 CR LF terminator"))?;
    if payload.contains(&0x03) {
        return Err(malformed("stray 0x03 in payload"));
    }
    Ok(payload)
}

/// Position in steps from a query reply.
pub fn parse_position(reply: &[u8]) -> DeviceResult<i64> {
    let payload = validate_frame(reply)?;
    let text = std::str::from_utf8(payload)
        .map_err(|_| DeviceError::protocol("motor position payload is not ASCII"))?;
    text.trim()
        .parse()
        .map_err(|_| DeviceError::protocol(format!("motor position {text:?} is not an integer")))
}

/// Three-axis stage protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct MotorThreeAxis;

impl DeviceProtocol for MotorThreeAxis {
    fn kind(&self) -> DeviceKind {
        DeviceKind::MotorThreeAxis
    }

    fn heartbeat(&self) -> Request {
        Request::new(
            "heartbeat",
            heartbeat::frame(self.kind().discriminant()),
            heartbeat::reply_framing(),
        )
    }

    fn verify_heartbeat(&self, reply: &[u8]) -> bool {
        heartbeat::verify(self.kind().discriminant(), reply)
    }

    fn encode(&self, command: &Command) -> DeviceResult<Request> {
        match *command {
            Command::MoveAxis { axis, mode, steps } => Ok(Request::new(
                command.name(),
                encode_move(axis, mode, steps)?,
                ReplyFraming::Until(REPLY_END),
            )),
            Command::QueryPosition { axis } => Ok(Request::new(
                command.name(),
                encode_position_query(axis),
                ReplyFraming::Until(REPLY_END),
            )),
            _ => Err(unsupported(self.kind(), command)),
        }
    }

    fn decode(&self, command: &Command, reply: &[u8]) -> DeviceResult<Reply> {
        match command {
            Command::MoveAxis { .. } => validate_frame(reply).map(|_| Reply::Ack),
            Command::QueryPosition { .. } => parse_position(reply).map(Reply::Position),
            _ => Err(unsupported(self.kind(), command)),
        }
    }
}
