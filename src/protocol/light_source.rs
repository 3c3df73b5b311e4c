//! Composite light source protocol.
//!
//! Fixed-width ASCII commands framed by `*` and a one-character suffix:
//!
//! | Command                   | Format        | Range          | Reply                     |
//! |---------------------------|---------------|----------------|---------------------------|
//! | Indication-laser power    | `*{:04}@`     | 0..=1000       | echo of the command       |
//! | Visible-light level       | `*{:04}!`     | 0..=100        | echo of the command       |
//! | Black-body temperature    | `*{:06}#`     | 0..=40000      | 15-byte `*`…`#` frame     |
//!
//! The 15-byte temperature frame carries the measured value: byte 8 is the sign
//! (`H` positive, `L` negative) and bytes 9..14 are the magnitude in
//! thousandths of a degree.

use super::{
    check_range, expect_echo, heartbeat, unsupported, Command, DeviceKind, DeviceProtocol, Reply,
    Request,
};
use crate::error::{DeviceError, DeviceResult};
use crate::transport::ReplyFraming;

/// Length of an indication-power or visible-light command and its echo.
const LEVEL_FRAME_LEN: usize = 6;
/// Length of a black-body temperature reply.
const TEMPERATURE_FRAME_LEN: usize = 15;
const SIGN_OFFSET: usize = 8;
const VALUE_RANGE: std::ops::Range<usize> = 9..14;

/// Encode an indication-laser power command.
pub fn encode_indication_power(power: u16) -> DeviceResult<Vec<u8>> {
    let power = check_range("indication power", power, 0..=1000)?;
    Ok(format!("*{power:04}@").into_bytes())
}

/// Encode a visible-light level command.
pub fn encode_visible_light(level: u16) -> DeviceResult<Vec<u8>> {
    let level = check_range("visible light level", level, 0..=100)?;
    Ok(format!("*{level:04}!").into_bytes())
}

/// Encode a black-body temperature set-point.
pub fn encode_black_body_temperature(setpoint: u32) -> DeviceResult<Vec<u8>> {
    let setpoint = check_range("black-body set-point", setpoint, 0..=40_000)?;
    Ok(format!("*{setpoint:06}#").into_bytes())
}

fn check_temperature_frame(reply: &[u8]) -> DeviceResult<()> {
    if reply.len() == TEMPERATURE_FRAME_LEN
        && reply.first() == Some(&b'*')
        && reply.last() == Some(&b'#')
    {
        Ok(())
    } else {
        Err(DeviceError::protocol(format!(
            "malformed black-body reply {:?}",
            String::from_utf8_lossy(reply)
        )))
    }
}

/// Measured black-body temperature in degrees Celsius from a 15-byte reply.
pub fn parse_black_body_temperature(reply: &[u8]) -> DeviceResult<f64> {
    check_temperature_frame(reply)?;

    let sign = match reply[SIGN_OFFSET] {
        b'H' => 1.0,
        b'L' => -1.0,
        other => {
            return Err(DeviceError::protocol(format!(
                "unknown temperature sign marker {:?}",
                char::from(other)
            )))
        }
    };

    let digits = std::str::from_utf8(&reply[VALUE_RANGE])
        .map_err(|_| DeviceError::protocol("temperature field is not ASCII"))?;
    let raw: u32 = digits.parse().map_err(|_| {
        DeviceError::protocol(format!("temperature field {digits:?} is not a number"))
    })?;

    Ok(sign * f64::from(raw) / 1000.0)
}

/// Light source protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct LightSource;

impl DeviceProtocol for LightSource {
    fn kind(&self) -> DeviceKind {
        DeviceKind::LightSource
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
            Command::SetIndicationPower { power } => Ok(Request::new(
                command.name(),
                encode_indication_power(power)?,
                ReplyFraming::Exact(LEVEL_FRAME_LEN),
            )),
            Command::SetVisibleLight { level } => Ok(Request::new(
                command.name(),
                encode_visible_light(level)?,
                ReplyFraming::Exact(LEVEL_FRAME_LEN),
            )),
            Command::SetBlackBodyTemperature { setpoint }
            | Command::ReadBlackBodyTemperature { setpoint } => Ok(Request::new(
                command.name(),
                encode_black_body_temperature(setpoint)?,
                ReplyFraming::Exact(TEMPERATURE_FRAME_LEN),
            )),
            _ => Err(unsupported(self.kind(), command)),
        }
    }

    fn decode(&self, command: &Command, reply: &[u8]) -> DeviceResult<Reply> {
        match *command {
            Command::SetIndicationPower { power } => {
                expect_echo(&encode_indication_power(power)?, reply)
            }
            Command::SetVisibleLight { level } => expect_echo(&encode_visible_light(level)?, reply),
            Command::SetBlackBodyTemperature { .. } => {
                check_temperature_frame(reply)?;
                Ok(Reply::Ack)
            }
            Command::ReadBlackBodyTemperature { .. } => {
                parse_black_body_temperature(reply).map(Reply::Temperature)
            }
            _ => Err(unsupported(self.kind(), command)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_levels() {
        assert_eq!(encode_indication_power(0).unwrap(), b"*0000@");
        assert_eq!(encode_indication_power(1000).unwrap(), b"*1000@");
        assert_eq!(encode_visible_light(55).unwrap(), b"*0055!");
        assert_eq!(encode_black_body_temperature(40_000).unwrap(), b"*040000#");
        assert_eq!(encode_black_body_temperature(250).unwrap(), b"*000250#");
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(encode_indication_power(1001).is_err());
        assert!(encode_visible_light(101).is_err());
        assert!(encode_black_body_temperature(40_001).is_err());

        let err = LightSource
            .encode(&Command::SetIndicationPower { power: 1500 })
            .unwrap_err();
        assert!(matches!(err, DeviceError::Protocol(_)));
    }

    #[test]
    fn test_power_succeeds_only_on_echo() {
        let cmd = Command::SetIndicationPower { power: 500 };
        assert_eq!(LightSource.decode(&cmd, b"*0500@").unwrap(), Reply::Ack);
        assert!(LightSource.decode(&cmd, b"*1000@").is_err());
        assert!(LightSource.decode(&cmd, b"*0500").is_err());
    }

    #[test]
    fn test_parse_temperature() {
        assert_eq!(parse_black_body_temperature(b"*0400000H25125#").unwrap(), 25.125);
        assert_eq!(parse_black_body_temperature(b"*0400000L01500#").unwrap(), -1.5);
    }

    #[test]
    fn test_parse_temperature_rejects_bad_frames() {
        // wrong length
        assert!(parse_black_body_temperature(b"*040000H25125#").is_err());
        // bad sign
        assert!(parse_black_body_temperature(b"*0400000X25125#").is_err());
        // missing trailer
        assert!(parse_black_body_temperature(b"*0400000H251250").is_err());
        // non-digit value
        assert!(parse_black_body_temperature(b"*0400000H2a125#").is_err());
    }

    #[test]
    fn test_set_temperature_accepts_any_framed_reply() {
        let cmd = Command::SetBlackBodyTemperature { setpoint: 30_000 };
        assert_eq!(LightSource.decode(&cmd, b"*0300000H29990#").unwrap(), Reply::Ack);
        assert!(LightSource.decode(&cmd, b"*030000#").is_err());
    }

    #[test]
    fn test_laser_commands_unsupported() {
        let err = LightSource.encode(&Command::ReadLaserTemperature).unwrap_err();
        assert!(matches!(err, DeviceError::UnsupportedCommand { .. }));
    }
}
