//! Pulsed 1064 nm laser protocol.
//!
//! Binary commands: a header byte, a little-endian `u16` argument, a trailer byte.
//! The laser acknowledges a set command by echoing the 4-byte frame.
//!
//! | Command              | Frame                          | Range        |
//! |----------------------|--------------------------------|--------------|
//! | Reset receive stack  | `0x93`                         | none         |
//! | Power (mW)           | `0x57 u16le 0x51`              | 0..=100      |
//! | Frequency            | `0x65 u16le(code) 0x6A`        | 1..=500000 Hz|
//! | Pulse width          | `0xA5 u16le 0x5A`              | 10..=100     |
//! | Temperature read     | `0x28 0x00 0x00 0x12`          | none         |
//!
//! The receive-stack reset is resent every 10 ms until a reply starting with
//! `0x5D` arrives, for at most 2 s.

use super::{
    check_range, expect_echo, heartbeat, unsupported, Command, DeviceKind, DeviceProtocol, Reply,
    Request, RetryUntil,
};
use crate::error::{DeviceError, DeviceResult};
use crate::transport::ReplyFraming;
use std::time::Duration;

const RESET: u8 = 0x93;
const RESET_ACK: u8 = 0x5D;
const POWER: (u8, u8) = (0x57, 0x51);
const FREQUENCY: (u8, u8) = (0x65, 0x6A);
const PULSE_WIDTH: (u8, u8) = (0xA5, 0x5A);
const TEMPERATURE: (u8, u8) = (0x28, 0x12);

/// Resend policy of the receive-stack reset.
pub const RESET_RETRY: RetryUntil = RetryUntil {
    interval: Duration::from_millis(10),
    budget: Duration::from_secs(2),
};

/// Fixed frequency points above the 10 kHz band, with their codes.
///
/// Code 91 is 50 kHz, shared with the top of the 10 kHz band
/// (`88 + (50000 - 20000) / 10000`), so 91 and 92 are distinct frequencies.
const HIGH_BAND: [(u32, u16); 5] = [
    (50_000, 91),
    (100_000, 92),
    (200_000, 93),
    (400_000, 94),
    (500_000, 95),
];

/// A requested frequency snapped to the laser's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantizedFrequency {
    /// Table code sent to the laser
    pub code: u16,
    /// Frequency the laser will actually run at, in Hz
    pub hz: u32,
}

/// Round `hz` to the nearest multiple of `step`, halves rounding up.
fn snap(hz: u32, step: u32) -> u32 {
    (hz + step / 2) / step * step
}

/// Snap `hz` to a step band `[low, high]` and compute `base + (f - low) / step`.
///
/// The point one step below `low` is the previous band's top point, code
/// `base - 1`, so a value may snap down onto it.
fn band(hz: u32, step: u32, low: u32, high: u32, base: u16) -> QuantizedFrequency {
    let floor = low - step;
    let snapped = snap(hz, step).clamp(floor, high);
    // (high - floor) / step is at most 19, so the narrowing cannot truncate.
    let offset = ((snapped - floor) / step) as u16;
    QuantizedFrequency {
        code: base - 1 + offset,
        hz: snapped,
    }
}

/// Map a repetition frequency to the laser's discrete code table.
///
/// | Requested         | Step     | Code                     |
/// |-------------------|----------|--------------------------|
/// | 1..=50            | 1 Hz     | `f`                      |
/// | 51..=100          | 5 Hz     | `51 + (f - 55) / 5`      |
/// | 101..=1000        | 50 Hz    | `61 + (f - 150) / 50`    |
/// | 1001..=10000      | 1 kHz    | `79 + (f - 2000) / 1000` |
/// | 10001..=50000     | 10 kHz   | `88 + (f - 20000) / 10000` |
/// | 50001..=500000    | nearest of 50k/100k/200k/400k/500k | 91..=95 |
///
/// Band edges belong to the lower band. A value near the bottom of a band
/// may snap down to the previous band's top point (`51` gives code 50).
pub fn frequency_code(hz: u32) -> DeviceResult<QuantizedFrequency> {
    let q = match hz {
        1..=50 => QuantizedFrequency {
            code: hz as u16,
            hz,
        },
        51..=100 => band(hz, 5, 55, 100, 51),
        101..=1_000 => band(hz, 50, 150, 1_000, 61),
        1_001..=10_000 => band(hz, 1_000, 2_000, 10_000, 79),
        10_001..=50_000 => band(hz, 10_000, 20_000, 50_000, 88),
        50_001..=500_000 => {
            let (point, code) = HIGH_BAND
                .iter()
                .copied()
                .min_by_key(|&(point, _)| (point.abs_diff(hz), std::cmp::Reverse(point)))
                .unwrap_or(HIGH_BAND[HIGH_BAND.len() - 1]);
            QuantizedFrequency { code, hz: point }
        }
        _ => {
            return Err(DeviceError::protocol(format!(
                "frequency {hz} Hz out of range 1..=500000"
            )))
        }
    };
    Ok(q)
}

fn frame(header_trailer: (u8, u8), value: u16) -> Vec<u8> {
    let [lo, hi] = value.to_le_bytes();
    vec![header_trailer.0, lo, hi, header_trailer.1]
}

/// Encode a power set command.
pub fn encode_power(milliwatts: u16) -> DeviceResult<Vec<u8>> {
    let milliwatts = check_range("laser power (mW)", milliwatts, 0..=100)?;
    Ok(frame(POWER, milliwatts))
}

/// Encode a frequency set command.
pub fn encode_frequency(hz: u32) -> DeviceResult<Vec<u8>> {
    let q = frequency_code(hz)?;
    Ok(frame(FREQUENCY, q.code))
}

/// Encode a pulse-width set command.
pub fn encode_pulse_width(width: u16) -> DeviceResult<Vec<u8>> {
    let width = check_range("pulse width", width, 10..=100)?;
    Ok(frame(PULSE_WIDTH, width))
}

/// Temperature read command.
pub fn encode_temperature_read() -> Vec<u8> {
    frame(TEMPERATURE, 0)
}

/// Temperature in degrees Celsius from a `[0x28, lo, hi, 0x12]` reply.
pub fn parse_temperature(reply: &[u8]) -> DeviceResult<f64> {
    match reply {
        [header, lo, hi, trailer] if (*header, *trailer) == TEMPERATURE => {
            Ok(f64::from(u16::from_le_bytes([*lo, *hi])) / 100.0)
        }
        _ => Err(DeviceError::protocol(format!(
            "malformed temperature reply {reply:02X?}"
        ))),
    }
}

/// 1064 nm laser protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct Laser1064nm;

impl DeviceProtocol for Laser1064nm {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Laser1064nm
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
        let framed = ReplyFraming::Exact(4);
        match *command {
            Command::ResetReceiveStack => {
                Ok(Request::new(command.name(), vec![RESET], ReplyFraming::Exact(1))
                    .retry_until(RESET_RETRY))
            }
            Command::SetLaserPower { milliwatts } => {
                Ok(Request::new(command.name(), encode_power(milliwatts)?, framed))
            }
            Command::SetFrequency { hz } => {
                let q = frequency_code(hz)?;
                if q.hz != hz {
                    tracing::debug!(
                        requested = hz,
                        actual = q.hz,
                        code = q.code,
                        "Frequency quantized"
                    );
                }
                Ok(Request::new(command.name(), frame(FREQUENCY, q.code), framed))
            }
            Command::SetPulseWidth { width } => {
                Ok(Request::new(command.name(), encode_pulse_width(width)?, framed))
            }
            Command::ReadLaserTemperature => {
                Ok(Request::new(command.name(), encode_temperature_read(), framed))
            }
            _ => Err(unsupported(self.kind(), command)),
        }
    }

    fn decode(&self, command: &Command, reply: &[u8]) -> DeviceResult<Reply> {
        match *command {
            Command::ResetReceiveStack => match reply.first() {
                Some(&RESET_ACK) => Ok(Reply::Ack),
                _ => Err(DeviceError::protocol(format!(
                    "receive-stack reset not acknowledged: {reply:02X?}"
                ))),
            },
            Command::SetLaserPower { milliwatts } => expect_echo(&encode_power(milliwatts)?, reply),
            Command::SetFrequency { hz } => expect_echo(&encode_frequency(hz)?, reply),
            Command::SetPulseWidth { width } => expect_echo(&encode_pulse_width(width)?, reply),
            Command::ReadLaserTemperature => parse_temperature(reply).map(Reply::Temperature),
            _ => Err(unsupported(self.kind(), command)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(hz: u32) -> u16 {
        frequency_code(hz).unwrap().code
    }

    #[test]
    fn test_encode_power() {
        assert_eq!(encode_power(50).unwrap(), vec![0x57, 0x32, 0x00, 0x51]);
        assert_eq!(encode_power(100).unwrap(), vec![0x57, 0x64, 0x00, 0x51]);
        assert!(encode_power(1500).is_err());
    }

    #[test]
    fn test_encode_frequency() {
        assert_eq!(encode_frequency(60).unwrap(), vec![0x65, 0x34, 0x00, 0x6A]);
        assert_eq!(encode_frequency(3000).unwrap(), vec![0x65, 0x50, 0x00, 0x6A]);
    }

    #[test]
    fn test_frequency_identity_band() {
        assert_eq!(code(1), 1);
        assert_eq!(code(25), 25);
        assert_eq!(code(50), 50);
    }

    #[test]
    fn test_frequency_band_edges() {
        // Upper edges belong to the lower band
        assert_eq!(frequency_code(100).unwrap(), QuantizedFrequency { code: 60, hz: 100 });
        assert_eq!(frequency_code(1_000).unwrap(), QuantizedFrequency { code: 78, hz: 1_000 });
        assert_eq!(frequency_code(10_000).unwrap(), QuantizedFrequency { code: 87, hz: 10_000 });
        assert_eq!(frequency_code(50_000).unwrap(), QuantizedFrequency { code: 91, hz: 50_000 });

        // First value of each band is nearest the previous band's top point
        assert_eq!(frequency_code(51).unwrap(), QuantizedFrequency { code: 50, hz: 50 });
        assert_eq!(frequency_code(101).unwrap(), QuantizedFrequency { code: 60, hz: 100 });
        assert_eq!(frequency_code(1_001).unwrap(), QuantizedFrequency { code: 78, hz: 1_000 });
        assert_eq!(
            frequency_code(10_001).unwrap(),
            QuantizedFrequency { code: 87, hz: 10_000 }
        );
    }

    #[test]
    fn test_frequency_near_band_bottom_snaps_down() {
        assert_eq!(frequency_code(52).unwrap(), QuantizedFrequency { code: 50, hz: 50 });
        assert_eq!(frequency_code(53).unwrap(), QuantizedFrequency { code: 51, hz: 55 });
        assert_eq!(frequency_code(110).unwrap(), QuantizedFrequency { code: 60, hz: 100 });
        assert_eq!(frequency_code(125).unwrap(), QuantizedFrequency { code: 61, hz: 150 });
        assert_eq!(frequency_code(1_200).unwrap(), QuantizedFrequency { code: 78, hz: 1_000 });
        assert_eq!(frequency_code(1_500).unwrap(), QuantizedFrequency { code: 79, hz: 2_000 });
        assert_eq!(
            frequency_code(11_000).unwrap(),
            QuantizedFrequency { code: 87, hz: 10_000 }
        );
        assert_eq!(
            frequency_code(15_000).unwrap(),
            QuantizedFrequency { code: 88, hz: 20_000 }
        );
    }

    #[test]
    fn test_frequency_snaps_to_nearest_step() {
        assert_eq!(code(57), 51);
        assert_eq!(code(58), 52);
        assert_eq!(code(174), 61);
        assert_eq!(code(175), 62);
        assert_eq!(code(2_499), 79);
        assert_eq!(code(2_500), 80);
        assert_eq!(code(34_999), 89);
        assert_eq!(code(35_000), 90);
    }

    #[test]
    fn test_frequency_high_band() {
        assert_eq!(code(60_000), 91);
        assert_eq!(code(75_000), 92);
        assert_eq!(code(100_000), 92);
        assert_eq!(code(180_000), 93);
        assert_eq!(code(300_000), 94);
        assert_eq!(code(460_000), 95);
        assert_eq!(code(500_000), 95);
    }

    #[test]
    fn test_frequency_out_of_range() {
        assert!(frequency_code(0).is_err());
        assert!(frequency_code(500_001).is_err());
        let err = Laser1064nm
            .encode(&Command::SetFrequency { hz: 600_000 })
            .unwrap_err();
        assert!(matches!(err, DeviceError::Protocol(_)));
    }

    #[test]
    fn test_pulse_width_range() {
        assert_eq!(encode_pulse_width(10).unwrap(), vec![0xA5, 0x0A, 0x00, 0x5A]);
        assert!(encode_pulse_width(9).is_err());
        assert!(encode_pulse_width(101).is_err());
    }

    #[test]
    fn test_parse_temperature() {
        // 0x0A28 = 2600 -> 26.00 C
        assert_eq!(parse_temperature(&[0x28, 0x28, 0x0A, 0x12]).unwrap(), 26.0);
        assert!(parse_temperature(&[0x28, 0x28, 0x0A]).is_err());
        assert!(parse_temperature(&[0x29, 0x28, 0x0A, 0x12]).is_err());
    }

    #[test]
    fn test_reset_request_retries() {
        let request = Laser1064nm.encode(&Command::ResetReceiveStack).unwrap();
        assert_eq!(request.payload, vec![0x93]);
        assert_eq!(request.retry, Some(RESET_RETRY));

        let cmd = Command::ResetReceiveStack;
        assert_eq!(Laser1064nm.decode(&cmd, &[0x5D]).unwrap(), Reply::Ack);
        assert!(Laser1064nm.decode(&cmd, &[0x00]).is_err());
        assert!(Laser1064nm.decode(&cmd, &[]).is_err());
    }

    #[test]
    fn test_set_commands_require_echo() {
        let cmd = Command::SetLaserPower { milliwatts: 50 };
        assert_eq!(
            Laser1064nm.decode(&cmd, &[0x57, 0x32, 0x00, 0x51]).unwrap(),
            Reply::Ack
        );
        assert!(Laser1064nm.decode(&cmd, &[0x57, 0x33, 0x00, 0x51]).is_err());
    }
}
