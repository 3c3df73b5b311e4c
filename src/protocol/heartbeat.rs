//! Modbus-style heartbeat frames.
//!
//! The light source, laser and motor controller answer a Modbus RTU
//! "read holding register" probe: `[id, 0x03, 0x00, 0x00, 0x00, 0x01, crc_lo, crc_hi]`,
//! where `id` is the device class discriminant. A reply is healthy when it is
//! at least five bytes long and starts with the same discriminant.

use crate::transport::ReplyFraming;
use crc::{Crc, CRC_16_MODBUS};

/// Length of the reply to a one-register read: id, function, count, 2 data, 2 CRC.
pub const REPLY_LEN: usize = 7;

const MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC-16/MODBUS, sent low byte first.
pub fn crc16_modbus(data: &[u8]) -> u16 {
    MODBUS.checksum(data)
}

/// Heartbeat probe for the device class `discriminant`.
pub fn frame(discriminant: u8) -> Vec<u8> {
    let mut frame = vec![discriminant, 0x03, 0x00, 0x00, 0x00, 0x01];
    let crc = crc16_modbus(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Reply framing for [`frame`].
pub fn reply_framing() -> ReplyFraming {
    ReplyFraming::Exact(REPLY_LEN)
}

/// Whether `reply` answers a probe sent to `discriminant`.
pub fn verify(discriminant: u8, reply: &[u8]) -> bool {
    reply.len() >= 5 && reply[0] == discriminant
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_light_source_frame_matches_device_manual() {
        assert_eq!(frame(0x01), vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);
    }

    #[test]
    fn test_crc_check_value() {
        // Catalogue check value for CRC-16/MODBUS
        assert_eq!(crc16_modbus(b"123456789"), 0x4B37);
    }

    #[test]
    fn test_crc_of_frame_with_crc_is_zero() {
        for id in 1..=4u8 {
            assert_eq!(crc16_modbus(&frame(id)), 0);
        }
    }

    #[test]
    fn test_verify() {
        assert!(verify(0x01, &[0x01, 0x03, 0x02, 0x00, 0x01, 0x79, 0x84]));
        assert!(!verify(0x01, &[0x02, 0x03, 0x02, 0x00, 0x01]));
        assert!(!verify(0x01, &[0x01, 0x03]));
        assert!(!verify(0x01, &[]));
    }
}
