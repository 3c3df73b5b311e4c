//! CCD camera heartbeat channel.
//!
//! Frame acquisition runs through the camera vendor's SDK outside this crate;
//! over serial the camera only answers a 2-byte heartbeat `[0x02, 0x03]`.

use super::{unsupported, Command, DeviceKind, DeviceProtocol, Reply, Request};
use crate::error::DeviceResult;
use crate::transport::ReplyFraming;

const READ_STATUS: u8 = 0x03;

/// CCD camera protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct CcdCamera;

impl DeviceProtocol for CcdCamera {
    fn kind(&self) -> DeviceKind {
        DeviceKind::CcdCamera
    }

    fn heartbeat(&self) -> Request {
        Request::new(
            "heartbeat",
            vec![self.kind().discriminant(), READ_STATUS],
            ReplyFraming::Exact(2),
        )
    }

    fn verify_heartbeat(&self, reply: &[u8]) -> bool {
        reply.len() >= 2 && reply[0] == self.kind().discriminant()
    }

    fn encode(&self, command: &Command) -> DeviceResult<Request> {
        Err(unsupported(self.kind(), command))
    }

    fn decode(&self, command: &Command, _reply: &[u8]) -> DeviceResult<Reply> {
        Err(unsupported(self.kind(), command))
    }
}
