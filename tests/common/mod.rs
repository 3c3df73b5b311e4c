//! Shared fixtures: a registry wired to mock links that behave like healthy
//! instruments, with short timings.
#![allow(dead_code)]

use labctl::config::{DeviceDescriptor, SerialSettings, SessionTimings};
use labctl::protocol::heartbeat;
use labctl::session::ConnectionState;
use labctl::transport::{MockReply, MockTransport, MockTransportFactory};
use labctl::{DeviceKind, DeviceRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Read timeout of every mock link.
pub const MOCK_READ_TIMEOUT: Duration = Duration::from_millis(40);

pub fn timings() -> SessionTimings {
    SessionTimings {
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_timeout: Duration::from_millis(300),
        command_timeout: Duration::from_millis(300),
        handshake_delay: Duration::ZERO,
        join_timeout: Duration::from_millis(500),
        idle_poll: Duration::from_millis(5),
    }
}

/// A healthy one-register read reply from device class `discriminant`.
pub fn heartbeat_reply(discriminant: u8) -> Vec<u8> {
    vec![discriminant, 0x03, 0x02, 0x00, 0x01, 0x00, 0x00]
}

fn is_heartbeat(kind: DeviceKind, payload: &[u8]) -> bool {
    match kind {
        DeviceKind::CcdCamera => payload == [0x02, 0x03],
        _ => payload == heartbeat::frame(kind.discriminant()).as_slice(),
    }
}

/// Reply the way a healthy `kind` device would.
pub fn healthy_reply(kind: DeviceKind, payload: &[u8]) -> MockReply {
    if is_heartbeat(kind, payload) {
        return MockReply::Bytes(match kind {
            DeviceKind::CcdCamera => vec![0x02, 0x00],
            _ => heartbeat_reply(kind.discriminant()),
        });
    }

    let bytes = match kind {
        DeviceKind::LightSource if payload.ends_with(b"#") => b"*0400000H25125#".to_vec(),
        DeviceKind::LightSource => payload.to_vec(),
        DeviceKind::Laser1064nm => match payload {
            [0x93] => vec![0x5D],
            // 25.00 degrees
            [0x28, 0x00, 0x00, 0x12] => vec![0x28, 0xC4, 0x09, 0x12],
            _ => payload.to_vec(),
        },
        DeviceKind::MotorThreeAxis if payload.ends_with(b"?\r") => {
            b"\xFF/0S1200\x03\r\n\xFF".to_vec()
        }
        DeviceKind::MotorThreeAxis => b"\xFF/0S\x03\r\n\xFF".to_vec(),
        DeviceKind::CcdCamera => return MockReply::Silent,
    };
    MockReply::Bytes(bytes)
}

/// A registry over mock links.
pub struct Bench {
    pub registry: DeviceRegistry,
    pub factory: MockTransportFactory,
}

impl Bench {
    pub fn new() -> Self {
        let factory = MockTransportFactory::new(MOCK_READ_TIMEOUT);
        let registry = DeviceRegistry::new(Arc::new(factory.clone()), timings());
        Self { registry, factory }
    }

    pub fn port(name: &str) -> String {
        format!("/dev/mock-{name}")
    }

    pub fn descriptor(name: &str, kind: DeviceKind) -> DeviceDescriptor {
        DeviceDescriptor::new(name, kind.tag(), SerialSettings::new(Self::port(name)))
    }

    /// Register a healthy device and return its link.
    pub fn add(&self, name: &str, kind: DeviceKind) -> MockTransport {
        self.registry.add(Self::descriptor(name, kind)).unwrap();
        let mock = self.factory.mock_for(&Self::port(name));
        mock.set_responder(move |payload| healthy_reply(kind, payload));
        mock
    }
}

/// Collect state events until `target` arrives or `within` passes.
pub async fn states_until(
    events: &mut broadcast::Receiver<ConnectionState>,
    target: ConnectionState,
    within: Duration,
) -> Vec<ConnectionState> {
    let mut seen = Vec::new();
    let _ = tokio::time::timeout(within, async {
        while let Ok(state) = events.recv().await {
            seen.push(state);
            if state == target {
                break;
            }
        }
    })
    .await;
    seen
}

/// Poll `cond` every millisecond for up to `within`.
pub async fn eventually(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    cond()
}
