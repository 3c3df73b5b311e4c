//! Named collection of device sessions.
//!
//! The registry is the surface the outer boundary talks to: each external
//! request maps to exactly one call here. Sessions are created at
//! [`add`](DeviceRegistry::add) with the protocol picked by the descriptor's
//! type tag; their links and tasks only exist between `connect` and
//! `disconnect`.

use crate::config::{DeviceDescriptor, LabConfig, SessionTimings};
use crate::error::{DeviceError, DeviceResult};
use crate::protocol::{Command, DeviceKind, Reply};
use crate::session::DeviceSession;
use crate::transport::{SerialTransportFactory, TransportFactory};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

/// Devices by unique name.
pub struct DeviceRegistry {
    sessions: RwLock<HashMap<String, DeviceSession>>,
    factory: Arc<dyn TransportFactory>,
    timings: SessionTimings,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.names())
            .field("timings", &self.timings)
            .finish()
    }
}

impl DeviceRegistry {
    /// Empty registry whose sessions get links from `factory`.
    pub fn new(factory: Arc<dyn TransportFactory>, timings: SessionTimings) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            factory,
            timings,
        }
    }

    /// Empty registry backed by real serial ports.
    pub fn with_serial(timings: SessionTimings) -> Self {
        Self::new(Arc::new(SerialTransportFactory), timings)
    }

    /// Registry pre-populated with every device in `config`.
    pub fn from_config(
        config: &LabConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> DeviceResult<Self> {
        let registry = Self::new(factory, config.timing.to_timings());
        for descriptor in &config.devices {
            registry.add(descriptor.clone())?;
        }
        Ok(registry)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, DeviceSession>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a device. Fails without touching the registry when the type
    /// tag is unknown or the name is already taken.
    pub fn add(&self, descriptor: DeviceDescriptor) -> DeviceResult<()> {
        let name = descriptor.name.clone();
        let kind = descriptor.device_type.clone();
        let session = DeviceSession::new(descriptor, self.factory.clone(), self.timings)?;

        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if sessions.contains_key(&name) {
            return Err(DeviceError::AlreadyExists(name));
        }
        sessions.insert(name.clone(), session);
        info!(device = %name, kind = %kind, "Device registered");
        Ok(())
    }

    /// The session registered under `name`.
    pub fn session(&self, name: &str) -> DeviceResult<DeviceSession> {
        self.read()
            .get(name)
            .cloned()
            .ok_or_else(|| DeviceError::NotFound(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Connect `name`, returning whether it is now connected.
    ///
    /// Link and handshake failures are logged and reported as `Ok(false)`;
    /// only an unknown name is an error. Use [`try_connect`](Self::try_connect)
    /// for the failure detail.
    pub async fn connect(&self, name: &str) -> DeviceResult<bool> {
        let session = self.session(name)?;
        match session.connect().await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(device = %name, error = %e, "Connect failed");
                Ok(false)
            }
        }
    }

    /// Connect `name`, surfacing the failure.
    pub async fn try_connect(&self, name: &str) -> DeviceResult<()> {
        self.session(name)?.connect().await
    }

    /// Add `descriptor` if its name is new, then connect it.
    pub async fn connect_with(&self, descriptor: DeviceDescriptor) -> DeviceResult<bool> {
        let name = descriptor.name.clone();
        match self.add(descriptor) {
            Ok(()) | Err(DeviceError::AlreadyExists(_)) => {}
            Err(e) => return Err(e),
        }
        self.connect(&name).await
    }

    /// Disconnect `name`. Disconnecting an already disconnected device is a no-op.
    pub async fn disconnect(&self, name: &str) -> DeviceResult<()> {
        self.session(name)?.disconnect().await;
        Ok(())
    }

    /// Disconnect every device.
    pub async fn disconnect_all(&self) {
        let sessions: Vec<DeviceSession> = self.read().values().cloned().collect();
        for session in sessions {
            session.disconnect().await;
        }
    }

    /// Whether `name` is connected.
    pub fn status(&self, name: &str) -> DeviceResult<bool> {
        Ok(self.session(name)?.is_connected())
    }

    /// Connection status of every device.
    pub fn status_all(&self) -> BTreeMap<String, bool> {
        self.read()
            .iter()
            .map(|(name, session)| (name.clone(), session.is_connected()))
            .collect()
    }

    /// Run `command` on `name`.
    pub async fn execute(&self, name: &str, command: &Command) -> DeviceResult<Reply> {
        self.session(name)?.execute(command).await
    }

    /// Alphabetically first device of `kind`, if any.
    pub fn first_of_kind(&self, kind: DeviceKind) -> Option<DeviceSession> {
        self.read()
            .values()
            .filter(|session| session.kind() == kind)
            .min_by(|a, b| a.name().cmp(b.name()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SerialSettings;
    use crate::transport::MockTransportFactory;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(Arc::new(MockTransportFactory::default()), SessionTimings::default())
    }

    fn descriptor(name: &str, kind: &str) -> DeviceDescriptor {
        DeviceDescriptor::new(name, kind, SerialSettings::new(format!("/dev/{name}")))
    }

    #[test]
    fn test_add_and_status() {
        let registry = registry();
        registry.add(descriptor("laser", "laser_1064nm")).unwrap();
        assert!(!registry.status("laser").unwrap());
        assert_eq!(registry.names(), vec!["laser".to_string()]);
    }

    #[test]
    fn test_unknown_type_leaves_registry_unchanged() {
        let registry = registry();
        let err = registry.add(descriptor("dev", "unknown")).unwrap_err();
        assert!(matches!(err, DeviceError::UnsupportedType(_)));
        assert!(matches!(registry.status("dev"), Err(DeviceError::NotFound(_))));
        assert!(registry.status_all().is_empty());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = registry();
        registry.add(descriptor("stage", "motor_three_axis")).unwrap();
        let err = registry.add(descriptor("stage", "light_source")).unwrap_err();
        assert!(matches!(err, DeviceError::AlreadyExists(_)));
        assert_eq!(registry.session("stage").unwrap().kind(), DeviceKind::MotorThreeAxis);
    }

    #[tokio::test]
    async fn test_unknown_names_are_not_found() {
        let registry = registry();
        assert!(matches!(registry.connect("ghost").await, Err(DeviceError::NotFound(_))));
        assert!(matches!(registry.disconnect("ghost").await, Err(DeviceError::NotFound(_))));
        assert!(matches!(
            registry.execute("ghost", &Command::ReadLaserTemperature).await,
            Err(DeviceError::NotFound(_))
        ));
    }

    #[test]
    fn test_first_of_kind() {
        let registry = registry();
        registry.add(descriptor("source_b", "light_source")).unwrap();
        registry.add(descriptor("laser", "laser_1064nm")).unwrap();
        registry.add(descriptor("source_a", "light_source")).unwrap();

        let found = registry.first_of_kind(DeviceKind::LightSource).unwrap();
        assert_eq!(found.name(), "source_a");
        assert!(registry.first_of_kind(DeviceKind::CcdCamera).is_none());
    }

    #[test]
    fn test_from_config() {
        let config = LabConfig::from_toml_str(
            r#"
            [[devices]]
            name = "camera"
            device_type = "ccd_camera"
            serial = { port = "/dev/ttyUSB3" }
            "#,
        )
        .unwrap();
        let factory = Arc::new(MockTransportFactory::default());
        let registry = DeviceRegistry::from_config(&config, factory).unwrap();
        assert_eq!(registry.status_all().get("camera"), Some(&false));
    }
}
