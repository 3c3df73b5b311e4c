//! Periodic liveness probing.

use super::channel::{CommandChannel, FaultHandler};
use crate::error::{DeviceError, DeviceResult};
use crate::protocol::DeviceProtocol;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Sends a heartbeat through the command channel every `interval` and faults
/// the session on the first reply that fails verification.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    device: String,
    protocol: Arc<dyn DeviceProtocol>,
    channel: Arc<CommandChannel>,
    interval: Duration,
    timeout: Duration,
}

impl HeartbeatMonitor {
    /// Monitor probing `device` every `interval`, waiting up to `timeout`
    /// for each reply.
    pub fn new(
        device: impl Into<String>,
        protocol: Arc<dyn DeviceProtocol>,
        channel: Arc<CommandChannel>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            device: device.into(),
            protocol,
            channel,
            interval,
            timeout,
        }
    }

    /// Run one heartbeat exchange and verify the reply.
    ///
    /// Used for the connect handshake as well as by the periodic loop. Any
    /// failure, including silence, is reported as [`DeviceError::Liveness`].
    pub async fn probe(&self) -> DeviceResult<()> {
        let reply = self
            .channel
            .heartbeat_exchange(self.protocol.heartbeat(), self.timeout)
            .await
            .map_err(|e| DeviceError::Liveness(format!("no heartbeat reply: {e}")))?;

        if self.protocol.verify_heartbeat(&reply.bytes) {
            debug!(device = %self.device, "Heartbeat ok");
            Ok(())
        } else {
            Err(DeviceError::Liveness(format!(
                "unexpected heartbeat reply {:02X?}",
                &reply.bytes[..]
            )))
        }
    }

    /// Start the periodic loop. It ends when `stop` turns true or after the
    /// first failed probe, which is reported through `on_fault`.
    pub fn spawn(self, mut stop: watch::Receiver<bool>, on_fault: FaultHandler) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {}
                    _ = stop.changed() => break,
                }
                if *stop.borrow() {
                    break;
                }

                let outcome = tokio::select! {
                    outcome = self.probe() => outcome,
                    _ = stop.changed() => break,
                };

                if let Err(err) = outcome {
                    error!(device = %self.device, error = %err, "Heartbeat failed");
                    on_fault(err.to_string());
                    break;
                }
            }
            debug!(device = %self.device, "Heartbeat monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{heartbeat, LightSource};
    use crate::transport::{MockReply, MockTransport, SharedTransport, Transport};
    use tokio::sync::Mutex as AsyncMutex;

    async fn setup(
        mock: &MockTransport,
    ) -> (Arc<CommandChannel>, watch::Sender<bool>, JoinHandle<()>) {
        let mut link = mock.clone();
        link.open().await.unwrap();
        let transport: SharedTransport = Arc::new(AsyncMutex::new(Box::new(link)));
        let channel = Arc::new(CommandChannel::new("light"));
        let (stop_tx, stop_rx) = watch::channel(false);
        let no_fault: FaultHandler = Arc::new(|_| {});
        let worker = channel.spawn_worker(transport, stop_rx, Duration::from_millis(5), no_fault);
        (channel, stop_tx, worker)
    }

    fn monitor(channel: Arc<CommandChannel>) -> HeartbeatMonitor {
        HeartbeatMonitor::new(
            "light",
            Arc::new(LightSource),
            channel,
            Duration::from_millis(20),
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn test_probe_accepts_matching_discriminant() {
        let mock = MockTransport::new(Duration::from_millis(30));
        mock.push_reply(MockReply::Bytes(vec![0x01, 0x03, 0x02, 0x00, 0x01, 0x79, 0x84]));
        let (channel, stop_tx, worker) = setup(&mock).await;

        monitor(channel).probe().await.unwrap();
        assert_eq!(mock.writes(), vec![heartbeat::frame(0x01)]);

        stop_tx.send(true).unwrap();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_probe_rejects_wrong_reply_and_silence() {
        let mock = MockTransport::new(Duration::from_millis(30));
        mock.push_reply(MockReply::Bytes(vec![0x04, 0x03, 0x02, 0x00, 0x01]));
        mock.push_reply(MockReply::Silent);
        let (channel, stop_tx, worker) = setup(&mock).await;
        let monitor = monitor(channel);

        assert!(matches!(monitor.probe().await, Err(DeviceError::Liveness(_))));
        assert!(matches!(monitor.probe().await, Err(DeviceError::Liveness(_))));

        stop_tx.send(true).unwrap();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_probe_reports_fault() {
        let mock = MockTransport::new(Duration::from_millis(30));
        mock.set_responder(|_| MockReply::Bytes(vec![0xEE; 7]));
        let (channel, stop_tx, worker) = setup(&mock).await;

        let (fault_tx, mut fault_rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = monitor(channel).spawn(
            stop_tx.subscribe(),
            Arc::new(move |reason| {
                let _ = fault_tx.send(reason);
            }),
        );

        let reason = fault_rx.recv().await.unwrap();
        assert!(reason.contains("Heartbeat verification failed"));
        handle.await.unwrap();

        stop_tx.send(true).unwrap();
        worker.await.unwrap();
    }
}
