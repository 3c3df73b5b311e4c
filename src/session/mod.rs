//! Device sessions
//!
//! A [`DeviceSession`] owns the whole lifecycle of one instrument link:
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──handshake ok──▶ Connected
//!      ▲                        │                           │
//!      │                 open/handshake fails        heartbeat or link
//!      │                        │                      failure
//!      └────────────────────────┴──── teardown ◀── Faulted ◀┘
//! ```
//!
//! While connected, a command worker and a heartbeat monitor run as tokio
//! tasks. Teardown stops both through a `watch` flag, joins each within the
//! configured bound (aborting stragglers), and closes the transport exactly
//! once. State changes are broadcast; see [`DeviceSession::subscribe`].

pub mod channel;
pub mod heartbeat;

pub use channel::{CommandChannel, FaultHandler, Priority, Response};
pub use heartbeat::HeartbeatMonitor;

use crate::config::{DeviceDescriptor, SessionTimings};
use crate::error::{ConcurrencyError, DeviceError, DeviceResult};
use crate::protocol::{Command, DeviceKind, DeviceProtocol, Reply, RetryUntil, Request};
use crate::transport::{SharedTransport, TransportFactory};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connection lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No link and no tasks
    Disconnected,
    /// Link opening or handshake in progress
    Connecting,
    /// Handshake passed; commands are accepted
    Connected,
    /// A heartbeat or the link failed; teardown is in progress
    Faulted,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

/// Tasks and link of a live connection.
struct Running {
    generation: u64,
    transport: SharedTransport,
    channel: Arc<CommandChannel>,
    stop_tx: watch::Sender<bool>,
    worker: JoinHandle<()>,
    monitor: Option<JoinHandle<()>>,
}

struct SessionInner {
    descriptor: DeviceDescriptor,
    kind: DeviceKind,
    protocol: Arc<dyn DeviceProtocol>,
    factory: Arc<dyn TransportFactory>,
    timings: SessionTimings,
    state: Mutex<ConnectionState>,
    events: broadcast::Sender<ConnectionState>,
    generation: AtomicU64,
    running: tokio::sync::Mutex<Option<Running>>,
}

/// One instrument's connection, command path, and liveness monitoring.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("name", &self.inner.descriptor.name)
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .finish()
    }
}

impl DeviceSession {
    /// Create a disconnected session. Fails with
    /// [`DeviceError::UnsupportedType`] for an unknown type tag.
    pub fn new(
        descriptor: DeviceDescriptor,
        factory: Arc<dyn TransportFactory>,
        timings: SessionTimings,
    ) -> DeviceResult<Self> {
        let kind: DeviceKind = descriptor.device_type.parse()?;
        let (events, _) = broadcast::channel(16);

        Ok(Self {
            inner: Arc::new(SessionInner {
                descriptor,
                kind,
                protocol: kind.protocol(),
                factory,
                timings,
                state: Mutex::new(ConnectionState::Disconnected),
                events,
                generation: AtomicU64::new(0),
                running: tokio::sync::Mutex::new(None),
            }),
        })
    }

    /// Unique name the session was registered under.
    pub fn name(&self) -> &str {
        &self.inner.descriptor.name
    }

    /// Device class, from the descriptor's type tag.
    pub fn kind(&self) -> DeviceKind {
        self.inner.kind
    }

    /// Descriptor the session was created from.
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.inner.descriptor
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True only in [`ConnectionState::Connected`].
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Receive every state change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.events.subscribe()
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = {
            let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            let changed = *state != next;
            *state = next;
            changed
        };
        if changed {
            debug!(device = %self.name(), state = %next, "State change");
            // No subscribers is fine
            let _ = self.inner.events.send(next);
        }
    }

    /// Open the link, start the worker, and verify the device with one
    /// heartbeat before reporting success. Connecting a connected session is
    /// a no-op.
    ///
    /// On any failure the session is left disconnected with no tasks running
    /// and the error is returned.
    pub async fn connect(&self) -> DeviceResult<()> {
        let mut running = self.inner.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let port = &self.inner.descriptor.serial.port;
        info!(device = %self.name(), kind = %self.kind(), port = %port, "Connecting");
        self.set_state(ConnectionState::Connecting);

        let mut link = self.inner.factory.create(&self.inner.descriptor.serial);
        if let Err(e) = link.open().await {
            warn!(device = %self.name(), error = %e, "Failed to open link");
            self.set_state(ConnectionState::Disconnected);
            return Err(e.into());
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let transport: SharedTransport = Arc::new(tokio::sync::Mutex::new(link));
        let channel = Arc::new(CommandChannel::new(self.name()));
        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = channel.spawn_worker(
            transport.clone(),
            stop_rx,
            self.inner.timings.idle_poll,
            self.fault_handler(generation),
        );

        let mut live = Running {
            generation,
            transport,
            channel: channel.clone(),
            stop_tx,
            worker,
            monitor: None,
        };

        if !self.inner.timings.handshake_delay.is_zero() {
            tokio::time::sleep(self.inner.timings.handshake_delay).await;
        }

        let monitor = HeartbeatMonitor::new(
            self.name(),
            self.inner.protocol.clone(),
            channel,
            self.inner.timings.heartbeat_interval,
            self.inner.timings.heartbeat_timeout,
        );

        if let Err(e) = monitor.probe().await {
            warn!(device = %self.name(), error = %e, "Handshake failed");
            self.teardown(live).await;
            self.set_state(ConnectionState::Disconnected);
            return Err(e);
        }

        let monitor = monitor.spawn(live.stop_tx.subscribe(), self.fault_handler(generation));
        live.monitor = Some(monitor);
        *running = Some(live);
        self.set_state(ConnectionState::Connected);
        info!(device = %self.name(), "Connected");
        Ok(())
    }

    /// Stop the tasks and close the link. Safe to call in any state and
    /// any number of times.
    pub async fn disconnect(&self) {
        let live = self.inner.running.lock().await.take();
        if let Some(live) = live {
            info!(device = %self.name(), "Disconnecting");
            self.teardown(live).await;
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Encode `command`, send it through the command channel, and decode the
    /// reply.
    ///
    /// Values outside the documented ranges are rejected before anything is
    /// queued. Commands with a resend policy are retried until the reply
    /// decodes or the policy's budget runs out.
    pub async fn execute(&self, command: &Command) -> DeviceResult<Reply> {
        let request = self.inner.protocol.encode(command)?;
        let channel = self.live_channel().await?;

        debug!(device = %self.name(), op = command.name(), payload = ?request.payload, "Executing");
        match request.retry {
            None => {
                let reply = channel
                    .submit(request, self.inner.timings.command_timeout)
                    .await?;
                self.inner.protocol.decode(command, &reply.bytes)
            }
            Some(policy) => {
                self.execute_until_acknowledged(&channel, command, request, policy)
                    .await
            }
        }
    }

    async fn execute_until_acknowledged(
        &self,
        channel: &CommandChannel,
        command: &Command,
        request: Request,
        policy: RetryUntil,
    ) -> DeviceResult<Reply> {
        let started = tokio::time::Instant::now();
        let mut attempt = 0u32;

        loop {
            let remaining = policy.budget.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                warn!(
                    device = %self.name(),
                    op = command.name(),
                    attempts = attempt,
                    "No acknowledgement"
                );
                return Err(ConcurrencyError::Timeout(policy.budget).into());
            }

            attempt += 1;
            let timeout = remaining.min(self.inner.timings.command_timeout);
            let outcome = channel
                .submit(request.clone(), timeout)
                .await
                .and_then(|reply| self.inner.protocol.decode(command, &reply.bytes));

            match outcome {
                Ok(reply) => {
                    debug!(device = %self.name(), op = command.name(), attempt, "Acknowledged");
                    return Ok(reply);
                }
                Err(e @ DeviceError::Concurrency(ConcurrencyError::ChannelClosed)) => return Err(e),
                Err(e) if e.faults_session() => return Err(e),
                Err(e) => debug!(
                    device = %self.name(),
                    op = command.name(),
                    attempt,
                    error = %e,
                    "Retrying"
                ),
            }

            let remaining = policy.budget.saturating_sub(started.elapsed());
            tokio::time::sleep(policy.interval.min(remaining)).await;
        }
    }

    /// The command channel of the live connection, for callers that need raw
    /// exchanges. `None` while disconnected.
    pub async fn channel(&self) -> Option<Arc<CommandChannel>> {
        self.inner
            .running
            .lock()
            .await
            .as_ref()
            .map(|live| live.channel.clone())
    }

    async fn live_channel(&self) -> DeviceResult<Arc<CommandChannel>> {
        match self.channel().await {
            Some(channel) if self.is_connected() => Ok(channel),
            _ => Err(DeviceError::NotConnected(self.name().to_string())),
        }
    }

    /// Build the callback tasks use to report a failure of connection
    /// `generation`. Reports from an older connection are ignored.
    fn fault_handler(&self, generation: u64) -> FaultHandler {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |reason: String| {
            if let Some(inner) = weak.upgrade() {
                let session = DeviceSession { inner };
                tokio::spawn(async move { session.fault(generation, reason).await });
            }
        })
    }

    async fn fault(&self, generation: u64, reason: String) {
        let mut running = self.inner.running.lock().await;
        let current = running.as_ref().map(|live| live.generation);
        if current != Some(generation) || self.state() != ConnectionState::Connected {
            debug!(device = %self.name(), %reason, "Ignoring fault from a finished connection");
            return;
        }

        warn!(device = %self.name(), %reason, "Session faulted");
        self.set_state(ConnectionState::Faulted);
        if let Some(live) = running.take() {
            self.teardown(live).await;
        }
        self.set_state(ConnectionState::Disconnected);
    }

    async fn teardown(&self, live: Running) {
        let Running {
            transport,
            stop_tx,
            worker,
            monitor,
            ..
        } = live;

        let _ = stop_tx.send(true);
        let bound = self.inner.timings.join_timeout;
        if let Some(monitor) = monitor {
            join_bounded(self.name(), "heartbeat monitor", monitor, bound).await;
        }
        join_bounded(self.name(), "command worker", worker, bound).await;

        let mut link = transport.lock().await;
        if let Err(e) = link.close().await {
            warn!(device = %self.name(), error = %e, "Error closing link");
        }
        debug!(device = %self.name(), "Link closed");
    }
}

/// Wait up to `bound` for `handle`, then abort it.
async fn join_bounded(device: &str, task: &str, mut handle: JoinHandle<()>, bound: Duration) {
    match tokio::time::timeout(bound, &mut handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_cancelled() => {}
        Ok(Err(e)) => warn!(device, task, error = %e, "Task panicked"),
        Err(_) => {
            warn!(device, task, ?bound, "Task did not stop in time, aborting");
            handle.abort();
            let _ = handle.await;
        }
    }
}
