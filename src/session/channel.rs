//! Command channel: two-priority queue in front of one transport.
//!
//! Callers [`submit`](CommandChannel::submit) requests and wait, bounded, for
//! the reply. A single worker task drains the queues, always taking a pending
//! heartbeat before any normal operation, and performs each exchange while
//! holding the transport's exclusive-access guard. Heartbeat replies go to a
//! dedicated mailbox read only by the heartbeat monitor, so a late heartbeat
//! reply can never be mistaken for the answer to a user command.

use crate::error::{ConcurrencyError, DeviceError, DeviceResult};
use crate::protocol::Request;
use crate::transport::SharedTransport;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Callback the worker uses to report a link failure to its session.
pub type FaultHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Queue an operation waits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Liveness probes; always served first
    Heartbeat,
    /// Everything else, in submission order
    Normal,
}

/// Raw reply bytes with the time they arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Reply as read from the link
    pub bytes: Bytes,
    /// When the exchange completed
    pub received_at: DateTime<Utc>,
}

enum ReplyRoute {
    Caller(oneshot::Sender<DeviceResult<Response>>),
    Heartbeat,
}

/// One queued exchange.
struct Operation {
    request: Request,
    priority: Priority,
    submitted_at: DateTime<Utc>,
    route: ReplyRoute,
}

impl Operation {
    fn abandoned(&self) -> bool {
        match &self.route {
            ReplyRoute::Caller(tx) => tx.is_closed(),
            ReplyRoute::Heartbeat => false,
        }
    }
}

#[derive(Default)]
struct Queues {
    heartbeat: VecDeque<Operation>,
    normal: VecDeque<Operation>,
    closed: bool,
}

impl Queues {
    fn pop(&mut self) -> Option<Operation> {
        self.heartbeat.pop_front().or_else(|| self.normal.pop_front())
    }
}

/// Serializes access to one device link.
pub struct CommandChannel {
    device: String,
    queues: Mutex<Queues>,
    wakeup: Notify,
    heartbeat_tx: mpsc::UnboundedSender<DeviceResult<Response>>,
    heartbeat_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<DeviceResult<Response>>>,
}

impl std::fmt::Debug for CommandChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queues = self.lock_queues();
        f.debug_struct("CommandChannel")
            .field("device", &self.device)
            .field("heartbeat_pending", &queues.heartbeat.len())
            .field("normal_pending", &queues.normal.len())
            .finish()
    }
}

impl CommandChannel {
    /// Create an idle channel for `device`.
    pub fn new(device: impl Into<String>) -> Self {
        let (heartbeat_tx, heartbeat_rx) = mpsc::unbounded_channel();
        Self {
            device: device.into(),
            queues: Mutex::new(Queues::default()),
            wakeup: Notify::new(),
            heartbeat_tx,
            heartbeat_rx: tokio::sync::Mutex::new(heartbeat_rx),
        }
    }

    fn lock_queues(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, op: Operation) -> DeviceResult<()> {
        {
            let mut queues = self.lock_queues();
            if queues.closed {
                return Err(ConcurrencyError::ChannelClosed.into());
            }
            match op.priority {
                Priority::Heartbeat => queues.heartbeat.push_back(op),
                Priority::Normal => queues.normal.push_back(op),
            }
        }
        self.wakeup.notify_one();
        Ok(())
    }

    /// Whether the worker has stopped for good.
    pub fn is_closed(&self) -> bool {
        self.lock_queues().closed
    }

    /// Number of operations waiting in each queue, heartbeat first.
    pub fn pending(&self) -> (usize, usize) {
        let queues = self.lock_queues();
        (queues.heartbeat.len(), queues.normal.len())
    }

    /// Queue a normal-priority request and wait up to `timeout` for its reply.
    ///
    /// On timeout the operation is abandoned: if the worker has not started
    /// it yet it is skipped, otherwise its reply is discarded.
    pub async fn submit(&self, request: Request, timeout: Duration) -> DeviceResult<Response> {
        let (tx, rx) = oneshot::channel();
        trace!(device = %self.device, op = request.kind, "Submitting operation");
        self.enqueue(Operation {
            request,
            priority: Priority::Normal,
            submitted_at: Utc::now(),
            route: ReplyRoute::Caller(tx),
        })?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConcurrencyError::ChannelClosed.into()),
            Err(_) => Err(ConcurrencyError::Timeout(timeout).into()),
        }
    }

    /// Queue a heartbeat probe whose reply goes to the heartbeat mailbox.
    pub fn enqueue_heartbeat(&self, request: Request) -> DeviceResult<()> {
        self.enqueue(Operation {
            request,
            priority: Priority::Heartbeat,
            submitted_at: Utc::now(),
            route: ReplyRoute::Heartbeat,
        })
    }

    /// Send a heartbeat and wait up to `timeout` for its reply.
    ///
    /// Replies left over from earlier, timed-out probes are discarded first.
    pub async fn heartbeat_exchange(
        &self,
        request: Request,
        timeout: Duration,
    ) -> DeviceResult<Response> {
        let mut mailbox = self.heartbeat_rx.lock().await;
        while let Ok(stale) = mailbox.try_recv() {
            debug!(device = %self.device, ok = stale.is_ok(), "Discarding stale heartbeat reply");
        }

        self.enqueue_heartbeat(request)?;

        match tokio::time::timeout(timeout, mailbox.recv()).await {
            Ok(Some(result)) => result,
            Ok(None) => Err(ConcurrencyError::ChannelClosed.into()),
            Err(_) => Err(ConcurrencyError::Timeout(timeout).into()),
        }
    }

    /// Start the worker loop.
    ///
    /// The worker exits when `stop` turns true, or after reporting a link
    /// failure through `on_fault`. Queued operations left behind are dropped,
    /// which wakes their callers with [`ConcurrencyError::ChannelClosed`].
    pub fn spawn_worker(
        self: &Arc<Self>,
        transport: SharedTransport,
        mut stop: watch::Receiver<bool>,
        idle_poll: Duration,
        on_fault: FaultHandler,
    ) -> JoinHandle<()> {
        let channel = Arc::clone(self);

        tokio::spawn(async move {
            debug!(device = %channel.device, "Command worker started");

            loop {
                if *stop.borrow() {
                    break;
                }

                let next = channel.lock_queues().pop();
                let Some(op) = next else {
                    tokio::select! {
                        _ = channel.wakeup.notified() => {}
                        _ = tokio::time::sleep(idle_poll) => {}
                        changed = stop.changed() => {
                            // Session dropped without stopping us
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                    continue;
                };

                if op.abandoned() {
                    trace!(
                        device = %channel.device,
                        op = op.request.kind,
                        "Skipping abandoned operation"
                    );
                    continue;
                }

                let exchange = async {
                    let mut link = transport.lock().await;
                    link.exchange(&op.request.payload, &op.request.framing).await
                };

                let result = tokio::select! {
                    result = exchange => result,
                    _ = stop.changed() => {
                        debug!(
                            device = %channel.device,
                            op = op.request.kind,
                            "Stop requested during exchange"
                        );
                        break;
                    }
                };

                let waited = Utc::now() - op.submitted_at;
                trace!(
                    device = %channel.device,
                    op = op.request.kind,
                    priority = ?op.priority,
                    elapsed_ms = waited.num_milliseconds(),
                    ok = result.is_ok(),
                    "Exchange complete"
                );

                let result = result
                    .map(|bytes| Response {
                        bytes,
                        received_at: Utc::now(),
                    })
                    .map_err(DeviceError::from);

                let fault = match &result {
                    Err(err) if err.faults_session() => Some(err.to_string()),
                    _ => None,
                };

                match op.route {
                    ReplyRoute::Caller(tx) => {
                        if tx.send(result).is_err() {
                            trace!(
                                device = %channel.device,
                                "Caller gave up before the reply arrived"
                            );
                        }
                    }
                    ReplyRoute::Heartbeat => {
                        let _ = channel.heartbeat_tx.send(result);
                    }
                }

                if let Some(reason) = fault {
                    warn!(device = %channel.device, %reason, "Link failure, stopping worker");
                    on_fault(reason);
                    break;
                }
            }

            // Refuse new work and wake anyone still waiting on a queued operation.
            let leftover = {
                let mut queues = channel.lock_queues();
                queues.closed = true;
                (
                    std::mem::take(&mut queues.heartbeat),
                    std::mem::take(&mut queues.normal),
                )
            };
            drop(leftover);
            debug!(device = %channel.device, "Command worker stopped");
        })
    }
}
