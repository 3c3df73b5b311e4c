//! Mock transport for tests and dry runs.
//!
//! Replies come from a scripted queue or from a responder closure that sees
//! each payload. Every write is recorded, and the number of `open`/`close`
//! calls and the peak number of concurrent exchanges are tracked so tests can
//! assert on link usage. Clones share state, so a test keeps one handle while
//! a session owns another.

use super::{ReplyFraming, Transport, TransportFactory};
use crate::config::SerialSettings;
use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// What the mock device does in response to one write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// Reply with these bytes
    Bytes(Vec<u8>),
    /// Say nothing; the read times out
    Silent,
    /// Never return from the exchange
    Hang,
    /// Fail the exchange with an I/O error of this kind
    Error(std::io::ErrorKind),
}

type Responder = Arc<dyn Fn(&[u8]) -> MockReply + Send + Sync>;

#[derive(Default)]
struct MockState {
    open: bool,
    fail_open: bool,
    open_calls: usize,
    close_calls: usize,
    writes: Vec<Vec<u8>>,
    replies: VecDeque<MockReply>,
    responder: Option<Responder>,
    delay: Duration,
    in_flight: usize,
    max_in_flight: usize,
}

/// Scripted, recording stand-in for a serial link.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    read_timeout: Duration,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}

impl MockTransport {
    /// Create a mock whose silent replies time out after `read_timeout`.
    pub fn new(read_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            read_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a reply for a future exchange. Queued replies win over the responder.
    pub fn push_reply(&self, reply: MockReply) {
        self.lock().replies.push_back(reply);
    }

    /// Answer every exchange without a queued reply by calling `responder`.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&[u8]) -> MockReply + Send + Sync + 'static,
    {
        self.lock().responder = Some(Arc::new(responder));
    }

    /// Delay every exchange by `delay` before replying.
    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = delay;
    }

    /// Make the next `open` calls fail.
    pub fn set_fail_open(&self, fail: bool) {
        self.lock().fail_open = fail;
    }

    /// Every payload written so far, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    /// Number of `open` calls.
    pub fn open_count(&self) -> usize {
        self.lock().open_calls
    }

    /// Number of `close` calls.
    pub fn close_count(&self) -> usize {
        self.lock().close_calls
    }

    /// Highest number of exchanges that were ever running at the same time.
    pub fn max_concurrent_exchanges(&self) -> usize {
        self.lock().max_in_flight
    }

    fn next_reply(&self, payload: &[u8]) -> (MockReply, Duration) {
        let mut state = self.lock();
        state.writes.push(payload.to_vec());
        state.in_flight += 1;
        state.max_in_flight = state.max_in_flight.max(state.in_flight);

        let reply = match state.replies.pop_front() {
            Some(reply) => reply,
            None => match &state.responder {
                Some(responder) => responder(payload),
                None => MockReply::Silent,
            },
        };
        (reply, state.delay)
    }

    fn finish_exchange(&self) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
    }
}

/// Decrements the in-flight counter even when the exchange future is dropped.
struct InFlight<'a>(&'a MockTransport);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.finish_exchange();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.open_calls += 1;
        if state.fail_open {
            return Err(TransportError::Open {
                port: "mock".to_string(),
                reason: "scripted open failure".to_string(),
            });
        }
        state.open = true;
        Ok(())
    }

    async fn exchange(
        &mut self,
        payload: &[u8],
        _framing: &ReplyFraming,
    ) -> Result<Bytes, TransportError> {
        if !self.lock().open {
            return Err(TransportError::NotOpen);
        }

        let (reply, delay) = self.next_reply(payload);
        let _in_flight = InFlight(&*self);

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match reply {
            MockReply::Bytes(bytes) => Ok(Bytes::from(bytes)),
            MockReply::Silent => {
                tokio::time::sleep(self.read_timeout).await;
                Err(TransportError::Timeout(self.read_timeout))
            }
            MockReply::Hang => std::future::pending().await,
            MockReply::Error(kind) => Err(TransportError::Io(std::io::Error::new(
                kind,
                "scripted I/O failure",
            ))),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.close_calls += 1;
        state.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.lock().open
    }
}

/// Hands out one shared [`MockTransport`] per port path.
#[derive(Clone, Default)]
pub struct MockTransportFactory {
    mocks: Arc<Mutex<HashMap<String, MockTransport>>>,
    read_timeout: Option<Duration>,
}

impl MockTransportFactory {
    /// Create a factory whose mocks time out silent reads after `read_timeout`.
    pub fn new(read_timeout: Duration) -> Self {
        Self {
            mocks: Arc::default(),
            read_timeout: Some(read_timeout),
        }
    }

    /// The mock behind `port`, created on first use.
    pub fn mock_for(&self, port: &str) -> MockTransport {
        let mut mocks = self.mocks.lock().unwrap_or_else(PoisonError::into_inner);
        mocks
            .entry(port.to_string())
            .or_insert_with(|| match self.read_timeout {
                Some(timeout) => MockTransport::new(timeout),
                None => MockTransport::default(),
            })
            .clone()
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self, settings: &SerialSettings) -> Box<dyn Transport> {
        Box::new(self.mock_for(&settings.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_replies_and_recording() {
        let mock = MockTransport::default();
        let mut link = mock.clone();
        link.open().await.unwrap();

        mock.push_reply(MockReply::Bytes(b"*0500@".to_vec()));
        let reply = link
            .exchange(b"*0500@", &ReplyFraming::Exact(6))
            .await
            .unwrap();

        assert_eq!(&reply[..], b"*0500@");
        assert_eq!(mock.writes(), vec![b"*0500@".to_vec()]);
        assert_eq!(mock.max_concurrent_exchanges(), 1);
    }

    #[tokio::test]
    async fn test_silent_times_out() {
        let mock = MockTransport::new(Duration::from_millis(10));
        let mut link = mock.clone();
        link.open().await.unwrap();

        let err = link.exchange(&[0x93], &ReplyFraming::Exact(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_exchange_requires_open() {
        let mut link = MockTransport::default();
        let err = link.exchange(&[0x93], &ReplyFraming::Exact(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::NotOpen));
    }

    #[tokio::test]
    async fn test_factory_shares_mock_per_port() {
        let factory = MockTransportFactory::default();
        let handle = factory.mock_for("COM1");

        let mut link = factory.create(&SerialSettings::new("COM1"));
        link.open().await.unwrap();

        assert_eq!(handle.open_count(), 1);
        assert_eq!(factory.mock_for("COM2").open_count(), 0);
    }
}
