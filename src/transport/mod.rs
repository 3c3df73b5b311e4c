//! Serial transports
//!
//! A [`Transport`] owns one physical link and performs atomic write-then-read
//! exchanges on it. It is purely mechanical I/O: no retries, no protocol
//! knowledge beyond the [`ReplyFraming`] the caller hands in to say when a
//! reply is complete.
//!
//! Implementations:
//! - [`SerialTransport`]: RS-232/RS-485 via `tokio-serial`
//! - [`MockTransport`]: scripted replies and recorded writes for tests

pub mod mock;
pub mod serial;

pub use mock::{MockReply, MockTransport, MockTransportFactory};
pub use serial::{SerialTransport, SerialTransportFactory};

use crate::config::SerialSettings;
use crate::error::TransportError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;

/// When a reply is complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyFraming {
    /// Exactly this many bytes
    Exact(usize),
    /// Up to and including this byte sequence
    Until(&'static [u8]),
}

impl ReplyFraming {
    /// Whether `buf` holds a complete reply.
    pub fn is_complete(&self, buf: &[u8]) -> bool {
        match self {
            ReplyFraming::Exact(n) => buf.len() >= *n,
            ReplyFraming::Until(term) => buf.ends_with(term),
        }
    }

    /// Largest read that cannot run past the end of the reply.
    fn next_read_len(&self, buffered: usize) -> usize {
        match self {
            ReplyFraming::Exact(n) => n.saturating_sub(buffered).max(1),
            // Terminated replies are read byte by byte so nothing after the
            // terminator is consumed.
            ReplyFraming::Until(_) => 1,
        }
    }
}

/// One physical link.
#[async_trait]
pub trait Transport: Send {
    /// Open the link. Opening an already open link is a no-op.
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Write the full payload, then read until `framing` is satisfied or the
    /// read timeout elapses.
    ///
    /// A timeout with no bytes is [`TransportError::Timeout`]; a timeout after
    /// a partial reply returns the partial bytes for the caller to reject.
    async fn exchange(
        &mut self,
        payload: &[u8],
        framing: &ReplyFraming,
    ) -> Result<Bytes, TransportError>;

    /// Close the link. Idempotent, and safe on a link that was never opened.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Whether the link is currently open.
    fn is_open(&self) -> bool;
}

/// Creates transports from connection settings.
pub trait TransportFactory: Send + Sync {
    /// Build an unopened transport for `settings`.
    fn create(&self, settings: &SerialSettings) -> Box<dyn Transport>;
}

/// A transport behind its exclusive-access guard.
///
/// Holding the lock for the duration of an exchange is what keeps a single
/// exchange in flight per link.
pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

/// Read one framed reply from `reader`, giving up after `timeout`.
pub async fn read_framed<R>(
    reader: &mut R,
    framing: &ReplyFraming,
    timeout: Duration,
) -> Result<Bytes, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let mut response = BytesMut::with_capacity(32);
    let mut buf = [0u8; 64];

    while !framing.is_complete(&response) {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        let want = framing.next_read_len(response.len()).min(buf.len());
        match tokio::time::timeout(remaining, reader.read(&mut buf[..want])).await {
            Ok(Ok(0)) => {
                if response.is_empty() {
                    return Err(TransportError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "serial port closed",
                    )));
                }
                break;
            }
            Ok(Ok(n)) => response.extend_from_slice(&buf[..n]),
            // Port timeout is shorter than our overall timeout
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Ok(Err(e)) => return Err(TransportError::Io(e)),
            Err(_) => break,
        }
    }

    if response.is_empty() {
        return Err(TransportError::Timeout(timeout));
    }
    Ok(response.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_framing_completion() {
        assert!(ReplyFraming::Exact(4).is_complete(&[1, 2, 3, 4]));
        assert!(!ReplyFraming::Exact(4).is_complete(&[1, 2, 3]));
        assert!(ReplyFraming::Until(b"\r\n").is_complete(b"ok\r\n"));
        assert!(!ReplyFraming::Until(b"\r\n").is_complete(b"ok\r"));
    }

    #[tokio::test]
    async fn test_read_exact_leaves_trailing_bytes() {
        let (mut device, mut host) = tokio::io::duplex(64);
        device.write_all(&[0x57, 0x32, 0x00, 0x51, 0xAA]).await.unwrap();

        let reply = read_framed(&mut host, &ReplyFraming::Exact(4), Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(&reply[..], &[0x57, 0x32, 0x00, 0x51]);

        let mut rest = [0u8; 1];
        host.read_exact(&mut rest).await.unwrap();
        assert_eq!(rest[0], 0xAA);
    }

    #[tokio::test]
    async fn test_read_until_terminator() {
        let (mut device, mut host) = tokio::io::duplex(64);
        device.write_all(b"\xFF/0S42\x03\r\n\xFFnext").await.unwrap();

        let reply = read_framed(
            &mut host,
            &ReplyFraming::Until(b"\x03\r\n\xFF"),
            Duration::from_millis(200),
        )
        .await
        .unwrap();
        assert_eq!(&reply[..], b"\xFF/0S42\x03\r\n\xFF");
    }

    #[tokio::test]
    async fn test_partial_reply_returned_on_timeout() {
        let (mut device, mut host) = tokio::io::duplex(64);
        device.write_all(b"*04").await.unwrap();

        let reply = read_framed(&mut host, &ReplyFraming::Exact(6), Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(&reply[..], b"*04");
    }

    #[tokio::test]
    async fn test_silence_is_timeout() {
        let (_device, mut host) = tokio::io::duplex(64);
        let err = read_framed(&mut host, &ReplyFraming::Exact(1), Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }
}
