//! RS-232/RS-485 transport over `tokio-serial`.
//!
//! Ports are opened with no flow control; data bits, stop bits, parity and the
//! read timeout come from [`SerialSettings`]. Before each write any unread
//! input is discarded so a late reply from an earlier exchange cannot be
//! taken for the current one.

use super::{ReplyFraming, Transport, TransportFactory};
use crate::config::SerialSettings;
use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;

#[cfg(feature = "instrument_serial")]
use crate::config::Parity;
#[cfg(feature = "instrument_serial")]
use tokio::io::AsyncWriteExt;
#[cfg(feature = "instrument_serial")]
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

/// Serial link to one instrument.
pub struct SerialTransport {
    settings: SerialSettings,

    #[cfg(feature = "instrument_serial")]
    port: Option<SerialStream>,
}

impl SerialTransport {
    /// Create an unopened transport.
    pub fn new(settings: SerialSettings) -> Self {
        Self {
            settings,
            #[cfg(feature = "instrument_serial")]
            port: None,
        }
    }

    /// Connection settings of this link.
    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }
}

#[cfg(feature = "instrument_serial")]
fn data_bits(bits: u8) -> tokio_serial::DataBits {
    match bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    }
}

#[cfg(feature = "instrument_serial")]
fn stop_bits(bits: u8) -> tokio_serial::StopBits {
    match bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    }
}

#[cfg(feature = "instrument_serial")]
fn parity(parity: Parity) -> tokio_serial::Parity {
    match parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        #[cfg(feature = "instrument_serial")]
        {
            if self.port.is_some() {
                return Ok(());
            }

            let s = &self.settings;
            let port = tokio_serial::new(&s.port, s.baud_rate)
                .data_bits(data_bits(s.data_bits))
                .stop_bits(stop_bits(s.stop_bits))
                .parity(parity(s.parity))
                .flow_control(tokio_serial::FlowControl::None)
                .timeout(s.timeout())
                .open_native_async()
                .map_err(|e| TransportError::Open {
                    port: s.port.clone(),
                    reason: e.to_string(),
                })?;

            tracing::debug!(port = %s.port, baud = s.baud_rate, "Serial port opened");
            self.port = Some(port);
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(TransportError::FeatureDisabled)
        }
    }

    async fn exchange(
        &mut self,
        payload: &[u8],
        framing: &ReplyFraming,
    ) -> Result<Bytes, TransportError> {
        #[cfg(feature = "instrument_serial")]
        {
            let timeout = self.settings.timeout();
            let port = self.port.as_mut().ok_or(TransportError::NotOpen)?;

            if let Err(e) = port.clear(tokio_serial::ClearBuffer::Input) {
                tracing::trace!(error = %e, "Failed to clear serial input buffer");
            }

            port.write_all(payload).await?;
            port.flush().await?;
            tracing::trace!(bytes = payload.len(), "Serial write complete");

            super::read_framed(port, framing, timeout).await
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = (payload, framing);
            Err(TransportError::FeatureDisabled)
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        #[cfg(feature = "instrument_serial")]
        {
            if self.port.take().is_some() {
                tracing::debug!(port = %self.settings.port, "Serial port closed");
            }
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        #[cfg(feature = "instrument_serial")]
        {
            self.port.is_some()
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            false
        }
    }
}

/// Opens real serial ports.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialTransportFactory;

impl TransportFactory for SerialTransportFactory {
    fn create(&self, settings: &SerialSettings) -> Box<dyn Transport> {
        Box::new(SerialTransport::new(settings.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_never_opened_is_noop() {
        let mut transport = SerialTransport::new(SerialSettings::new("/dev/ttyUSB0"));
        assert!(!transport.is_open());
        transport.close().await.unwrap();
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_exchange_before_open_fails() {
        let mut transport = SerialTransport::new(SerialSettings::new("/dev/ttyUSB0"));
        let result = transport.exchange(b"*0500@", &ReplyFraming::Exact(6)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_open_missing_port_fails() {
        let mut transport =
            SerialTransport::new(SerialSettings::new("/dev/this-port-does-not-exist"));
        assert!(transport.open().await.is_err());
        assert!(!transport.is_open());
    }
}
