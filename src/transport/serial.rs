//! Serial RTU transport
//!
//! Opens the configured serial port and delimits frames by the inter-frame
//! silence the Modbus line discipline mandates: 3.5 character times at the
//! current baud rate (fixed at 1.75 ms above 19200 baud). A receive
//! completes when the inter-byte gap exceeds that threshold.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::debug;

use crate::config::Parity;
use crate::modbus::constants::MAX_RTU_FRAME;

use super::{hex_frame, Transport, TransportError};

/// Serial line parameters for one RTU bus
#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub device: String,
    pub baud: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
}

impl SerialSettings {
    /// Bits on the wire per character: start + data + parity + stop
    fn bits_per_char(&self) -> u32 {
        1 + u32::from(self.data_bits)
            + u32::from(self.parity != Parity::N)
            + u32::from(self.stop_bits)
    }

    /// The 3.5-character inter-frame silence at the configured baud rate
    pub fn inter_frame_silence(&self) -> Duration {
        if self.baud > 19_200 {
            return Duration::from_micros(1750);
        }
        let micros = 3_500_000u64 * u64::from(self.bits_per_char()) / u64::from(self.baud);
        Duration::from_micros(micros.max(1))
    }

    fn to_parity(&self) -> tokio_serial::Parity {
        match self.parity {
            Parity::N => tokio_serial::Parity::None,
            Parity::E => tokio_serial::Parity::Even,
            Parity::O => tokio_serial::Parity::Odd,
        }
    }

    fn to_data_bits(&self) -> tokio_serial::DataBits {
        match self.data_bits {
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    fn to_stop_bits(&self) -> tokio_serial::StopBits {
        match self.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        }
    }
}

/// RTU serial transport
#[derive(Debug)]
pub struct SerialTransport {
    settings: SerialSettings,
    silence: Duration,
    port: Option<SerialStream>,
}

impl SerialTransport {
    pub fn new(settings: SerialSettings) -> Self {
        let silence = settings.inter_frame_silence();
        Self {
            settings,
            silence,
            port: None,
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> &'static str {
        "rtu"
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        debug!(device = %self.settings.device, baud = self.settings.baud, "opening serial port");

        let port = tokio_serial::new(&self.settings.device, self.settings.baud)
            .data_bits(self.settings.to_data_bits())
            .parity(self.settings.to_parity())
            .stop_bits(self.settings.to_stop_bits())
            .open_native_async()
            .map_err(|e| {
                TransportError::ConnectionFailed(format!("{}: {e}", self.settings.device))
            })?;

        #[cfg(unix)]
        {
            let mut port = port;
            port.set_exclusive(false)
                .map_err(|e| TransportError::ConnectionFailed(format!("set_exclusive: {e}")))?;
            self.port = Some(port);
        }
        #[cfg(not(unix))]
        {
            self.port = Some(port);
        }

        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.port.take().is_some() {
            // The port closes when dropped.
            debug!(device = %self.settings.device, "closed serial port");
        }
        Ok(())
    }

    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;

        let result = async {
            port.write_all(frame).await?;
            port.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                debug!(direction = "send", frame = %hex_frame(frame), "rtu frame");
                Ok(())
            },
            Err(e) => {
                self.port = None;
                Err(TransportError::SendFailed(e.to_string()))
            },
        }
    }

    async fn recv_frame(&mut self, deadline: Duration) -> Result<Vec<u8>, TransportError> {
        let silence = self.silence;
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;

        let mut frame: Vec<u8> = Vec::with_capacity(64);
        let mut chunk = [0u8; 64];

        // Wait for the first bytes within the caller's deadline.
        let first = timeout(deadline, port.read(&mut chunk)).await;
        match first {
            Ok(Ok(0)) => {
                self.port = None;
                return Err(TransportError::ConnectionLost("port closed".into()));
            },
            Ok(Ok(n)) => frame.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => {
                self.port = None;
                return Err(TransportError::ReceiveFailed(e.to_string()));
            },
            Err(_) => return Err(TransportError::Timeout(deadline)),
        }

        // Keep reading until the line goes quiet for 3.5 character times.
        loop {
            let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;
            let next = timeout(silence, port.read(&mut chunk)).await;
            match next {
                Ok(Ok(0)) => {
                    self.port = None;
                    return Err(TransportError::ConnectionLost("port closed".into()));
                },
                Ok(Ok(n)) => {
                    frame.extend_from_slice(&chunk[..n]);
                    if frame.len() > MAX_RTU_FRAME {
                        return Err(TransportError::ReceiveFailed(format!(
                            "frame exceeds {MAX_RTU_FRAME} bytes"
                        )));
                    }
                },
                Ok(Err(e)) => {
                    self.port = None;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                },
                // Inter-byte gap exceeded: the frame is complete.
                Err(_) => break,
            }
        }

        debug!(direction = "recv", frame = %hex_frame(&frame), "rtu frame");
        Ok(frame)
    }
}
