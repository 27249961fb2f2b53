//! TCP transport
//!
//! One TCP connection per master channel. The MBAP length prefix removes
//! framing ambiguity: a receive reads the 7-byte header, then exactly the
//! advertised remainder. Reconnection is the worker's responsibility.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::modbus::constants::{MAX_PDU_SIZE, MBAP_HEADER_LEN};

use super::{hex_frame, Transport, TransportError};

/// TCP client transport for the master role
#[derive(Debug)]
pub struct TcpTransport {
    host: String,
    port: u16,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(host: impl Into<String>, port: u16, connect_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout,
            stream: None,
        }
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> &'static str {
        "tcp"
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        let addr = format!("{}:{}", self.host, self.port);
        debug!(%addr, "opening TCP transport");

        let stream = timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))?
            .map_err(|e| TransportError::ConnectionFailed(format!("{addr}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::ConnectionFailed(format!("set_nodelay: {e}")))?;

        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!(host = %self.host, port = self.port, "closed TCP transport");
        }
        Ok(())
    }

    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream_mut()?;
        let result = stream.write_all(frame).await;
        match result {
            Ok(()) => {
                debug!(direction = "send", frame = %hex_frame(frame), "tcp frame");
                Ok(())
            },
            Err(e) => {
                self.stream = None;
                Err(TransportError::SendFailed(e.to_string()))
            },
        }
    }

    async fn recv_frame(&mut self, deadline: Duration) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream_mut()?;

        let read = async {
            let mut header = [0u8; MBAP_HEADER_LEN];
            stream
                .read_exact(&mut header)
                .await
                .map_err(|e| TransportError::ConnectionLost(e.to_string()))?;

            // MBAP length counts bytes from the unit id onward; the unit id
            // is already part of the header we read.
            let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
            if length == 0 || length > MAX_PDU_SIZE + 1 {
                return Err(TransportError::ReceiveFailed(format!(
                    "implausible MBAP length {length}"
                )));
            }

            let mut frame = header.to_vec();
            frame.resize(MBAP_HEADER_LEN + length - 1, 0);
            stream
                .read_exact(&mut frame[MBAP_HEADER_LEN..])
                .await
                .map_err(|e| TransportError::ConnectionLost(e.to_string()))?;
            Ok(frame)
        };

        let result = timeout(deadline, read).await;
        let frame = match result {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                self.stream = None;
                return Err(e);
            },
            Err(_) => return Err(TransportError::Timeout(deadline)),
        };

        debug!(direction = "recv", frame = %hex_frame(&frame), "tcp frame");
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::frame::encode_mbap;
    use crate::modbus::pdu::Pdu;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_send_recv_mbap_framing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(n, 12);
            // Answer with an MBAP-framed FC3 response
            let pdu = Pdu::from_slice(&[0x03, 0x02, 0x12, 0x34]).unwrap();
            socket.write_all(&encode_mbap(1, 1, &pdu)).await.unwrap();
        });

        let mut transport = TcpTransport::new(addr.ip().to_string(), addr.port(),
            Duration::from_secs(1));
        transport.open().await.unwrap();
        assert!(transport.is_connected());

        let pdu = Pdu::from_slice(&[0x03, 0x00, 0x64, 0x00, 0x01]).unwrap();
        transport.send_frame(&encode_mbap(1, 1, &pdu)).await.unwrap();

        let frame = transport.recv_frame(Duration::from_secs(1)).await.unwrap();
        assert_eq!(frame.len(), 11);
        assert_eq!(&frame[7..], &[0x03, 0x02, 0x12, 0x34]);

        transport.close().await.unwrap();
        assert!(!transport.is_connected());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_recv_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _guard = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut transport = TcpTransport::new(addr.ip().to_string(), addr.port(),
            Duration::from_secs(1));
        transport.open().await.unwrap();

        let err = transport
            .recv_frame(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        // A timeout does not tear down the link by itself
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 1 is essentially never listening
        let mut transport =
            TcpTransport::new("127.0.0.1", 1, Duration::from_millis(500));
        assert!(transport.open().await.is_err());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_send_without_open() {
        let mut transport = TcpTransport::new("127.0.0.1", 502, Duration::from_secs(1));
        let err = transport.send_frame(&[0x00]).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }
}
