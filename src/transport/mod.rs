//! Transport layer
//!
//! One capability shared by both link types: open, close, send a frame,
//! receive a frame within a deadline. The master worker owns reconnection;
//! a transport only reports that the link is gone.

pub mod serial;
pub mod tcp;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use serial::SerialTransport;
pub use tcp::TcpTransport;

/// Transport layer error types
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Not connected")]
    NotConnected,

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl TransportError {
    /// Timeouts leave the link usable; everything else requires a reopen
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}

/// A bidirectional frame link to one remote device or serial bus
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Link type identifier ("tcp" / "rtu")
    fn kind(&self) -> &'static str;

    /// True when the link is currently open
    fn is_connected(&self) -> bool;

    /// Open the link
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Close the link; idempotent
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Send one complete ADU
    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Receive one complete ADU within the deadline
    async fn recv_frame(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;
}

/// Render a frame as spaced hex for trace logging
pub(crate) fn hex_frame(frame: &[u8]) -> String {
    frame
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        assert!(TransportError::Timeout(Duration::from_secs(1)).is_timeout());
        assert!(!TransportError::ConnectionLost("reset".into()).is_timeout());
    }

    #[test]
    fn test_hex_frame() {
        assert_eq!(hex_frame(&[0x01, 0x03, 0xC5]), "01 03 C5");
        assert_eq!(hex_frame(&[]), "");
    }
}
