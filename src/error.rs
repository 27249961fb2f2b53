//! Error handling for the gateway
//!
//! One service-wide error enum; transport and protocol layers define their
//! own narrow error types which are wrapped here at the channel boundary.

use thiserror::Error;

use crate::modbus::codec::ModbusException;
use crate::transport::TransportError;

/// Gateway error type
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    Io(String),

    /// Transport open/read/write failures
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Frame-level errors: CRC mismatch, short frame, MBAP mismatch
    #[error("Frame error: {0}")]
    Frame(String),

    /// General protocol errors (malformed PDU, unexpected function code)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer answered with a Modbus exception PDU
    #[error("Modbus exception: {0}")]
    Exception(ModbusException),

    /// Decoding raw registers into a typed value failed
    #[error("Decode error: {0}")]
    Decode(String),

    /// Data serialization and deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Realtime bus access errors
    #[error("Bus error: {0}")]
    Bus(String),

    /// Channel not found
    #[error("Channel {0} not found")]
    ChannelNotFound(u16),

    /// Point not found
    #[error("Point not found: {0}")]
    PointNotFound(String),

    /// Invalid operation for the current state or role
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Operation timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The channel is stopping; the in-flight operation was abandoned
    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, GatewayError>;

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Serialization(format!("JSON error: {err}"))
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        GatewayError::Serialization(format!("YAML error: {err}"))
    }
}

impl From<redis::RedisError> for GatewayError {
    fn from(err: redis::RedisError) -> Self {
        GatewayError::Bus(err.to_string())
    }
}

impl GatewayError {
    pub fn config(msg: impl Into<String>) -> Self {
        GatewayError::Config(msg.into())
    }

    pub fn frame(msg: impl Into<String>) -> Self {
        GatewayError::Frame(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        GatewayError::Protocol(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        GatewayError::Decode(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        GatewayError::Timeout(msg.into())
    }

    /// True for errors that compromise the link and require a reconnect
    pub fn is_transport_fatal(&self) -> bool {
        matches!(self, GatewayError::Transport(_) | GatewayError::Io(_))
    }
}

/// Extension trait for adding context to foreign errors
pub trait ErrorExt<T> {
    fn config_error(self, msg: &str) -> Result<T>;
    fn io_error(self, msg: &str) -> Result<T>;
    fn frame_error(self, msg: &str) -> Result<T>;
}

impl<T, E> ErrorExt<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn config_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| GatewayError::Config(format!("{msg}: {e}")))
    }

    fn io_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| GatewayError::Io(format!("{msg}: {e}")))
    }

    fn frame_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| GatewayError::Frame(format!("{msg}: {e}")))
    }
}
