//! Structured gateway events
//!
//! Every notable occurrence (channel lifecycle, transport connect and
//! disconnect, transaction failures, decode warnings) is emitted as a
//! structured event through an [`EventSink`]. The default sink forwards to
//! `tracing`; tests use [`CollectingSink`] to assert on emitted events.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// Event severity, mapped onto tracing levels by the default sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Well-known event codes
pub mod codes {
    pub const CHANNEL_CREATED: &str = "channel_created";
    pub const CHANNEL_STARTED: &str = "channel_started";
    pub const CHANNEL_STOPPED: &str = "channel_stopped";
    pub const CHANNEL_RECONFIGURED: &str = "channel_reconfigured";
    pub const TRANSPORT_CONNECTED: &str = "transport_connected";
    pub const TRANSPORT_DISCONNECTED: &str = "transport_disconnected";
    pub const TRANSPORT_ERROR: &str = "transport_error";
    pub const TRANSACTION_FAILED: &str = "transaction_failed";
    pub const PROTOCOL_EXCEPTION: &str = "protocol_exception";
    pub const FRAME_ERROR: &str = "frame_error";
    pub const DECODE_WARNING: &str = "decode_warning";
    pub const IMAGE_OUT_OF_RANGE: &str = "image_out_of_range";
    pub const CLIENT_CONNECTED: &str = "client_connected";
    pub const CLIENT_DISCONNECTED: &str = "client_disconnected";
    pub const CLIENT_REJECTED: &str = "client_rejected";
    pub const BUS_DEGRADED: &str = "bus_degraded";
    pub const WRITE_FAILED: &str = "write_failed";
}

/// A single structured event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Originating channel index
    pub channel: u16,
    pub severity: Severity,
    pub code: String,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
}

impl Event {
    pub fn new(channel: u16, severity: Severity, code: &str) -> Self {
        Self {
            channel,
            severity,
            code: code.to_string(),
            details: BTreeMap::new(),
        }
    }

    pub fn info(channel: u16, code: &str) -> Self {
        Self::new(channel, Severity::Info, code)
    }

    pub fn warning(channel: u16, code: &str) -> Self {
        Self::new(channel, Severity::Warning, code)
    }

    pub fn error(channel: u16, code: &str) -> Self {
        Self::new(channel, Severity::Error, code)
    }

    /// Attach a detail field
    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.details.insert(key.to_string(), value.to_string());
        self
    }
}

/// Destination for structured events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Shared handle to an event sink
pub type SharedSink = Arc<dyn EventSink>;

/// Default sink: forwards events to the tracing subscriber
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: Event) {
        let details = serde_json::to_string(&event.details).unwrap_or_default();
        match event.severity {
            Severity::Info => {
                info!(channel = event.channel, code = %event.code, %details, "gateway event")
            },
            Severity::Warning => {
                warn!(channel = event.channel, code = %event.code, %details, "gateway event")
            },
            Severity::Error => {
                error!(channel = event.channel, code = %event.code, %details, "gateway event")
            },
        }
    }
}

/// Test sink that records every event
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<Event>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Count events matching a code
    pub fn count(&self, code: &str) -> usize {
        self.events().iter().filter(|e| e.code == code).count()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: Event) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }
}
