//! Realtime bus publication
//!
//! Decoded point values leave the engine as `(key, serialized-value)` writes
//! against a key/value bus. The key is a stable function of the point id
//! (`<prefix>:<point-id>`, prefix `data` by default); the value is a JSON
//! document carrying the payload, unit, timestamp and validity.

pub mod redis;

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::Result;
use crate::modbus::decoder::PointValue;

pub use self::redis::RedisBus;

/// Bus key for a point id
pub fn point_key(prefix: &str, point_id: &str) -> String {
    format!("{prefix}:{point_id}")
}

/// Serialize a point value into its bus representation
pub fn serialize_value(value: &PointValue) -> Result<String> {
    let doc = serde_json::json!({
        "value": value.payload,
        "unit": value.unit,
        "timestamp": value.timestamp.to_rfc3339(),
        "valid": value.is_valid(),
    });
    Ok(doc.to_string())
}

/// Destination for bus writes
#[async_trait]
pub trait BusWriter: Send + Sync {
    /// Write one serialized value; best-effort: a failure must degrade
    /// publication, never the channel
    async fn write(&self, key: &str, value: &str) -> Result<()>;
}

/// In-memory bus used by tests and as a null sink
#[derive(Debug, Default)]
pub struct MemoryBus {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl BusWriter for MemoryBus {
    async fn write(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
