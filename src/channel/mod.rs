//! Channel runtime types
//!
//! State machine, per-channel statistics and the command protocol between
//! the supervisor and a channel worker.

pub mod master;
pub mod slave;

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};

use crate::config::Role;
use crate::error::Result;
use crate::modbus::decoder::Payload;

/// Channel lifecycle state
///
/// `Error` is transient: the worker re-enters `Starting` after a backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Configured,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

/// Per-channel counters, surfaced through `status()`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelStats {
    pub transactions_ok: u64,
    pub transactions_failed: u64,
    pub frame_errors: u64,
    pub connects: u64,
    pub disconnects: u64,
    pub last_error: Option<String>,
    pub last_poll: Option<DateTime<Utc>>,
}

/// Snapshot of one channel's state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub index: u16,
    pub name: String,
    pub role: Role,
    pub state: ChannelState,
    pub connected: bool,
    pub stats: ChannelStats,
}

impl ChannelStatus {
    pub fn new(index: u16, name: &str, role: Role) -> Self {
        Self {
            index,
            name: name.to_string(),
            role,
            state: ChannelState::Configured,
            connected: false,
            stats: ChannelStats::default(),
        }
    }
}

/// Shared, mutex-guarded status cell updated by the worker and read by the
/// supervisor; critical sections never span an await point. State
/// transitions are mirrored onto a watch channel so the supervisor can
/// await a channel becoming observably running.
#[derive(Debug)]
pub struct StatusCell {
    inner: Mutex<ChannelStatus>,
    state_tx: watch::Sender<ChannelState>,
}

impl StatusCell {
    pub fn new(status: ChannelStatus) -> Arc<Self> {
        let (state_tx, _) = watch::channel(status.state);
        Arc::new(Self {
            inner: Mutex::new(status),
            state_tx,
        })
    }

    pub fn snapshot(&self) -> ChannelStatus {
        self.lock().clone()
    }

    pub fn set_state(&self, state: ChannelState) {
        self.lock().state = state;
        self.state_tx.send_replace(state);
    }

    /// Watch state transitions; the receiver starts at the current state
    pub fn state_changes(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> ChannelState {
        self.lock().state
    }

    pub fn set_connected(&self, connected: bool) {
        self.lock().connected = connected;
    }

    pub fn update<F: FnOnce(&mut ChannelStats)>(&self, f: F) {
        f(&mut self.lock().stats);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChannelStatus> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A command submitted to a channel worker
#[derive(Debug)]
pub enum WorkerCommand {
    /// Write a value to an output point (master) or into the register image
    /// (slave); the reply resolves when the operation completes
    Write {
        point_id: String,
        value: Payload,
        reply: oneshot::Sender<Result<()>>,
    },
}
