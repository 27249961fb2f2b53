//! Channel supervisor
//!
//! Owns the set of channels and their worker tasks. The supervisor is an
//! explicit value handed to the host binary; there is no process-global
//! instance. The channel table lock is held only for lookup, insert and
//! delete; all per-channel work (joining workers, awaiting writes) happens
//! outside it, so a failure in one channel never blocks another.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::channel::master::MasterWorker;
use crate::channel::slave::SlaveWorker;
use crate::channel::{ChannelState, ChannelStatus, StatusCell, WorkerCommand};
use crate::config::{ChannelConfig, Role, TransportParams};
use crate::error::{GatewayError, Result};
use crate::events::{codes, Event, SharedSink};
use crate::modbus::decoder::Payload;
use crate::publish::BusWriter;
use crate::transport::serial::{SerialSettings, SerialTransport};
use crate::transport::{TcpTransport, Transport};

/// Command queue depth per channel worker
const COMMAND_QUEUE_DEPTH: usize = 64;

struct ChannelRuntime {
    commands: mpsc::Sender<WorkerCommand>,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

struct ChannelEntry {
    config: ChannelConfig,
    status: Arc<StatusCell>,
    runtime: Option<ChannelRuntime>,
}

impl ChannelEntry {
    fn is_running(&self) -> bool {
        self.runtime
            .as_ref()
            .map(|rt| !rt.join.is_finished())
            .unwrap_or(false)
    }
}

/// The process-wide channel table and lifecycle driver
pub struct ChannelSupervisor {
    channels: Mutex<HashMap<u16, ChannelEntry>>,
    bus: Arc<dyn BusWriter>,
    events: SharedSink,
}

impl ChannelSupervisor {
    pub fn new(bus: Arc<dyn BusWriter>, events: SharedSink) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            bus,
            events,
        }
    }

    /// Register a channel; the channel is not started
    pub fn create(&self, config: ChannelConfig) -> Result<()> {
        config.validate()?;
        let index = config.index;

        let mut channels = self.lock();
        if channels.contains_key(&index) {
            return Err(GatewayError::config(format!(
                "channel {index} already exists"
            )));
        }

        let status = StatusCell::new(ChannelStatus::new(index, &config.name, config.role));
        channels.insert(
            index,
            ChannelEntry {
                config,
                status,
                runtime: None,
            },
        );
        drop(channels);

        self.events.emit(Event::info(index, codes::CHANNEL_CREATED));
        Ok(())
    }

    /// Stop and forget a channel
    pub async fn remove(&self, index: u16) -> Result<()> {
        self.stop(index).await?;
        self.lock().remove(&index);
        Ok(())
    }

    /// Start a channel's worker; idempotent while it is running
    ///
    /// Returns once the channel is observably running. If the worker cannot
    /// reach the running state within the channel's start timeout (or exits
    /// first), it is torn down again, the channel is left stopped and the
    /// error is returned.
    pub async fn start(&self, index: u16) -> Result<()> {
        let (config, status) = {
            let mut channels = self.lock();
            let entry = channels
                .get_mut(&index)
                .ok_or(GatewayError::ChannelNotFound(index))?;
            if entry.is_running() {
                return Ok(());
            }
            entry.runtime = None;
            entry.status.set_state(ChannelState::Starting);
            (entry.config.clone(), Arc::clone(&entry.status))
        };
        let start_timeout = config.start_timeout();

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let join = match config.role {
            Role::Master => {
                let transport = build_transport(&config)?;
                let worker = MasterWorker::new(
                    config,
                    transport,
                    Arc::clone(&self.bus),
                    Arc::clone(&self.events),
                    Arc::clone(&status),
                    commands_rx,
                    shutdown_rx,
                );
                tokio::spawn(worker.run())
            },
            Role::Slave => {
                let worker = SlaveWorker::new(
                    config,
                    Arc::clone(&self.bus),
                    Arc::clone(&self.events),
                    Arc::clone(&status),
                    commands_rx,
                    shutdown_rx,
                );
                tokio::spawn(worker.run())
            },
        };

        {
            let mut channels = self.lock();
            match channels.get_mut(&index) {
                Some(entry) => {
                    entry.runtime = Some(ChannelRuntime {
                        commands: commands_tx,
                        shutdown: shutdown_tx,
                        join,
                    });
                },
                None => {
                    // Removed concurrently: tear the fresh worker down again.
                    let _ = shutdown_tx.send(true);
                    return Err(GatewayError::ChannelNotFound(index));
                },
            }
        }

        match self.await_running(index, &status, start_timeout).await {
            Ok(()) => {
                self.events.emit(Event::info(index, codes::CHANNEL_STARTED));
                Ok(())
            },
            Err(e) => {
                let _ = self.stop(index).await;
                Err(e)
            },
        }
    }

    /// Block until the worker reports `Running`; worker exit or the start
    /// timeout fail the wait
    async fn await_running(
        &self,
        index: u16,
        status: &Arc<StatusCell>,
        limit: Duration,
    ) -> Result<()> {
        let mut states = status.state_changes();
        let deadline = tokio::time::Instant::now() + limit;

        loop {
            let state = *states.borrow_and_update();
            match state {
                ChannelState::Running => return Ok(()),
                ChannelState::Stopped => {
                    return Err(GatewayError::InvalidOperation(format!(
                        "channel {index} worker exited before running"
                    )));
                },
                _ => {},
            }

            match tokio::time::timeout_at(deadline, states.changed()).await {
                Ok(Ok(())) => {},
                Ok(Err(_)) => {
                    return Err(GatewayError::InvalidOperation(format!(
                        "channel {index} worker went away during start"
                    )));
                },
                Err(_) => {
                    return Err(GatewayError::timeout(format!(
                        "channel {index} did not reach running within {limit:?}"
                    )));
                },
            }
        }
    }

    /// Stop a channel and join its worker; idempotent
    pub async fn stop(&self, index: u16) -> Result<()> {
        let runtime = {
            let mut channels = self.lock();
            let entry = channels
                .get_mut(&index)
                .ok_or(GatewayError::ChannelNotFound(index))?;
            entry.runtime.take()
        };

        if let Some(runtime) = runtime {
            let _ = runtime.shutdown.send(true);
            let _ = runtime.join.await;
            info!(channel = index, "channel stopped");
        }
        Ok(())
    }

    /// Replace a channel's configuration
    ///
    /// Atomic from the caller's viewpoint: a running channel is stopped and
    /// joined, the config swapped, and the channel restarted. Returns only
    /// after the restarted worker is observably running again. If the
    /// restart fails (including the start timeout), the channel is left
    /// stopped and the error is returned.
    pub async fn reconfigure(&self, index: u16, new_config: ChannelConfig) -> Result<()> {
        if new_config.index != index {
            return Err(GatewayError::config(format!(
                "config carries index {}, expected {index}",
                new_config.index
            )));
        }
        new_config.validate()?;

        let was_running = {
            let channels = self.lock();
            channels
                .get(&index)
                .ok_or(GatewayError::ChannelNotFound(index))?
                .is_running()
        };

        self.stop(index).await?;

        {
            let mut channels = self.lock();
            let entry = channels
                .get_mut(&index)
                .ok_or(GatewayError::ChannelNotFound(index))?;
            entry.status =
                StatusCell::new(ChannelStatus::new(index, &new_config.name, new_config.role));
            entry.config = new_config;
        }
        self.events
            .emit(Event::info(index, codes::CHANNEL_RECONFIGURED));

        if was_running {
            self.start(index).await?;
        }
        Ok(())
    }

    /// Snapshot one channel's status
    pub fn status(&self, index: u16) -> Result<ChannelStatus> {
        let channels = self.lock();
        let entry = channels
            .get(&index)
            .ok_or(GatewayError::ChannelNotFound(index))?;
        Ok(entry.status.snapshot())
    }

    /// Snapshot every channel, ordered by index
    pub fn list(&self) -> Vec<ChannelStatus> {
        let handles: Vec<Arc<StatusCell>> = {
            let channels = self.lock();
            channels.values().map(|e| Arc::clone(&e.status)).collect()
        };
        let mut statuses: Vec<ChannelStatus> =
            handles.iter().map(|cell| cell.snapshot()).collect();
        statuses.sort_by_key(|s| s.index);
        statuses
    }

    /// Write a value to an output point of a channel
    ///
    /// Enqueues the write onto the worker and waits for completion bounded
    /// by the channel's response timeout.
    pub async fn write(&self, index: u16, point_id: &str, value: Payload) -> Result<()> {
        let (commands, timeout) = {
            let channels = self.lock();
            let entry = channels
                .get(&index)
                .ok_or(GatewayError::ChannelNotFound(index))?;
            let runtime = entry.runtime.as_ref().ok_or_else(|| {
                GatewayError::InvalidOperation(format!("channel {index} is not running"))
            })?;
            (runtime.commands.clone(), entry.config.response_timeout())
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(WorkerCommand::Write {
                point_id: point_id.to_string(),
                value,
                reply: reply_tx,
            })
            .await
            .map_err(|_| GatewayError::Cancelled)?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::Cancelled),
            Err(_) => Err(GatewayError::timeout(format!(
                "write to '{point_id}' on channel {index} timed out"
            ))),
        }
    }

    /// Stop every channel; used by the host binary on shutdown
    pub async fn stop_all(&self) {
        let indices: Vec<u16> = {
            let channels = self.lock();
            channels.keys().copied().collect()
        };
        for index in indices {
            let _ = self.stop(index).await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u16, ChannelEntry>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Build the master-side transport for a channel config
fn build_transport(config: &ChannelConfig) -> Result<Box<dyn Transport>> {
    match &config.transport {
        TransportParams::Tcp { host, port, .. } => Ok(Box::new(TcpTransport::new(
            host.clone(),
            *port,
            config.response_timeout(),
        ))),
        TransportParams::Rtu {
            device,
            baud,
            data_bits,
            parity,
            stop_bits,
        } => Ok(Box::new(SerialTransport::new(SerialSettings {
            device: device.clone(),
            baud: *baud,
            data_bits: *data_bits,
            parity: *parity,
            stop_bits: *stop_bits,
        }))),
    }
}
