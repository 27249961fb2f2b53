//! Slave channel worker
//!
//! Serves the channel's register image to external Modbus clients over TCP
//! or RTU. External writes pass through the image's event stream and are
//! forwarded to the bus; supervisor writes update the image directly. All
//! waits are bounded so stop requests are observed within the poll quantum.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::{ChannelConfig, TransportParams, UnitMismatchPolicy};
use crate::error::{GatewayError, Result};
use crate::events::{codes, Event, SharedSink};
use crate::modbus::codec::ModbusException;
use crate::modbus::constants::{
    self, BROADCAST_UNIT_ID, MAX_PDU_SIZE, MBAP_HEADER_LEN, SLAVE_POLL_QUANTUM_MS,
};
use crate::modbus::decoder::{self, PointValue};
use crate::modbus::dispatcher;
use crate::modbus::frame;
use crate::modbus::image::{ImageLayout, RegisterImage, WriteEvent};
use crate::publish::{point_key, serialize_value, BusWriter};
use crate::transport::serial::{SerialSettings, SerialTransport};
use crate::transport::Transport;

use super::{ChannelState, StatusCell, WorkerCommand};

/// Where a register write event lands in the point table
#[derive(Debug, Default)]
struct PointIndex {
    /// Coil address -> point id
    coils: HashMap<u16, String>,
    /// First holding register of a point -> point id
    holdings: HashMap<u16, String>,
}

impl PointIndex {
    fn build(config: &ChannelConfig) -> Self {
        let mut index = Self::default();
        for (id, point) in &config.points {
            match point.effective_function_code() {
                constants::FC_READ_COILS
                | constants::FC_WRITE_SINGLE_COIL
                | constants::FC_WRITE_MULTIPLE_COILS => {
                    index.coils.insert(point.address, id.clone());
                },
                constants::FC_READ_HOLDING_REGISTERS
                | constants::FC_WRITE_SINGLE_REGISTER
                | constants::FC_WRITE_MULTIPLE_REGISTERS => {
                    index.holdings.insert(point.address, id.clone());
                },
                _ => {},
            }
        }
        index
    }
}

/// The slave-role worker for one channel
pub struct SlaveWorker {
    config: ChannelConfig,
    image: Arc<RegisterImage>,
    point_index: PointIndex,
    bus: Arc<dyn BusWriter>,
    events: SharedSink,
    status: Arc<StatusCell>,
    commands: mpsc::Receiver<WorkerCommand>,
    commands_open: bool,
    shutdown: watch::Receiver<bool>,
}

impl SlaveWorker {
    pub fn new(
        config: ChannelConfig,
        bus: Arc<dyn BusWriter>,
        events: SharedSink,
        status: Arc<StatusCell>,
        commands: mpsc::Receiver<WorkerCommand>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let image = Arc::new(RegisterImage::new(ImageLayout::from_points(&config.points)));
        let point_index = PointIndex::build(&config);
        Self {
            config,
            image,
            point_index,
            bus,
            events,
            status,
            commands,
            commands_open: true,
            shutdown,
        }
    }

    /// Run the serve loop until cancelled
    pub async fn run(mut self) {
        self.status.set_state(ChannelState::Starting);

        let result = match self.config.transport.clone() {
            TransportParams::Tcp { host, port, unit_id } => {
                self.run_tcp(&host, port, unit_id).await
            },
            TransportParams::Rtu {
                device,
                baud,
                data_bits,
                parity,
                stop_bits,
            } => {
                let settings = SerialSettings {
                    device,
                    baud,
                    data_bits,
                    parity,
                    stop_bits,
                };
                self.run_rtu(settings).await
            },
        };

        if let Err(e) = result {
            self.status.update(|s| s.last_error = Some(e.to_string()));
            self.events.emit(
                Event::error(self.config.index, codes::TRANSPORT_ERROR).with("error", e),
            );
        }

        self.finish();
    }

    // ---------- TCP ----------

    async fn run_tcp(&mut self, host: &str, port: u16, unit_id: u8) -> Result<()> {
        let listener = TcpListener::bind((host, port)).await.map_err(|e| {
            GatewayError::Io(format!("bind {host}:{port} failed: {e}"))
        })?;
        info!(
            channel = self.config.index,
            addr = %format!("{host}:{port}"),
            "slave listening"
        );
        self.status.set_state(ChannelState::Running);
        self.status.set_connected(true);

        let clients = Arc::new(AtomicUsize::new(0));
        let mut writes = self.image.subscribe_writes();

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Ok(());
                    }
                },
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => self.admit_client(socket, peer, unit_id, &clients),
                        Err(e) => {
                            warn!(channel = self.config.index, error = %e, "accept failed");
                        },
                    }
                },
                event = writes.recv() => {
                    match event {
                        Ok(event) => self.forward_write(event).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(channel = self.config.index, missed, "write events lagged");
                        },
                        Err(broadcast::error::RecvError::Closed) => {},
                    }
                },
                command = self.commands.recv(), if self.commands_open => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => self.commands_open = false,
                    }
                },
            }
        }
    }

    fn admit_client(
        &self,
        socket: TcpStream,
        peer: std::net::SocketAddr,
        unit_id: u8,
        clients: &Arc<AtomicUsize>,
    ) {
        let index = self.config.index;
        if clients.load(Ordering::Acquire) >= self.config.max_clients {
            self.events.emit(
                Event::warning(index, codes::CLIENT_REJECTED)
                    .with("peer", peer)
                    .with("max_clients", self.config.max_clients),
            );
            return;
        }
        clients.fetch_add(1, Ordering::AcqRel);
        self.events
            .emit(Event::info(index, codes::CLIENT_CONNECTED).with("peer", peer));

        let image = Arc::clone(&self.image);
        let events = Arc::clone(&self.events);
        let clients = Arc::clone(clients);
        let status = Arc::clone(&self.status);
        let shutdown = self.shutdown.clone();
        let policy = self.config.unit_mismatch;

        tokio::spawn(async move {
            serve_client(
                socket,
                peer,
                unit_id,
                policy,
                image,
                index,
                events.clone(),
                status,
                shutdown,
            )
            .await;
            clients.fetch_sub(1, Ordering::AcqRel);
            events.emit(Event::info(index, codes::CLIENT_DISCONNECTED).with("peer", peer));
        });
    }

    // ---------- RTU ----------

    async fn run_rtu(&mut self, settings: SerialSettings) -> Result<()> {
        let mut transport = SerialTransport::new(settings);
        transport.open().await.map_err(GatewayError::Transport)?;
        info!(channel = self.config.index, "slave serving RTU bus");
        self.status.set_state(ChannelState::Running);
        self.status.set_connected(true);

        let unit_id = self.config.local_unit_id();
        let quantum = Duration::from_millis(SLAVE_POLL_QUANTUM_MS);
        let mut writes = self.image.subscribe_writes();

        while !self.cancelled() {
            // Bounded wait for a request so cancellation stays prompt.
            match transport.recv_frame(quantum).await {
                Ok(raw) => match frame::decode_rtu(&raw) {
                    Ok((unit, request)) => {
                        if unit != unit_id && unit != BROADCAST_UNIT_ID {
                            // Foreign unit id on a shared bus: always drop.
                            continue;
                        }
                        let response = dispatcher::dispatch(&self.image, &request);
                        if unit != BROADCAST_UNIT_ID {
                            let out = frame::encode_rtu(unit, &response);
                            if let Err(e) = transport.send_frame(&out).await {
                                warn!(channel = self.config.index, error = %e, "RTU send failed");
                            }
                        }
                        self.status.update(|s| s.transactions_ok += 1);
                    },
                    Err(e) => {
                        self.status.update(|s| s.frame_errors += 1);
                        self.events.emit(
                            Event::warning(self.config.index, codes::FRAME_ERROR)
                                .with("error", e),
                        );
                    },
                },
                Err(e) if e.is_timeout() => {},
                Err(e) => {
                    return Err(GatewayError::Transport(e));
                },
            }

            // Drain pending write events and supervisor commands.
            while let Ok(event) = writes.try_recv() {
                self.forward_write(event).await;
            }
            while self.commands_open {
                match self.commands.try_recv() {
                    Ok(command) => self.handle_command(command),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        self.commands_open = false;
                    },
                }
            }
        }

        let _ = transport.close().await;
        Ok(())
    }

    // ---------- shared ----------

    /// Apply a supervisor write to the register image
    fn handle_command(&self, command: WorkerCommand) {
        let WorkerCommand::Write {
            point_id,
            value,
            reply,
        } = command;
        let result = self.apply_local_write(&point_id, &value);
        let _ = reply.send(result);
    }

    fn apply_local_write(&self, point_id: &str, value: &decoder::Payload) -> Result<()> {
        let point = self
            .config
            .points
            .get(point_id)
            .ok_or_else(|| GatewayError::PointNotFound(point_id.to_string()))?;

        match point.effective_function_code() {
            constants::FC_READ_COILS
            | constants::FC_WRITE_SINGLE_COIL
            | constants::FC_WRITE_MULTIPLE_COILS => {
                self.image.set_coil(point.address, value.as_bool());
            },
            constants::FC_READ_DISCRETE_INPUTS => {
                self.image.set_discrete(point.address, value.as_bool());
            },
            constants::FC_READ_HOLDING_REGISTERS
            | constants::FC_WRITE_SINGLE_REGISTER
            | constants::FC_WRITE_MULTIPLE_REGISTERS => {
                let words = decoder::encode_registers(point, value)?;
                self.image.set_holdings(point.address, &words);
            },
            constants::FC_READ_INPUT_REGISTERS => {
                let words = decoder::encode_registers(point, value)?;
                self.image.set_inputs(point.address, &words);
            },
            other => {
                return Err(GatewayError::InvalidOperation(format!(
                    "function code {other} has no image space"
                )))
            },
        }
        Ok(())
    }

    /// Forward an external write back to the bus as a point value
    async fn forward_write(&self, event: WriteEvent) {
        let timestamp = Utc::now();
        let value = match event {
            WriteEvent::Coil { address, value } => {
                let Some(id) = self.point_index.coils.get(&address) else {
                    return;
                };
                let point = &self.config.points[id];
                decoder::decode_bit(id, point, value, timestamp)
            },
            WriteEvent::Register { address, .. } => {
                // Multi-register points raise one event per word; forward on
                // the first word only, after the whole write landed.
                let Some(id) = self.point_index.holdings.get(&address) else {
                    return;
                };
                let point = &self.config.points[id];
                let Some(words) = self.image.get_holdings(address, point.register_count())
                else {
                    return;
                };
                match decoder::decode_registers(id, point, &words, timestamp) {
                    Ok(value) => value,
                    Err(e) => {
                        self.events.emit(
                            Event::warning(self.config.index, codes::DECODE_WARNING)
                                .with("point", id)
                                .with("error", e),
                        );
                        return;
                    },
                }
            },
        };
        self.publish_value(&value).await;
    }

    async fn publish_value(&self, value: &PointValue) {
        let key = point_key(&self.config.key_prefix, &value.id);
        match serialize_value(value) {
            Ok(serialized) => {
                if let Err(e) = self.bus.write(&key, &serialized).await {
                    warn!(channel = self.config.index, error = %e, "bus write failed");
                }
            },
            Err(e) => {
                warn!(channel = self.config.index, error = %e, "value serialization failed")
            },
        }
    }

    fn cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn finish(&mut self) {
        self.status.set_state(ChannelState::Stopping);

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            let WorkerCommand::Write { reply, .. } = command;
            let _ = reply.send(Err(GatewayError::Cancelled));
        }

        self.status.set_connected(false);
        self.status.set_state(ChannelState::Stopped);
        self.events
            .emit(Event::info(self.config.index, codes::CHANNEL_STOPPED));
        info!(channel = self.config.index, "slave worker stopped");
    }
}

/// Serve one TCP client until it disconnects or the channel stops
#[allow(clippy::too_many_arguments)]
async fn serve_client(
    mut socket: TcpStream,
    peer: std::net::SocketAddr,
    unit_id: u8,
    policy: UnitMismatchPolicy,
    image: Arc<RegisterImage>,
    channel: u16,
    events: SharedSink,
    status: Arc<StatusCell>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            },
            frame = read_mbap_frame(&mut socket) => frame,
        };

        let raw = match frame {
            Ok(raw) => raw,
            Err(e) => {
                debug!(channel, %peer, error = %e, "client read ended");
                return;
            },
        };

        let (header, request) = match frame::decode_mbap(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                status.update(|s| s.frame_errors += 1);
                events.emit(Event::warning(channel, codes::FRAME_ERROR).with("error", e));
                continue;
            },
        };

        if header.unit_id != unit_id && header.unit_id != BROADCAST_UNIT_ID {
            match policy {
                UnitMismatchPolicy::Drop => continue,
                UnitMismatchPolicy::GatewayTargetFailed => {
                    let fc = request.function_code().unwrap_or(0);
                    let response = dispatcher::exception_response(
                        fc,
                        ModbusException::GatewayTargetFailed,
                    );
                    let out =
                        frame::encode_mbap(header.transaction_id, header.unit_id, &response);
                    if socket.write_all(&out).await.is_err() {
                        return;
                    }
                    continue;
                },
            }
        }

        let response = dispatcher::dispatch(&image, &request);
        status.update(|s| s.transactions_ok += 1);
        if header.unit_id == BROADCAST_UNIT_ID {
            // Broadcast requests are answered with silence.
            continue;
        }

        let out = frame::encode_mbap(header.transaction_id, header.unit_id, &response);
        if let Err(e) = socket.write_all(&out).await {
            debug!(channel, %peer, error = %e, "client write failed");
            return;
        }
    }
}

/// Read one MBAP-framed request from a client socket
async fn read_mbap_frame(socket: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut header = [0u8; MBAP_HEADER_LEN];
    socket.read_exact(&mut header).await?;

    let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
    if length == 0 || length > MAX_PDU_SIZE + 1 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("implausible MBAP length {length}"),
        ));
    }

    let mut frame = header.to_vec();
    frame.resize(MBAP_HEADER_LEN + length - 1, 0);
    socket.read_exact(&mut frame[MBAP_HEADER_LEN..]).await?;
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ByteOrder, DataType, PointConfig, PointType, Role};
    use std::collections::BTreeMap;

    fn point(point_type: PointType, fc: u8, address: u16) -> PointConfig {
        let bit = matches!(fc, 1 | 2 | 5 | 15);
        PointConfig {
            point_type,
            data_type: if bit { DataType::Bool } else { DataType::Uint16 },
            byte_order: ByteOrder::Ab,
            slave_id: 1,
            address,
            function_code: Some(fc),
            scale: 1.0,
            offset: 0.0,
            unit: String::new(),
            min: 0.0,
            max: 0.0,
            description: String::new(),
        }
    }

    #[test]
    fn test_point_index_build() {
        let mut points = BTreeMap::new();
        points.insert("coil".to_string(), point(PointType::Do, 5, 3));
        points.insert("reg".to_string(), point(PointType::Ao, 6, 20));
        points.insert("input".to_string(), point(PointType::Ai, 4, 9));

        let config = ChannelConfig {
            index: 1,
            name: "s".to_string(),
            role: Role::Slave,
            transport: TransportParams::Tcp {
                host: "127.0.0.1".to_string(),
                port: 1502,
                unit_id: 1,
            },
            poll_period_ms: 1000,
            response_timeout_ms: 1000,
            start_timeout_ms: 5000,
            max_read_registers: 120,
            max_clients: 32,
            unit_mismatch: UnitMismatchPolicy::Drop,
            key_prefix: "data".to_string(),
            points,
        };

        let index = PointIndex::build(&config);
        assert_eq!(index.coils.get(&3).unwrap(), "coil");
        assert_eq!(index.holdings.get(&20).unwrap(), "reg");
        // Input registers are not writable over the wire
        assert!(index.holdings.get(&9).is_none());
    }
}
