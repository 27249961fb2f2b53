//! Master channel worker
//!
//! Drives the poll cycle for one channel: reconnect with bounded backoff,
//! read the planned ranges, decode and publish point values, and execute
//! queued write commands in submission order. All blocking steps honor the
//! response timeout and observe cancellation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ChannelConfig, TransportParams};
use crate::error::{GatewayError, Result};
use crate::events::{codes, Event, SharedSink};
use crate::modbus::codec::ModbusCodec;
use crate::modbus::constants::{
    self, BROADCAST_UNIT_ID, FRAME_ERROR_RECONNECT_THRESHOLD, INTER_RANGE_DELAY_MS,
};
use crate::modbus::decoder::{self, Payload, PointValue};
use crate::modbus::frame::{self, TransactionIds};
use crate::modbus::pdu::Pdu;
use crate::modbus::planner::{plan_read_ranges, ReadRange};
use crate::publish::{point_key, serialize_value, BusWriter};
use crate::transport::Transport;

use super::{ChannelState, StatusCell, WorkerCommand};

/// Floor of the reconnect backoff
const RECONNECT_MIN: Duration = Duration::from_secs(1);

/// The master-role worker for one channel
pub struct MasterWorker {
    config: ChannelConfig,
    transport: Box<dyn Transport>,
    bus: Arc<dyn BusWriter>,
    events: SharedSink,
    status: Arc<StatusCell>,
    commands: mpsc::Receiver<WorkerCommand>,
    commands_open: bool,
    shutdown: watch::Receiver<bool>,
    tx_ids: TransactionIds,
    consecutive_frame_errors: u32,
    reconnect_backoff: Duration,
}

impl MasterWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ChannelConfig,
        transport: Box<dyn Transport>,
        bus: Arc<dyn BusWriter>,
        events: SharedSink,
        status: Arc<StatusCell>,
        commands: mpsc::Receiver<WorkerCommand>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            transport,
            bus,
            events,
            status,
            commands,
            commands_open: true,
            shutdown,
            tx_ids: TransactionIds::new(),
            consecutive_frame_errors: 0,
            reconnect_backoff: RECONNECT_MIN,
        }
    }

    /// Run the poll loop until cancelled
    pub async fn run(mut self) {
        let index = self.config.index;
        self.status.set_state(ChannelState::Starting);

        let ranges = match plan_read_ranges(&self.config.points, self.config.max_read_registers)
        {
            Ok(ranges) => ranges,
            Err(e) => {
                self.events.emit(
                    Event::error(index, codes::TRANSACTION_FAILED).with("error", &e),
                );
                self.status.update(|s| s.last_error = Some(e.to_string()));
                self.finish().await;
                return;
            },
        };
        info!(
            channel = index,
            name = %self.config.name,
            ranges = ranges.len(),
            points = self.config.points.len(),
            "master worker started"
        );

        while !self.cancelled() {
            if !self.transport.is_connected() && !self.reconnect().await {
                continue;
            }

            let cycle_start = Instant::now();
            self.poll_cycle(&ranges).await;
            self.status.update(|s| s.last_poll = Some(Utc::now()));

            let elapsed = cycle_start.elapsed();
            let period = self.config.poll_period();
            if elapsed < period {
                self.idle(period - elapsed).await;
            }
        }

        self.finish().await;
    }

    /// One pass over the planned ranges; returns early on transport loss
    async fn poll_cycle(&mut self, ranges: &[ReadRange]) {
        let index = self.config.index;

        for (i, range) in ranges.iter().enumerate() {
            if self.cancelled() {
                return;
            }

            match self.poll_range(range).await {
                Ok(()) => {
                    self.consecutive_frame_errors = 0;
                    self.status.update(|s| s.transactions_ok += 1);
                },
                Err(GatewayError::Exception(exception)) => {
                    // The peer is alive but rejected the request; the points
                    // are reported not-available for this cycle and the next
                    // cycle retries.
                    self.status.update(|s| s.transactions_failed += 1);
                    self.events.emit(
                        Event::warning(index, codes::PROTOCOL_EXCEPTION)
                            .with("function_code", range.function_code)
                            .with("start", range.start)
                            .with("exception", exception),
                    );
                    self.mark_range_not_available(range).await;
                },
                Err(e @ GatewayError::Frame(_)) => {
                    self.consecutive_frame_errors += 1;
                    self.status.update(|s| {
                        s.frame_errors += 1;
                        s.transactions_failed += 1;
                        s.last_error = Some(e.to_string());
                    });
                    self.events.emit(
                        Event::warning(index, codes::FRAME_ERROR)
                            .with("error", &e)
                            .with("consecutive", self.consecutive_frame_errors),
                    );
                    if self.consecutive_frame_errors >= FRAME_ERROR_RECONNECT_THRESHOLD {
                        self.disconnect("repeated frame errors").await;
                        return;
                    }
                },
                Err(e) => {
                    self.status.update(|s| {
                        s.transactions_failed += 1;
                        s.last_error = Some(e.to_string());
                    });
                    self.events
                        .emit(Event::error(index, codes::TRANSPORT_ERROR).with("error", &e));
                    self.disconnect(&e.to_string()).await;
                    return;
                },
            }

            // Pacing delay so slow devices are not saturated.
            if i + 1 < ranges.len() {
                self.idle(Duration::from_millis(INTER_RANGE_DELAY_MS)).await;
            }
        }
    }

    /// Read one range, decode every point in it and publish the values
    async fn poll_range(&mut self, range: &ReadRange) -> Result<()> {
        let pdu =
            ModbusCodec::build_read_request(range.function_code, range.start, range.quantity)?;
        let response = self
            .transact(range.slave_id, &pdu, true)
            .await?
            .ok_or_else(|| GatewayError::protocol("read transaction returned no response"))?;
        let timestamp = Utc::now();

        if constants::is_bit_function(range.function_code) {
            let bits =
                ModbusCodec::parse_read_bits(&response, range.function_code, range.quantity)?;
            for planned in &range.points {
                let point = &self.config.points[&planned.id];
                let bit = bits[usize::from(planned.address - range.start)];
                let value = decoder::decode_bit(&planned.id, point, bit, timestamp);
                self.publish_value(&value).await;
            }
        } else {
            let words = ModbusCodec::parse_read_registers(
                &response,
                range.function_code,
                range.quantity,
            )?;
            for planned in &range.points {
                let point = &self.config.points[&planned.id];
                let offset = usize::from(planned.address - range.start);
                let slice = &words[offset..offset + usize::from(planned.quantity)];
                match decoder::decode_registers(&planned.id, point, slice, timestamp) {
                    Ok(value) => self.publish_value(&value).await,
                    Err(e) => {
                        self.events.emit(
                            Event::warning(self.config.index, codes::DECODE_WARNING)
                                .with("point", &planned.id)
                                .with("error", e),
                        );
                    },
                }
            }
        }

        Ok(())
    }

    /// Frame, send and await one request; `None` for broadcast writes
    async fn transact(
        &mut self,
        slave_id: u8,
        pdu: &Pdu,
        expect_response: bool,
    ) -> Result<Option<Pdu>> {
        let timeout = self.config.response_timeout();

        match &self.config.transport {
            TransportParams::Tcp { .. } => {
                let tx_id = self.tx_ids.next();
                self.transport
                    .send_frame(&frame::encode_mbap(tx_id, slave_id, pdu))
                    .await?;
                if !expect_response {
                    return Ok(None);
                }
                let raw = self.transport.recv_frame(timeout).await?;
                let (header, response) = frame::decode_mbap(&raw)?;
                if header.transaction_id != tx_id {
                    return Err(GatewayError::frame(format!(
                        "transaction id mismatch: sent {tx_id}, got {}",
                        header.transaction_id
                    )));
                }
                Ok(Some(response))
            },
            TransportParams::Rtu { .. } => {
                self.transport
                    .send_frame(&frame::encode_rtu(slave_id, pdu))
                    .await?;
                if !expect_response {
                    return Ok(None);
                }
                let raw = self.transport.recv_frame(timeout).await?;
                let (unit, response) = frame::decode_rtu(&raw)?;
                if unit != slave_id {
                    return Err(GatewayError::frame(format!(
                        "response from unit {unit}, expected {slave_id}"
                    )));
                }
                Ok(Some(response))
            },
        }
    }

    /// Execute one queued write against its point
    async fn execute_write(&mut self, point_id: &str, value: Payload) -> Result<()> {
        let point = self
            .config
            .points
            .get(point_id)
            .cloned()
            .ok_or_else(|| GatewayError::PointNotFound(point_id.to_string()))?;
        if !point.point_type.is_output() {
            return Err(GatewayError::InvalidOperation(format!(
                "point '{point_id}' is not writable"
            )));
        }
        if !self.transport.is_connected() {
            return Err(GatewayError::Transport(
                crate::transport::TransportError::NotConnected,
            ));
        }

        let broadcast = point.slave_id == BROADCAST_UNIT_ID;
        let (pdu, expected_fc) = if point.is_bit_point() {
            (
                ModbusCodec::build_write_single_coil(point.address, value.as_bool())?,
                constants::FC_WRITE_SINGLE_COIL,
            )
        } else {
            let words = decoder::encode_registers(&point, &value)?;
            if words.len() == 1 {
                // Single registers go out as FC 6; some peers reject FC 16
                // with a quantity of one.
                (
                    ModbusCodec::build_write_single_register(point.address, words[0])?,
                    constants::FC_WRITE_SINGLE_REGISTER,
                )
            } else {
                (
                    ModbusCodec::build_write_multiple_registers(point.address, &words)?,
                    constants::FC_WRITE_MULTIPLE_REGISTERS,
                )
            }
        };

        match self.transact(point.slave_id, &pdu, !broadcast).await {
            Ok(Some(response)) => {
                ModbusCodec::parse_write_response(&response, expected_fc, point.address)?;
                debug!(channel = self.config.index, point = point_id, "write completed");
                Ok(())
            },
            Ok(None) => {
                debug!(channel = self.config.index, point = point_id, "broadcast write sent");
                Ok(())
            },
            Err(e) => {
                self.events.emit(
                    Event::error(self.config.index, codes::WRITE_FAILED)
                        .with("point", point_id)
                        .with("error", &e),
                );
                if e.is_transport_fatal() {
                    self.disconnect(&e.to_string()).await;
                }
                Err(e)
            },
        }
    }

    async fn handle_command(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Write {
                point_id,
                value,
                reply,
            } => {
                let result = self.execute_write(&point_id, value).await;
                let _ = reply.send(result);
            },
        }
    }

    /// Publish one decoded value to the bus; bus trouble never fails a cycle
    async fn publish_value(&self, value: &PointValue) {
        let key = point_key(&self.config.key_prefix, &value.id);
        match serialize_value(value) {
            Ok(serialized) => {
                if let Err(e) = self.bus.write(&key, &serialized).await {
                    warn!(channel = self.config.index, error = %e, "bus write failed");
                    self.events.emit(
                        Event::warning(self.config.index, codes::BUS_DEGRADED)
                            .with("error", e),
                    );
                }
            },
            Err(e) => {
                warn!(channel = self.config.index, error = %e, "value serialization failed")
            },
        }
    }

    /// Mark every point of a range not-available for this cycle
    async fn mark_range_not_available(&self, range: &ReadRange) {
        let timestamp = Utc::now();
        for planned in &range.points {
            let unit = &self.config.points[&planned.id].unit;
            let value = PointValue::not_available(&planned.id, unit, timestamp);
            self.publish_value(&value).await;
        }
    }

    /// Attempt a reconnect; sleeps the backoff and returns false on failure
    async fn reconnect(&mut self) -> bool {
        let index = self.config.index;
        self.status.set_state(ChannelState::Starting);

        match self.transport.open().await {
            Ok(()) => {
                self.reconnect_backoff = RECONNECT_MIN;
                self.consecutive_frame_errors = 0;
                self.status.set_connected(true);
                self.status.set_state(ChannelState::Running);
                self.status.update(|s| s.connects += 1);
                self.events.emit(Event::info(index, codes::TRANSPORT_CONNECTED));
                true
            },
            Err(e) => {
                self.status.set_state(ChannelState::Error);
                self.status.update(|s| s.last_error = Some(e.to_string()));
                self.events
                    .emit(Event::error(index, codes::TRANSPORT_ERROR).with("error", &e));

                // Bounded backoff: at least one second, at most five poll
                // periods.
                let cap = RECONNECT_MIN.max(self.config.poll_period() * 5);
                let backoff = self.reconnect_backoff.min(cap);
                self.reconnect_backoff = (self.reconnect_backoff * 2).min(cap);
                self.idle(backoff).await;
                false
            },
        }
    }

    async fn disconnect(&mut self, reason: &str) {
        let _ = self.transport.close().await;
        self.consecutive_frame_errors = 0;
        self.status.set_connected(false);
        self.status.update(|s| s.disconnects += 1);
        self.events.emit(
            Event::warning(self.config.index, codes::TRANSPORT_DISCONNECTED)
                .with("reason", reason),
        );
    }

    /// Sleep while staying responsive to shutdown and queued writes
    async fn idle(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            if self.cancelled() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return,
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return;
                    }
                },
                command = self.commands.recv(), if self.commands_open => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => self.commands_open = false,
                    }
                },
            }
        }
    }

    fn cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Final teardown: cancel queued writes, close the link, report Stopped
    async fn finish(&mut self) {
        self.status.set_state(ChannelState::Stopping);

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            let WorkerCommand::Write { reply, .. } = command;
            let _ = reply.send(Err(GatewayError::Cancelled));
        }

        if self.transport.is_connected() {
            let _ = self.transport.close().await;
            self.status.set_connected(false);
        }

        self.status.set_state(ChannelState::Stopped);
        self.events
            .emit(Event::info(self.config.index, codes::CHANNEL_STOPPED));
        info!(channel = self.config.index, "master worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelStatus;
    use crate::config::{ByteOrder, DataType, Parity, PointConfig, PointType, Role};
    use crate::events::CollectingSink;
    use crate::publish::MemoryBus;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Transport stub that always answers with a fixed frame
    #[derive(Debug)]
    struct MockTransport {
        connected: bool,
        opens: Arc<Mutex<u32>>,
        response: Vec<u8>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn kind(&self) -> &'static str {
            "rtu"
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn open(&mut self) -> std::result::Result<(), TransportError> {
            *self.opens.lock().unwrap() += 1;
            self.connected = true;
            Ok(())
        }

        async fn close(&mut self) -> std::result::Result<(), TransportError> {
            self.connected = false;
            Ok(())
        }

        async fn send_frame(&mut self, _frame: &[u8]) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        async fn recv_frame(
            &mut self,
            _timeout: Duration,
        ) -> std::result::Result<Vec<u8>, TransportError> {
            Ok(self.response.clone())
        }
    }

    fn rtu_config() -> ChannelConfig {
        let mut points = BTreeMap::new();
        points.insert(
            "p0".to_string(),
            PointConfig {
                point_type: PointType::Ai,
                data_type: DataType::Uint16,
                byte_order: ByteOrder::Ab,
                slave_id: 1,
                address: 0,
                function_code: Some(3),
                scale: 1.0,
                offset: 0.0,
                unit: String::new(),
                min: 0.0,
                max: 0.0,
                description: String::new(),
            },
        );
        ChannelConfig {
            index: 9,
            name: "mock".to_string(),
            role: Role::Master,
            transport: TransportParams::Rtu {
                device: "/dev/null".to_string(),
                baud: 9600,
                data_bits: 8,
                parity: Parity::N,
                stop_bits: 1,
            },
            poll_period_ms: 30,
            response_timeout_ms: 100,
            start_timeout_ms: 1000,
            max_read_registers: 120,
            max_clients: 32,
            unit_mismatch: Default::default(),
            key_prefix: "data".to_string(),
            points,
        }
    }

    #[tokio::test]
    async fn test_three_consecutive_frame_errors_force_reconnect() {
        let opens = Arc::new(Mutex::new(0u32));
        // Valid response for unit 1 FC3 with the final CRC byte flipped.
        let transport = MockTransport {
            connected: false,
            opens: Arc::clone(&opens),
            response: vec![0x01, 0x03, 0x02, 0x12, 0x34, 0xB5, 0x32],
        };

        let sink = CollectingSink::new();
        let status = crate::channel::StatusCell::new(ChannelStatus::new(9, "mock", Role::Master));
        let (_commands_tx, commands_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = MasterWorker::new(
            rtu_config(),
            Box::new(transport),
            Arc::new(MemoryBus::new()),
            sink.clone(),
            Arc::clone(&status),
            commands_rx,
            shutdown_rx,
        );
        let handle = tokio::spawn(worker.run());

        // Three corrupt frames in a row must close the link and trigger a
        // fresh open attempt.
        let mut waited = 0;
        while sink.count(codes::TRANSPORT_DISCONNECTED) == 0 {
            assert!(waited < 3000, "no reconnect after repeated CRC errors");
            tokio::time::sleep(Duration::from_millis(25)).await;
            waited += 25;
        }
        assert!(sink.count(codes::FRAME_ERROR) >= 3);

        let mut waited = 0;
        while *opens.lock().unwrap() < 2 {
            assert!(waited < 3000, "transport was not reopened");
            tokio::time::sleep(Duration::from_millis(25)).await;
            waited += 25;
        }

        let _ = shutdown_tx.send(true);
        handle.await.unwrap();

        let snapshot = status.snapshot();
        assert!(snapshot.stats.frame_errors >= 3);
        assert!(snapshot.stats.disconnects >= 1);
        assert_eq!(snapshot.state, ChannelState::Stopped);
    }
}
