//! End-to-end gateway tests
//!
//! A master channel polls a slave channel of the same process over loopback
//! TCP; assertions run against the in-memory bus and the collected events.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use modgate::channel::ChannelState;
use modgate::config::{
    ByteOrder, ChannelConfig, DataType, PointConfig, PointType, Role, TransportParams,
    UnitMismatchPolicy,
};
use modgate::events::CollectingSink;
use modgate::publish::MemoryBus;
use modgate::{ChannelSupervisor, Payload};

fn point(
    point_type: PointType,
    data_type: DataType,
    byte_order: ByteOrder,
    function_code: u8,
    address: u16,
) -> PointConfig {
    PointConfig {
        point_type,
        data_type,
        byte_order,
        slave_id: 1,
        address,
        function_code: Some(function_code),
        scale: 1.0,
        offset: 0.0,
        unit: "V".to_string(),
        min: 0.0,
        max: 0.0,
        description: String::new(),
    }
}

fn channel(
    index: u16,
    role: Role,
    port: u16,
    poll_period_ms: u64,
    points: BTreeMap<String, PointConfig>,
) -> ChannelConfig {
    ChannelConfig {
        index,
        name: format!("chan-{index}"),
        role,
        transport: TransportParams::Tcp {
            host: "127.0.0.1".to_string(),
            port,
            unit_id: 1,
        },
        poll_period_ms,
        response_timeout_ms: 500,
        start_timeout_ms: 3000,
        max_read_registers: 120,
        max_clients: 32,
        unit_mismatch: UnitMismatchPolicy::Drop,
        key_prefix: "data".to_string(),
        points,
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, deadline_ms: u64, check: F) {
    let mut waited = 0;
    while !check() {
        assert!(waited < deadline_ms, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(25)).await;
        waited += 25;
    }
}

#[tokio::test]
async fn test_master_polls_slave_end_to_end() {
    let bus = Arc::new(MemoryBus::new());
    let sink = CollectingSink::new();
    let supervisor = ChannelSupervisor::new(bus.clone(), sink.clone());

    // Slave serves one holding register and one float32 input pair.
    let mut slave_points = BTreeMap::new();
    slave_points.insert(
        "s.volts".to_string(),
        point(PointType::Ai, DataType::Uint16, ByteOrder::Ab, 3, 100),
    );
    slave_points.insert(
        "s.power".to_string(),
        point(PointType::Ai, DataType::Float32, ByteOrder::Cdab, 3, 110),
    );
    supervisor
        .create(channel(1, Role::Slave, 15502, 1000, slave_points))
        .unwrap();
    supervisor.start(1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Seed the image through the supervisor write path.
    supervisor.write(1, "s.volts", Payload::Int(4660)).await.unwrap();
    supervisor
        .write(1, "s.power", Payload::Float(3.125))
        .await
        .unwrap();

    // Master polls the same registers.
    let mut master_points = BTreeMap::new();
    master_points.insert(
        "m.volts".to_string(),
        point(PointType::Ai, DataType::Uint16, ByteOrder::Ab, 3, 100),
    );
    master_points.insert(
        "m.power".to_string(),
        point(PointType::Ai, DataType::Float32, ByteOrder::Cdab, 3, 110),
    );
    supervisor
        .create(channel(2, Role::Master, 15502, 100, master_points))
        .unwrap();
    supervisor.start(2).await.unwrap();

    wait_for("master poll results", 3000, || {
        bus.get("data:m.volts").is_some() && bus.get("data:m.power").is_some()
    })
    .await;

    let volts: serde_json::Value =
        serde_json::from_str(&bus.get("data:m.volts").unwrap()).unwrap();
    assert_eq!(volts["value"], 4660);
    assert_eq!(volts["valid"], true);
    assert_eq!(volts["unit"], "V");

    let power: serde_json::Value =
        serde_json::from_str(&bus.get("data:m.power").unwrap()).unwrap();
    assert!((power["value"].as_f64().unwrap() - 3.125).abs() < 1e-9);

    let status = supervisor.status(2).unwrap();
    assert_eq!(status.state, ChannelState::Running);
    assert!(status.connected);
    assert!(status.stats.transactions_ok >= 1);

    supervisor.stop_all().await;
}

#[tokio::test]
async fn test_master_write_reaches_slave_and_bus() {
    let bus = Arc::new(MemoryBus::new());
    let sink = CollectingSink::new();
    let supervisor = ChannelSupervisor::new(bus.clone(), sink.clone());

    let mut slave_points = BTreeMap::new();
    slave_points.insert(
        "s.setpoint".to_string(),
        point(PointType::Ai, DataType::Uint16, ByteOrder::Ab, 3, 20),
    );
    supervisor
        .create(channel(1, Role::Slave, 15503, 1000, slave_points))
        .unwrap();
    supervisor.start(1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Master writes a single register; the worker prefers FC 6.
    let mut master_points = BTreeMap::new();
    master_points.insert(
        "m.setpoint".to_string(),
        point(PointType::Ao, DataType::Uint16, ByteOrder::Ab, 6, 20),
    );
    master_points.insert(
        "m.readback".to_string(),
        point(PointType::Ai, DataType::Uint16, ByteOrder::Ab, 3, 20),
    );
    supervisor
        .create(channel(2, Role::Master, 15503, 100, master_points))
        .unwrap();
    supervisor.start(2).await.unwrap();

    wait_for("master connected", 3000, || {
        supervisor
            .status(2)
            .map(|s| s.connected)
            .unwrap_or(false)
    })
    .await;

    supervisor
        .write(2, "m.setpoint", Payload::Int(77))
        .await
        .unwrap();

    // The write lands in the slave image and is forwarded to the bus under
    // the slave's own point id.
    wait_for("write-through on the bus", 3000, || {
        bus.get("data:s.setpoint").is_some()
    })
    .await;
    let forwarded: serde_json::Value =
        serde_json::from_str(&bus.get("data:s.setpoint").unwrap()).unwrap();
    assert_eq!(forwarded["value"], 77);

    // The master's next poll reads the value back.
    wait_for("readback on the bus", 3000, || {
        bus.get("data:m.readback")
            .and_then(|text| serde_json::from_str::<serde_json::Value>(&text).ok())
            .map(|doc| doc["value"] == 77)
            .unwrap_or(false)
    })
    .await;

    supervisor.stop_all().await;
}

#[tokio::test]
async fn test_exception_marks_points_not_available_and_retries() {
    let bus = Arc::new(MemoryBus::new());
    let sink = CollectingSink::new();
    let supervisor = ChannelSupervisor::new(bus.clone(), sink.clone());

    // Slave image covers holding registers up to 50 only.
    let mut slave_points = BTreeMap::new();
    slave_points.insert(
        "s.small".to_string(),
        point(PointType::Ai, DataType::Uint16, ByteOrder::Ab, 3, 49),
    );
    supervisor
        .create(channel(1, Role::Slave, 15504, 1000, slave_points))
        .unwrap();
    supervisor.start(1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The master asks for a register the slave does not have.
    let mut master_points = BTreeMap::new();
    master_points.insert(
        "m.ghost".to_string(),
        point(PointType::Ai, DataType::Uint16, ByteOrder::Ab, 3, 500),
    );
    supervisor
        .create(channel(2, Role::Master, 15504, 100, master_points))
        .unwrap();
    supervisor.start(2).await.unwrap();

    wait_for("not-available value on the bus", 3000, || {
        bus.get("data:m.ghost").is_some()
    })
    .await;
    let ghost: serde_json::Value =
        serde_json::from_str(&bus.get("data:m.ghost").unwrap()).unwrap();
    assert_eq!(ghost["valid"], false);

    // The next cycles keep retrying the read instead of giving up.
    wait_for("repeated retries", 3000, || {
        supervisor
            .status(2)
            .map(|s| s.stats.transactions_failed >= 2)
            .unwrap_or(false)
    })
    .await;

    // The transport stayed up: an exception is not a transport error.
    let status = supervisor.status(2).unwrap();
    assert!(status.connected);
    assert_eq!(status.stats.disconnects, 0);

    supervisor.stop_all().await;
}

#[tokio::test]
async fn test_slave_rejects_clients_beyond_limit() {
    let bus = Arc::new(MemoryBus::new());
    let sink = CollectingSink::new();
    let supervisor = ChannelSupervisor::new(bus.clone(), sink.clone());

    let mut slave_points = BTreeMap::new();
    slave_points.insert(
        "s.v".to_string(),
        point(PointType::Ai, DataType::Uint16, ByteOrder::Ab, 3, 0),
    );
    let mut config = channel(1, Role::Slave, 15505, 1000, slave_points);
    config.max_clients = 1;
    supervisor.create(config).unwrap();
    supervisor.start(1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let _first = tokio::net::TcpStream::connect("127.0.0.1:15505")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let _second = tokio::net::TcpStream::connect("127.0.0.1:15505")
        .await
        .unwrap();

    wait_for("client rejection event", 3000, || {
        sink.count(modgate::events::codes::CLIENT_REJECTED) >= 1
    })
    .await;

    supervisor.stop_all().await;
}
