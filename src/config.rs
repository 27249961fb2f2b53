//! Channel and point configuration model
//!
//! The declarative document is a YAML file with a list of channels; each
//! channel carries its transport parameters and a point table. Configs are
//! validated once at load time and are immutable while a channel runs;
//! replacing one requires a full stop/start cycle through the supervisor.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorExt, GatewayError, Result};
use crate::modbus::constants;

/// Channel role: poll remote devices or serve a register image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Slave,
}

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    N,
    E,
    O,
}

/// Transport parameters, tagged by link type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportParams {
    Tcp {
        host: String,
        port: u16,
        #[serde(default = "default_unit_id")]
        unit_id: u8,
    },
    Rtu {
        device: String,
        #[serde(default = "default_baud")]
        baud: u32,
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        #[serde(default = "default_parity")]
        parity: Parity,
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
    },
}

fn default_unit_id() -> u8 {
    1
}
fn default_baud() -> u32 {
    9600
}
fn default_data_bits() -> u8 {
    8
}
fn default_parity() -> Parity {
    Parity::N
}
fn default_stop_bits() -> u8 {
    1
}

/// Point direction and kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PointType {
    /// Digital input (status indication)
    Di,
    /// Analog input (measurement)
    Ai,
    /// Digital output (command)
    Do,
    /// Analog output (setpoint)
    Ao,
}

impl PointType {
    /// Default function code when none is configured
    pub fn default_function_code(&self) -> u8 {
        match self {
            PointType::Di => constants::FC_READ_DISCRETE_INPUTS,
            PointType::Ai => constants::FC_READ_INPUT_REGISTERS,
            PointType::Do => constants::FC_WRITE_SINGLE_COIL,
            PointType::Ao => constants::FC_WRITE_SINGLE_REGISTER,
        }
    }

    /// True for DI/AI points, which are polled by the master
    pub fn is_input(&self) -> bool {
        matches!(self, PointType::Di | PointType::Ai)
    }

    /// True for DO/AO points, which are written on demand
    pub fn is_output(&self) -> bool {
        !self.is_input()
    }

    /// Function codes legal for this point type
    fn allowed_function_codes(&self) -> &'static [u8] {
        match self {
            PointType::Di => &[constants::FC_READ_COILS, constants::FC_READ_DISCRETE_INPUTS],
            PointType::Ai => &[
                constants::FC_READ_HOLDING_REGISTERS,
                constants::FC_READ_INPUT_REGISTERS,
            ],
            PointType::Do => &[
                constants::FC_WRITE_SINGLE_COIL,
                constants::FC_WRITE_MULTIPLE_COILS,
            ],
            PointType::Ao => &[
                constants::FC_WRITE_SINGLE_REGISTER,
                constants::FC_WRITE_MULTIPLE_REGISTERS,
            ],
        }
    }
}

/// Wire data type of a point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Bool,
}

impl DataType {
    /// Size of the type in 16-bit registers (bit points occupy one bit)
    pub fn register_count(&self) -> u16 {
        match self {
            DataType::Int16 | DataType::Uint16 | DataType::Bool => 1,
            DataType::Int32 | DataType::Uint32 | DataType::Float32 => 2,
        }
    }
}

/// Register-to-byte ordering for multi-byte values
///
/// 16-bit types use only `AB`/`BA`; 32-bit types use the four-letter forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ByteOrder {
    Ab,
    Ba,
    Abcd,
    Cdab,
    Badc,
    Dcba,
}

impl ByteOrder {
    /// True for the two-letter (single register) orders
    pub fn is_single_register(&self) -> bool {
        matches!(self, ByteOrder::Ab | ByteOrder::Ba)
    }
}

impl Default for ByteOrder {
    fn default() -> Self {
        ByteOrder::Ab
    }
}

/// What a slave channel does with requests for a foreign unit id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitMismatchPolicy {
    /// Ignore the request entirely
    Drop,
    /// Reply with exception 0x0B (TCP only; RTU always drops)
    GatewayTargetFailed,
}

impl Default for UnitMismatchPolicy {
    fn default() -> Self {
        UnitMismatchPolicy::Drop
    }
}

/// Static description of one data point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointConfig {
    pub point_type: PointType,
    pub data_type: DataType,
    #[serde(default)]
    pub byte_order: ByteOrder,
    /// 1-247; 0 is the broadcast address and is legal for writes only
    pub slave_id: u8,
    pub address: u16,
    /// Explicit function code; derived from `point_type` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_code: Option<u8>,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub min: f64,
    #[serde(default)]
    pub max: f64,
    #[serde(default)]
    pub description: String,
}

fn default_scale() -> f64 {
    1.0
}

impl PointConfig {
    /// Function code actually used on the wire
    pub fn effective_function_code(&self) -> u8 {
        self.function_code
            .unwrap_or_else(|| self.point_type.default_function_code())
    }

    /// Size in 16-bit registers (1 for bit points)
    pub fn register_count(&self) -> u16 {
        self.data_type.register_count()
    }

    /// True when this point addresses a bit space (coils / discrete inputs)
    pub fn is_bit_point(&self) -> bool {
        matches!(
            self.effective_function_code(),
            constants::FC_READ_COILS
                | constants::FC_READ_DISCRETE_INPUTS
                | constants::FC_WRITE_SINGLE_COIL
                | constants::FC_WRITE_MULTIPLE_COILS
        )
    }

    /// Validation window is active only when min < max
    pub fn has_range_check(&self) -> bool {
        self.min < self.max
    }

    fn validate(&self, id: &str) -> Result<()> {
        if self.slave_id > 247 {
            return Err(GatewayError::config(format!(
                "point '{id}': slave_id {} out of range 0-247",
                self.slave_id
            )));
        }
        if self.slave_id == 0 && self.point_type.is_input() {
            return Err(GatewayError::config(format!(
                "point '{id}': broadcast address 0 is write-only"
            )));
        }

        let fc = self.effective_function_code();
        if !self.point_type.allowed_function_codes().contains(&fc) {
            return Err(GatewayError::config(format!(
                "point '{id}': function code {fc} not valid for {:?} points",
                self.point_type
            )));
        }

        // The full register span must fit the 16-bit address space.
        let span = if self.is_bit_point() {
            1
        } else {
            self.register_count()
        };
        if u32::from(self.address) + u32::from(span) > 0x1_0000 {
            return Err(GatewayError::config(format!(
                "point '{id}': address {} + size {span} exceeds address space",
                self.address
            )));
        }

        if self.is_bit_point() && self.data_type != DataType::Bool {
            return Err(GatewayError::config(format!(
                "point '{id}': bit-space function code {fc} requires data_type bool"
            )));
        }
        if self.register_count() == 1 && !self.byte_order.is_single_register() {
            return Err(GatewayError::config(format!(
                "point '{id}': byte order {:?} needs a 32-bit data type",
                self.byte_order
            )));
        }
        if self.register_count() == 2 && self.byte_order.is_single_register() {
            return Err(GatewayError::config(format!(
                "point '{id}': 32-bit data type requires a four-letter byte order"
            )));
        }

        Ok(())
    }
}

/// Configuration of one channel, immutable while the channel runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Stable channel identifier
    pub index: u16,
    pub name: String,
    pub role: Role,
    pub transport: TransportParams,
    #[serde(default = "default_poll_period_ms")]
    pub poll_period_ms: u64,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Bound on how long `start`/`reconfigure` wait for the worker to
    /// become observably running before tearing it down again
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,
    /// Upper bound on registers per read request (planner cap)
    #[serde(default = "default_max_read_registers")]
    pub max_read_registers: u16,
    /// Maximum concurrent TCP clients in the slave role
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    #[serde(default)]
    pub unit_mismatch: UnitMismatchPolicy,
    /// Bus key prefix; the full key is `<prefix>:<point-id>`
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default)]
    pub points: BTreeMap<String, PointConfig>,
}

fn default_poll_period_ms() -> u64 {
    1000
}
fn default_response_timeout_ms() -> u64 {
    1000
}
fn default_start_timeout_ms() -> u64 {
    5000
}
fn default_max_read_registers() -> u16 {
    constants::DEFAULT_MAX_RANGE_REGISTERS
}
fn default_max_clients() -> usize {
    32
}
fn default_key_prefix() -> String {
    "data".to_string()
}

impl ChannelConfig {
    /// The unit id this channel answers to in the slave role
    pub fn local_unit_id(&self) -> u8 {
        match &self.transport {
            TransportParams::Tcp { unit_id, .. } => *unit_id,
            // RTU slaves answer on the slave id shared by the point table;
            // fall back to 1 for an empty table.
            TransportParams::Rtu { .. } => self
                .points
                .values()
                .map(|p| p.slave_id)
                .find(|id| *id != 0)
                .unwrap_or(1),
        }
    }

    pub fn poll_period(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_period_ms)
    }

    pub fn response_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.response_timeout_ms)
    }

    pub fn start_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.start_timeout_ms)
    }

    /// Validate the channel and its point table
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(GatewayError::config(format!(
                "channel {}: name must not be empty",
                self.index
            )));
        }
        if self.poll_period_ms == 0 {
            return Err(GatewayError::config(format!(
                "channel {}: poll_period_ms must be positive",
                self.index
            )));
        }

        if let TransportParams::Rtu {
            baud,
            data_bits,
            stop_bits,
            ..
        } = &self.transport
        {
            if *baud == 0 {
                return Err(GatewayError::config(format!(
                    "channel {}: baud rate must be positive",
                    self.index
                )));
            }
            if ![7, 8].contains(data_bits) {
                return Err(GatewayError::config(format!(
                    "channel {}: data_bits must be 7 or 8",
                    self.index
                )));
            }
            if ![1, 2].contains(stop_bits) {
                return Err(GatewayError::config(format!(
                    "channel {}: stop_bits must be 1 or 2",
                    self.index
                )));
            }
        }

        // (slave_id, function_code, address) uniquely identifies a point, and
        // no two points may share a register (bitfield overlap is rejected).
        let mut seen: HashSet<(u8, u8, u16)> = HashSet::new();
        let mut occupied: HashMap<(u8, u8, u16), String> = HashMap::new();
        for (id, point) in &self.points {
            point.validate(id)?;

            let fc = point.effective_function_code();
            if !seen.insert((point.slave_id, fc, point.address)) {
                return Err(GatewayError::config(format!(
                    "channel {}: duplicate point at slave {} fc {fc} address {}",
                    self.index, point.slave_id, point.address
                )));
            }

            let span = if point.is_bit_point() {
                1
            } else {
                point.register_count()
            };
            for offset in 0..span {
                let reg = point.address + offset;
                let key = (point.slave_id, fc, reg);
                if let Some(other) = occupied.get(&key) {
                    return Err(GatewayError::config(format!(
                        "channel {}: points '{other}' and '{id}' overlap at \
                         slave {} fc {fc} register {reg}",
                        self.index, point.slave_id
                    )));
                }
                occupied.insert(key, id.clone());
            }
        }

        Ok(())
    }
}

/// Top-level gateway configuration document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

impl GatewayConfig {
    /// Load and validate a YAML configuration document
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .io_error("failed to read configuration file")?;
        Self::from_yaml(&text)
    }

    /// Parse and validate from YAML text
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: GatewayConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut indices = HashSet::new();
        for channel in &self.channels {
            if !indices.insert(channel.index) {
                return Err(GatewayError::config(format!(
                    "duplicate channel index {}",
                    channel.index
                )));
            }
            channel.validate()?;
        }
        Ok(())
    }
}
