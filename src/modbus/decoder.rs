//! Point value decoding
//!
//! Turns raw 16-bit register words into typed, scaled, range-validated
//! point values according to the per-point byte order and data type, and
//! provides the inverse encoding used by the write path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{ByteOrder, DataType, PointConfig};
use crate::error::{GatewayError, Result};

/// Typed point payload
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl Payload {
    /// Numeric view of the payload
    pub fn as_f64(&self) -> f64 {
        match self {
            Payload::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            },
            Payload::Int(i) => *i as f64,
            Payload::Float(f) => *f,
        }
    }

    /// Truthiness: non-zero is true
    pub fn as_bool(&self) -> bool {
        match self {
            Payload::Bool(b) => *b,
            Payload::Int(i) => *i != 0,
            Payload::Float(f) => *f != 0.0,
        }
    }
}

/// Value quality flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Quality {
    Good,
    OutOfRange,
    Stale,
    NotAvailable,
}

/// A decoded runtime value for one point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointValue {
    pub id: String,
    pub payload: Payload,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    pub quality: Quality,
}

impl PointValue {
    /// Placeholder emitted when the containing range failed
    pub fn not_available(id: &str, unit: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            payload: Payload::Float(0.0),
            unit: unit.to_string(),
            timestamp,
            quality: Quality::NotAvailable,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self.quality, Quality::Good | Quality::OutOfRange)
    }
}

/// Assemble the 4-byte big-endian word of a 32-bit value from its two
/// registers according to the byte order
fn bytes_32(words: [u16; 2], order: ByteOrder) -> Result<[u8; 4]> {
    let h = words[0].to_be_bytes();
    let l = words[1].to_be_bytes();
    let bytes = match order {
        ByteOrder::Abcd => [h[0], h[1], l[0], l[1]],
        ByteOrder::Cdab => [l[0], l[1], h[0], h[1]],
        ByteOrder::Badc => [h[1], h[0], l[1], l[0]],
        ByteOrder::Dcba => [l[1], l[0], h[1], h[0]],
        ByteOrder::Ab | ByteOrder::Ba => {
            return Err(GatewayError::decode(format!(
                "byte order {order:?} is not valid for 32-bit values"
            )))
        },
    };
    Ok(bytes)
}

/// Inverse of [`bytes_32`]: split a big-endian 4-byte word into registers
fn words_32(bytes: [u8; 4], order: ByteOrder) -> Result<[u16; 2]> {
    let (h, l) = match order {
        ByteOrder::Abcd => ([bytes[0], bytes[1]], [bytes[2], bytes[3]]),
        ByteOrder::Cdab => ([bytes[2], bytes[3]], [bytes[0], bytes[1]]),
        ByteOrder::Badc => ([bytes[1], bytes[0]], [bytes[3], bytes[2]]),
        ByteOrder::Dcba => ([bytes[3], bytes[2]], [bytes[1], bytes[0]]),
        ByteOrder::Ab | ByteOrder::Ba => {
            return Err(GatewayError::decode(format!(
                "byte order {order:?} is not valid for 32-bit values"
            )))
        },
    };
    Ok([u16::from_be_bytes(h), u16::from_be_bytes(l)])
}

/// Single-register raw value after byte-order selection
fn raw_16(word: u16, order: ByteOrder) -> Result<u16> {
    match order {
        ByteOrder::Ab => Ok(word),
        ByteOrder::Ba => Ok(word.swap_bytes()),
        other => Err(GatewayError::decode(format!(
            "byte order {other:?} is not valid for 16-bit values"
        ))),
    }
}

/// Decode the register words of one point into a typed value
///
/// `timestamp` is the wall-clock instant at which the containing read range
/// completed.
pub fn decode_registers(
    id: &str,
    point: &PointConfig,
    words: &[u16],
    timestamp: DateTime<Utc>,
) -> Result<PointValue> {
    let expected = point.register_count() as usize;
    if words.len() != expected {
        return Err(GatewayError::decode(format!(
            "point '{id}': got {} registers, expected {expected}",
            words.len()
        )));
    }

    let (raw, payload) = match point.data_type {
        DataType::Bool => {
            let raw = raw_16(words[0], point.byte_order)?;
            (f64::from(raw), Payload::Bool(raw != 0))
        },
        DataType::Uint16 => {
            let raw = raw_16(words[0], point.byte_order)?;
            (f64::from(raw), Payload::Int(i64::from(raw)))
        },
        DataType::Int16 => {
            let raw = raw_16(words[0], point.byte_order)? as i16;
            (f64::from(raw), Payload::Int(i64::from(raw)))
        },
        DataType::Uint32 => {
            let raw = u32::from_be_bytes(bytes_32([words[0], words[1]], point.byte_order)?);
            (f64::from(raw), Payload::Int(i64::from(raw)))
        },
        DataType::Int32 => {
            let raw = i32::from_be_bytes(bytes_32([words[0], words[1]], point.byte_order)?);
            (f64::from(raw), Payload::Int(i64::from(raw)))
        },
        DataType::Float32 => {
            let raw = f32::from_be_bytes(bytes_32([words[0], words[1]], point.byte_order)?);
            (f64::from(raw), Payload::Float(f64::from(raw)))
        },
    };

    Ok(finish(id, point, raw, payload, timestamp))
}

/// Decode a coil / discrete input bit into a point value
pub fn decode_bit(
    id: &str,
    point: &PointConfig,
    bit: bool,
    timestamp: DateTime<Utc>,
) -> PointValue {
    finish(
        id,
        point,
        if bit { 1.0 } else { 0.0 },
        Payload::Bool(bit),
        timestamp,
    )
}

/// Apply scale/offset and the validation window
fn finish(
    id: &str,
    point: &PointConfig,
    raw: f64,
    payload: Payload,
    timestamp: DateTime<Utc>,
) -> PointValue {
    let scaled = raw * point.scale + point.offset;

    let payload = match payload {
        Payload::Bool(b) => Payload::Bool(b),
        _ if point.scale == 1.0 && point.offset == 0.0 => payload,
        _ => Payload::Float(scaled),
    };

    let quality = if !point.has_range_check() || (point.min <= scaled && scaled <= point.max) {
        Quality::Good
    } else {
        Quality::OutOfRange
    };

    PointValue {
        id: id.to_string(),
        payload,
        unit: point.unit.clone(),
        timestamp,
        quality,
    }
}

/// Encode an engineering value into register words for a write
///
/// Inverse of [`decode_registers`]: the scale and offset are removed before
/// the raw value is laid out according to the data type and byte order.
pub fn encode_registers(point: &PointConfig, value: &Payload) -> Result<Vec<u16>> {
    let scaled = value.as_f64();
    let raw = if point.scale != 0.0 {
        (scaled - point.offset) / point.scale
    } else {
        scaled
    };

    match point.data_type {
        DataType::Bool => Ok(vec![u16::from(value.as_bool())]),
        DataType::Uint16 => {
            let v = check_integer_range(raw, 0.0, f64::from(u16::MAX))? as u16;
            Ok(vec![raw_16(v, point.byte_order)?])
        },
        DataType::Int16 => {
            let v = check_integer_range(raw, f64::from(i16::MIN), f64::from(i16::MAX))? as i16;
            Ok(vec![raw_16(v as u16, point.byte_order)?])
        },
        DataType::Uint32 => {
            let v = check_integer_range(raw, 0.0, f64::from(u32::MAX))? as u32;
            Ok(words_32(v.to_be_bytes(), point.byte_order)?.to_vec())
        },
        DataType::Int32 => {
            let v = check_integer_range(raw, f64::from(i32::MIN), f64::from(i32::MAX))? as i32;
            Ok(words_32(v.to_be_bytes(), point.byte_order)?.to_vec())
        },
        DataType::Float32 => {
            Ok(words_32((raw as f32).to_be_bytes(), point.byte_order)?.to_vec())
        },
    }
}

fn check_integer_range(value: f64, min: f64, max: f64) -> Result<f64> {
    let rounded = value.round();
    if rounded < min || rounded > max {
        return Err(GatewayError::decode(format!(
            "value {value} outside {min}..={max}"
        )));
    }
    Ok(rounded)
}
