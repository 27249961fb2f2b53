//! Request construction and response parsing
//!
//! Builds master-side request PDUs for function codes 1/2/3/4/5/6/15/16 and
//! extracts typed payloads from responses, turning exception PDUs into
//! [`ModbusException`] errors.

use std::fmt;

use crate::error::{GatewayError, Result};

use super::constants::{self, COIL_OFF, COIL_ON};
use super::pdu::{Pdu, PduBuilder};

/// Modbus exception codes (specification v1.1b3 §7)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModbusException {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    DeviceFailure,
    Acknowledge,
    DeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetFailed,
    /// Code outside the specification
    Other(u8),
}

impl ModbusException {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => ModbusException::IllegalFunction,
            0x02 => ModbusException::IllegalDataAddress,
            0x03 => ModbusException::IllegalDataValue,
            0x04 => ModbusException::DeviceFailure,
            0x05 => ModbusException::Acknowledge,
            0x06 => ModbusException::DeviceBusy,
            0x08 => ModbusException::MemoryParityError,
            0x0A => ModbusException::GatewayPathUnavailable,
            0x0B => ModbusException::GatewayTargetFailed,
            other => ModbusException::Other(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            ModbusException::IllegalFunction => 0x01,
            ModbusException::IllegalDataAddress => 0x02,
            ModbusException::IllegalDataValue => 0x03,
            ModbusException::DeviceFailure => 0x04,
            ModbusException::Acknowledge => 0x05,
            ModbusException::DeviceBusy => 0x06,
            ModbusException::MemoryParityError => 0x08,
            ModbusException::GatewayPathUnavailable => 0x0A,
            ModbusException::GatewayTargetFailed => 0x0B,
            ModbusException::Other(code) => *code,
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusException::IllegalFunction => "illegal function",
            ModbusException::IllegalDataAddress => "illegal data address",
            ModbusException::IllegalDataValue => "illegal data value",
            ModbusException::DeviceFailure => "server device failure",
            ModbusException::Acknowledge => "acknowledge",
            ModbusException::DeviceBusy => "server device busy",
            ModbusException::MemoryParityError => "memory parity error",
            ModbusException::GatewayPathUnavailable => "gateway path unavailable",
            ModbusException::GatewayTargetFailed => "gateway target failed to respond",
            ModbusException::Other(_) => "unknown exception",
        };
        write!(f, "{name} (code {:#04X})", self.code())
    }
}

/// Request builders and response parsers
pub struct ModbusCodec;

impl ModbusCodec {
    /// Build a read request for FC 1/2/3/4
    pub fn build_read_request(function_code: u8, address: u16, quantity: u16) -> Result<Pdu> {
        match function_code {
            constants::FC_READ_COILS
            | constants::FC_READ_DISCRETE_INPUTS
            | constants::FC_READ_HOLDING_REGISTERS
            | constants::FC_READ_INPUT_REGISTERS => {},
            other => {
                return Err(GatewayError::protocol(format!(
                    "function code {other} is not a read"
                )))
            },
        }

        let limit = constants::read_limit(function_code);
        if quantity == 0 || quantity > limit {
            return Err(GatewayError::protocol(format!(
                "read quantity {quantity} outside 1..={limit} for FC {function_code}"
            )));
        }
        if u32::from(address) + u32::from(quantity) > 0x1_0000 {
            return Err(GatewayError::protocol(format!(
                "read range {address}+{quantity} exceeds address space"
            )));
        }

        Ok(PduBuilder::new()
            .function_code(function_code)?
            .address(address)?
            .quantity(quantity)?
            .build())
    }

    /// FC 05: Write Single Coil (ON = 0xFF00, OFF = 0x0000)
    pub fn build_write_single_coil(address: u16, value: bool) -> Result<Pdu> {
        Ok(PduBuilder::new()
            .function_code(constants::FC_WRITE_SINGLE_COIL)?
            .address(address)?
            .quantity(if value { COIL_ON } else { COIL_OFF })?
            .build())
    }

    /// FC 06: Write Single Register
    pub fn build_write_single_register(address: u16, value: u16) -> Result<Pdu> {
        Ok(PduBuilder::new()
            .function_code(constants::FC_WRITE_SINGLE_REGISTER)?
            .address(address)?
            .quantity(value)?
            .build())
    }

    /// FC 15: Write Multiple Coils, bit 0 of the first data byte is the
    /// first coil
    pub fn build_write_multiple_coils(address: u16, values: &[bool]) -> Result<Pdu> {
        if values.is_empty() || values.len() > constants::MAX_WRITE_COILS as usize {
            return Err(GatewayError::protocol(format!(
                "coil count {} outside 1..={} for FC 15",
                values.len(),
                constants::MAX_WRITE_COILS
            )));
        }

        let mut pdu = PduBuilder::new()
            .function_code(constants::FC_WRITE_MULTIPLE_COILS)?
            .address(address)?
            .quantity(values.len() as u16)?
            .byte(values.len().div_ceil(8) as u8)?
            .build();

        let mut current = 0u8;
        let mut bit = 0;
        for &value in values {
            if value {
                current |= 1 << bit;
            }
            bit += 1;
            if bit == 8 {
                pdu.push(current)?;
                current = 0;
                bit = 0;
            }
        }
        if bit > 0 {
            pdu.push(current)?;
        }

        Ok(pdu)
    }

    /// FC 16: Write Multiple Registers
    pub fn build_write_multiple_registers(address: u16, values: &[u16]) -> Result<Pdu> {
        if values.is_empty() || values.len() > constants::MAX_WRITE_REGISTERS as usize {
            return Err(GatewayError::protocol(format!(
                "register count {} outside 1..={} for FC 16",
                values.len(),
                constants::MAX_WRITE_REGISTERS
            )));
        }

        let mut pdu = PduBuilder::new()
            .function_code(constants::FC_WRITE_MULTIPLE_REGISTERS)?
            .address(address)?
            .quantity(values.len() as u16)?
            .byte((values.len() * 2) as u8)?
            .build();
        for &value in values {
            pdu.push_u16(value)?;
        }
        Ok(pdu)
    }

    /// Check the response function code and surface exception PDUs
    fn check_response(pdu: &Pdu, expected_fc: u8) -> Result<()> {
        let fc = pdu
            .function_code()
            .ok_or_else(|| GatewayError::frame("empty response PDU"))?;

        if pdu.is_exception() {
            if fc & !constants::EXCEPTION_FLAG != expected_fc {
                return Err(GatewayError::frame(format!(
                    "exception for FC {:#04X}, expected FC {expected_fc:#04X}",
                    fc & !constants::EXCEPTION_FLAG
                )));
            }
            let code = pdu.exception_code().unwrap_or(0);
            return Err(GatewayError::Exception(ModbusException::from_code(code)));
        }

        if fc != expected_fc {
            return Err(GatewayError::frame(format!(
                "function code mismatch: expected {expected_fc:#04X}, got {fc:#04X}"
            )));
        }
        Ok(())
    }

    /// Parse an FC 1/2 response into `quantity` bit values
    pub fn parse_read_bits(pdu: &Pdu, expected_fc: u8, quantity: u16) -> Result<Vec<bool>> {
        Self::check_response(pdu, expected_fc)?;

        let payload = pdu.payload();
        if payload.is_empty() {
            return Err(GatewayError::frame("read response missing byte count"));
        }
        let byte_count = payload[0] as usize;
        let data = &payload[1..];
        if data.len() != byte_count || byte_count < (quantity as usize).div_ceil(8) {
            return Err(GatewayError::frame(format!(
                "bit read response byte count {byte_count} does not cover {quantity} bits"
            )));
        }

        let mut bits = Vec::with_capacity(quantity as usize);
        for i in 0..quantity as usize {
            bits.push(data[i / 8] & (1 << (i % 8)) != 0);
        }
        Ok(bits)
    }

    /// Parse an FC 3/4 response into `quantity` register words
    pub fn parse_read_registers(pdu: &Pdu, expected_fc: u8, quantity: u16) -> Result<Vec<u16>> {
        Self::check_response(pdu, expected_fc)?;

        let payload = pdu.payload();
        if payload.is_empty() {
            return Err(GatewayError::frame("read response missing byte count"));
        }
        let byte_count = payload[0] as usize;
        let data = &payload[1..];
        if data.len() != byte_count || byte_count != quantity as usize * 2 {
            return Err(GatewayError::frame(format!(
                "register read response byte count {byte_count}, expected {}",
                quantity * 2
            )));
        }

        Ok(data
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    /// Validate an FC 5/6/15/16 response echo
    pub fn parse_write_response(pdu: &Pdu, expected_fc: u8, address: u16) -> Result<()> {
        Self::check_response(pdu, expected_fc)?;

        let payload = pdu.payload();
        if payload.len() < 4 {
            return Err(GatewayError::frame("write response too short"));
        }
        let echoed = u16::from_be_bytes([payload[0], payload[1]]);
        if echoed != address {
            return Err(GatewayError::frame(format!(
                "write response echoes address {echoed}, expected {address}"
            )));
        }
        Ok(())
    }
}
