//! ADU framing: RTU CRC16 and the TCP MBAP header
//!
//! The RTU ADU is `unit + PDU + CRC16` with the CRC transmitted low byte
//! first. The TCP ADU is `MBAP + unit + PDU` where the MBAP length field
//! counts every byte from the unit id to the end of the PDU.

use crate::error::{GatewayError, Result};

use super::constants::{MAX_RTU_FRAME, MBAP_HEADER_LEN, RTU_CRC_LEN};
use super::pdu::Pdu;

/// CRC16-IBM over a byte slice (polynomial 0xA001, init 0xFFFF)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Wrap a PDU into an RTU ADU: unit id, PDU, CRC16 (low byte first)
pub fn encode_rtu(unit_id: u8, pdu: &Pdu) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + pdu.len() + RTU_CRC_LEN);
    frame.push(unit_id);
    frame.extend_from_slice(pdu.as_slice());
    let crc = crc16(&frame);
    frame.push((crc & 0xFF) as u8);
    frame.push((crc >> 8) as u8);
    frame
}

/// Unwrap an RTU ADU, verifying length and CRC
pub fn decode_rtu(frame: &[u8]) -> Result<(u8, Pdu)> {
    if frame.len() < 1 + 1 + RTU_CRC_LEN {
        return Err(GatewayError::frame(format!(
            "RTU frame too short: {} bytes",
            frame.len()
        )));
    }
    if frame.len() > MAX_RTU_FRAME {
        return Err(GatewayError::frame(format!(
            "RTU frame too long: {} bytes",
            frame.len()
        )));
    }

    let body = &frame[..frame.len() - RTU_CRC_LEN];
    let received =
        u16::from(frame[frame.len() - 2]) | (u16::from(frame[frame.len() - 1]) << 8);
    let computed = crc16(body);
    if received != computed {
        return Err(GatewayError::frame(format!(
            "CRC mismatch: received {received:04X}, computed {computed:04X}"
        )));
    }

    Ok((body[0], Pdu::from_slice(&body[1..])?))
}

/// Parsed MBAP header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    /// Byte count from the unit id to the end of the PDU
    pub length: u16,
    pub unit_id: u8,
}

/// Wrap a PDU into a TCP ADU with an MBAP header
pub fn encode_mbap(transaction_id: u16, unit_id: u8, pdu: &Pdu) -> Vec<u8> {
    let length = (pdu.len() + 1) as u16;
    let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x00]); // protocol id: Modbus
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(unit_id);
    frame.extend_from_slice(pdu.as_slice());
    frame
}

/// Unwrap a TCP ADU, validating the MBAP header
pub fn decode_mbap(frame: &[u8]) -> Result<(MbapHeader, Pdu)> {
    if frame.len() < MBAP_HEADER_LEN + 1 {
        return Err(GatewayError::frame(format!(
            "MBAP frame too short: {} bytes",
            frame.len()
        )));
    }

    let transaction_id = u16::from_be_bytes([frame[0], frame[1]]);
    let protocol_id = u16::from_be_bytes([frame[2], frame[3]]);
    let length = u16::from_be_bytes([frame[4], frame[5]]);
    let unit_id = frame[6];

    if protocol_id != 0 {
        return Err(GatewayError::frame(format!(
            "unexpected MBAP protocol id {protocol_id:#06X}"
        )));
    }
    let expected = frame.len() - 6;
    if usize::from(length) != expected {
        return Err(GatewayError::frame(format!(
            "MBAP length mismatch: header says {length}, frame carries {expected}"
        )));
    }

    Ok((
        MbapHeader {
            transaction_id,
            length,
            unit_id,
        },
        Pdu::from_slice(&frame[MBAP_HEADER_LEN..])?,
    ))
}

/// Per-channel monotonically increasing transaction ids
#[derive(Debug, Default)]
pub struct TransactionIds {
    next: u16,
}

impl TransactionIds {
    pub fn new() -> Self {
        Self { next: 0 }
    }

    /// Hand out the next id, wrapping at 0xFFFF
    pub fn next(&mut self) -> u16 {
        self.next = self.next.wrapping_add(1);
        self.next
    }
}
