//! Modbus protocol constants and limits

/// FC 01: Read Coils
pub const FC_READ_COILS: u8 = 0x01;
/// FC 02: Read Discrete Inputs
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
/// FC 03: Read Holding Registers
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
/// FC 04: Read Input Registers
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
/// FC 05: Write Single Coil
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
/// FC 06: Write Single Register
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
/// FC 15: Write Multiple Coils
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;
/// FC 16: Write Multiple Registers
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Exception responses set the high bit of the function code
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Protocol limit: bits per FC 01/02 read
pub const MAX_READ_BITS: u16 = 2000;
/// Protocol limit: registers per FC 03/04 read
pub const MAX_READ_REGISTERS: u16 = 125;
/// Protocol limit: bits per FC 15 write
pub const MAX_WRITE_COILS: u16 = 1968;
/// Protocol limit: registers per FC 16 write
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Maximum PDU size per the Modbus specification
pub const MAX_PDU_SIZE: usize = 253;
/// MBAP header length: tx(2) + proto(2) + len(2) + unit(1)
pub const MBAP_HEADER_LEN: usize = 7;
/// RTU trailer: CRC16 little-endian
pub const RTU_CRC_LEN: usize = 2;
/// Largest RTU ADU: unit + PDU + CRC
pub const MAX_RTU_FRAME: usize = 1 + MAX_PDU_SIZE + RTU_CRC_LEN;

/// FC 05 coil ON value
pub const COIL_ON: u16 = 0xFF00;
/// FC 05 coil OFF value
pub const COIL_OFF: u16 = 0x0000;

/// Broadcast slave address: writes only, no response
pub const BROADCAST_UNIT_ID: u8 = 0;

/// Default cap on registers per planned read range
pub const DEFAULT_MAX_RANGE_REGISTERS: u16 = 120;
/// Largest address gap the planner bridges inside one range; reading up to
/// this many junk registers is cheaper than an extra round-trip.
pub const RANGE_GAP_LIMIT: u16 = 10;

/// Fixed pacing delay between read ranges within a poll cycle
pub const INTER_RANGE_DELAY_MS: u64 = 50;
/// Quantum for the slave worker's multiplexed waits, so stop requests are
/// observed promptly
pub const SLAVE_POLL_QUANTUM_MS: u64 = 100;
/// Consecutive frame errors that force a transport reconnect
pub const FRAME_ERROR_RECONNECT_THRESHOLD: u32 = 3;

/// Element limit for a read function code (bits for 01/02, registers for 03/04)
pub fn read_limit(function_code: u8) -> u16 {
    match function_code {
        FC_READ_COILS | FC_READ_DISCRETE_INPUTS => MAX_READ_BITS,
        _ => MAX_READ_REGISTERS,
    }
}

/// True for the bit-space function codes
pub fn is_bit_function(function_code: u8) -> bool {
    matches!(
        function_code,
        FC_READ_COILS | FC_READ_DISCRETE_INPUTS | FC_WRITE_SINGLE_COIL | FC_WRITE_MULTIPLE_COILS
    )
}
