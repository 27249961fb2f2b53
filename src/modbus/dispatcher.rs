//! Slave request dispatcher
//!
//! Parses inbound request PDUs, validates them per function code, routes to
//! the register image and builds the normal or exception response. Invalid
//! client input always produces an exception response and never terminates
//! the channel.

use crate::modbus::codec::ModbusException;

use super::constants::{self, COIL_OFF, COIL_ON};
use super::image::{RegisterImage, WriteEvent};
use super::pdu::Pdu;

/// Build an exception response for a function code
pub fn exception_response(function_code: u8, exception: ModbusException) -> Pdu {
    let mut pdu = Pdu::new();
    // Two pushes into an empty fixed buffer cannot fail.
    let _ = pdu.push(function_code | constants::EXCEPTION_FLAG);
    let _ = pdu.push(exception.code());
    pdu
}

/// Dispatch one request PDU against the image and produce the response PDU
///
/// The caller decides whether the response is actually sent (broadcast
/// requests are answered with silence).
pub fn dispatch(image: &RegisterImage, request: &Pdu) -> Pdu {
    let Some(fc) = request.function_code() else {
        return exception_response(0, ModbusException::IllegalFunction);
    };

    match fc {
        constants::FC_READ_COILS | constants::FC_READ_DISCRETE_INPUTS => {
            read_bits(image, fc, request)
        },
        constants::FC_READ_HOLDING_REGISTERS | constants::FC_READ_INPUT_REGISTERS => {
            read_registers(image, fc, request)
        },
        constants::FC_WRITE_SINGLE_COIL => write_single_coil(image, request),
        constants::FC_WRITE_SINGLE_REGISTER => write_single_register(image, request),
        constants::FC_WRITE_MULTIPLE_COILS => write_multiple_coils(image, request),
        constants::FC_WRITE_MULTIPLE_REGISTERS => write_multiple_registers(image, request),
        _ => exception_response(fc, ModbusException::IllegalFunction),
    }
}

fn header(payload: &[u8]) -> Option<(u16, u16)> {
    if payload.len() < 4 {
        return None;
    }
    Some((
        u16::from_be_bytes([payload[0], payload[1]]),
        u16::from_be_bytes([payload[2], payload[3]]),
    ))
}

/// FC 01 / 02: pack bit values LSB-first
fn read_bits(image: &RegisterImage, fc: u8, request: &Pdu) -> Pdu {
    let Some((address, quantity)) = header(request.payload()) else {
        return exception_response(fc, ModbusException::IllegalDataValue);
    };
    if quantity == 0 || quantity > constants::MAX_READ_BITS {
        return exception_response(fc, ModbusException::IllegalDataValue);
    }

    let bits = if fc == constants::FC_READ_COILS {
        image.get_coils(address, quantity)
    } else {
        image.get_discretes(address, quantity)
    };
    let Some(bits) = bits else {
        return exception_response(fc, ModbusException::IllegalDataAddress);
    };

    let mut response = Pdu::new();
    let _ = response.push(fc);
    let _ = response.push(quantity.div_ceil(8) as u8);
    let mut current = 0u8;
    let mut bit = 0;
    for &value in &bits {
        if value {
            current |= 1 << bit;
        }
        bit += 1;
        if bit == 8 {
            let _ = response.push(current);
            current = 0;
            bit = 0;
        }
    }
    if bit > 0 {
        let _ = response.push(current);
    }
    response
}

/// FC 03 / 04: emit registers big-endian
fn read_registers(image: &RegisterImage, fc: u8, request: &Pdu) -> Pdu {
    let Some((address, quantity)) = header(request.payload()) else {
        return exception_response(fc, ModbusException::IllegalDataValue);
    };
    if quantity == 0 || quantity > constants::MAX_READ_REGISTERS {
        return exception_response(fc, ModbusException::IllegalDataValue);
    }

    let words = if fc == constants::FC_READ_HOLDING_REGISTERS {
        image.get_holdings(address, quantity)
    } else {
        image.get_inputs(address, quantity)
    };
    let Some(words) = words else {
        return exception_response(fc, ModbusException::IllegalDataAddress);
    };

    let mut response = Pdu::new();
    let _ = response.push(fc);
    let _ = response.push((quantity * 2) as u8);
    for word in words {
        let _ = response.push_u16(word);
    }
    response
}

/// FC 05: the only legal values are 0xFF00 (on) and 0x0000 (off)
fn write_single_coil(image: &RegisterImage, request: &Pdu) -> Pdu {
    let fc = constants::FC_WRITE_SINGLE_COIL;
    let Some((address, value)) = header(request.payload()) else {
        return exception_response(fc, ModbusException::IllegalDataValue);
    };
    if value != COIL_ON && value != COIL_OFF {
        return exception_response(fc, ModbusException::IllegalDataValue);
    }

    let on = value == COIL_ON;
    image.set_coil(address, on);
    image.notify_write(WriteEvent::Coil { address, value: on });

    echo(fc, request.payload())
}

/// FC 06
fn write_single_register(image: &RegisterImage, request: &Pdu) -> Pdu {
    let fc = constants::FC_WRITE_SINGLE_REGISTER;
    let Some((address, value)) = header(request.payload()) else {
        return exception_response(fc, ModbusException::IllegalDataValue);
    };
    if u32::from(address) >= image.layout().holding {
        return exception_response(fc, ModbusException::IllegalDataAddress);
    }

    image.set_holding(address, value);
    image.notify_write(WriteEvent::Register { address, value });

    echo(fc, request.payload())
}

/// FC 15
fn write_multiple_coils(image: &RegisterImage, request: &Pdu) -> Pdu {
    let fc = constants::FC_WRITE_MULTIPLE_COILS;
    let payload = request.payload();
    let Some((address, quantity)) = header(payload) else {
        return exception_response(fc, ModbusException::IllegalDataValue);
    };
    if quantity == 0 || quantity > constants::MAX_WRITE_COILS {
        return exception_response(fc, ModbusException::IllegalDataValue);
    }
    let expected_bytes = (quantity as usize).div_ceil(8);
    if payload.len() < 5
        || payload[4] as usize != expected_bytes
        || payload.len() != 5 + expected_bytes
    {
        return exception_response(fc, ModbusException::IllegalDataValue);
    }
    if u32::from(address) + u32::from(quantity) > 0x1_0000 {
        return exception_response(fc, ModbusException::IllegalDataAddress);
    }

    let data = &payload[5..];
    let values: Vec<bool> = (0..quantity as usize)
        .map(|i| data[i / 8] & (1 << (i % 8)) != 0)
        .collect();

    image.set_coils(address, &values);
    for (i, &value) in values.iter().enumerate() {
        image.notify_write(WriteEvent::Coil {
            address: address + i as u16,
            value,
        });
    }

    echo(fc, &payload[..4])
}

/// FC 16
fn write_multiple_registers(image: &RegisterImage, request: &Pdu) -> Pdu {
    let fc = constants::FC_WRITE_MULTIPLE_REGISTERS;
    let payload = request.payload();
    let Some((address, quantity)) = header(payload) else {
        return exception_response(fc, ModbusException::IllegalDataValue);
    };
    if quantity == 0 || quantity > constants::MAX_WRITE_REGISTERS {
        return exception_response(fc, ModbusException::IllegalDataValue);
    }
    let expected_bytes = quantity as usize * 2;
    if payload.len() < 5
        || payload[4] as usize != expected_bytes
        || payload.len() != 5 + expected_bytes
    {
        return exception_response(fc, ModbusException::IllegalDataValue);
    }
    if u32::from(address) + u32::from(quantity) > 0x1_0000 {
        return exception_response(fc, ModbusException::IllegalDataAddress);
    }

    let values: Vec<u16> = payload[5..]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();

    image.set_holdings(address, &values);
    for (i, &value) in values.iter().enumerate() {
        image.notify_write(WriteEvent::Register {
            address: address + i as u16,
            value,
        });
    }

    echo(fc, &payload[..4])
}

/// Echo the function code plus the leading payload bytes
fn echo(fc: u8, payload: &[u8]) -> Pdu {
    let mut response = Pdu::new();
    let _ = response.push(fc);
    let _ = response.extend(payload);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::image::ImageLayout;

    fn image() -> RegisterImage {
        RegisterImage::new(ImageLayout {
            coils: 100,
            discrete: 100,
            holding: 100,
            input: 100,
        })
    }

    fn request(bytes: &[u8]) -> Pdu {
        Pdu::from_slice(bytes).unwrap()
    }

    #[test]
    fn test_fc3_single_register() {
        // Request for holding register 100 would be out of range; use 50.
        let image = image();
        image.set_holding(50, 0x1234);
        let response = dispatch(&image, &request(&[0x03, 0x00, 0x32, 0x00, 0x01]));
        assert_eq!(response.as_slice(), &[0x03, 0x02, 0x12, 0x34]);
    }

    #[test]
    fn test_fc3_rtu_round_trip_scenario() {
        // Master request 01 03 00 64 00 01 C5 D5 against holding[100]=0x1234
        // answers 01 03 02 12 34 B5 33.
        let image = RegisterImage::new(ImageLayout {
            holding: 101,
            ..Default::default()
        });
        image.set_holding(100, 0x1234);

        let frame = [0x01, 0x03, 0x00, 0x64, 0x00, 0x01, 0xC5, 0xD5];
        let (unit, pdu) = crate::modbus::frame::decode_rtu(&frame).unwrap();
        assert_eq!(unit, 1);

        let response = dispatch(&image, &pdu);
        let out = crate::modbus::frame::encode_rtu(unit, &response);
        assert_eq!(out, vec![0x01, 0x03, 0x02, 0x12, 0x34, 0xB5, 0x33]);
    }

    #[test]
    fn test_fc1_bit_packing() {
        let image = image();
        image.set_coils(0, &[true, false, true, true]);
        let response = dispatch(&image, &request(&[0x01, 0x00, 0x00, 0x00, 0x04]));
        // 4 bits LSB-first: 0b1101 = 0x0D
        assert_eq!(response.as_slice(), &[0x01, 0x01, 0x0D]);
    }

    #[test]
    fn test_fc2_discrete_inputs() {
        let image = image();
        image.set_discrete(3, true);
        let response = dispatch(&image, &request(&[0x02, 0x00, 0x00, 0x00, 0x08]));
        assert_eq!(response.as_slice(), &[0x02, 0x01, 0x08]);
    }

    #[test]
    fn test_fc4_input_registers() {
        let image = image();
        image.set_inputs(10, &[1, 2]);
        let response = dispatch(&image, &request(&[0x04, 0x00, 0x0A, 0x00, 0x02]));
        assert_eq!(response.as_slice(), &[0x04, 0x04, 0x00, 0x01, 0x00, 0x02]);
    }

    #[test]
    fn test_fc3_illegal_address_scenario() {
        // Image holds only 100 holding registers; FC3 at 0xFFFE qty 5 must
        // answer exception 02 (illegal data address).
        let image = image();
        let response = dispatch(&image, &request(&[0x03, 0xFF, 0xFE, 0x00, 0x05]));
        assert_eq!(response.as_slice(), &[0x83, 0x02]);
    }

    #[test]
    fn test_fc3_quantity_validation() {
        let image = image();
        let response = dispatch(&image, &request(&[0x03, 0x00, 0x00, 0x00, 0x00]));
        assert_eq!(response.as_slice(), &[0x83, 0x03]);
        let response = dispatch(&image, &request(&[0x03, 0x00, 0x00, 0x00, 0x7E]));
        assert_eq!(response.as_slice(), &[0x83, 0x03]); // 126 > 125
    }

    #[test]
    fn test_fc5_write_and_echo() {
        let image = image();
        let mut writes = image.subscribe_writes();

        let response = dispatch(&image, &request(&[0x05, 0x00, 0x07, 0xFF, 0x00]));
        assert_eq!(response.as_slice(), &[0x05, 0x00, 0x07, 0xFF, 0x00]);
        assert_eq!(image.get_coil(7), Some(true));
        assert_eq!(
            writes.try_recv().unwrap(),
            WriteEvent::Coil {
                address: 7,
                value: true
            }
        );
    }

    #[test]
    fn test_fc5_rejects_bad_value() {
        let image = image();
        let response = dispatch(&image, &request(&[0x05, 0x00, 0x07, 0x12, 0x34]));
        assert_eq!(response.as_slice(), &[0x85, 0x03]);
        assert_eq!(image.get_coil(7), Some(false));
    }

    #[test]
    fn test_fc6_write_and_echo() {
        let image = image();
        let mut writes = image.subscribe_writes();

        let response = dispatch(&image, &request(&[0x06, 0x00, 0x10, 0xAB, 0xCD]));
        assert_eq!(response.as_slice(), &[0x06, 0x00, 0x10, 0xAB, 0xCD]);
        assert_eq!(image.get_holding(0x10), Some(0xABCD));
        assert_eq!(
            writes.try_recv().unwrap(),
            WriteEvent::Register {
                address: 0x10,
                value: 0xABCD
            }
        );
    }

    #[test]
    fn test_fc6_unknown_address() {
        let image = image();
        let response = dispatch(&image, &request(&[0x06, 0x01, 0x00, 0x00, 0x01]));
        assert_eq!(response.as_slice(), &[0x86, 0x02]);
    }

    #[test]
    fn test_fc16_coalesced_write_scenario() {
        // holding[10..=12] = [11, 22, 33]; echo header; events in order.
        let image = image();
        let mut writes = image.subscribe_writes();

        let response = dispatch(
            &image,
            &request(&[
                0x10, 0x00, 0x0A, 0x00, 0x03, 0x06, 0x00, 0x0B, 0x00, 0x16, 0x00, 0x21,
            ]),
        );
        assert_eq!(response.as_slice(), &[0x10, 0x00, 0x0A, 0x00, 0x03]);
        assert_eq!(image.get_holdings(10, 3), Some(vec![11, 22, 33]));

        for (addr, value) in [(10u16, 11u16), (11, 22), (12, 33)] {
            assert_eq!(
                writes.try_recv().unwrap(),
                WriteEvent::Register {
                    address: addr,
                    value
                }
            );
        }
    }

    #[test]
    fn test_fc16_byte_count_mismatch() {
        let image = image();
        // byte_count says 4 but quantity is 3
        let response = dispatch(
            &image,
            &request(&[0x10, 0x00, 0x0A, 0x00, 0x03, 0x04, 0x00, 0x0B, 0x00, 0x16]),
        );
        assert_eq!(response.as_slice(), &[0x90, 0x03]);
    }

    #[test]
    fn test_fc15_write_multiple_coils() {
        let image = image();
        let response = dispatch(
            &image,
            &request(&[0x0F, 0x00, 0x00, 0x00, 0x0A, 0x02, 0x8D, 0x03]),
        );
        assert_eq!(response.as_slice(), &[0x0F, 0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(
            image.get_coils(0, 10).unwrap(),
            vec![true, false, true, true, false, false, false, true, true, true]
        );
    }

    #[test]
    fn test_fc15_byte_count_mismatch() {
        let image = image();
        let response = dispatch(
            &image,
            &request(&[0x0F, 0x00, 0x00, 0x00, 0x0A, 0x01, 0x8D]),
        );
        assert_eq!(response.as_slice(), &[0x8F, 0x03]);
    }

    #[test]
    fn test_unsupported_function_code() {
        let image = image();
        let response = dispatch(&image, &request(&[0x2B, 0x00]));
        assert_eq!(response.as_slice(), &[0xAB, 0x01]);
    }

    #[test]
    fn test_write_then_read_back() {
        // Dispatcher-image law: a successful FC 5/6/15/16 is immediately
        // visible to FC 1/3 over the same addresses.
        let image = image();

        dispatch(&image, &request(&[0x05, 0x00, 0x02, 0xFF, 0x00]));
        let coils = dispatch(&image, &request(&[0x01, 0x00, 0x00, 0x00, 0x04]));
        assert_eq!(coils.as_slice(), &[0x01, 0x01, 0x04]);

        dispatch(
            &image,
            &request(&[0x10, 0x00, 0x05, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x00, 0x14]),
        );
        let regs = dispatch(&image, &request(&[0x03, 0x00, 0x05, 0x00, 0x02]));
        assert_eq!(regs.as_slice(), &[0x03, 0x04, 0x00, 0x0A, 0x00, 0x14]);
    }
}
