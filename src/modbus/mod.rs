//! Modbus protocol engine
//!
//! Wire-level codec (PDU construction, RTU/TCP framing, CRC16), the read
//! range planner, the point decoder, and the slave-side register image and
//! request dispatcher.

pub mod codec;
pub mod constants;
pub mod decoder;
pub mod dispatcher;
pub mod frame;
pub mod image;
pub mod pdu;
pub mod planner;
