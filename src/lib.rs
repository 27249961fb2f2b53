//! # modgate: Modbus communication gateway
//!
//! A long-running service that connects to industrial field devices over
//! Modbus TCP and serial RTU, polls them on behalf of a supervisory layer,
//! and publishes decoded point values to a Redis key/value bus. Channels can
//! also run in the slave role, exposing a register image to external Modbus
//! clients and propagating writes back to the bus.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────┐   ┌─────────────────┐
//! │  YAML config │──►│ ChannelSupervisor│──►│ Channel workers │
//! └──────────────┘   └──────────────────┘   │ (master/slave)  │
//!                                            └───────┬─────────┘
//!                          ┌─────────────┐           │
//!                          │  Redis bus  │◄──────────┘
//!                          └─────────────┘
//! ```
//!
//! Each channel owns its transport (TCP or RTU) and point table and is
//! driven by an independent tokio task. The supervisor only holds handles;
//! a failure inside one channel never blocks operations on another.

pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod modbus;
pub mod publish;
pub mod supervisor;
pub mod transport;

pub use config::{ChannelConfig, GatewayConfig, PointConfig, Role};
pub use error::{GatewayError, Result};
pub use modbus::decoder::{Payload, PointValue, Quality};
pub use supervisor::ChannelSupervisor;
