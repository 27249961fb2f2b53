//! Slave register image
//!
//! Shared, mutex-protected storage for the four Modbus address spaces. The
//! image is pre-sized at channel start from the highest address referenced
//! by any configured point; sets beyond that range are still accepted so a
//! growing point table can coexist with a smaller image, but they log a
//! warning. External writes are published on a typed event stream that the
//! slave worker subscribes to.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::warn;

use crate::config::PointConfig;

use super::constants;

/// A write applied to the image by an external Modbus client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteEvent {
    Coil { address: u16, value: bool },
    Register { address: u16, value: u16 },
}

/// Pre-sized extents of the four address spaces (exclusive upper bounds)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageLayout {
    pub coils: u32,
    pub discrete: u32,
    pub holding: u32,
    pub input: u32,
}

impl ImageLayout {
    /// Derive the layout from a point table: each point extends the space
    /// its function code addresses.
    pub fn from_points(points: &BTreeMap<String, PointConfig>) -> Self {
        let mut layout = Self::default();
        for point in points.values() {
            let fc = point.effective_function_code();
            let end = u32::from(point.address)
                + if point.is_bit_point() {
                    1
                } else {
                    u32::from(point.register_count())
                };
            match fc {
                constants::FC_READ_COILS
                | constants::FC_WRITE_SINGLE_COIL
                | constants::FC_WRITE_MULTIPLE_COILS => layout.coils = layout.coils.max(end),
                constants::FC_READ_DISCRETE_INPUTS => {
                    layout.discrete = layout.discrete.max(end)
                },
                constants::FC_READ_HOLDING_REGISTERS
                | constants::FC_WRITE_SINGLE_REGISTER
                | constants::FC_WRITE_MULTIPLE_REGISTERS => {
                    layout.holding = layout.holding.max(end)
                },
                constants::FC_READ_INPUT_REGISTERS => layout.input = layout.input.max(end),
                _ => {},
            }
        }
        layout
    }
}

#[derive(Debug, Default)]
struct ImageInner {
    coils: HashMap<u16, bool>,
    discrete: HashMap<u16, bool>,
    holding: HashMap<u16, u16>,
    input: HashMap<u16, u16>,
}

/// The shared register image
///
/// All accesses are serialized by one image-wide lock so that ranged reads
/// observe consistent values across spaces.
#[derive(Debug)]
pub struct RegisterImage {
    inner: Mutex<ImageInner>,
    layout: ImageLayout,
    writes: broadcast::Sender<WriteEvent>,
}

impl RegisterImage {
    pub fn new(layout: ImageLayout) -> Self {
        let (writes, _) = broadcast::channel(1024);
        Self {
            inner: Mutex::new(ImageInner::default()),
            layout,
            writes,
        }
    }

    pub fn layout(&self) -> ImageLayout {
        self.layout
    }

    /// Subscribe to external write notifications
    pub fn subscribe_writes(&self) -> broadcast::Receiver<WriteEvent> {
        self.writes.subscribe()
    }

    /// Publish a write notification; fired by the dispatcher after the image
    /// is updated and before the response is sent
    pub fn notify_write(&self, event: WriteEvent) {
        // No subscribers is fine: nothing forwards writes to the bus.
        let _ = self.writes.send(event);
    }

    fn warn_out_of_range(&self, space: &str, address: u16, size: u32) {
        warn!(
            space,
            address,
            size,
            "register image set beyond pre-sized range"
        );
    }

    // ---------- coils ----------

    pub fn set_coil(&self, address: u16, value: bool) {
        if u32::from(address) >= self.layout.coils {
            self.warn_out_of_range("coils", address, self.layout.coils);
        }
        self.lock().coils.insert(address, value);
    }

    pub fn get_coil(&self, address: u16) -> Option<bool> {
        if u32::from(address) >= self.layout.coils {
            return None;
        }
        Some(*self.lock().coils.get(&address).unwrap_or(&false))
    }

    pub fn set_coils(&self, start: u16, values: &[bool]) {
        let end = u32::from(start) + values.len() as u32;
        if end > self.layout.coils {
            self.warn_out_of_range("coils", start, self.layout.coils);
        }
        let mut inner = self.lock();
        for (i, &value) in values.iter().enumerate() {
            inner.coils.insert(start + i as u16, value);
        }
    }

    pub fn get_coils(&self, start: u16, quantity: u16) -> Option<Vec<bool>> {
        let end = u32::from(start) + u32::from(quantity);
        if end > self.layout.coils {
            return None;
        }
        let inner = self.lock();
        Some(
            (start..start + quantity)
                .map(|addr| *inner.coils.get(&addr).unwrap_or(&false))
                .collect(),
        )
    }

    // ---------- discrete inputs ----------

    pub fn set_discrete(&self, address: u16, value: bool) {
        if u32::from(address) >= self.layout.discrete {
            self.warn_out_of_range("discrete", address, self.layout.discrete);
        }
        self.lock().discrete.insert(address, value);
    }

    pub fn get_discrete(&self, address: u16) -> Option<bool> {
        if u32::from(address) >= self.layout.discrete {
            return None;
        }
        Some(*self.lock().discrete.get(&address).unwrap_or(&false))
    }

    pub fn set_discretes(&self, start: u16, values: &[bool]) {
        let end = u32::from(start) + values.len() as u32;
        if end > self.layout.discrete {
            self.warn_out_of_range("discrete", start, self.layout.discrete);
        }
        let mut inner = self.lock();
        for (i, &value) in values.iter().enumerate() {
            inner.discrete.insert(start + i as u16, value);
        }
    }

    pub fn get_discretes(&self, start: u16, quantity: u16) -> Option<Vec<bool>> {
        let end = u32::from(start) + u32::from(quantity);
        if end > self.layout.discrete {
            return None;
        }
        let inner = self.lock();
        Some(
            (start..start + quantity)
                .map(|addr| *inner.discrete.get(&addr).unwrap_or(&false))
                .collect(),
        )
    }

    // ---------- holding registers ----------

    pub fn set_holding(&self, address: u16, value: u16) {
        if u32::from(address) >= self.layout.holding {
            self.warn_out_of_range("holding", address, self.layout.holding);
        }
        self.lock().holding.insert(address, value);
    }

    pub fn get_holding(&self, address: u16) -> Option<u16> {
        if u32::from(address) >= self.layout.holding {
            return None;
        }
        Some(*self.lock().holding.get(&address).unwrap_or(&0))
    }

    pub fn set_holdings(&self, start: u16, values: &[u16]) {
        let end = u32::from(start) + values.len() as u32;
        if end > self.layout.holding {
            self.warn_out_of_range("holding", start, self.layout.holding);
        }
        let mut inner = self.lock();
        for (i, &value) in values.iter().enumerate() {
            inner.holding.insert(start + i as u16, value);
        }
    }

    pub fn get_holdings(&self, start: u16, quantity: u16) -> Option<Vec<u16>> {
        let end = u32::from(start) + u32::from(quantity);
        if end > self.layout.holding {
            return None;
        }
        let inner = self.lock();
        Some(
            (start..start + quantity)
                .map(|addr| *inner.holding.get(&addr).unwrap_or(&0))
                .collect(),
        )
    }

    // ---------- input registers ----------

    pub fn set_input(&self, address: u16, value: u16) {
        if u32::from(address) >= self.layout.input {
            self.warn_out_of_range("input", address, self.layout.input);
        }
        self.lock().input.insert(address, value);
    }

    pub fn get_input(&self, address: u16) -> Option<u16> {
        if u32::from(address) >= self.layout.input {
            return None;
        }
        Some(*self.lock().input.get(&address).unwrap_or(&0))
    }

    pub fn set_inputs(&self, start: u16, values: &[u16]) {
        let end = u32::from(start) + values.len() as u32;
        if end > self.layout.input {
            self.warn_out_of_range("input", start, self.layout.input);
        }
        let mut inner = self.lock();
        for (i, &value) in values.iter().enumerate() {
            inner.input.insert(start + i as u16, value);
        }
    }

    pub fn get_inputs(&self, start: u16, quantity: u16) -> Option<Vec<u16>> {
        let end = u32::from(start) + u32::from(quantity);
        if end > self.layout.input {
            return None;
        }
        let inner = self.lock();
        Some(
            (start..start + quantity)
                .map(|addr| *inner.input.get(&addr).unwrap_or(&0))
                .collect(),
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ImageInner> {
        // Poisoning cannot leave partial writes: every mutation completes
        // under the guard, so recover the inner value.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
