//! Handlers for devices bound to register-memory slots.
//!
//! A device owns one slot of register memory. The slot still stores a byte,
//! but every read or write through [`RegisterMemory::read`] and [`RegisterMemory::write`]
//! notifies the device, which may then inspect or modify register memory
//! (including raising interrupt requests in `IRQ`).
//!
//! The core types here are:
//! - [`RegisterDevice`]: A device which can be bound to a register slot.
//! - [`RegisterView`]: The view of register memory a device is given during a callback.
//! - [`DeviceHandler`]: The collection of every device bound to a register memory.
//!
//! This module also provides some devices:
//! - [`TimerDevice`]: A countdown timer which raises interrupt 0.
//! - [`SerialPort`]: A byte-wide serial port backed by channels.
//!
//! [`RegisterMemory::read`]: super::mem::RegisterMemory::read
//! [`RegisterMemory::write`]: super::mem::RegisterMemory::write

mod timer;
mod serial;

pub use timer::TimerDevice;
pub use serial::{SerialHost, SerialPort};

use super::mem::{IRQ, IRQ_MASK};

/// The kind of access made to a device-backed slot.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Access {
    /// The slot was read. The callback runs before the byte is returned.
    Read,
    /// The slot was written. The callback runs after the byte is stored.
    Write,
}

/// A device which can be bound to a slot of register memory.
pub trait RegisterDevice: Send + 'static {
    /// Called whenever the program reads or writes the bound slot.
    fn on_access(&mut self, slot: u8, access: Access, regs: &mut RegisterView<'_>);

    /// Called once per instruction cycle.
    fn tick(&mut self, _slot: u8, _regs: &mut RegisterView<'_>) {}

    /// Resets the device's internal state.
    fn reset(&mut self) {}
}

/// Mutable access to raw register memory, given to a device during a callback.
///
/// Reads and writes here bypass windows, policies, and device callbacks.
pub struct RegisterView<'a> {
    data: &'a mut [u8; 256],
}
impl<'a> RegisterView<'a> {
    fn new(data: &'a mut [u8; 256]) -> Self {
        Self { data }
    }

    /// Gets the stored byte of a slot.
    pub fn get(&self, slot: u8) -> u8 {
        self.data[usize::from(slot)]
    }
    /// Sets the stored byte of a slot.
    pub fn set(&mut self, slot: u8, value: u8) {
        self.data[usize::from(slot)] = value;
    }

    /// Marks the given interrupt source (0-5) as pending in `IRQ`.
    pub fn request_interrupt(&mut self, source: u8) {
        if source < 6 {
            self.data[usize::from(IRQ)] |= (1 << source) & IRQ_MASK;
        }
    }
}

/// The central hub for all devices bound to a register memory.
///
/// Devices are identified by the order in which they were inserted.
pub struct DeviceHandler {
    devices: Vec<(u8, u8, Box<dyn RegisterDevice>)>,
}

impl DeviceHandler {
    /// Creates a new device handler with no devices.
    pub fn new() -> Self {
        Self { devices: vec![] }
    }

    /// Adds a device bound to `slot`, which holds `initial` after every reset.
    ///
    /// If successful, the ID of the device is returned.
    ///
    /// # Errors
    /// If the number of devices would exceed [`u16::MAX`], the device is returned back.
    pub(super) fn insert<D: RegisterDevice>(&mut self, slot: u8, dev: D, initial: u8) -> Result<u16, D> {
        let Ok(id) = u16::try_from(self.devices.len()) else { return Err(dev) };
        self.devices.push((slot, initial, Box::new(dev)));
        Ok(id)
    }

    /// Notifies the device with the given ID of an access to its slot.
    pub(super) fn access(&mut self, id: u16, slot: u8, access: Access, data: &mut [u8; 256]) {
        if let Some((_, _, dev)) = self.devices.get_mut(usize::from(id)) {
            dev.on_access(slot, access, &mut RegisterView::new(data));
        }
    }

    /// Advances every device by one instruction cycle.
    pub(super) fn tick(&mut self, data: &mut [u8; 256]) {
        let mut view = RegisterView::new(data);
        for (slot, _, dev) in &mut self.devices {
            dev.tick(*slot, &mut view);
        }
    }

    /// Resets every device.
    pub fn reset(&mut self) {
        self.devices.iter_mut().for_each(|(_, _, dev)| dev.reset());
    }

    /// Number of devices bound.
    pub fn len(&self) -> usize {
        self.devices.len()
    }
    /// Whether no devices are bound.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Iterates over every binding, as `(id, slot, initial value)`.
    pub fn bindings(&self) -> impl Iterator<Item = (u16, u8, u8)> + '_ {
        self.devices.iter()
            .enumerate()
            .map(|(id, &(slot, initial, _))| (id as u16, slot, initial))
    }
}
impl Default for DeviceHandler {
    fn default() -> Self {
        Self::new()
    }
}
impl std::fmt::Debug for DeviceHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut list = f.debug_list();
        for (id, slot, initial) in self.bindings() {
            list.entry(&format_args!("#{id} @ {slot:02X} (init {initial:02X})"));
        }
        list.finish()
    }
}

/// A device that handles slot accesses with a function.
#[allow(clippy::type_complexity)]
pub struct AccessFromFn(Box<dyn FnMut(u8, Access, &mut RegisterView<'_>) + Send + 'static>);
impl AccessFromFn {
    /// Creates a new device from a function.
    pub fn new(f: impl FnMut(u8, Access, &mut RegisterView<'_>) + Send + 'static) -> Self {
        Self(Box::new(f))
    }
}
impl std::fmt::Debug for AccessFromFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessFromFn").finish_non_exhaustive()
    }
}
impl RegisterDevice for AccessFromFn {
    fn on_access(&mut self, slot: u8, access: Access, regs: &mut RegisterView<'_>) {
        (self.0)(slot, access, regs)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use crate::sim::mem::{RegisterMemory, SlotPolicy, IRQ, PORT2};

    use super::*;

    #[test]
    fn test_callback_order() {
        let log = Arc::new(Mutex::new(vec![]));
        let dev_log = Arc::clone(&log);

        let mut regs = RegisterMemory::new(&mut 0u8);
        let id = regs.add_device(PORT2, AccessFromFn::new(move |slot, access, view| {
            dev_log.lock().unwrap().push((slot, access, view.get(slot)));
            if access == Access::Read {
                view.set(slot, 0x99);
            }
        }), 0x11).unwrap();
        assert_eq!(regs.policy(PORT2), SlotPolicy::Device(id));
        assert_eq!(regs.get_raw(PORT2), 0x11);

        regs.write(PORT2, 0x42);
        // the read callback runs before the byte is returned
        assert_eq!(regs.read(PORT2), 0x99);

        assert_eq!(*log.lock().unwrap(), [
            (PORT2, Access::Write, 0x42),
            (PORT2, Access::Read, 0x42),
        ]);
    }

    #[test]
    fn test_request_interrupt() {
        let mut regs = RegisterMemory::new(&mut 0u8);
        regs.add_device(PORT2, AccessFromFn::new(|_, _, view| view.request_interrupt(5)), 0).unwrap();
        regs.read(PORT2);
        assert_eq!(regs.get_raw(IRQ), 0b10_0000);
    }

    #[test]
    fn test_slot_taken() {
        let mut regs = RegisterMemory::new(&mut 0u8);
        regs.add_device(PORT2, AccessFromFn::new(|_, _, _| ()), 0).unwrap();
        assert!(regs.add_device(PORT2, AccessFromFn::new(|_, _, _| ()), 0).is_err());
        assert!(regs.add_device(0xE3, AccessFromFn::new(|_, _, _| ()), 0).is_err());
        assert_eq!(regs.devices.len(), 1);
    }
}
