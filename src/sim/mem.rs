//! Memory handling for the simulator.
//!
//! This module consists of:
//! - [`RegisterMemory`]: The 256-slot register memory, with per-slot access policies ([`SlotPolicy`]).
//! - [`MemArray`]: A 64KB byte-addressed memory (used for both PROGRAM and DATA memory).
//! - [`MachineInitStrategy`]: How memory that was never written by a program image is filled.
//! - Constants naming the special registers in slots `0xF0`-`0xFF`.

use rand::rngs::StdRng;
use rand::Rng;

use super::device::{Access, DeviceHandler, RegisterDevice};

/// Port 0. The reference timer device lives here.
pub const PORT0: u8 = 0x00;
/// Port 1.
pub const PORT1: u8 = 0x01;
/// Port 2.
pub const PORT2: u8 = 0x02;
/// Port 3.
pub const PORT3: u8 = 0x03;
/// Serial I/O register.
pub const SIO: u8 = 0xF0;
/// Timer mode register.
pub const TMR: u8 = 0xF1;
/// Timer 1 count.
pub const T1: u8 = 0xF2;
/// Timer 1 prescaler.
pub const PRE1: u8 = 0xF3;
/// Timer 0 count.
pub const T0: u8 = 0xF4;
/// Timer 0 prescaler.
pub const PRE0: u8 = 0xF5;
/// Port 2 mode.
pub const P2M: u8 = 0xF6;
/// Port 3 mode.
pub const P3M: u8 = 0xF7;
/// Ports 0 & 1 mode. Bit 2 selects a stack held in register memory.
pub const P01M: u8 = 0xF8;
/// Interrupt priority register.
pub const IPR: u8 = 0xF9;
/// Interrupt request (pending) register.
pub const IRQ: u8 = 0xFA;
/// Interrupt mask register. Bit 7 is the global enable.
pub const IMR: u8 = 0xFB;
/// Flags register. See [`super::alu::Flags`].
pub const FLAGS: u8 = 0xFC;
/// Register pointer.
pub const RP: u8 = 0xFD;
/// Stack pointer, high byte.
pub const SPH: u8 = 0xFE;
/// Stack pointer, low byte.
pub const SPL: u8 = 0xFF;

/// `P01M` bit selecting a stack held in register memory.
pub const P01M_INTERNAL_STACK: u8 = 0x04;
/// `IMR` global interrupt enable bit.
pub const IMR_ENABLE: u8 = 0x80;
/// Bits of `IRQ`/`IMR` that correspond to interrupt sources 0-5.
pub const IRQ_MASK: u8 = 0x3F;

const UNIMPLEMENTED: std::ops::RangeInclusive<u8> = 0x80..=0xDF;
const WINDOW: std::ops::RangeInclusive<u8> = 0xE0..=0xEF;

/// Access policy of a single register-memory slot.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum SlotPolicy {
    /// Reads and writes go straight to the stored byte.
    ReadWrite,
    /// Writes are ignored.
    ReadOnly,
    /// The stored byte is backed by the device with the given ID
    /// (see [`DeviceHandler`]), which is notified on every access.
    Device(u16),
    /// The access is redirected into the working register block selected by [`RP`].
    Windowed,
}

/// The register memory.
///
/// Accesses through [`RegisterMemory::read`] and [`RegisterMemory::write`] resolve windowed slots
/// and apply each slot's [`SlotPolicy`]:
/// - `0x80`-`0xDF` are read-only and hold `0xFF`.
/// - `0xE0 + n` is redirected to slot `(RP << 4) | n`.
/// - device-backed slots store the byte first and then notify their device on a write,
///   and notify their device before returning the stored byte on a read.
///
/// Raw access (which bypasses all of the above) is available through
/// [`RegisterMemory::get_raw`] and [`RegisterMemory::set_raw`].
///
/// ```
/// use z8_sim::sim::mem::{RegisterMemory, RP};
///
/// let mut regs = RegisterMemory::new(&mut 0u8);
/// regs.write(RP, 0x02);
/// regs.write(0xE5, 0x42);
/// assert_eq!(regs.read(0x25), 0x42);
///
/// regs.write(0x90, 0x00); // unimplemented, ignored
/// assert_eq!(regs.read(0x90), 0xFF);
/// ```
#[derive(Debug)]
pub struct RegisterMemory {
    data: [u8; 256],
    policy: [SlotPolicy; 256],

    /// Devices bound to device-backed slots.
    pub devices: DeviceHandler,
}

impl RegisterMemory {
    /// Creates a register memory.
    ///
    /// General-purpose slots (`0x04`-`0x7F`) are filled by the filler;
    /// ports, windowed slots, and special registers start at 0.
    pub fn new(filler: &mut impl ByteFiller) -> Self {
        let mut data = [0; 256];
        let mut policy = [SlotPolicy::ReadWrite; 256];

        for slot in 0x04..=0x7Fu8 {
            data[usize::from(slot)] = filler.generate();
        }
        for slot in UNIMPLEMENTED {
            data[usize::from(slot)] = 0xFF;
            policy[usize::from(slot)] = SlotPolicy::ReadOnly;
        }
        for slot in WINDOW {
            policy[usize::from(slot)] = SlotPolicy::Windowed;
        }

        Self { data, policy, devices: DeviceHandler::new() }
    }

    /// The current register pointer (the working block is `rp() << 4`).
    pub fn rp(&self) -> u8 {
        self.data[usize::from(RP)] & 0x0F
    }

    /// Resolves a windowed slot to the slot it is redirected to.
    ///
    /// Non-windowed slots resolve to themselves. Resolution is a single step,
    /// so a register pointer of `0xE` maps the window onto itself and
    /// accesses land on the raw windowed bytes.
    pub fn resolve(&self, slot: u8) -> u8 {
        match self.policy[usize::from(slot)] {
            SlotPolicy::Windowed => (self.rp() << 4) | (slot & 0x0F),
            _ => slot,
        }
    }

    /// Gets the policy of a slot (without resolving windows).
    pub fn policy(&self, slot: u8) -> SlotPolicy {
        self.policy[usize::from(slot)]
    }

    /// Reads a slot, resolving windows and applying the slot's policy.
    pub fn read(&mut self, slot: u8) -> u8 {
        let slot = self.resolve(slot);
        if let SlotPolicy::Device(id) = self.policy[usize::from(slot)] {
            self.devices.access(id, slot, Access::Read, &mut self.data);
        }
        self.data[usize::from(slot)]
    }

    /// Writes a slot, resolving windows and applying the slot's policy.
    pub fn write(&mut self, slot: u8, value: u8) {
        let slot = self.resolve(slot);
        match self.policy[usize::from(slot)] {
            SlotPolicy::ReadWrite | SlotPolicy::Windowed => self.data[usize::from(slot)] = value,
            SlotPolicy::ReadOnly => {},
            SlotPolicy::Device(id) => {
                self.data[usize::from(slot)] = value;
                self.devices.access(id, slot, Access::Write, &mut self.data);
            }
        }
    }

    /// Reads the stored byte of a slot, without resolving windows or notifying devices.
    pub fn get_raw(&self, slot: u8) -> u8 {
        self.data[usize::from(slot)]
    }
    /// Sets the stored byte of a slot, without resolving windows, checking policy, or notifying devices.
    pub fn set_raw(&mut self, slot: u8, value: u8) {
        self.data[usize::from(slot)] = value;
    }
    /// Gets the stored bytes of every slot.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Binds a device to a slot, setting the slot's stored byte to `initial`.
    ///
    /// If successful, the ID of the device is returned.
    ///
    /// # Errors
    /// If the slot is read-only, windowed or already bound to a device, the device is returned back.
    pub fn add_device<D: RegisterDevice>(&mut self, slot: u8, dev: D, initial: u8) -> Result<u16, D> {
        if self.policy[usize::from(slot)] != SlotPolicy::ReadWrite {
            return Err(dev);
        }
        let id = self.devices.insert(slot, dev, initial)?;
        self.policy[usize::from(slot)] = SlotPolicy::Device(id);
        self.data[usize::from(slot)] = initial;
        Ok(id)
    }

    /// Takes ownership of a device handler (from a previous register memory),
    /// rebinding its slots and resetting its devices.
    pub(super) fn restore_devices(&mut self, mut devices: DeviceHandler) {
        devices.reset();
        for (id, slot, initial) in devices.bindings() {
            self.policy[usize::from(slot)] = SlotPolicy::Device(id);
            self.data[usize::from(slot)] = initial;
        }
        self.devices = devices;
    }

    /// Advances every device by one instruction cycle.
    pub(super) fn tick_devices(&mut self) {
        self.devices.tick(&mut self.data);
    }
}

/// A 64KB byte-addressed memory.
///
/// This is held in the heap, as it is too large for the stack.
#[derive(Clone)]
pub struct MemArray(Box<[u8]>);
impl MemArray {
    const LEN: usize = 1 << 16;

    /// Creates a memory array filled by the filler.
    pub fn new(filler: &mut impl ByteFiller) -> Self {
        Self((0..Self::LEN).map(|_| filler.generate()).collect())
    }

    /// Copies a block of bytes into memory starting at `start`, wrapping around the end of memory.
    pub fn copy_block(&mut self, start: u16, data: &[u8]) {
        let mut addr = start;
        for &byte in data {
            self[addr] = byte;
            addr = addr.wrapping_add(1);
        }
    }

    /// Gets the memory as a slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}
impl std::ops::Index<u16> for MemArray {
    type Output = u8;

    fn index(&self, index: u16) -> &Self::Output {
        &self.0[usize::from(index)]
    }
}
impl std::ops::IndexMut<u16> for MemArray {
    fn index_mut(&mut self, index: u16) -> &mut Self::Output {
        &mut self.0[usize::from(index)]
    }
}
impl std::fmt::Debug for MemArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemArray")
            .field("len", &self.0.len())
            .finish_non_exhaustive()
    }
}

/// Trait that describes types that can be used to fill memory a program never wrote.
pub trait ByteFiller {
    /// Generate the data.
    fn generate(&mut self) -> u8;
}
impl ByteFiller for () {
    /// This creates unseeded, non-deterministic values.
    fn generate(&mut self) -> u8 {
        rand::random()
    }
}
impl ByteFiller for u8 {
    /// Sets each byte to the given value.
    fn generate(&mut self) -> u8 {
        *self
    }
}
impl ByteFiller for StdRng {
    /// This creates deterministic values from a seeded generator.
    fn generate(&mut self) -> u8 {
        self.gen()
    }
}

/// Strategy used to fill PROGRAM memory, DATA memory,
/// and the general-purpose register slots of the [`Simulator`].
///
/// [`Simulator`]: super::Simulator
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MachineInitStrategy {
    /// Fills each byte randomly and non-deterministically.
    Unseeded,

    /// Fills each byte randomly and deterministically.
    Seeded {
        /// The seed the RNG was initialized with.
        seed: u64
    },

    /// Fills each byte with a known value.
    Known {
        /// The value to fill each byte with.
        value: u8
    }
}
impl Default for MachineInitStrategy {
    /// Zero-filled memory, so runs are reproducible.
    fn default() -> Self {
        MachineInitStrategy::Known { value: 0 }
    }
}

impl MachineInitStrategy {
    pub(super) fn generator(&self) -> impl ByteFiller {
        use rand::SeedableRng;

        match self {
            MachineInitStrategy::Unseeded => Filler::Unseeded,
            MachineInitStrategy::Seeded { seed } => Filler::Seeded(Box::new(StdRng::seed_from_u64(*seed))),
            MachineInitStrategy::Known { value } => Filler::Known(*value),
        }
    }
}

enum Filler {
    Unseeded,
    Seeded(Box<StdRng>),
    Known(u8)
}
impl ByteFiller for Filler {
    fn generate(&mut self) -> u8 {
        match self {
            Filler::Unseeded  => ().generate(),
            Filler::Seeded(r) => r.generate(),
            Filler::Known(k)  => k.generate(),
        }
    }
}
