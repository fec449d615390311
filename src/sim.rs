//! Simulating and execution for the microcontroller.
//!
//! This module is focused on executing program images (i.e., [`Image`]).
//!
//! This module consists of:
//! - [`Simulator`]: The struct that holds the machine state and runs the instruction cycle.
//! - [`mem`]: The module handling register memory and the byte memory arrays.
//! - [`cache`]: The module handling the memory bus and the program-memory cache.
//! - [`alu`]: The module handling flag-accurate arithmetic.
//! - [`interrupt`]: The module handling interrupt priority.
//! - [`predicate`]: The module handling predicated execution (`IF`).
//! - [`device`]: The module handling devices bound to register slots.
//! - [`debug`]: The module handling types of breakpoints for the simulator.
//!
//! # Usage
//!
//! To simulate some code, you need to instantiate a Simulator and load an image to it:
//!
//! ```
//! use z8_sim::image::srec;
//! use z8_sim::sim::{Simulator, RunOutcome};
//!
//! // LD 10h, #15h; INC 10h; STOP
//! let image = srec::parse("S109000CE6101520106F40\nS9000C").unwrap();
//!
//! let mut simulator = Simulator::new(Default::default());
//! simulator.load_image(&image);
//! assert_eq!(simulator.run(), RunOutcome::Halted);
//! assert_eq!(simulator.regs.get_raw(0x10), 0x16);
//! ```
//!
//! ## Flags
//!
//! Here, we define `simulator` to have the default flags.
//! We could also configure the simulator by editing the flags. For example,
//! if we wish to use a direct-mapped, write-through cache, we can edit the flags like so:
//!
//! ```
//! # use z8_sim::sim::{Simulator, SimFlags};
//! use z8_sim::sim::cache::{CacheConfig, Placement, WritePolicy};
//!
//! let cache = CacheConfig { lines: 16, placement: Placement::Direct, write_policy: WritePolicy::WriteThrough };
//! let mut simulator = Simulator::new(SimFlags { cache, ..Default::default() });
//! ```
//!
//! All of the available flags can be found in [`SimFlags`].
//!
//! ## Execution
//!
//! Beyond the basic [`Simulator::run`] (which runs until `STOP`),
//! there are also:
//! - [`Simulator::step_in`]: manual step-by-step simulation
//! - [`Simulator::run_while`], [`Simulator::run_with_limit`]: more advanced programmatic execution
//!
//! Every `run*` method returns a [`RunOutcome`] describing why it returned.
//! Runs are always bounded by [`SimFlags::instruction_limit`], so a runaway program
//! ends with [`RunOutcome::Exhausted`] rather than looping forever.
//!
//! ```
//! use z8_sim::sim::{Simulator, RunOutcome};
//!
//! let mut sim = Simulator::new(Default::default());
//! // SRP #1; LD r0, #3; INC r0; STOP
//! sim.bus.program.copy_block(0x000C, &[0x31, 0x01, 0x0C, 0x03, 0x0E, 0x6F]);
//!
//! sim.step_in();
//! sim.step_in();
//! assert_eq!(sim.regs.read(0xE0), 3);
//! sim.step_in();
//! assert_eq!(sim.regs.get_raw(0x10), 4);
//! assert_eq!(sim.run(), RunOutcome::Halted);
//! ```
//!
//! ## Querying State
//!
//! - The PC is the `sim.pc` field.
//! - Register memory is the `sim.regs` field. [`RegisterMemory::read`] and [`RegisterMemory::write`]
//!   behave as the program sees them (windows, read-only slots, devices), while
//!   [`RegisterMemory::get_raw`] and [`RegisterMemory::set_raw`] access the stored bytes directly.
//! - PROGRAM and DATA memory are on the `sim.bus` field. Note that PROGRAM memory on the bus
//!   may be stale while a write-back cache holds dirty lines (see [`Simulator::flush`]).
//! - The counters `cycles`, `sys_clock`, and `instructions_run` are public fields.
//!
//! ## Debugging with breakpoints
//!
//! Breakpoints are accessible through the `breakpoints` field on [`Simulator`].
//!
//! ```
//! use z8_sim::sim::{Simulator, RunOutcome};
//! use z8_sim::sim::debug::Breakpoint;
//!
//! let mut sim = Simulator::new(Default::default());
//! // NOP; NOP; NOP; STOP
//! sim.bus.program.copy_block(0x000C, &[0xFF, 0xFF, 0xFF, 0x6F]);
//! sim.breakpoints.insert(Breakpoint::PC(0x000E));
//!
//! assert_eq!(sim.run(), RunOutcome::Breakpoint);
//! assert_eq!(sim.pc, 0x000E);
//! ```
//!
//! ## Devices and interrupts
//!
//! Devices are bound to register slots with [`Simulator::add_device`]
//! and raise interrupts by setting bits in `IRQ`.
//! After every instruction cycle, the devices are ticked and pending interrupts are polled.
//! See the [`device`] and [`interrupt`] modules.
//!
//! [`RegisterMemory::read`]: mem::RegisterMemory::read
//! [`RegisterMemory::write`]: mem::RegisterMemory::write
//! [`RegisterMemory::get_raw`]: mem::RegisterMemory::get_raw
//! [`RegisterMemory::set_raw`]: mem::RegisterMemory::set_raw
pub mod mem;
pub mod alu;
pub mod cache;
pub mod interrupt;
pub mod predicate;
pub mod device;
pub mod debug;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::image::{Image, Region};
use crate::isa::{self, AluOp, Cond, Instr, Mode, Operand, Transfer, UnaryOp};
use self::alu::Flags;
use self::cache::{Bus, Cache, CacheConfig, Space};
use self::debug::Breakpoint;
use self::device::RegisterDevice;
use self::mem::{MachineInitStrategy, RegisterMemory, SlotPolicy};
use self::mem::{FLAGS, IMR, IMR_ENABLE, IPR, IRQ, IRQ_MASK, P01M, P01M_INTERNAL_STACK, RP, SPH, SPL};
use self::predicate::{IfContext, Settlement};

/// The PC after reset, just past the interrupt vector table.
pub const RESET_PC: u16 = 0x000C;

/// Errors that can occur when setting up the simulator.
///
/// Execution itself never fails.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SimErr {
    /// A device could not be bound to a slot,
    /// because the slot is read-only, windowed or already bound to another device.
    DeviceSlotTaken {
        /// The slot.
        slot: u8
    },
    /// The number of devices ever added exceeds [`u16::MAX`].
    TooManyDevices,
}
impl std::fmt::Display for SimErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SimErr::DeviceSlotTaken { slot } => write!(f, "register slot {slot:02X}h cannot hold a device"),
            SimErr::TooManyDevices => f.write_str("too many devices"),
        }
    }
}
impl std::error::Error for SimErr {}

/// Reason for why execution stopped.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum RunOutcome {
    /// The running flag was cleared (by `STOP`, or by another holder of [`Simulator::running`]).
    Halted,
    /// The safety ceiling ([`SimFlags::instruction_limit`]) was reached.
    Exhausted,
    /// A breakpoint matched.
    Breakpoint,
    /// The tripwire condition of [`Simulator::run_while`] returned false.
    Tripwire,
}

/// Configuration flags for [`Simulator`].
///
/// These can be modified after the `Simulator` is created with [`Simulator::new`].
/// Unless noted otherwise, their effects apply immediately.
///
/// Read the field descriptions for more details.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct SimFlags {
    /// Configuration of the program-memory cache.
    ///
    /// This flag only goes into effect after a `Simulator::new` or `Simulator::reset` call.
    ///
    /// By default, this is 32 lines, fully associative, write-back.
    pub cache: CacheConfig,

    /// Safety ceiling on the total number of instruction cycles (`sys_clock`).
    ///
    /// This is not part of the instruction set. It prevents a runaway program
    /// from looping forever; reaching it ends a run with [`RunOutcome::Exhausted`].
    ///
    /// By default, this is `1_000_000`.
    pub instruction_limit: u64,

    /// The fill strategy for memory that was never written by an image.
    ///
    /// This is used to initialize PROGRAM memory, DATA memory,
    /// and the general-purpose register slots.
    /// This flag only goes into effect after a `Simulator::new` or `Simulator::reset` call.
    ///
    /// By default, this flag is [`MachineInitStrategy::default`].
    pub machine_init: MachineInitStrategy,
}
impl Default for SimFlags {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            instruction_limit: 1_000_000,
            machine_init: MachineInitStrategy::default(),
        }
    }
}

/// Executes program images.
#[derive(Debug)]
pub struct Simulator {
    // ------------------ SIMULATION STATE ------------------
    // Calling [`Simulator::reset`] resets these values.

    /// Register memory (including the devices bound to it).
    pub regs: RegisterMemory,

    /// PROGRAM and DATA memory.
    pub bus: Bus,

    /// The cache in front of PROGRAM memory.
    pub cache: Cache,

    /// The program counter.
    pub pc: u16,

    /// The number of clock cycles billed by executed instructions and interrupt entries.
    pub cycles: u64,

    /// The number of instruction cycles that have elapsed (including cycles spent parked by `HALT`).
    pub sys_clock: u64,

    /// The number of instructions executed (skipped instructions do not count).
    pub instructions_run: u64,

    /// The active `IF` block, if any.
    pub if_context: IfContext,

    /// Set by `HALT`: no instructions are fetched until an interrupt is serviced.
    parked: bool,

    // ------------------ CONFIG/DEBUG STATE ------------------
    // Calling [`Simulator::reset`] does not reset these values.

    /// Whether the machine is running.
    ///
    /// This is publicly accessible via a reference through [`Simulator::running`].
    running: RunFlag,

    /// Configuration settings for the simulator.
    ///
    /// These are preserved between resets.
    ///
    /// See [`SimFlags`] for more details on what configuration
    /// settings are available.
    pub flags: SimFlags,

    /// Breakpoints for the simulator.
    pub breakpoints: HashSet<Breakpoint>,
}
impl Simulator where Simulator: Send {}

impl Simulator {
    /// Creates a new simulator, using the provided running flag.
    fn new_with_running(flags: SimFlags, running: RunFlag) -> Self {
        let mut filler = flags.machine_init.generator();
        running.store(true, Ordering::Relaxed);

        Self {
            regs: RegisterMemory::new(&mut filler),
            bus: Bus::new(&mut filler),
            cache: Cache::new(flags.cache),
            pc: RESET_PC,
            cycles: 0,
            sys_clock: 0,
            instructions_run: 0,
            if_context: IfContext::default(),
            parked: false,

            running,
            flags,
            breakpoints: Default::default(),
        }
    }

    /// Creates a new simulator with the provided flags, with no image loaded.
    pub fn new(flags: SimFlags) -> Self {
        Self::new_with_running(flags, Arc::default())
    }

    /// Resets the simulator.
    ///
    /// This resets the state of the `Simulator` back to before any execution calls,
    /// while preserving configuration and debug state.
    ///
    /// Note that this function preserves:
    /// - Flags
    /// - Breakpoints
    /// - Devices (their slots are rebound and the devices themselves are reset)
    /// - The running flag reference (anything holding [`Simulator::running`] can still control it)
    ///
    /// This does not reload images. Any image has to be reloaded into the Simulator.
    pub fn reset(&mut self) {
        let running = Arc::clone(&self.running);
        let flags = self.flags;
        let breakpoints = std::mem::take(&mut self.breakpoints);
        let devices = std::mem::take(&mut self.regs.devices);

        *self = Simulator::new_with_running(flags, running);
        self.breakpoints = breakpoints;
        self.regs.restore_devices(devices);
    }

    /// Loads an image into this simulator.
    ///
    /// PROGRAM and DATA blocks are copied to the bus, register blocks are copied
    /// into register memory (bypassing slot policies), and the PC is set to the image's entry point.
    /// This also marks the machine as running.
    pub fn load_image(&mut self, image: &Image) {
        // anything the program wrote is kept unless the image overwrites it
        self.cache.flush(&mut self.bus);
        self.cache.invalidate();

        for block in &image.blocks {
            match block.region {
                Region::Program  => self.bus.program.copy_block(block.start, &block.data),
                Region::Data     => self.bus.data.copy_block(block.start, &block.data),
                Region::Register => {
                    for (slot, &byte) in (block.start..).zip(&block.data) {
                        self.regs.set_raw(slot as u8, byte);
                    }
                }
            }
        }

        if let Some(entry) = image.entry {
            self.pc = entry;
        }
        self.if_context.cancel();
        self.parked = false;
        self.running.store(true, Ordering::Relaxed);
    }

    /// Binds a device to a register slot, setting the slot to `initial`.
    ///
    /// If successful, the ID of the device is returned.
    pub fn add_device(&mut self, slot: u8, dev: impl RegisterDevice, initial: u8) -> Result<u16, SimErr> {
        if self.regs.policy(slot) != SlotPolicy::ReadWrite {
            return Err(SimErr::DeviceSlotTaken { slot });
        }
        self.regs.add_device(slot, dev, initial)
            .map_err(|_| SimErr::TooManyDevices)
    }

    /// Gets a reference to the running flag.
    ///
    /// Storing `false` into it from another thread stops a run in progress
    /// (the run returns [`RunOutcome::Halted`]).
    pub fn running(&self) -> &RunFlag {
        &self.running
    }
    /// Whether the machine is running (has not executed `STOP` or been stopped externally).
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
    /// Whether the CPU is parked by `HALT`, waiting for an interrupt.
    pub fn is_parked(&self) -> bool {
        self.parked
    }

    /// Writes every dirty cache line back to PROGRAM memory on the bus.
    ///
    /// This is done automatically when `STOP` executes.
    pub fn flush(&mut self) {
        self.cache.flush(&mut self.bus);
    }

    /// Reads a byte of PROGRAM memory, through the cache.
    pub fn read_program(&mut self, addr: u16) -> u8 {
        self.cache.read(&mut self.bus, addr)
    }
    /// Writes a byte of PROGRAM memory, through the cache.
    pub fn write_program(&mut self, addr: u16, value: u8) {
        self.cache.write(&mut self.bus, addr, value);
    }

    /// The current stack pointer.
    ///
    /// If `P01M` selects an internal stack, this is only `SPL` (and points into register memory).
    /// Otherwise, this is `SPH:SPL` (and points into DATA memory).
    pub fn sp(&self) -> u16 {
        match self.internal_stack() {
            true  => u16::from(self.regs.get_raw(SPL)),
            false => u16::from_be_bytes([self.regs.get_raw(SPH), self.regs.get_raw(SPL)]),
        }
    }

    /// Gets the flags register.
    pub fn cpu_flags(&self) -> Flags {
        Flags(self.regs.get_raw(FLAGS))
    }

    /// Runs until the tripwire condition returns false (or any of the typical breaks occur).
    ///
    /// The typical break conditions are:
    /// - the machine is not running (`STOP` was executed, or the running flag was cleared)
    /// - the instruction ceiling is reached
    /// - a breakpoint matches
    pub fn run_while(&mut self, mut tripwire: impl FnMut(&mut Simulator) -> bool) -> RunOutcome {
        // event loop
        // run until:
        // 1. the running flag is cleared
        // 2. the ceiling is hit
        // 3. the tripwire condition returns false
        // 4. any of the breakpoints are hit
        let outcome = loop {
            if !self.is_running() {
                break RunOutcome::Halted;
            }
            if self.sys_clock >= self.flags.instruction_limit {
                break RunOutcome::Exhausted;
            }
            if !tripwire(self) {
                break RunOutcome::Tripwire;
            }

            self.step();

            // After executing, check that any breakpoints were hit.
            if self.is_running() && self.breakpoints.iter().any(|bp| bp.check(self)) {
                break RunOutcome::Breakpoint;
            }
        };

        log::trace!("run ended ({outcome:?}) at {:04X}h after {} cycles", self.pc, self.cycles);
        outcome
    }

    /// Execute the program.
    ///
    /// This blocks until the program stops (or the instruction ceiling is reached).
    /// If you would like to limit the number of steps to execute further, consider [`Simulator::run_with_limit`].
    pub fn run(&mut self) -> RunOutcome {
        self.run_while(|_| true)
    }

    /// Execute the program with a limit on how many instruction cycles to run.
    ///
    /// This blocks until the program stops or until the limit has been hit.
    pub fn run_with_limit(&mut self, max_steps: u64) -> RunOutcome {
        let start = self.sys_clock;
        self.run_while(|sim| sim.sys_clock.wrapping_sub(start) < max_steps)
    }

    /// Simulate one instruction cycle.
    ///
    /// This returns [`RunOutcome::Tripwire`] once the cycle completes,
    /// unless one of the typical break conditions of [`Simulator::run_while`] happens first
    /// (in which case, the cycle may not have been executed).
    pub fn step_in(&mut self) -> RunOutcome {
        let mut first = true;
        self.run_while(|_| std::mem::take(&mut first))
    }

    /// One instruction cycle: execute (unless parked), settle any `IF` block,
    /// tick devices, then poll interrupts.
    fn step(&mut self) {
        if !self.parked {
            let addr = self.pc;
            let opcode = self.fetch();
            let instr = Instr::decode(opcode);
            log::trace!("{addr:04X}h: {instr}");

            self.execute(instr);
            let settlement = self.if_context.settle();
            self.settle(settlement);
            self.instructions_run = self.instructions_run.wrapping_add(1);

            if !self.is_running() { return };
        }

        self.regs.tick_devices();
        self.poll_interrupts();
        self.sys_clock = self.sys_clock.wrapping_add(1);
    }

    fn settle(&mut self, settlement: Settlement) {
        if let Some(flags) = settlement.restore {
            self.regs.write(FLAGS, flags);
        }
        for _ in 0..settlement.skip {
            let addr = self.pc;
            let opcode = self.fetch();
            self.pc = self.pc.wrapping_add(u16::from(isa::opcode_size(opcode)));
            log::debug!("IF: skipped {} at {addr:04X}h", Instr::decode(opcode));
        }
    }

    fn poll_interrupts(&mut self) {
        let imr = self.regs.get_raw(IMR);
        if imr & IMR_ENABLE == 0 { return };

        let pending = imr & self.regs.get_raw(IRQ) & IRQ_MASK;
        if let Some(source) = interrupt::select(self.regs.get_raw(IPR), pending) {
            self.service_interrupt(source);
        }
    }

    fn service_interrupt(&mut self, source: u8) {
        let entry = u16::from(source) * 2;
        let vector = u16::from_be_bytes([self.read_program(entry), self.read_program(entry + 1)]);
        log::debug!("servicing interrupt {source} at {vector:04X}h (from {:04X}h)", self.pc);

        self.push_word(self.pc);
        self.pc = vector;
        self.cycles += 20;

        let flags = self.regs.read(FLAGS);
        self.push(flags);
        self.cycles += match self.internal_stack() {
            true  => 10,
            false => 12,
        };

        let imr = self.regs.get_raw(IMR);
        self.regs.set_raw(IMR, imr & !IMR_ENABLE);
        let irq = self.regs.get_raw(IRQ);
        self.regs.set_raw(IRQ, irq & !(1 << source));
        self.cycles += 6;

        self.if_context.cancel();
        self.parked = false;
    }

    fn fetch(&mut self) -> u8 {
        let byte = self.read_program(self.pc);
        self.pc = self.pc.wrapping_add(1);
        byte
    }
    fn fetch_word(&mut self) -> u16 {
        let hi = self.fetch();
        let lo = self.fetch();
        u16::from_be_bytes([hi, lo])
    }

    fn read_space(&mut self, space: Space, addr: u16) -> u8 {
        match space {
            Space::Program => self.read_program(addr),
            Space::Data => self.bus.read(Space::Data, addr),
        }
    }
    fn write_space(&mut self, space: Space, addr: u16, value: u8) {
        match space {
            Space::Program => self.write_program(addr, value),
            Space::Data => self.bus.write(Space::Data, addr, value),
        }
    }

    /// Reads a register pair (high byte at `slot`).
    fn read_pair(&mut self, slot: u8) -> u16 {
        let hi = self.regs.read(slot);
        let lo = self.regs.read(slot.wrapping_add(1));
        u16::from_be_bytes([hi, lo])
    }
    fn write_pair(&mut self, slot: u8, value: u16) {
        let [hi, lo] = value.to_be_bytes();
        self.regs.write(slot, hi);
        self.regs.write(slot.wrapping_add(1), lo);
    }

    fn flags(&mut self) -> Flags {
        Flags(self.regs.read(FLAGS))
    }
    fn set_flags(&mut self, flags: Flags) {
        self.regs.write(FLAGS, flags.bits());
    }
    /// Writes the flags, then the result (so a result written to `FLAGS` wins).
    fn set_result(&mut self, dst: u8, result: u8, flags: Flags) {
        self.set_flags(flags);
        self.regs.write(dst, result);
    }

    /// Evaluates a condition code, billing its cost.
    fn condition(&mut self, cc: Cond) -> bool {
        self.cycles += 10;
        let flags = self.flags();
        alu::test(cc, flags)
    }

    /// Transfers control, abandoning any active `IF` block.
    fn jump(&mut self, target: u16) {
        self.pc = target;
        self.if_context.cancel();
    }
    fn jump_relative(&mut self, offset: u8) {
        self.jump(self.pc.wrapping_add_signed(i16::from(offset as i8)));
    }
    fn call(&mut self, target: u16) {
        self.push_word(self.pc);
        self.jump(target);
        self.cycles += 20;
    }

    fn internal_stack(&self) -> bool {
        self.regs.get_raw(P01M) & P01M_INTERNAL_STACK != 0
    }
    fn set_sp(&mut self, sp: u16) {
        let [hi, lo] = sp.to_be_bytes();
        self.regs.set_raw(SPL, lo);
        if !self.internal_stack() {
            self.regs.set_raw(SPH, hi);
        }
    }
    fn push(&mut self, value: u8) {
        let sp = self.sp().wrapping_sub(1);
        self.set_sp(sp);
        match self.internal_stack() {
            true  => self.regs.write(sp as u8, value),
            false => self.bus.write(Space::Data, sp, value),
        }
    }
    fn pop(&mut self) -> u8 {
        let sp = self.sp();
        let value = match self.internal_stack() {
            true  => self.regs.read(sp as u8),
            false => self.bus.read(Space::Data, sp),
        };
        self.set_sp(sp.wrapping_add(1));
        value
    }
    /// Pushes a word so the high byte ends up at the lower address.
    fn push_word(&mut self, value: u16) {
        let [hi, lo] = value.to_be_bytes();
        self.push(lo);
        self.push(hi);
    }
    fn pop_word(&mut self) -> u16 {
        let hi = self.pop();
        let lo = self.pop();
        u16::from_be_bytes([hi, lo])
    }

    fn execute(&mut self, instr: Instr) {
        match instr {
            Instr::LoadWorking(r) => {
                let src = self.fetch();
                let value = self.regs.read(src);
                self.regs.write(working(r), value);
                self.cycles += 6;
            },
            Instr::StoreWorking(r) => {
                let dst = self.fetch();
                let value = self.regs.read(working(r));
                self.regs.write(dst, value);
                self.cycles += 6;
            },
            Instr::Djnz(r) => {
                let offset = self.fetch();
                let value = self.regs.read(working(r)).wrapping_sub(1);
                self.regs.write(working(r), value);
                self.cycles += 10;
                if value != 0 {
                    self.jump_relative(offset);
                    self.cycles += 2;
                }
            },
            Instr::Jr(cc) => {
                let offset = self.fetch();
                if self.condition(cc) {
                    self.jump_relative(offset);
                    self.cycles += 2;
                }
            },
            Instr::LoadImm(r) => {
                let value = self.fetch();
                self.regs.write(working(r), value);
                self.cycles += 6;
            },
            Instr::Jp(cc) => {
                let target = self.fetch_word();
                if self.condition(cc) {
                    self.jump(target);
                    self.cycles += 2;
                }
            },
            Instr::IncWorking(r) => {
                self.modify(working(r), alu::inc);
                self.cycles += 6;
            },
            Instr::If => {
                let operand = self.fetch();
                let cc = Cond::from_nibble(operand >> 4);
                let holds = self.condition(cc);
                let flags = self.regs.read(FLAGS);
                self.if_context.arm(operand, holds, flags);
                log::debug!("IF {cc} ({holds}): {:?}", self.if_context);
            },
            Instr::Stop => {
                log::debug!("STOP at {:04X}h", self.pc.wrapping_sub(1));
                self.running.store(false, Ordering::Relaxed);
                self.flush();
                self.cycles += 6;
            },
            Instr::Halt => {
                self.parked = true;
                self.cycles += 6;
            },
            Instr::Di => {
                let imr = self.regs.read(IMR);
                self.regs.write(IMR, imr & !IMR_ENABLE);
                self.cycles += 6;
            },
            Instr::Ei => {
                let imr = self.regs.read(IMR);
                self.regs.write(IMR, imr | IMR_ENABLE);
                self.cycles += 6;
            },
            Instr::Ret => {
                let target = self.pop_word();
                self.jump(target);
                self.cycles += 14;
            },
            Instr::Iret => {
                let flags = self.pop();
                self.regs.write(FLAGS, flags);
                let target = self.pop_word();
                self.jump(target);
                let imr = self.regs.read(IMR);
                self.regs.write(IMR, imr | IMR_ENABLE);
                self.cycles += 16;
            },
            Instr::Rcf | Instr::Scf | Instr::Ccf => {
                let flags = self.flags();
                let carry = match instr {
                    Instr::Rcf => false,
                    Instr::Scf => true,
                    _ => !flags.carry(),
                };
                self.set_flags(flags.with(Flags::C, carry));
                self.cycles += 6;
            },
            Instr::Nop => self.cycles += 6,
            Instr::Binary(op, mode) => self.binary(op, mode),
            Instr::JpIndirect => {
                let pair = self.fetch();
                let target = self.read_pair(pair);
                self.jump(target);
                self.cycles += 8;
            },
            Instr::Srp => {
                let value = self.fetch();
                self.regs.write(RP, value & 0x0F);
                self.cycles += 6;
            },
            Instr::Unary(op, operand) => self.unary(op, operand),
            Instr::Lde(t) => self.transfer(Space::Data, t),
            Instr::Ldc(t) => self.transfer(Space::Program, t),
            Instr::LoadIndexed => {
                let regs = self.fetch();
                let base = self.fetch();
                let offset = self.regs.read(working(regs & 0xF));
                let value = self.regs.read(base.wrapping_add(offset));
                self.regs.write(working(regs >> 4), value);
                self.cycles += 10;
            },
            Instr::StoreIndexed => {
                let regs = self.fetch();
                let base = self.fetch();
                let offset = self.regs.read(working(regs & 0xF));
                let value = self.regs.read(working(regs >> 4));
                self.regs.write(base.wrapping_add(offset), value);
                self.cycles += 10;
            },
            Instr::CallIndirect => {
                let pair = self.fetch();
                let target = self.read_pair(pair);
                self.call(target);
            },
            Instr::Call => {
                let target = self.fetch_word();
                self.call(target);
            },
            Instr::StoreIndirect => {
                let regs = self.fetch();
                let dst = self.regs.read(working(regs >> 4));
                let value = self.regs.read(working(regs & 0xF));
                self.regs.write(dst, value);
                self.cycles += 6;
            },
            Instr::StoreIndirectReg => {
                let src = self.fetch();
                let dst = self.fetch();
                let value = self.regs.read(src);
                let dst = self.regs.read(dst);
                self.regs.write(dst, value);
                self.cycles += 10;
            },
            Instr::Undefined(opcode) => {
                log::warn!("undefined opcode {opcode:02X}h at {:04X}h, ignoring", self.pc.wrapping_sub(1));
            },
        }
    }

    /// Fetches the operands of a two-operand instruction,
    /// returning the destination slot and the source value.
    fn binary_operands(&mut self, mode: Mode) -> (u8, u8) {
        match mode {
            Mode::WorkWork => {
                let regs = self.fetch();
                self.cycles += 6;
                (working(regs >> 4), self.regs.read(working(regs & 0xF)))
            },
            Mode::WorkIndirect => {
                let regs = self.fetch();
                self.cycles += 6;
                let ptr = self.regs.read(working(regs & 0xF));
                (working(regs >> 4), self.regs.read(ptr))
            },
            Mode::RegReg => {
                let src = self.fetch();
                let value = self.regs.read(src);
                let dst = self.fetch();
                self.cycles += 10;
                (dst, value)
            },
            Mode::RegIndirect => {
                let src = self.fetch();
                let ptr = self.regs.read(src);
                let value = self.regs.read(ptr);
                let dst = self.fetch();
                self.cycles += 10;
                (dst, value)
            },
            Mode::RegImm => {
                let dst = self.fetch();
                let value = self.fetch();
                self.cycles += 10;
                (dst, value)
            },
            Mode::IndirectImm => {
                let ptr = self.fetch();
                let dst = self.regs.read(ptr);
                let value = self.fetch();
                self.cycles += 10;
                (dst, value)
            },
        }
    }

    fn binary(&mut self, op: AluOp, mode: Mode) {
        let (dst, src) = self.binary_operands(mode);
        if op == AluOp::Ld {
            self.regs.write(dst, src);
            return;
        }

        let a = self.regs.read(dst);
        let flags = self.flags();
        let (result, flags) = match op {
            AluOp::Add => alu::add(a, src, false, flags),
            AluOp::Adc => alu::add(a, src, flags.carry(), flags),
            AluOp::Sub | AluOp::Cp => alu::sub(a, src, false, flags),
            AluOp::Sbc => alu::sub(a, src, flags.carry(), flags),
            AluOp::Or  => logical(a | src, flags),
            AluOp::And | AluOp::Tm => logical(a & src, flags),
            AluOp::Tcm => logical(!a & src, flags),
            AluOp::Xor => logical(a ^ src, flags),
            AluOp::Ld  => (src, flags),
        };

        match op.writes_back() {
            true  => self.set_result(dst, result, flags),
            false => self.set_flags(flags),
        }
    }

    /// Applies a single-operand ALU function to a register.
    fn modify(&mut self, slot: u8, f: fn(u8, Flags) -> (u8, Flags)) {
        let value = self.regs.read(slot);
        let flags = self.flags();
        let (result, flags) = f(value, flags);
        self.set_result(slot, result, flags);
    }

    fn unary(&mut self, op: UnaryOp, operand: Operand) {
        let reg = self.fetch();
        let slot = match operand {
            Operand::Direct => reg,
            Operand::Indirect => self.regs.read(reg),
        };
        self.cycles += 6;

        match op {
            UnaryOp::Dec  => self.modify(slot, alu::dec),
            UnaryOp::Rlc  => self.modify(slot, alu::rlc),
            UnaryOp::Inc  => self.modify(slot, alu::inc),
            UnaryOp::Com  => self.modify(slot, alu::com),
            UnaryOp::Rl   => self.modify(slot, alu::rl),
            UnaryOp::Rrc  => self.modify(slot, alu::rrc),
            UnaryOp::Sra  => self.modify(slot, alu::sra),
            UnaryOp::Rr   => self.modify(slot, alu::rr),
            UnaryOp::Da   => {
                self.modify(slot, alu::decimal_adjust);
                self.cycles += 2;
            },
            UnaryOp::Swap => {
                self.modify(slot, alu::swap);
                self.cycles += 2;
            },
            UnaryOp::Clr  => self.regs.write(slot, 0),
            UnaryOp::Pop  => {
                let value = self.pop();
                self.regs.write(slot, value);
                self.cycles += 4;
            },
            UnaryOp::Push => {
                let value = self.regs.read(slot);
                self.push(value);
                self.cycles += 4;
                if !self.internal_stack() { self.cycles += 2 };
                if operand == Operand::Indirect { self.cycles += 2 };
            },
            UnaryOp::Decw | UnaryOp::Incw => {
                let value = self.read_pair(slot);
                let flags = self.flags();
                let (result, flags) = match op {
                    UnaryOp::Decw => alu::decw(value, flags),
                    _ => alu::incw(value, flags),
                };
                self.set_flags(flags);
                self.write_pair(slot, result);
                self.cycles += 4;
            },
        }
    }

    /// `LDE`/`LDC`: moves a byte between a working register and the memory addressed by a working register pair.
    fn transfer(&mut self, space: Space, t: Transfer) {
        let regs = self.fetch();
        let r = working(regs >> 4);
        let pair = working(regs & 0xF);
        let addr = self.read_pair(pair);

        match t {
            Transfer::Load => {
                let value = self.read_space(space, addr);
                self.regs.write(r, value);
            },
            Transfer::LoadIncr => {
                let value = self.read_space(space, addr);
                let dst = self.regs.read(r);
                self.regs.write(dst, value);
            },
            Transfer::Store => {
                let value = self.regs.read(r);
                self.write_space(space, addr, value);
            },
            Transfer::StoreIncr => {
                let src = self.regs.read(r);
                let value = self.regs.read(src);
                self.write_space(space, addr, value);
            },
        }

        match t.increments() {
            true => {
                let ptr = self.regs.read(r);
                self.regs.write(r, ptr.wrapping_add(1));
                self.write_pair(pair, addr.wrapping_add(1));
                self.cycles += 18;
            },
            false => self.cycles += 12,
        }
    }
}
impl Default for Simulator {
    fn default() -> Self {
        Self::new(Default::default())
    }
}

/// The windowed slot of working register `n`.
fn working(n: u8) -> u8 {
    0xE0 | (n & 0x0F)
}

fn logical(result: u8, flags: Flags) -> (u8, Flags) {
    (result, alu::logic(result, flags))
}

/// A type alias for the running flag.
pub type RunFlag = Arc<AtomicBool>;

#[cfg(test)]
mod tests {
    use crate::image::srec;
    use crate::sim::cache::{Placement, WritePolicy};
    use crate::sim::device::TimerDevice;
    use crate::sim::mem::PORT0;

    use super::*;

    const ADC_SAMPLE: &str = "\
S0 Test of all ADC modes with IF
S10C000C1F79FFFF3101DF1F7FA2
S1140015120113021414101515101610201717FF6F5A
S30B00100F011381801610108A
S9000c
";

    const GET_ARGS_SAMPLE: &str = "\
S112000CE610152010E611100111F111B0106F5C
S9000c
";

    const JUMP_SAMPLE: &str = "\
S10A000C7D2000DF7D2000D0
S11720001610011F65FF6B062610021F666B04FFFFFFFF6F16
S9000C
";

    // LD X(r), r is D7 followed by (source register << 4 | index register) and the base.
    const CALL_SAMPLE: &str = "\
S0 CALL, RET and LD tests
S111000C3101AC01BC02CC030C00D610006F15
S10F1000D7A0640ED7B0640ED7C064AF54
S9000C
";

    fn load(src: &str) -> Simulator {
        let image = srec::parse(src).unwrap();
        let mut sim = Simulator::new(Default::default());
        sim.load_image(&image);
        sim
    }

    fn with_program(program: &[u8]) -> Simulator {
        let mut sim = Simulator::new(Default::default());
        sim.bus.program.copy_block(RESET_PC, program);
        sim
    }

    #[test]
    fn test_adc_sample() {
        let mut sim = load(ADC_SAMPLE);
        assert_eq!(sim.run(), RunOutcome::Halted);
        assert_eq!(sim.regs.get_raw(0x10), 0x14);
        assert_eq!(sim.regs.rp(), 0x01);
        // IF / false arm / SCF / IF / three ADCs / STOP
        assert_eq!(sim.instructions_run, 8);
    }

    #[test]
    fn test_get_args_sample() {
        let mut sim = load(GET_ARGS_SAMPLE);
        let mut trace = vec![];
        while sim.is_running() {
            sim.step_in();
            trace.push((sim.regs.get_raw(0x10), sim.regs.get_raw(0x11)));
        }

        assert_eq!(trace, [
            (0x15, 0x00), // LD 10h, #15h
            (0x16, 0x00), // INC 10h
            (0x16, 0x10), // LD 11h, #10h
            (0x15, 0x10), // DEC @11h
            (0x51, 0x10), // SWAP @11h
            (0x00, 0x10), // CLR 10h
            (0x00, 0x10), // STOP
        ]);
    }

    #[test]
    fn test_jump_sample() {
        let mut sim = load(JUMP_SAMPLE);
        assert_eq!(sim.run(), RunOutcome::Halted);
        assert_eq!(sim.regs.get_raw(0x10), 0x00);
        assert_eq!(sim.pc, 0x2014);
        assert_eq!(sim.regs.get_raw(FLAGS), 0xCC);
        assert!(!sim.if_context.active());
    }

    #[test]
    fn test_if_always_true() {
        // SRP #1; IF always (2, 1); INC r0; INC r1; INC r2; INC r3; STOP
        let mut sim = with_program(&[0x31, 0x01, 0x1F, 0x89, 0x0E, 0x1E, 0x2E, 0x3E, 0x6F]);
        assert_eq!(sim.run(), RunOutcome::Halted);
        assert_eq!(&sim.regs.as_slice()[0x10..0x14], [1, 1, 0, 1]);
    }

    #[test]
    fn test_if_always_false() {
        // SRP #1; IF never (2, 1); INC r0; INC r1; INC r2; INC r3; STOP
        let mut sim = with_program(&[0x31, 0x01, 0x1F, 0x09, 0x0E, 0x1E, 0x2E, 0x3E, 0x6F]);
        assert_eq!(sim.run(), RunOutcome::Halted);
        assert_eq!(&sim.regs.as_slice()[0x10..0x14], [0, 0, 1, 1]);
    }

    #[test]
    fn test_if_skips_by_width() {
        // SRP #1; IF never (1, 0); ADD 10h, #5; INC r1; STOP
        let mut sim = with_program(&[0x31, 0x01, 0x1F, 0x04, 0x06, 0x10, 0x05, 0x1E, 0x6F]);
        assert_eq!(sim.run(), RunOutcome::Halted);
        assert_eq!(sim.regs.get_raw(0x10), 0);
        assert_eq!(sim.regs.get_raw(0x11), 1);
    }

    #[test]
    fn test_if_restores_flags() {
        // SCF; IF always (1, 0); RCF; STOP
        let mut sim = with_program(&[0xDF, 0x1F, 0x84, 0xCF, 0x6F]);
        assert_eq!(sim.run(), RunOutcome::Halted);
        assert!(sim.cpu_flags().carry());
    }

    #[test]
    fn test_if_abandoned_by_jump() {
        // SRP #1; IF always (2, 1); INC r0; JR +0; INC r1; INC r2; STOP
        let mut sim = with_program(&[0x31, 0x01, 0x1F, 0x89, 0x0E, 0x8B, 0x00, 0x1E, 0x2E, 0x6F]);
        assert_eq!(sim.run(), RunOutcome::Halted);
        assert_eq!(&sim.regs.as_slice()[0x10..0x13], [1, 1, 1]);
    }

    #[test]
    fn test_djnz() {
        // SRP #1; LD r0, #3; loop: INC r1; DJNZ r0, loop; STOP
        let mut sim = with_program(&[0x31, 0x01, 0x0C, 0x03, 0x1E, 0x0A, 0xFD, 0x6F]);
        assert_eq!(sim.run(), RunOutcome::Halted);
        assert_eq!(sim.regs.get_raw(0x10), 0);
        assert_eq!(sim.regs.get_raw(0x11), 3);
    }

    /// Sets up an internal stack at 80h, flags 35h, and group A interrupts (3 at 0100h, 5 at 0200h),
    /// then raises both.
    fn interrupt_program(ipr: u8) -> Simulator {
        let mut sim = with_program(&[
            0xE6, P01M, 0x04,
            0xE6, SPL, 0x80,
            0xE6, FLAGS, 0x35,
            0xE6, IPR, ipr,
            0xE6, IMR, 0xA8,
            0xE6, IRQ, 0x28,
            0x6F,
        ]);
        sim.bus.program.copy_block(0x0006, &[0x01, 0x00]);
        sim.bus.program.copy_block(0x000A, &[0x02, 0x00]);
        sim.bus.program.copy_block(0x0100, &[0xDF, 0xBF]); // SCF; IRET
        sim.bus.program.copy_block(0x0200, &[0xBF]);       // IRET
        sim
    }

    #[test]
    fn test_interrupt_priority_and_iret() {
        let mut sim = interrupt_program(0b10_1000);
        for _ in 0..6 {
            sim.step_in();
        }

        // source 3 won
        assert_eq!(sim.pc, 0x0100);
        assert_eq!(sim.regs.get_raw(IRQ), 0x20);
        assert_eq!(sim.regs.get_raw(IMR), 0x28);
        assert_eq!(sim.sp(), 0x7D);
        assert_eq!(&sim.regs.as_slice()[0x7D..0x80], [0x35, 0x00, 0x1E]);

        sim.step_in(); // SCF
        assert!(sim.cpu_flags().carry());
        sim.step_in(); // IRET, then source 5 is serviced
        assert_eq!(sim.pc, 0x0200);
        assert_eq!(sim.regs.get_raw(IRQ), 0x00);
        assert_eq!(sim.regs.get_raw(0x7D), 0x35);

        sim.step_in(); // IRET
        assert_eq!(sim.pc, 0x001E);
        assert_eq!(sim.regs.get_raw(FLAGS), 0x35);
        assert_eq!(sim.regs.get_raw(IMR), 0xA8);
        assert_eq!(sim.sp(), 0x80);

        assert_eq!(sim.run(), RunOutcome::Halted);
    }

    #[test]
    fn test_interrupt_intra_group() {
        let mut sim = interrupt_program(0b00_1000);
        for _ in 0..6 {
            sim.step_in();
        }
        assert_eq!(sim.pc, 0x0200);
        assert_eq!(sim.regs.get_raw(IRQ), 0x08);
    }

    #[test]
    fn test_interrupt_disabled() {
        let mut sim = interrupt_program(0b10_1000);
        sim.bus.program.copy_block(RESET_PC + 14, &[0x28]); // IMR without the enable bit
        assert_eq!(sim.run(), RunOutcome::Halted);
        assert_eq!(sim.regs.get_raw(IRQ), 0x28);
    }

    #[test]
    fn test_timer_interrupt() {
        let mut sim = with_program(&[
            0xE6, P01M, 0x04,
            0xE6, SPL, 0x80,
            0xE6, IMR, 0x81,
            0xE6, PORT0, 0x02,
            0x8B, 0xFE, // JR $
        ]);
        sim.bus.program.copy_block(0x0000, &[0x01, 0x00]);
        sim.bus.program.copy_block(0x0100, &[0xE6, 0x20, 0xAA, 0x6F]);
        sim.add_device(PORT0, TimerDevice::new(), 0).unwrap();

        assert_eq!(sim.run(), RunOutcome::Halted);
        assert_eq!(sim.regs.get_raw(0x20), 0xAA);
    }

    #[test]
    fn test_halt_waits_for_interrupt() {
        let mut sim = with_program(&[
            0xE6, P01M, 0x04,
            0xE6, SPL, 0x80,
            0xE6, IMR, 0x81,
            0xE6, PORT0, 0x05,
            0x7F, // HALT
            0x6F,
        ]);
        sim.bus.program.copy_block(0x0000, &[0x01, 0x00]);
        sim.bus.program.copy_block(0x0100, &[0xBF]); // IRET
        sim.add_device(PORT0, TimerDevice::new(), 0).unwrap();

        for _ in 0..5 {
            sim.step_in();
        }
        assert!(sim.is_parked());
        let executed = sim.instructions_run;
        for _ in 0..3 {
            sim.step_in();
        }
        assert_eq!(sim.instructions_run, executed);

        assert_eq!(sim.run(), RunOutcome::Halted);
        assert_eq!(sim.pc, RESET_PC + 14);
    }

    #[test]
    fn test_halt_without_interrupts_exhausts() {
        let mut sim = with_program(&[0x7F, 0x6F]);
        sim.flags.instruction_limit = 50;
        assert_eq!(sim.run(), RunOutcome::Exhausted);
        assert_eq!(sim.sys_clock, 50);
        assert_eq!(sim.instructions_run, 1);
    }

    #[test]
    fn test_external_stack() {
        // SPH/SPL = 2000h; CALL 0100h; STOP
        let mut sim = with_program(&[
            0xE6, SPH, 0x20,
            0xE6, SPL, 0x00,
            0xD6, 0x01, 0x00,
            0x6F,
        ]);
        sim.bus.program.copy_block(0x0100, &[0xAF]); // RET

        for _ in 0..3 {
            sim.step_in();
        }
        assert_eq!(sim.pc, 0x0100);
        assert_eq!(sim.sp(), 0x1FFE);
        assert_eq!(sim.bus.data[0x1FFE], 0x00);
        assert_eq!(sim.bus.data[0x1FFF], 0x15);

        sim.step_in();
        assert_eq!(sim.pc, 0x0015);
        assert_eq!(sim.sp(), 0x2000);
    }

    #[test]
    fn test_internal_stack() {
        // P01M internal; SPL = 40h; CALL 0100h; STOP
        let mut sim = with_program(&[
            0xE6, P01M, 0x04,
            0xE6, SPL, 0x40,
            0xD6, 0x01, 0x00,
            0x6F,
        ]);
        sim.bus.program.copy_block(0x0100, &[0xAF]); // RET

        for _ in 0..3 {
            sim.step_in();
        }
        assert_eq!(sim.sp(), 0x3E);
        assert_eq!(&sim.regs.as_slice()[0x3E..0x40], [0x00, 0x15]);
        assert_eq!(sim.regs.get_raw(SPH), 0x00);

        sim.step_in();
        assert_eq!(sim.pc, 0x0015);
        assert_eq!(sim.sp(), 0x40);
    }

    #[test]
    fn test_push_pop() {
        // P01M internal; SPL = 40h; SRP #1; LD r0, #99h; PUSH r0; POP 11h; STOP
        let mut sim = with_program(&[
            0xE6, P01M, 0x04,
            0xE6, SPL, 0x40,
            0x31, 0x01,
            0x0C, 0x99,
            0x70, 0xE0,
            0x50, 0x11,
            0x6F,
        ]);
        assert_eq!(sim.run(), RunOutcome::Halted);
        assert_eq!(sim.regs.get_raw(0x11), 0x99);
        assert_eq!(sim.regs.get_raw(0x3F), 0x99);
        assert_eq!(sim.sp(), 0x40);
    }

    fn store_program(write_policy: WritePolicy) -> Simulator {
        // SRP #1; LD r0, #5Ah; LD r2, #30h; LD r3, #00h; LDC @rr2, r0; STOP
        let program = [0x31, 0x01, 0x0C, 0x5A, 0x2C, 0x30, 0x3C, 0x00, 0xD2, 0x02, 0x6F];
        let cache = CacheConfig { lines: 8, placement: Placement::Associative, write_policy };
        let mut sim = Simulator::new(SimFlags { cache, ..Default::default() });
        sim.bus.program.copy_block(RESET_PC, &program);
        sim
    }

    #[test]
    fn test_write_back_flushes_on_stop() {
        let mut sim = store_program(WritePolicy::WriteBack);
        for _ in 0..5 {
            sim.step_in();
        }
        assert_eq!(sim.bus.program[0x3000], 0x00);
        assert_eq!(sim.read_program(0x3000), 0x5A);

        assert_eq!(sim.run(), RunOutcome::Halted);
        assert_eq!(sim.bus.program[0x3000], 0x5A);
    }

    #[test]
    fn test_write_through() {
        let mut sim = store_program(WritePolicy::WriteThrough);
        for _ in 0..5 {
            sim.step_in();
        }
        assert_eq!(sim.bus.program[0x3000], 0x5A);
    }

    #[test]
    fn test_lde_increment() {
        // SRP #1; LD r2, #40h; LD r3, #00h; LD r4, #20h; LDEI @r4, @rr2; STOP
        let mut sim = with_program(&[0x31, 0x01, 0x2C, 0x40, 0x3C, 0x00, 0x4C, 0x20, 0x83, 0x42, 0x6F]);
        sim.bus.data[0x4000] = 0x77;
        assert_eq!(sim.run(), RunOutcome::Halted);
        assert_eq!(sim.regs.get_raw(0x20), 0x77);
        assert_eq!(sim.regs.get_raw(0x14), 0x21);
        assert_eq!(sim.regs.get_raw(0x13), 0x01);
    }

    #[test]
    fn test_call_sample() {
        let mut sim = load(CALL_SAMPLE);
        for _ in 0..6 {
            sim.step_in();
        }
        assert_eq!(sim.pc, 0x1000);
        assert_eq!(sim.sp(), 0xFFFE);
        assert_eq!(sim.bus.data[0xFFFE], 0x00);
        assert_eq!(sim.bus.data[0xFFFF], 0x19);

        assert_eq!(sim.run(), RunOutcome::Halted);
        assert_eq!(&sim.regs.as_slice()[0x64..0x68], [1, 2, 3, 0]);
        assert_eq!(sim.regs.get_raw(0x10), 2);
        assert_eq!(sim.pc, 0x001A);
        assert_eq!(sim.sp(), 0x0000);
        assert_eq!(sim.instructions_run, 13);
    }

    #[test]
    fn test_indexed_loads() {
        // SRP #1; LD r1, #3; LD r2, #ABh; LD 40h(r1), r2; LD r3, 40h(r1); STOP
        let mut sim = with_program(&[0x31, 0x01, 0x1C, 0x03, 0x2C, 0xAB, 0xD7, 0x21, 0x40, 0xC7, 0x31, 0x40, 0x6F]);
        assert_eq!(sim.run(), RunOutcome::Halted);
        assert_eq!(sim.regs.get_raw(0x43), 0xAB);
        assert_eq!(sim.regs.get_raw(0x13), 0xAB);
        assert_eq!(sim.regs.get_raw(0x40), 0x00);
    }

    #[test]
    fn test_indirect_call_and_jump() {
        // SRP #1; LD r4, #01h; LD r5, #00h; CALL @14h;
        // LD r6, #02h; LD r7, #00h; JP @16h
        let mut sim = with_program(&[
            0x31, 0x01,
            0x4C, 0x01,
            0x5C, 0x00,
            0xD4, 0x14,
            0x6C, 0x02,
            0x7C, 0x00,
            0x30, 0x16,
        ]);
        sim.bus.program.copy_block(0x0100, &[0x8E, 0xAF]); // INC r8; RET
        sim.bus.program.copy_block(0x0200, &[0x6F]);

        for _ in 0..4 {
            sim.step_in();
        }
        assert_eq!(sim.pc, 0x0100);
        assert_eq!(sim.sp(), 0xFFFE);
        assert_eq!(sim.bus.data[0xFFFE], 0x00);
        assert_eq!(sim.bus.data[0xFFFF], 0x14);

        assert_eq!(sim.run(), RunOutcome::Halted);
        assert_eq!(sim.regs.get_raw(0x18), 1);
        assert_eq!(sim.pc, 0x0201);
        assert_eq!(sim.sp(), 0x0000);
    }

    #[test]
    fn test_store_indirect() {
        // SRP #1; LD r0, #30h; LD r1, #5Ch; LD @r0, r1; LD 31h, #40h; LD @31h, 30h; STOP
        let mut sim = with_program(&[
            0x31, 0x01,
            0x0C, 0x30,
            0x1C, 0x5C,
            0xF3, 0x01,
            0xE6, 0x31, 0x40,
            0xF5, 0x30, 0x31,
            0x6F,
        ]);
        assert_eq!(sim.run(), RunOutcome::Halted);
        assert_eq!(sim.regs.get_raw(0x30), 0x5C);
        assert_eq!(sim.regs.get_raw(0x40), 0x5C);
        assert_eq!(sim.regs.get_raw(0x31), 0x40);
    }

    #[test]
    fn test_ldc_load_and_lde_store() {
        // SRP #1; LD r2, #01h; LD r3, #00h; LDC r0, @rr2;
        // LD r4, #20h; LD r5, #00h; LDE @rr4, r0; STOP
        let mut sim = with_program(&[
            0x31, 0x01,
            0x2C, 0x01,
            0x3C, 0x00,
            0xC2, 0x02,
            0x4C, 0x20,
            0x5C, 0x00,
            0x92, 0x04,
            0x6F,
        ]);
        sim.bus.program.copy_block(0x0100, &[0x99]);

        assert_eq!(sim.run(), RunOutcome::Halted);
        assert_eq!(sim.regs.get_raw(0x10), 0x99);
        assert_eq!(sim.bus.data[0x2000], 0x99);
        // no auto-increment
        assert_eq!(sim.regs.get_raw(0x12), 0x01);
        assert_eq!(sim.regs.get_raw(0x13), 0x00);
        assert_eq!(sim.regs.get_raw(0x14), 0x20);
        assert_eq!(sim.regs.get_raw(0x15), 0x00);
    }

    /// Runs `op 20h, #src` with `20h = dst` and the given flags,
    /// returning the contents of 20h and the flags afterwards.
    fn run_binary(opcode: u8, dst: u8, src: u8, flags: u8) -> (u8, u8) {
        let mut sim = with_program(&[
            0xE6, FLAGS, flags,
            0xE6, 0x20, dst,
            opcode, 0x20, src,
            0x6F,
        ]);
        assert_eq!(sim.run(), RunOutcome::Halted);
        (sim.regs.get_raw(0x20), sim.regs.get_raw(FLAGS))
    }

    #[test]
    fn test_binary_write_back() {
        const C: u8 = Flags::C;
        const Z: u8 = Flags::Z;
        const S: u8 = Flags::S;
        const V: u8 = Flags::V;
        const D: u8 = Flags::D;
        const H: u8 = Flags::H;

        // OR: V cleared
        assert_eq!(run_binary(0x46, 0x0F, 0xF0, V), (0xFF, S));
        // AND: C untouched
        assert_eq!(run_binary(0x56, 0x0F, 0xF0, C), (0x00, C | Z));
        // XOR
        assert_eq!(run_binary(0xB6, 0xFF, 0x0F, 0), (0xF0, S));
        // SBC subtracts the carry
        assert_eq!(run_binary(0x36, 0x10, 0x01, C), (0x0E, C | D));
        assert_eq!(run_binary(0x36, 0x10, 0x01, 0), (0x0F, C | D));

        // TM, TCM, CP only set flags
        assert_eq!(run_binary(0x76, 0x0F, 0xF0, 0), (0x0F, Z));
        assert_eq!(run_binary(0x76, 0x0F, 0x81, 0), (0x0F, 0));
        assert_eq!(run_binary(0x66, 0x0F, 0x0F, 0), (0x0F, Z));
        assert_eq!(run_binary(0x66, 0x0F, 0x80, 0), (0x0F, S));
        assert_eq!(run_binary(0xA6, 0x05, 0x05, 0), (0x05, C | Z | D | H));
        assert_eq!(run_binary(0xA6, 0x05, 0x06, 0), (0x05, S | V | D));
    }

    #[test]
    fn test_undefined_opcode_is_noop() {
        let mut sim = with_program(&[0xF2, 0x6F]);
        assert_eq!(sim.run(), RunOutcome::Halted);
        assert_eq!(sim.pc, RESET_PC + 2);
    }

    #[test]
    fn test_exhausted() {
        let mut sim = with_program(&[0x8B, 0xFE]);
        sim.flags.instruction_limit = 100;
        assert_eq!(sim.run(), RunOutcome::Exhausted);
        assert_eq!(sim.sys_clock, 100);
        assert!(sim.is_running());
    }

    #[test]
    fn test_run_with_limit_and_external_stop() {
        let mut sim = with_program(&[0x8B, 0xFE]);
        assert_eq!(sim.run_with_limit(10), RunOutcome::Tripwire);
        assert_eq!(sim.sys_clock, 10);

        sim.running().store(false, Ordering::Relaxed);
        assert_eq!(sim.run(), RunOutcome::Halted);
        assert_eq!(sim.sys_clock, 10);
    }

    #[test]
    fn test_cycle_breakpoint() {
        let mut sim = with_program(&[0xFF, 0xFF, 0xFF, 0x6F]);
        sim.breakpoints.insert(Breakpoint::Cycles(12));
        assert_eq!(sim.run(), RunOutcome::Breakpoint);
        assert_eq!(sim.cycles, 12);
    }

    #[test]
    fn test_reset_keeps_devices() {
        let mut sim = with_program(&[0x6F]);
        let id = sim.add_device(PORT0, TimerDevice::new(), 0x00).unwrap();
        assert_eq!(sim.add_device(PORT0, TimerDevice::new(), 0x00), Err(SimErr::DeviceSlotTaken { slot: PORT0 }));
        assert_eq!(sim.add_device(0xE0, TimerDevice::new(), 0x00), Err(SimErr::DeviceSlotTaken { slot: 0xE0 }));
        sim.run();

        sim.reset();
        assert!(sim.is_running());
        assert_eq!(sim.pc, RESET_PC);
        assert_eq!(sim.regs.policy(PORT0), SlotPolicy::Device(id));
    }

    #[test]
    fn test_device_rejected_on_read_only_slot() {
        let mut sim = with_program(&[0x6F]);
        assert_eq!(sim.add_device(0x90, TimerDevice::new(), 0x00), Err(SimErr::DeviceSlotTaken { slot: 0x90 }));
        assert_eq!(sim.regs.policy(0x90), SlotPolicy::ReadOnly);

        sim.regs.write(0x90, 0x34);
        assert_eq!(sim.regs.read(0x90), 0xFF);
    }
}
