//! Utilities to debug simulation.
//!
//! The key type here is [`Breakpoint`], which can be inserted into the [`Simulator`]'s
//! `breakpoints` field to make the `run*` methods stop early.
use std::fmt::Write;

use super::Simulator;

/// Common breakpoints.
#[derive(PartialEq, Eq, Hash)]
pub enum Breakpoint {
    /// Break when the PC is equal to the given value.
    PC(u16),

    /// Break when a register-memory slot holds a matching value.
    ///
    /// Windowed slots (`0xE0`-`0xEF`) are resolved through the current register pointer.
    /// Checking never notifies devices.
    Reg {
        /// Slot to check.
        slot: u8,
        /// Predicate to break against.
        value: Comparator
    },

    /// Break when a DATA memory address holds a matching value.
    Data {
        /// Address to check.
        addr: u16,
        /// Predicate to break against.
        value: Comparator
    },

    /// Break once at least this many cycles have been billed.
    Cycles(u64),
}

impl Breakpoint where Breakpoint: Send + Sync { /* assert Breakpoint is send/sync */ }

impl Breakpoint {
    /// Checks if a break should occur.
    pub fn check(&self, sim: &Simulator) -> bool {
        match *self {
            Breakpoint::PC(expected) => expected == sim.pc,
            Breakpoint::Reg { slot, ref value } => value.check(sim.regs.get_raw(sim.regs.resolve(slot))),
            Breakpoint::Data { addr, ref value } => value.check(sim.bus.data[addr]),
            Breakpoint::Cycles(n) => sim.cycles >= n,
        }
    }
}
impl std::fmt::Debug for Breakpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Breakpoint(")?;
        match self {
            Self::PC(expected) => write!(f, "PC == {expected:04X}h")?,
            Self::Reg { slot, value } => write!(f, "reg[{slot:02X}h] {value}")?,
            Self::Data { addr, value } => write!(f, "data[{addr:04X}h] {value}")?,
            Self::Cycles(n) => write!(f, "cycles >= {n}")?,
        }
        f.write_char(')')
    }
}

/// Predicate over a byte.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum Comparator {
    /// Never breaks.
    Never,
    /// Break if the byte is less than the provided value.
    Lt(u8),
    /// Break if the byte is equal to the provided value.
    Eq(u8),
    /// Break if the byte is less than or equal to the provided value.
    Le(u8),
    /// Break if the byte is greater than the provided value.
    Gt(u8),
    /// Break if the byte is not equal to the provided value.
    Ne(u8),
    /// Break if the byte is greater than or equal to the provided value.
    Ge(u8),
    /// Break if the bits selected by `mask` are equal to `bits`.
    ///
    /// Useful for watching single flags (e.g., `Masked { mask: 0x80, bits: 0x80 }` on `FLAGS` for carry).
    Masked {
        /// Bits to compare.
        mask: u8,
        /// Expected value of the compared bits.
        bits: u8
    },
    /// Always breaks.
    Always
}
impl Comparator {
    /// Checks if the operand passes the comparator.
    pub fn check(&self, operand: u8) -> bool {
        match *self {
            Comparator::Never  => false,
            Comparator::Lt(r)  => operand < r,
            Comparator::Eq(r)  => operand == r,
            Comparator::Le(r)  => operand <= r,
            Comparator::Gt(r)  => operand > r,
            Comparator::Ne(r)  => operand != r,
            Comparator::Ge(r)  => operand >= r,
            Comparator::Masked { mask, bits } => operand & mask == bits & mask,
            Comparator::Always => true,
        }
    }
}
impl std::fmt::Display for Comparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Comparator::Never  => f.write_str("never"),
            Comparator::Lt(r)  => write!(f, "< {r:02X}h"),
            Comparator::Eq(r)  => write!(f, "== {r:02X}h"),
            Comparator::Le(r)  => write!(f, "<= {r:02X}h"),
            Comparator::Gt(r)  => write!(f, "> {r:02X}h"),
            Comparator::Ne(r)  => write!(f, "!= {r:02X}h"),
            Comparator::Ge(r)  => write!(f, ">= {r:02X}h"),
            Comparator::Masked { mask, bits } => write!(f, "& {mask:02X}h == {:02X}h", bits & mask),
            Comparator::Always => f.write_str("always"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comparators() {
        assert!(Comparator::Lt(5).check(4));
        assert!(!Comparator::Lt(5).check(5));
        assert!(Comparator::Ge(5).check(5));
        assert!(Comparator::Masked { mask: 0x80, bits: 0xFF }.check(0x81));
        assert!(!Comparator::Masked { mask: 0x80, bits: 0x80 }.check(0x7F));
        assert!(!Comparator::Never.check(0));
        assert!(Comparator::Always.check(0));
    }

    #[test]
    fn test_debug_format() {
        let bp = Breakpoint::Reg { slot: 0x10, value: Comparator::Eq(0x14) };
        assert_eq!(format!("{bp:?}"), "Breakpoint(reg[10h] == 14h)");
        assert_eq!(format!("{:?}", Breakpoint::PC(0x000C)), "Breakpoint(PC == 000Ch)");
    }
}
