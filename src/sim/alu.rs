//! Flag-accurate arithmetic and logic.
//!
//! Every function here is pure: it takes operand bytes and the current [`Flags`]
//! and returns the result along with the updated flags.
//! Bits a given operation does not affect are carried over from the input flags.

use crate::isa::Cond;

/// A wrapper over `u8` in order to facilitate the flags register (`FLAGS`, slot `0xFC`).
///
/// ```text
///       C Z S V D H - -
///       | | | | | |
/// 0xFC: 1 0 1 0 0 1 0 0
/// ```
///
/// - `C` (bit 7): carry
/// - `Z` (bit 6): zero
/// - `S` (bit 5): sign
/// - `V` (bit 4): overflow
/// - `D` (bit 3): decimal adjust (set by subtraction, cleared by addition)
/// - `H` (bit 2): half carry
///
/// The low two bits are user flags and are never touched by the ALU.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Flags(pub u8);

impl Flags {
    /// Carry flag mask.
    pub const C: u8 = 0x80;
    /// Zero flag mask.
    pub const Z: u8 = 0x40;
    /// Sign flag mask.
    pub const S: u8 = 0x20;
    /// Overflow flag mask.
    pub const V: u8 = 0x10;
    /// Decimal-adjust flag mask.
    pub const D: u8 = 0x08;
    /// Half-carry flag mask.
    pub const H: u8 = 0x04;

    /// Gets the bit-representation of the flags.
    pub fn bits(self) -> u8 {
        self.0
    }
    /// Checks the carry flag.
    pub fn carry(self) -> bool {
        self.0 & Self::C != 0
    }
    /// Checks the zero flag.
    pub fn zero(self) -> bool {
        self.0 & Self::Z != 0
    }
    /// Checks the sign flag.
    pub fn sign(self) -> bool {
        self.0 & Self::S != 0
    }
    /// Checks the overflow flag.
    pub fn overflow(self) -> bool {
        self.0 & Self::V != 0
    }
    /// Checks the decimal-adjust flag.
    pub fn decimal(self) -> bool {
        self.0 & Self::D != 0
    }
    /// Checks the half-carry flag.
    pub fn half_carry(self) -> bool {
        self.0 & Self::H != 0
    }

    /// Returns a copy of these flags with the masked bits set or cleared.
    #[must_use]
    pub fn with(self, mask: u8, on: bool) -> Flags {
        match on {
            true  => Flags(self.0 | mask),
            false => Flags(self.0 & !mask),
        }
    }

    /// Sets Z and S from an 8-bit result.
    fn zs(self, result: u8) -> Flags {
        self.with(Self::Z, result == 0)
            .with(Self::S, result & 0x80 != 0)
    }
}
impl std::fmt::Debug for Flags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use std::fmt::Write;

        f.write_str("Flags(")?;
        for (mask, name) in [(Self::C, 'C'), (Self::Z, 'Z'), (Self::S, 'S'), (Self::V, 'V'), (Self::D, 'D'), (Self::H, 'H')] {
            if self.0 & mask != 0 { f.write_char(name)?; }
        }
        f.write_char(')')
    }
}

fn sign(byte: u8) -> bool {
    byte & 0x80 != 0
}
fn bit4(byte: u8) -> bool {
    byte & 0x10 != 0
}

/// Adds `a + b + carry_in`.
///
/// C is bit 8 of the 9-bit sum, V is set when the result's sign differs from `a`'s,
/// D is cleared, and H is set when bit 4 of the result differs from bit 4 of `a`.
pub fn add(a: u8, b: u8, carry_in: bool, flags: Flags) -> (u8, Flags) {
    let wide = u16::from(a) + u16::from(b) + u16::from(carry_in);
    let result = wide as u8;

    let flags = flags
        .with(Flags::C, wide & 0x100 != 0)
        .zs(result)
        .with(Flags::V, sign(a) != sign(result))
        .with(Flags::D, false)
        .with(Flags::H, bit4(result) != bit4(a));
    (result, flags)
}

/// Subtracts `a - b - borrow_in`.
///
/// C is the complement of bit 8 of the 9-bit difference, D is set,
/// and H is the complement of the half-carry comparison done by [`add`].
pub fn sub(a: u8, b: u8, borrow_in: bool, flags: Flags) -> (u8, Flags) {
    let wide = u16::from(a)
        .wrapping_sub(u16::from(b))
        .wrapping_sub(u16::from(borrow_in));
    let result = wide as u8;

    let flags = flags
        .with(Flags::C, wide & 0x100 == 0)
        .zs(result)
        .with(Flags::V, sign(a) != sign(result))
        .with(Flags::D, true)
        .with(Flags::H, bit4(result) == bit4(a));
    (result, flags)
}

/// Flags for a logical result (`AND`, `OR`, `XOR`, `TM`, `TCM`, `COM`): Z and S from the result, V cleared.
pub fn logic(result: u8, flags: Flags) -> Flags {
    flags.zs(result).with(Flags::V, false)
}

/// Increments a byte. Sets Z, S, and V (V when the sign changed).
pub fn inc(a: u8, flags: Flags) -> (u8, Flags) {
    let result = a.wrapping_add(1);
    (result, flags.zs(result).with(Flags::V, sign(a) != sign(result)))
}

/// Decrements a byte. Sets Z, S, and V (V when the sign changed).
pub fn dec(a: u8, flags: Flags) -> (u8, Flags) {
    let result = a.wrapping_sub(1);
    (result, flags.zs(result).with(Flags::V, sign(a) != sign(result)))
}

fn word_flags(before: u16, after: u16, flags: Flags) -> Flags {
    flags
        .with(Flags::Z, after == 0)
        .with(Flags::S, after & 0x8000 != 0)
        .with(Flags::V, (before ^ after) & 0x8000 != 0)
}

/// Increments a register pair. Flags come from the 16-bit result.
pub fn incw(a: u16, flags: Flags) -> (u16, Flags) {
    let result = a.wrapping_add(1);
    (result, word_flags(a, result, flags))
}

/// Decrements a register pair. Flags come from the 16-bit result.
pub fn decw(a: u16, flags: Flags) -> (u16, Flags) {
    let result = a.wrapping_sub(1);
    (result, word_flags(a, result, flags))
}

fn rotate_flags(a: u8, result: u8, carry: bool, flags: Flags) -> Flags {
    flags
        .with(Flags::C, carry)
        .zs(result)
        .with(Flags::V, sign(a) != sign(result))
}

/// Rotates left. Bit 7 goes to both bit 0 and C.
pub fn rl(a: u8, flags: Flags) -> (u8, Flags) {
    let result = a.rotate_left(1);
    (result, rotate_flags(a, result, sign(a), flags))
}

/// Rotates left through carry. C goes to bit 0, bit 7 goes to C.
pub fn rlc(a: u8, flags: Flags) -> (u8, Flags) {
    let result = (a << 1) | u8::from(flags.carry());
    (result, rotate_flags(a, result, sign(a), flags))
}

/// Rotates right. Bit 0 goes to both bit 7 and C.
pub fn rr(a: u8, flags: Flags) -> (u8, Flags) {
    let result = a.rotate_right(1);
    (result, rotate_flags(a, result, a & 1 != 0, flags))
}

/// Rotates right through carry. C goes to bit 7, bit 0 goes to C.
pub fn rrc(a: u8, flags: Flags) -> (u8, Flags) {
    let result = (a >> 1) | (u8::from(flags.carry()) << 7);
    (result, rotate_flags(a, result, a & 1 != 0, flags))
}

/// Shifts right arithmetically. Bit 7 is preserved, bit 0 goes to C, V is cleared.
pub fn sra(a: u8, flags: Flags) -> (u8, Flags) {
    let result = (a >> 1) | (a & 0x80);
    let flags = flags
        .with(Flags::C, a & 1 != 0)
        .zs(result)
        .with(Flags::V, false);
    (result, flags)
}

/// Swaps nibbles. Sets Z and S.
pub fn swap(a: u8, flags: Flags) -> (u8, Flags) {
    let result = a.rotate_left(4);
    (result, flags.zs(result))
}

/// Complements. Sets Z and S, clears V.
pub fn com(a: u8, flags: Flags) -> (u8, Flags) {
    let result = !a;
    (result, logic(result, flags))
}

/// Decimal-adjusts the result of a previous BCD addition or subtraction.
///
/// The correction is chosen from the current H and C flags and the operand's nibbles.
/// C, Z, and S are set from the corrected result.
pub fn decimal_adjust(a: u8, flags: Flags) -> (u8, Flags) {
    let msn = a >> 4;
    let lsn = a & 0xF;

    let correction: u8 = match (flags.half_carry(), flags.carry()) {
        (false, false) => match lsn {
            0x0..=0x9 if msn <= 0x9 => 0x00,
            0x0..=0x9 => 0x06,
            _ if msn <= 0x8 => 0x06,
            _ => 0x66,
        },
        (false, true) => match lsn {
            0x0..=0x9 if msn <= 0x2 => 0x60,
            0x0..=0x9 if msn >= 0x7 => 0xA0,
            0x0..=0x9 => 0x00,
            _ if msn <= 0x2 => 0x66,
            _ => 0x00,
        },
        (true, false) => match lsn {
            0x0..=0x3 if msn <= 0x9 => 0x06,
            0x0..=0x3 => 0x66,
            0x6..=0xF if msn <= 0x8 => 0xFA,
            _ => 0x00,
        },
        (true, true) => match lsn {
            0x0..=0x3 if msn >= 0x3 => 0x66,
            0x6..=0xF if msn >= 0x6 => 0x9A,
            _ => 0x00,
        },
    };

    let wide = u16::from(a) + u16::from(correction);
    let result = wide as u8;
    (result, flags.with(Flags::C, wide & 0x100 != 0).zs(result))
}

/// Evaluates a condition code against the flags.
pub fn test(cond: Cond, flags: Flags) -> bool {
    let c = flags.carry();
    let z = flags.zero();
    let s = flags.sign();
    let v = flags.overflow();

    match cond {
        Cond::Never  => false,
        Cond::Lt     => s ^ v,
        Cond::Le     => z | (s ^ v),
        Cond::Ule    => c | z,
        Cond::Ov     => v,
        Cond::Mi     => s,
        Cond::Z      => z,
        Cond::C      => c,
        Cond::Always => true,
        Cond::Ge     => !(s ^ v),
        Cond::Gt     => !(z | (s ^ v)),
        Cond::Ugt    => !c & !z,
        Cond::Nov    => !v,
        Cond::Pl     => !s,
        Cond::Nz     => !z,
        Cond::Nc     => !c,
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_add_carry_is_bit8() {
        for a in 0..=0xFFu8 {
            for b in 0..=0xFFu8 {
                let (result, flags) = add(a, b, false, Flags::default());
                let wide = u16::from(a) + u16::from(b);
                assert_eq!(result, wide as u8);
                assert_eq!(flags.carry(), wide & 0x100 != 0, "{a:02X} + {b:02X}");
                assert!(!flags.decimal());
            }
        }
    }

    #[test]
    fn test_add_then_sub_restores() {
        for a in 0..=0xFFu8 {
            for b in 0..=0xFFu8 {
                let (sum, flags) = add(a, b, false, Flags::default());
                let (back, flags) = sub(sum, b, false, flags);
                assert_eq!(back, a);
                assert!(flags.decimal());

                // comparing the restored value against itself is a zero-result compare
                let (_, cmp) = sub(back, a, false, flags);
                assert!(cmp.zero());
                assert!(!cmp.sign());
            }
        }
    }

    #[test]
    fn test_add_flags() {
        // 0x7F + 0x01 crosses into negative
        let (r, f) = add(0x7F, 0x01, false, Flags::default());
        assert_eq!(r, 0x80);
        assert!(f.sign() && f.overflow() && !f.zero() && !f.carry());

        // 0xFF + 0x01 wraps to zero with carry
        let (r, f) = add(0xFF, 0x01, false, Flags::default());
        assert_eq!(r, 0x00);
        assert!(f.zero() && f.carry());

        // carry in
        let (r, _) = add(0x0F, 0x01, true, Flags::default());
        assert_eq!(r, 0x11);

        // user bits are preserved
        let (_, f) = add(1, 1, false, Flags(0x03));
        assert_eq!(f.bits() & 0x03, 0x03);
    }

    #[test]
    fn test_sub_flags() {
        // no borrow: bit 8 clear, so C is set
        let (r, f) = sub(0x02, 0x02, false, Flags::default());
        assert_eq!(r, 0);
        assert_eq!(f, Flags(Flags::C | Flags::Z | Flags::D | Flags::H));

        // borrow: bit 8 set, so C is clear
        let (r, f) = sub(0x03, 0x05, false, Flags::default());
        assert_eq!(r, 0xFE);
        assert!(!f.carry() && f.sign());

        let (r, _) = sub(0x10, 0x01, true, Flags::default());
        assert_eq!(r, 0x0E);
    }

    #[test]
    fn test_logic_clears_overflow() {
        let f = logic(0x80, Flags(Flags::V | Flags::C));
        assert!(f.sign() && !f.overflow() && f.carry());
        let f = logic(0x00, Flags::default());
        assert!(f.zero());
    }

    #[test]
    fn test_rotates() {
        let (r, f) = rl(0x81, Flags::default());
        assert_eq!(r, 0x03);
        assert!(f.carry());

        let (r, f) = rlc(0x16, Flags::default());
        assert_eq!(r, 0x2C);
        assert!(!f.carry());
        let (r, _) = rlc(0x16, Flags(Flags::C));
        assert_eq!(r, 0x2D);

        let (r, f) = rr(0x01, Flags::default());
        assert_eq!(r, 0x80);
        assert!(f.carry() && f.sign());

        let (r, f) = rrc(0x02, Flags(Flags::C));
        assert_eq!(r, 0x81);
        assert!(!f.carry());

        let (r, f) = sra(0x81, Flags(Flags::V));
        assert_eq!(r, 0xC0);
        assert!(f.carry() && !f.overflow());

        let (r, _) = swap(0x2C, Flags::default());
        assert_eq!(r, 0xC2);
    }

    #[test]
    fn test_word_ops() {
        let (r, f) = incw(0x00FF, Flags::default());
        assert_eq!(r, 0x0100);
        assert!(!f.zero());

        let (r, f) = decw(0x0001, Flags::default());
        assert_eq!(r, 0);
        assert!(f.zero());

        let (r, f) = incw(0x7FFF, Flags::default());
        assert_eq!(r, 0x8000);
        assert!(f.sign() && f.overflow());
    }

    #[test]
    fn test_decimal_adjust() {
        // 0x15 + 0x27 = 0x3C, adjusts to 0x42
        let (sum, flags) = add(0x15, 0x27, false, Flags::default());
        let (r, _) = decimal_adjust(sum, flags);
        assert_eq!(r, 0x42);

        // already valid BCD with no carries
        let (r, f) = decimal_adjust(0x45, Flags::default());
        assert_eq!(r, 0x45);
        assert!(!f.carry());

        // high nibble out of range with carry produces carry out
        let (r, f) = decimal_adjust(0x9A, Flags::default());
        assert_eq!(r, 0x00);
        assert!(f.carry() && f.zero());
    }

    #[test]
    fn test_conditions() {
        let none = Flags::default();
        assert!(!test(Cond::Never, none));
        assert!(test(Cond::Always, none));
        assert!(test(Cond::Ge, none));
        assert!(test(Cond::Ugt, none));

        let sv = Flags(Flags::S);
        assert!(test(Cond::Lt, sv));
        assert!(test(Cond::Le, sv));
        assert!(!test(Cond::Gt, sv));
        assert!(!test(Cond::Lt, Flags(Flags::S | Flags::V)));

        let cz = Flags(Flags::C | Flags::Z);
        assert!(test(Cond::Ule, cz));
        assert!(!test(Cond::Nc, cz));
        assert!(!test(Cond::Nz, cz));

        // every code and its complement disagree
        for bits in 0..=0xFFu8 {
            let flags = Flags(bits);
            for code in 0..8 {
                assert_ne!(
                    test(Cond::from_nibble(code), flags),
                    test(Cond::from_nibble(code + 8), flags)
                );
            }
        }
    }

    proptest! {
        #[test]
        fn test_add_with_carry_matches_wide_sum(a: u8, b: u8, carry_in: bool, seed: u8) {
            let (result, flags) = add(a, b, carry_in, Flags(seed));
            let wide = u16::from(a) + u16::from(b) + u16::from(carry_in);
            prop_assert_eq!(result, wide as u8);
            prop_assert_eq!(flags.carry(), wide > 0xFF);
            prop_assert_eq!(flags.zero(), result == 0);
            prop_assert_eq!(flags.bits() & 0x03, seed & 0x03);
        }

        #[test]
        fn test_rl_rr_inverse(a: u8) {
            let (left, _) = rl(a, Flags::default());
            let (back, _) = rr(left, Flags::default());
            prop_assert_eq!(back, a);
        }
    }
}
