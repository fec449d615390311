//! Predicated execution (the `IF` extension).
//!
//! `IF cc, t, f` makes the next `t` instructions conditional on `cc` being true,
//! and the `f` instructions after those conditional on `cc` being false.
//! Instructions whose arm was not taken are skipped without executing.
//! Instructions whose arm was taken execute, but the flags they produce are discarded
//! (the flags are restored to their value when `IF` executed).
//!
//! A taken control transfer (or interrupt entry) abandons the block.

/// The state of an active `IF` block.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct IfContext {
    /// Instructions remaining in the true arm.
    pub true_count: u8,
    /// Instructions remaining in the false arm.
    pub false_count: u8,
    /// Whether the condition held.
    pub condition: bool,
    /// The flags register at the time `IF` executed.
    pub saved_flags: u8,
    /// Set by `IF` itself, so the settlement at the end of its own cycle is ignored.
    fresh: bool,
}

/// What the simulator must do at the end of an instruction cycle.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct Settlement {
    /// Number of upcoming instructions to skip.
    pub skip: u8,
    /// Flags value to restore, if any.
    pub restore: Option<u8>,
}

impl IfContext {
    /// Starts a block.
    ///
    /// The low nibble of `operand` holds the true count (bits 3-2) and false count (bits 1-0).
    pub fn arm(&mut self, operand: u8, condition: bool, flags: u8) {
        *self = IfContext {
            true_count: (operand >> 2) & 0b11,
            false_count: operand & 0b11,
            condition,
            saved_flags: flags,
            fresh: true,
        };
    }

    /// Whether the block has any instructions remaining.
    pub fn active(&self) -> bool {
        self.true_count > 0 || self.false_count > 0
    }

    /// Abandons the block.
    pub fn cancel(&mut self) {
        *self = IfContext::default();
    }

    /// Advances the block past the instruction that just executed,
    /// and reports how many instructions should be skipped and whether to restore flags.
    ///
    /// ```
    /// use z8_sim::sim::predicate::{IfContext, Settlement};
    ///
    /// let mut ctx = IfContext::default();
    /// ctx.arm(0b1001, true, 0x40); // two true, one false
    ///
    /// // the IF itself
    /// assert_eq!(ctx.settle(), Settlement { skip: 0, restore: None });
    /// // the first conditional instruction ran
    /// assert_eq!(ctx.settle(), Settlement { skip: 0, restore: Some(0x40) });
    /// // the second ran, and the false arm is skipped
    /// assert_eq!(ctx.settle(), Settlement { skip: 1, restore: Some(0x40) });
    /// assert!(!ctx.active());
    /// ```
    pub fn settle(&mut self) -> Settlement {
        let executed = !std::mem::take(&mut self.fresh);
        let mut out = Settlement::default();

        if self.condition {
            if executed && self.true_count > 0 {
                self.true_count -= 1;
                out.restore = Some(self.saved_flags);
            }
            if self.true_count == 0 && self.false_count > 0 {
                out.skip = std::mem::take(&mut self.false_count);
                out.restore = Some(self.saved_flags);
            }
        } else if self.true_count > 0 {
            out.skip = std::mem::take(&mut self.true_count);
        } else if executed && self.false_count > 0 {
            self.false_count -= 1;
            out.restore = Some(self.saved_flags);
        }

        out
    }
}
