//! The interrupt priority poll.
//!
//! The six interrupt sources are split into three fixed groups of two:
//! - group A: sources 3 and 5
//! - group B: sources 0 and 2
//! - group C: sources 1 and 4
//!
//! The priority register (`IPR`) selects the relative order of the groups
//! (bits 4, 3 and 0) and, within each group, which source wins when both are pending
//! (bit 5 for A, bit 2 for B, bit 1 for C).
//!
//! [`select`] picks the source to service out of the set of pending-and-enabled sources.

/// One of the three interrupt groups.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Group {
    /// Sources 3 and 5.
    A,
    /// Sources 0 and 2.
    B,
    /// Sources 1 and 4.
    C,
}

impl Group {
    /// The two sources in this group, the winning one first, per `IPR`.
    pub fn sources(self, ipr: u8) -> [u8; 2] {
        let bit = |n: u8| ipr & (1 << n) != 0;
        match self {
            Group::A if bit(5) => [3, 5],
            Group::A => [5, 3],
            Group::B if bit(2) => [0, 2],
            Group::B => [2, 0],
            Group::C if bit(1) => [4, 1],
            Group::C => [1, 4],
        }
    }

    /// The highest priority source of this group which is pending, if any.
    pub fn winner(self, ipr: u8, pending: u8) -> Option<u8> {
        self.sources(ipr)
            .into_iter()
            .find(|&s| pending & (1 << s) != 0)
    }
}

/// The order of groups (highest priority first) selected by `IPR`,
/// or `None` if `IPR` holds a reserved encoding.
pub fn group_order(ipr: u8) -> Option<[Group; 3]> {
    use Group::{A, B, C};

    let key = (ipr >> 4 & 1) << 2 | (ipr >> 3 & 1) << 1 | (ipr & 1);
    match key {
        0b001 => Some([C, A, B]),
        0b010 => Some([A, B, C]),
        0b011 => Some([A, C, B]),
        0b100 => Some([B, C, A]),
        0b101 => Some([C, B, A]),
        0b110 => Some([B, A, C]),
        _ => None,
    }
}

/// Selects which source to service.
///
/// `pending` should be the set of sources which are both requested and enabled
/// (`IRQ & IMR & 0x3F`). If only one source is pending, it is selected regardless of `IPR`.
///
/// If `IPR` holds a reserved group order, the lowest-numbered pending source is selected.
///
/// ```
/// use z8_sim::sim::interrupt::select;
///
/// // only source 2 pending
/// assert_eq!(select(0x00, 0b00_0100), Some(2));
/// // sources 3 and 5 pending (group A), group A prefers 3 when bit 5 is set
/// assert_eq!(select(0b10_1000, 0b10_1000), Some(3));
/// assert_eq!(select(0b00_1000, 0b10_1000), Some(5));
/// ```
pub fn select(ipr: u8, pending: u8) -> Option<u8> {
    let pending = pending & 0x3F;
    if pending == 0 { return None };
    if pending.is_power_of_two() {
        return Some(pending.trailing_zeros() as u8);
    }

    match group_order(ipr) {
        Some(order) => order.into_iter().find_map(|g| g.winner(ipr, pending)),
        None => {
            log::warn!("reserved interrupt priority {ipr:02X}, servicing lowest pending source");
            Some(pending.trailing_zeros() as u8)
        }
    }
}
