use super::{Access, RegisterDevice, RegisterView};

/// Interrupt source raised when the timer expires.
const TIMER_IRQ: u8 = 0;

/// A countdown timer which raises interrupt source 0 when it expires.
///
/// Writing to the bound slot programs the timer:
/// - A value with a zero count (`0` or `0x80`) stops it.
/// - Any other value starts a countdown of `(value & 0x7F) * 2` instruction cycles.
///   If bit 7 is set, the countdown restarts every time it expires.
///
/// ```
/// use z8_sim::sim::{Simulator, SimFlags};
/// use z8_sim::sim::device::TimerDevice;
/// use z8_sim::sim::mem::{MachineInitStrategy, PORT0, IRQ};
///
/// // memory full of NOPs
/// let flags = SimFlags { machine_init: MachineInitStrategy::Known { value: 0xFF }, ..Default::default() };
/// let mut sim = Simulator::new(flags);
/// sim.add_device(PORT0, TimerDevice::new(), 0).unwrap();
/// sim.regs.write(PORT0, 0x02); // four cycles, one-shot
/// for _ in 0..4 { sim.step_in(); }
/// assert_eq!(sim.regs.get_raw(IRQ) & 1, 1);
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TimerDevice {
    count: u8,
    reload_value: u8,
    reload: bool,
    running: bool,
}
impl TimerDevice {
    /// Creates a new (stopped) timer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the timer is counting down.
    pub fn running(&self) -> bool {
        self.running
    }
    /// Gets the number of cycles remaining until the timer expires.
    pub fn get_remaining(&self) -> u8 {
        self.count
    }

    fn program(&mut self, value: u8) {
        if value & 0x7F == 0 {
            self.running = false;
            return;
        }

        self.reload_value = (value & 0x7F) << 1;
        self.count = self.reload_value;
        self.reload = value & 0x80 != 0;
        self.running = true;
    }
}
impl RegisterDevice for TimerDevice {
    fn on_access(&mut self, slot: u8, access: Access, regs: &mut RegisterView<'_>) {
        if access == Access::Write {
            self.program(regs.get(slot));
        }
    }

    fn tick(&mut self, _slot: u8, regs: &mut RegisterView<'_>) {
        if !self.running { return };

        self.count = self.count.wrapping_sub(1);
        if self.count == 0 {
            log::debug!("timer expired (reload: {})", self.reload);
            regs.request_interrupt(TIMER_IRQ);
            match self.reload {
                true  => self.count = self.reload_value,
                false => self.running = false,
            }
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use crate::sim::mem::{RegisterMemory, IRQ, PORT0};

    use super::*;

    fn setup() -> RegisterMemory {
        let mut regs = RegisterMemory::new(&mut 0u8);
        regs.add_device(PORT0, TimerDevice::new(), 0).unwrap();
        regs
    }

    #[test]
    fn test_one_shot() {
        let mut regs = setup();
        regs.write(PORT0, 0x03);

        for _ in 0..5 {
            regs.tick_devices();
            assert_eq!(regs.get_raw(IRQ), 0);
        }
        regs.tick_devices();
        assert_eq!(regs.get_raw(IRQ), 0x01);

        // stopped, stays quiet
        regs.set_raw(IRQ, 0);
        for _ in 0..20 {
            regs.tick_devices();
        }
        assert_eq!(regs.get_raw(IRQ), 0);
    }

    #[test]
    fn test_reload() {
        let mut regs = setup();
        regs.write(PORT0, 0x81);

        let mut fired = 0;
        for _ in 0..10 {
            regs.tick_devices();
            if regs.get_raw(IRQ) & 1 != 0 {
                fired += 1;
                regs.set_raw(IRQ, 0);
            }
        }
        assert_eq!(fired, 5);
    }

    #[test]
    fn test_zero_count_with_reload_stops() {
        let mut regs = setup();
        regs.write(PORT0, 0x81);
        regs.write(PORT0, 0x80);
        for _ in 0..300 {
            regs.tick_devices();
        }
        assert_eq!(regs.get_raw(IRQ), 0);
    }

    #[test]
    fn test_stop() {
        let mut regs = setup();
        regs.write(PORT0, 0x01);
        regs.write(PORT0, 0x00);
        for _ in 0..4 {
            regs.tick_devices();
        }
        assert_eq!(regs.get_raw(IRQ), 0);
    }
}
