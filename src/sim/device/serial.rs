use crossbeam_channel as cbc;

use super::{Access, RegisterDevice, RegisterView};

/// Interrupt source raised when a byte arrives.
const RX_IRQ: u8 = 3;
/// Interrupt source raised when a byte has been sent.
const TX_IRQ: u8 = 4;

/// A byte-wide serial port, connected to the host through a pair of channels.
///
/// - Writing the bound slot transmits the byte and raises interrupt source 4.
/// - Once per cycle, if the last received byte has been read,
///   the next byte from the host is latched into the slot and interrupt source 3 is raised.
///
/// ```
/// use z8_sim::sim::device::SerialPort;
/// use z8_sim::sim::mem::{RegisterMemory, SIO};
///
/// let mut regs = RegisterMemory::new(&mut 0u8);
/// let (port, host) = SerialPort::pair();
/// regs.add_device(SIO, port, 0).unwrap();
///
/// regs.write(SIO, b'!');
/// assert_eq!(host.rx.try_recv(), Ok(b'!'));
/// ```
#[derive(Debug)]
pub struct SerialPort {
    tx: cbc::Sender<u8>,
    rx: cbc::Receiver<u8>,
    unread: bool,
}

/// The host's end of a [`SerialPort`].
#[derive(Debug, Clone)]
pub struct SerialHost {
    /// Sends bytes to the simulated program.
    pub tx: cbc::Sender<u8>,
    /// Receives bytes the simulated program transmitted.
    pub rx: cbc::Receiver<u8>,
}

impl SerialPort {
    /// Creates a serial port from the channel ends it should use.
    ///
    /// Bytes the program writes are sent through `tx`,
    /// and bytes from `rx` are latched for the program to read.
    pub fn new(tx: cbc::Sender<u8>, rx: cbc::Receiver<u8>) -> Self {
        Self { tx, rx, unread: false }
    }

    /// Creates a serial port connected to a new [`SerialHost`].
    pub fn pair() -> (Self, SerialHost) {
        let (host_tx, port_rx) = cbc::unbounded();
        let (port_tx, host_rx) = cbc::unbounded();

        (Self::new(port_tx, port_rx), SerialHost { tx: host_tx, rx: host_rx })
    }
}
impl RegisterDevice for SerialPort {
    fn on_access(&mut self, slot: u8, access: Access, regs: &mut RegisterView<'_>) {
        match access {
            Access::Read => self.unread = false,
            Access::Write => {
                // A disconnected host just drops output.
                if self.tx.send(regs.get(slot)).is_err() {
                    log::debug!("serial port at {slot:02X} has no host, dropping output");
                }
                regs.request_interrupt(TX_IRQ);
            }
        }
    }

    fn tick(&mut self, slot: u8, regs: &mut RegisterView<'_>) {
        if self.unread { return };

        if let Ok(byte) = self.rx.try_recv() {
            regs.set(slot, byte);
            self.unread = true;
            regs.request_interrupt(RX_IRQ);
        }
    }

    fn reset(&mut self) {
        self.unread = false;
    }
}

#[cfg(test)]
mod tests {
    use crate::sim::mem::{RegisterMemory, IRQ, SIO};

    use super::*;

    #[test]
    fn test_transmit() {
        let mut regs = RegisterMemory::new(&mut 0u8);
        let (port, host) = SerialPort::pair();
        regs.add_device(SIO, port, 0).unwrap();

        for &b in b"hi" {
            regs.write(SIO, b);
        }
        assert_eq!(host.rx.try_iter().collect::<Vec<_>>(), b"hi");
        assert_eq!(regs.get_raw(IRQ), 1 << TX_IRQ);
    }

    #[test]
    fn test_receive_waits_for_read() {
        let mut regs = RegisterMemory::new(&mut 0u8);
        let (port, host) = SerialPort::pair();
        regs.add_device(SIO, port, 0).unwrap();

        host.tx.send(b'a').unwrap();
        host.tx.send(b'b').unwrap();

        regs.tick_devices();
        assert_eq!(regs.get_raw(IRQ), 1 << RX_IRQ);
        regs.tick_devices();
        // 'a' has not been read yet, so 'b' is held back
        assert_eq!(regs.read(SIO), b'a');

        regs.tick_devices();
        assert_eq!(regs.read(SIO), b'b');
    }

    #[test]
    fn test_disconnected_host() {
        let mut regs = RegisterMemory::new(&mut 0u8);
        let (port, host) = SerialPort::pair();
        regs.add_device(SIO, port, 0).unwrap();
        drop(host);

        regs.write(SIO, 0x55);
        regs.tick_devices();
        assert_eq!(regs.get_raw(SIO), 0x55);
    }
}
