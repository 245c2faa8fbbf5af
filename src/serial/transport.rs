//! Byte-level transport the framing layer rides on.
//!
//! [`SerialTransport`] abstracts the raw byte pump ([`SerialTransport::send_byte`]
//! is `KdHyperDbgSendByte`, [`SerialTransport::try_recv_byte`] is
//! `KdHyperDbgRecvByte`'s non-blocking poll), so [`crate::serial::kd_controller`]
//! and the framing in [`super::packet`] don't depend on how bytes actually
//! leave the box. [`ComPortTransport`] is the concrete 16550-UART
//! implementation, built on the same `inb`/`outb` port-I/O idiom
//! `logger.rs`'s transmit-only `Uart` already uses, extended with baud-rate
//! programming and a receive path.
//!
//! Grounded on `SerialConnection.c` for the protocol surface and
//! `logger.rs` for the UART port-I/O idiom.

use crate::config::{ALLOWED_BAUD_RATES, ALLOWED_COM_PORTS};
use crate::error::{HvError, HvResult};
use crate::x86_instructions::{inb, outb};

const UART_OFFSET_DATA: u16 = 0;
const UART_OFFSET_INTERRUPT_ENABLE: u16 = 1;
const UART_OFFSET_DIVISOR_LATCH_LOW: u16 = 0;
const UART_OFFSET_DIVISOR_LATCH_HIGH: u16 = 1;
const UART_OFFSET_LINE_CONTROL: u16 = 3;
const UART_OFFSET_LINE_STATUS: u16 = 5;

const LINE_CONTROL_8N1: u8 = 0x03;
const LINE_CONTROL_DIVISOR_LATCH_ENABLE: u8 = 0x80;
const LINE_STATUS_DATA_READY: u8 = 0x01;
const LINE_STATUS_THR_EMPTY: u8 = 0x20;

const UART_BASE_CLOCK: u32 = 115_200;

/// Sends and receives raw bytes over whatever physical link the debuggee
/// was configured with. Implemented directly against hardware
/// ([`ComPortTransport`]) or, in tests, an in-memory loopback.
pub trait SerialTransport {
    /// Blocks until the byte has been accepted by the transmitter.
    fn send_byte(&self, byte: u8);
    /// Returns the next received byte without blocking, or `None` if the
    /// transport has nothing buffered yet.
    fn try_recv_byte(&self) -> Option<u8>;
}

/// COM port number, 1-based, as the original's `COMn_PORT` constants name
/// them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ComPort(u8);

impl ComPort {
    /// Validates `port` against [`ALLOWED_COM_PORTS`].
    ///
    /// Mirrors `SerialConnectionCheckPort`.
    pub fn new(port: u8) -> HvResult<Self> {
        if ALLOWED_COM_PORTS.contains(&port) {
            Ok(Self(port))
        } else {
            Err(HvError::InvalidSerialPort)
        }
    }

    fn io_port_base(self) -> u16 {
        match self.0 {
            1 => 0x3f8,
            2 => 0x2f8,
            3 => 0x3e8,
            4 => 0x2e8,
            _ => unreachable!("validated by ComPort::new"),
        }
    }
}

/// Validates `baud` against [`ALLOWED_BAUD_RATES`].
///
/// Mirrors `SerialConnectionCheckBaudrate`.
pub fn check_baud_rate(baud: u32) -> HvResult<()> {
    if ALLOWED_BAUD_RATES.contains(&baud) {
        Ok(())
    } else {
        Err(HvError::InvalidBaudrate)
    }
}

/// A 16550-compatible UART, configured for the debuggee's serial link.
pub struct ComPortTransport {
    io_port_base: u16,
}

impl ComPortTransport {
    /// Programs `port` for `baud` 8-N-1 and returns a transport driving it.
    ///
    /// Mirrors the setup `SerialConnectionPrepare` delegates to
    /// `KdHyperDbgPrepareDebuggeeConnectionPort`.
    pub fn configure(port: ComPort, baud: u32) -> HvResult<Self> {
        check_baud_rate(baud)?;
        let io_port_base = port.io_port_base();
        let divisor = UART_BASE_CLOCK / baud.max(1);

        outb(io_port_base + UART_OFFSET_INTERRUPT_ENABLE, 0x00);
        outb(io_port_base + UART_OFFSET_LINE_CONTROL, LINE_CONTROL_DIVISOR_LATCH_ENABLE);
        outb(io_port_base + UART_OFFSET_DIVISOR_LATCH_LOW, (divisor & 0xff) as u8);
        outb(io_port_base + UART_OFFSET_DIVISOR_LATCH_HIGH, (divisor >> 8) as u8);
        outb(io_port_base + UART_OFFSET_LINE_CONTROL, LINE_CONTROL_8N1);

        Ok(Self { io_port_base })
    }
}

impl SerialTransport for ComPortTransport {
    fn send_byte(&self, byte: u8) {
        while inb(self.io_port_base + UART_OFFSET_LINE_STATUS) & LINE_STATUS_THR_EMPTY == 0 {}
        outb(self.io_port_base + UART_OFFSET_DATA, byte);
    }

    fn try_recv_byte(&self) -> Option<u8> {
        if inb(self.io_port_base + UART_OFFSET_LINE_STATUS) & LINE_STATUS_DATA_READY != 0 {
            Some(inb(self.io_port_base + UART_OFFSET_DATA))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use super::*;

    #[test]
    fn com_port_rejects_ports_outside_the_allow_list() {
        assert!(ComPort::new(1).is_ok());
        assert_eq!(ComPort::new(5), Err(HvError::InvalidSerialPort));
    }

    #[test]
    fn baud_rate_rejects_nonstandard_values() {
        assert!(check_baud_rate(115200).is_ok());
        assert_eq!(check_baud_rate(1_000_000), Err(HvError::InvalidBaudrate));
    }

    /// In-memory loopback transport used to exercise [`super::super::packet`]
    /// framing without touching real hardware.
    pub(crate) struct LoopbackTransport {
        pub(crate) inbox: RefCell<VecDeque<u8>>,
        pub(crate) outbox: RefCell<std::vec::Vec<u8>>,
    }

    impl SerialTransport for LoopbackTransport {
        fn send_byte(&self, byte: u8) {
            self.outbox.borrow_mut().push(byte);
        }
        fn try_recv_byte(&self) -> Option<u8> {
            self.inbox.borrow_mut().pop_front()
        }
    }

    #[test]
    fn loopback_transport_round_trips_bytes() {
        let transport = LoopbackTransport {
            inbox: RefCell::new(VecDeque::from(std::vec![1u8, 2, 3])),
            outbox: RefCell::new(std::vec::Vec::new()),
        };
        while let Some(byte) = transport.try_recv_byte() {
            transport.send_byte(byte);
        }
        assert_eq!(*transport.outbox.borrow(), std::vec![1u8, 2, 3]);
    }
}
