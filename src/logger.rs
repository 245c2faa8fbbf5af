//! The module containing the serial-backed logger implementation.
//!
//! Generalizes a fixed-COM1 `Uart`/`UartLogger` pair into one that logs over
//! whatever [`SerialTransport`] the debuggee was configured with — the same
//! transport `serial::kd_controller` frames its wire protocol over, so a
//! single COM port (or named pipe) can carry both.

use crate::{config::LOGGING_LEVEL, serial::SerialTransport};
use core::fmt::{self, Write};
use spin::Mutex;

struct TransportWriter<'a> {
    transport: &'a dyn SerialTransport,
}

impl Write for TransportWriter<'_> {
    fn write_str(&mut self, string: &str) -> fmt::Result {
        for byte in string.bytes() {
            self.transport.send_byte(byte);
        }
        Ok(())
    }
}

struct SerialLogger {
    transport: Mutex<Option<&'static dyn SerialTransport>>,
}

impl SerialLogger {
    const fn new() -> Self {
        Self {
            transport: Mutex::new(None),
        }
    }
}

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::Level::Trace
    }

    fn log(&self, record: &log::Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let guard = self.transport.lock();
        if let Some(transport) = *guard {
            let mut writer = TransportWriter { transport };
            let _ = writeln!(writer, "#{}:{}: {}", apic_id(), record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Gets an APIC ID.
fn apic_id() -> u32 {
    // See: (AMD) CPUID Fn0000_0001_EBX LocalApicId, LogicalProcessorCount, CLFlush
    // See: (Intel) Table 3-8. Information Returned by CPUID Instruction
    x86::cpuid::cpuid!(0x1).ebx >> 24
}

static SERIAL_LOGGER: SerialLogger = SerialLogger::new();

/// Points the global logger at `transport` and installs it as the `log`
/// crate's backend.
///
/// `transport` must outlive the logger (in practice, the same `'static`
/// transport the serial wire protocol itself is configured against).
pub fn init_serial_logger(transport: &'static dyn SerialTransport) {
    *SERIAL_LOGGER.transport.lock() = Some(transport);
    let _ = log::set_logger(&SERIAL_LOGGER).map(|()| log::set_max_level(LOGGING_LEVEL));
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::{cell::RefCell, vec::Vec};

    struct CapturingTransport {
        bytes: RefCell<Vec<u8>>,
    }

    impl SerialTransport for CapturingTransport {
        fn send_byte(&self, byte: u8) {
            self.bytes.borrow_mut().push(byte);
        }
        fn try_recv_byte(&self) -> Option<u8> {
            None
        }
    }

    #[test]
    fn log_record_is_written_through_the_configured_transport() {
        let transport: &'static CapturingTransport = std::boxed::Box::leak(std::boxed::Box::new(CapturingTransport {
            bytes: RefCell::new(Vec::new()),
        }));
        init_serial_logger(transport);
        log::info!("hello from the debuggee");

        let written = transport.bytes.borrow();
        let text = std::str::from_utf8(&written).unwrap();
        assert!(text.contains("INFO"));
        assert!(text.contains("hello from the debuggee"));
    }
}
