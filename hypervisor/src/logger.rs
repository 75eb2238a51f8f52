//! Serial port logger for the `log` facade.
//!
//! There is no stdout while a processor is being brought into VMX operation,
//! so informational and error events go out over a UART. Each line is tagged
//! with the APIC id of the emitting processor. Logging never affects control
//! flow: failures to write are silently dropped.

use {
    crate::intel::support::{inb, outb},
    alloc::boxed::Box,
    core::{fmt, fmt::Write},
    spin::Mutex,
};

/// UART register offsets.
const UART_OFFSET_DATA: u16 = 0x0;
const UART_OFFSET_INTERRUPT_ENABLE: u16 = 0x1;
const UART_OFFSET_FIFO_CONTROL: u16 = 0x2;
const UART_OFFSET_LINE_CONTROL: u16 = 0x3;
const UART_OFFSET_MODEM_CONTROL: u16 = 0x4;
const UART_OFFSET_LINE_STATUS: u16 = 0x5;
const UART_OFFSET_TRANSMITTER_HOLDING_BUFFER: u16 = 0x0;

/// Global raw pointer to the installed logger. Kept as a raw pointer so no
/// shared reference to a `static mut` is ever formed.
static mut SERIAL_LOGGER: *const SerialLogger = core::ptr::null();

/// Initialize the serial logger and install it as the global `log` logger.
///
/// Idempotent: if a logger has already been installed, only the max log level
/// is updated. The surrounding system may bring processors up one at a time,
/// and every one of them is allowed to call this.
pub fn init(port: SerialPort, level: log::LevelFilter) {
    unsafe {
        if !SERIAL_LOGGER.is_null() {
            log::set_max_level(level);
            return;
        }
    }

    // Leak the logger so `log::set_logger` gets the `'static` it demands.
    let logger_ref: &'static SerialLogger = Box::leak(Box::new(SerialLogger::new(port)));

    unsafe {
        SERIAL_LOGGER = logger_ref as *const SerialLogger;
    }

    // If somebody else won the install race, keep going with their logger
    // rather than taking the processor down over a log line.
    let _ = log::set_logger(logger_ref);
    log::set_max_level(level);
}

/// Serial ports supported by the logger.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SerialPort {
    /// COM1 (0x3F8)
    COM1 = 0x3F8,
    /// COM2 (0x2F8)
    COM2 = 0x2F8,
}

/// The logger installed into the `log` facade.
pub struct SerialLogger {
    port: Mutex<Serial>,
}

impl SerialLogger {
    fn new(port: SerialPort) -> Self {
        Self {
            port: Mutex::new(Serial { port }),
        }
    }
}

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::Level::Trace
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            let cpu = apic_id();
            let mut serial = self.port.lock();
            let _ = writeln!(&mut *serial, "cpu-{} {}: {}", cpu, record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Low-level serial writer.
struct Serial {
    port: SerialPort,
}

impl Serial {
    fn init(&mut self) {
        let base = self.port as u16;

        // Disable interrupts
        outb(base + UART_OFFSET_INTERRUPT_ENABLE, 0x00);
        // Enable DLAB
        outb(base + UART_OFFSET_LINE_CONTROL, 0x80);
        // Divisor = 3 -> 38400 baud (for 115200 base)
        outb(base + UART_OFFSET_DATA, 0x03);
        outb(base + UART_OFFSET_INTERRUPT_ENABLE, 0x00);
        // 8 bits, no parity, one stop bit
        outb(base + UART_OFFSET_LINE_CONTROL, 0x03);
        // Enable FIFO, clear, 14-byte threshold
        outb(base + UART_OFFSET_FIFO_CONTROL, 0xC7);
        // IRQs enabled, RTS/DSR set
        outb(base + UART_OFFSET_MODEM_CONTROL, 0x0B);
    }

    fn write_byte(&mut self, byte: u8) {
        let base = self.port as u16;
        // Wait until TX empty
        while (inb(base + UART_OFFSET_LINE_STATUS) & 0x20) == 0 {}
        outb(base + UART_OFFSET_TRANSMITTER_HOLDING_BUFFER, byte);
    }
}

impl fmt::Write for Serial {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.init();
        for b in s.bytes() {
            if b == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(b);
        }
        Ok(())
    }
}

/// Returns the current processor's APIC id so log lines can be attributed.
fn apic_id() -> u32 {
    x86::cpuid::cpuid!(0x1).ebx >> 24
}
