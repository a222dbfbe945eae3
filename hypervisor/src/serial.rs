//! 16550A serial console.
//!
//! The single byte sink of the kernel. The logger formats lines and feeds
//! them through [`write_string`]; the panic handler and the guest's COM1
//! pass-through use the same port, which is why everything funnels through
//! one mutex-protected writer.

use {
    crate::intel::support::{inb, outb},
    core::fmt,
    spin::Mutex,
};

/// COM1 base port.
const COM1: u16 = 0x3F8;

/// UART register offsets from the base port.
const UART_DATA: u16 = 0x0;
const UART_INTERRUPT_ENABLE: u16 = 0x1;
const UART_FIFO_CONTROL: u16 = 0x2;
const UART_LINE_CONTROL: u16 = 0x3;
const UART_MODEM_CONTROL: u16 = 0x4;
const UART_LINE_STATUS: u16 = 0x5;

/// Line status: transmitter holding register empty.
const LSR_THR_EMPTY: u8 = 0x20;

static SERIAL: Mutex<Serial> = Mutex::new(Serial { base: COM1 });

/// Program the UART: 115200 baud, 8N1, FIFO on.
pub fn init() {
    let mut serial = SERIAL.lock();
    serial.init();
}

/// Write raw bytes to the console. LF is expanded to CRLF.
pub fn write_string(s: &[u8]) {
    let mut serial = SERIAL.lock();
    for &b in s {
        if b == b'\n' {
            serial.write_byte(b'\r');
        }
        serial.write_byte(b);
    }
}

/// Write formatted arguments to the console.
pub fn write_fmt(args: fmt::Arguments<'_>) {
    use fmt::Write;
    let mut writer = SerialWriter;
    let _ = writer.write_fmt(args);
}

struct Serial {
    base: u16,
}

impl Serial {
    fn init(&mut self) {
        // Interrupts off, DLAB on, divisor 1 (115200), 8N1, FIFO enabled
        // and cleared with a 14-byte threshold, DTR/RTS asserted.
        outb(self.base + UART_INTERRUPT_ENABLE, 0x00);
        outb(self.base + UART_LINE_CONTROL, 0x80);
        outb(self.base + UART_DATA, 0x01);
        outb(self.base + UART_INTERRUPT_ENABLE, 0x00);
        outb(self.base + UART_LINE_CONTROL, 0x03);
        outb(self.base + UART_FIFO_CONTROL, 0xC7);
        outb(self.base + UART_MODEM_CONTROL, 0x03);
    }

    fn write_byte(&mut self, byte: u8) {
        while (inb(self.base + UART_LINE_STATUS) & LSR_THR_EMPTY) == 0 {}
        outb(self.base + UART_DATA, byte);
    }
}

struct SerialWriter;

impl fmt::Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        write_string(s.as_bytes());
        Ok(())
    }
}
