//! Serial console output and the kernel's `log` backend.
//!
//! All diagnostics go out over COM1; the `log` facade is wired to the same
//! port so modules can use `log::warn!` and friends.

use crate::x86;
use core::fmt;
use core::fmt::Write;
use spin::{Mutex, Once};

const COM1: u16 = 0x3f8;

const COM_RX: u16 = 0; // in: receive buffer (DLAB=0)
const COM_TX: u16 = 0; // out: transmit buffer (DLAB=0)
const COM_DLL: u16 = 0; // out: divisor latch low (DLAB=1)
const COM_DLM: u16 = 1; // out: divisor latch high (DLAB=1)
const COM_IER: u16 = 1; // out: interrupt enable register
const COM_FCR: u16 = 2; // out: FIFO control register
const COM_IIR: u16 = 2; // in: interrupt ID register
const COM_LCR: u16 = 3; // out: line control register
const COM_MCR: u16 = 4; // out: modem control register
const COM_LSR: u16 = 5; // in: line status register

const COM_LCR_DLAB: u8 = 0x80;
const COM_LCR_WLEN8: u8 = 0x03;
const COM_LSR_TXRDY: u8 = 0x20;

struct Serial {
    exists: bool,
}

impl Serial {
    fn putc(&mut self, c: u8) {
        if !self.exists {
            return;
        }
        for _ in 0..12800 {
            if x86::inb(COM1 + COM_LSR) & COM_LSR_TXRDY != 0 {
                break;
            }
        }
        x86::outb(COM1 + COM_TX, c);
    }
}

impl Write for Serial {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            if b == b'\n' {
                self.putc(b'\r');
            }
            self.putc(b);
        }
        Ok(())
    }
}

static SERIAL: Once<Mutex<Serial>> = Once::new();

fn serial() -> &'static Mutex<Serial> {
    SERIAL.call_once(|| {
        // Turn off the FIFO.
        x86::outb(COM1 + COM_FCR, 0);
        // Set speed; requires DLAB latch.
        x86::outb(COM1 + COM_LCR, COM_LCR_DLAB);
        x86::outb(COM1 + COM_DLL, 12); // 115200 / 9600
        x86::outb(COM1 + COM_DLM, 0);
        // 8 data bits, 1 stop bit, parity off; turn off DLAB latch.
        x86::outb(COM1 + COM_LCR, COM_LCR_WLEN8 & !COM_LCR_DLAB);
        // No modem controls.
        x86::outb(COM1 + COM_MCR, 0);
        x86::outb(COM1 + COM_IER, 0);
        // The port does not exist if LSR reads 0xFF.
        let exists = x86::inb(COM1 + COM_LSR) != 0xff;
        x86::inb(COM1 + COM_IIR);
        x86::inb(COM1 + COM_RX);
        Mutex::new(Serial { exists })
    })
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    // write_str never fails.
    let _ = serial().lock().write_fmt(args);
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::_print(format_args!($($arg)*));
    }
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => {
        $crate::print!("{}\n", format_args!($($arg)*));
    }
}

struct KernelLog;

impl log::Log for KernelLog {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            println!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static KERNEL_LOG: KernelLog = KernelLog;

/// Route the `log` facade to the serial console. Called once at boot.
pub fn init() {
    if log::set_logger(&KERNEL_LOG).is_ok() {
        log::set_max_level(log::LevelFilter::Info);
    }
}
