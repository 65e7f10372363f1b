//! Serial port sink (C6: serial sink).
//!
//! A byte-oriented diagnostic sink, reachable from every CPU, so it is lock-protected by a
//! single [`SpinlockIrqSave`]. This is also the backend the [`crate::logging`] module writes
//! through.

use core::fmt::{self, Write};

use uart_16550::SerialPort;

use crate::synch::spinlock::SpinlockIrqSave;

/// Standard COM1 I/O port base.
const COM1_PORT: u16 = 0x3f8;

static SERIAL: SpinlockIrqSave<Option<SerialPort>> = SpinlockIrqSave::new(None);

/// Initializes the serial sink. Must run before the first call to [`write_fmt`] or the
/// logger's first emitted line; calling it twice is harmless.
pub fn init() {
    let mut guard = SERIAL.lock();
    if guard.is_none() {
        let mut port = unsafe { SerialPort::new(COM1_PORT) };
        port.init();
        *guard = Some(port);
    }
}

/// Writes a single byte to the serial port, blocking until it is accepted.
pub fn write_byte(byte: u8) {
    let mut guard = SERIAL.lock();
    if let Some(port) = guard.as_mut() {
        let _ = port.send_raw(byte);
    }
}

struct SerialWriter<'a>(&'a mut SerialPort);

impl Write for SerialWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            let _ = self.0.send_raw(byte);
        }
        Ok(())
    }
}

/// Formats and writes `args` to the serial sink, holding the sink's lock for the whole write so
/// lines from different CPUs are not interleaved.
pub fn write_fmt(args: fmt::Arguments<'_>) {
    let mut guard = SERIAL.lock();
    if let Some(port) = guard.as_mut() {
        let _ = SerialWriter(port).write_fmt(args);
    }
}

/// Prints a line to the serial sink, matching the `println!`-style macro the rest of the crate
/// uses for diagnostics outside the `log` facade (early boot, before the logger is installed).
#[macro_export]
macro_rules! serial_println {
    () => {
        $crate::serial::write_fmt(format_args!("\n"));
    };
    ($($arg:tt)*) => {{
        $crate::serial::write_fmt(format_args!($($arg)*));
        $crate::serial::write_fmt(format_args!("\n"));
    }};
}
