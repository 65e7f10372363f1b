//! Logging (C6 ambient stack): a [`log::Log`] implementation backed by the serial sink.
//!
//! Mirrors the teacher's approach of installing a single global logger over its own UART at
//! crate startup; the facade (`log::{info,warn,error,debug,trace}`) is used everywhere else in
//! the crate instead of ad-hoc serial writes.

use log::{LevelFilter, Log, Metadata, Record};

use crate::serial;

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        serial::write_fmt(format_args!(
            "[{:>5} CPU{}] {}\n",
            record.level(),
            crate::smp::current_cpu_index().unwrap_or(0),
            record.args()
        ));
    }

    fn flush(&self) {}
}

/// Installs the serial-backed logger as the global `log` facade sink.
///
/// Idempotent in effect: `log::set_logger` fails only if a logger is already installed, which
/// this crate treats as a non-fatal condition rather than panicking.
pub fn init(level: LevelFilter) {
    serial::init();
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}
