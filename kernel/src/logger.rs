//! Serial-backed `log` sink
//!
//! Routes records from the `log` facade to the serial console as
//! `[LEVEL subsystem] message`. Installed once during boot; records issued
//! before installation are dropped by the facade.

use log::{LevelFilter, Metadata, Record};

/// Compile-time log verbosity.
const MAX_LEVEL: LevelFilter = LevelFilter::Info;

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= MAX_LEVEL
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            crate::serial_println!(
                "[{:5} {}] {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Install the serial logger. Safe to call more than once; later calls are
/// ignored by the facade.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(MAX_LEVEL);
    }
}
