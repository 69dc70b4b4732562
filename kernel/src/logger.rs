//! Kernel logging backend
//!
//! Installs a [`log::Log`] implementation that forwards records to the
//! serial console with a level and target prefix. Subsystems report state
//! transitions and user-visible failures through the `log` facade; raw
//! `println!` is reserved for the banner and the test harness.

use log::{LevelFilter, Metadata, Record};

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            println!("[{:<5}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the serial logger. Safe to call more than once; only the first
/// call wins.
pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
