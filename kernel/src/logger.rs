//! `log` facade backed by the serial console.

use log::{LevelFilter, Log, Metadata, Record};

use crate::config::DEFAULT_LOG_LEVEL;

struct SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        crate::serial_println!(
            "[{:5} {}] {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

/// Install the serial logger. Serial must already be initialized.
pub fn init(level: Option<LevelFilter>) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level.unwrap_or(DEFAULT_LOG_LEVEL));
    }
}
