//! Console logger
//!
//! Backend for the `log` facade: records go to the VGA console with
//! their subsystem target as prefix. Errors print in the red attribute,
//! which is the kernel's user-visible failure channel.

use log::{LevelFilter, Log, Metadata, Record};

use crate::drivers::vga;

struct ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if record.level() == log::Level::Error {
            vga::with_attr(vga::ATTR_ERROR, || {
                crate::println!("{}: {}", record.target(), record.args());
            });
        } else {
            crate::println!("[{}] {}", record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: ConsoleLogger = ConsoleLogger;

/// Installs the console logger. Call once, before the subsystems start
/// reporting.
pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
