//! Minimal console logger behind the `log` facade.

use log::{Level, LevelFilter, Log, Metadata, Record};

struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "E",
            Level::Warn => "W",
            Level::Info => "I",
            Level::Debug => "D",
            Level::Trace => "T",
        };
        println!("[{}] {}", tag, record.args());
    }

    fn flush(&self) {}
}

/// Install the console logger. Safe to call more than once; later calls
/// only adjust the level.
pub fn init(trace: bool) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(if trace {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    });
}
