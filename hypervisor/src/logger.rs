//! Serial-port logger behind the `log` facade.
//!
//! Lines are rendered as `[LEVEL] scope | message`. The scope is the module
//! path with the crate prefix stripped, which keeps lines short on an 80
//! column serial capture.

use {
    crate::serial,
    log::{Level, LevelFilter, Metadata, Record},
};

static LOGGER: SerialLogger = SerialLogger;

/// Compile-time log level, selected with the `log-*` cargo features.
const MAX_LEVEL: LevelFilter = if cfg!(feature = "log-debug") {
    LevelFilter::Debug
} else if cfg!(feature = "log-warn") {
    LevelFilter::Warn
} else if cfg!(feature = "log-error") {
    LevelFilter::Error
} else {
    LevelFilter::Info
};

/// Install the serial logger as the global `log` sink.
pub fn init() {
    // A second registration can only happen if init() runs twice; keep the
    // first logger and just make sure the level is set.
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(MAX_LEVEL);
}

struct SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= MAX_LEVEL
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let scope = record
            .target()
            .strip_prefix("mirage_hypervisor::")
            .unwrap_or_else(|| record.target());
        serial::write_fmt(format_args!(
            "[{}] {} | {}\n",
            level_tag(record.level()),
            scope,
            record.args()
        ));
    }

    fn flush(&self) {}
}

fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN ",
        Level::Info => "INFO ",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}
