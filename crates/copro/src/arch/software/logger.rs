//! A log sink for host-side runs of the emulated machine.

use core::fmt::Write;

use alloc::string::String;
use log::LevelFilter;
use spin::Once;

/// Writes log records to standard error.
pub struct TestLogger;

static LOGGER: TestLogger = TestLogger;
static INSTALLED: Once<()> = Once::new();

impl TestLogger {
    /// Installs the logger. Only the first call in a process has any effect, and a logger
    /// installed by someone else is left in place.
    pub fn install() {
        INSTALLED.call_once(|| {
            if log::set_logger(&LOGGER).is_err() {
                return;
            }

            #[cfg(any(debug_assertions, feature = "detailed-logging"))]
            log::set_max_level(LevelFilter::Trace);

            #[cfg(not(any(debug_assertions, feature = "detailed-logging")))]
            log::set_max_level(LevelFilter::Info);
        });
    }
}

impl log::Log for TestLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let mut line = String::new();
        if write_log_entry_to(&mut line, record).is_ok() {
            std::eprint!("{line}");
        }
    }

    fn flush(&self) {}
}

fn write_log_entry_to(writer: &mut impl Write, record: &log::Record) -> core::fmt::Result {
    #[cfg(any(debug_assertions, feature = "detailed-logging"))]
    return writeln!(
        writer,
        "[{} {}:{} {}] {}",
        record.level(),
        record.file().unwrap_or("unknown"),
        record.line().unwrap_or(0),
        record.target(),
        record.args()
    );
    #[cfg(not(any(debug_assertions, feature = "detailed-logging")))]
    return writeln!(writer, "[{:5}] {}", record.level(), record.args());
}
