use core::fmt::Write;

use log::{Level, LevelFilter, Metadata, Record};

/// Logger writing through the SBI firmware console.
struct KernelLogger;

struct SbiConsole;

impl Write for SbiConsole {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for byte in s.bytes() {
            crate::arch::console_putchar(byte);
        }
        Ok(())
    }
}

/// Serializes whole log lines; harts otherwise interleave mid-record.
static CONSOLE_LOCK: spin::Mutex<()> = spin::Mutex::new(());

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _guard = CONSOLE_LOCK.lock();
            let _ = writeln!(
                SbiConsole,
                "[{}] hart{} {}",
                record.level(),
                crate::arch::hartid(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Install the logger. Must run before anything logs.
pub fn init() {
    match log::set_logger(&LOGGER).map(|()| log::set_max_level(LevelFilter::Info)) {
        Ok(()) => log::info!("logger initialized"),
        Err(err) => panic!("logger init failed: {}", err),
    }
}
