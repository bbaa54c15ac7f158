//! Route this crate's `log` records to the QEMU debug console.

use kernel_qemu::QemuLogger;
use log::{LevelFilter, SetLoggerError};

static LOGGER_INFO: QemuLogger = QemuLogger::new(LevelFilter::Info);
static LOGGER_TRACE: QemuLogger = QemuLogger::new(LevelFilter::Trace);

/// Install the QEMU logger. `verbose` also emits the per-transition
/// `trace!` records.
///
/// # Errors
/// Fails if a logger has already been installed.
pub fn init(verbose: bool) -> Result<(), SetLoggerError> {
    if verbose {
        LOGGER_TRACE.install()
    } else {
        LOGGER_INFO.install()
    }
}
