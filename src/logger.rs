use core::sync::atomic::AtomicBool;
use core::sync::atomic::Ordering;

use log::LevelFilter;

static INIT: AtomicBool = AtomicBool::new(false);

/// Initializes the logger with debug mode, logging all messages
/// including debug messages.
pub fn init_logger_debug() {
    if !INIT.swap(true, Ordering::SeqCst) {
        init(true);
    }
}

/// Initializes the logger with default mode, only logging errors and
/// above.
pub fn init_logger() {
    if !INIT.swap(true, Ordering::SeqCst) {
        init(false);
    }
}

fn init(debug: bool) {
    let level = if debug {
        LevelFilter::Trace
    } else {
        LevelFilter::Error
    };
    let _ = env_logger::Builder::from_default_env()
        .filter_module("fang_core", level)
        .format_timestamp(None)
        .is_test(false)
        .try_init();
}
