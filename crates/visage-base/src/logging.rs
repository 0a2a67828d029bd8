use log::{LevelFilter, Log, Metadata, Record};
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

/// A logger that writes to stdout using println!
pub struct StdoutLogger;

impl Log for StdoutLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let timestamp = format_time_of_day();
        let level = record.level();
        let thread_id = std::thread::current().id();
        let file = record.file().unwrap_or("unknown");
        let line = record.line().unwrap_or(0);
        let message = record.args();

        println!(
            "{} [{}] [thread:{:?}] {}:{} - {}",
            timestamp, level, thread_id, file, line, message
        );
    }

    fn flush(&self) {
        std::io::stdout().flush().ok();
    }
}

/// Format the current UTC time of day as HH:MM:SS
pub fn format_time_of_day() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let time_of_day = secs % 86400;
    let hours = time_of_day / 3600;
    let minutes = (time_of_day % 3600) / 60;
    let seconds = time_of_day % 60;

    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}

/// Initialize the global logger with StdoutLogger
///
/// Sets the max level based on build mode:
/// - Debug builds: LevelFilter::Debug (all levels active)
/// - Release builds: LevelFilter::Info (Debug suppressed)
///
/// This can only be called once per process. Subsequent calls are silently ignored.
pub fn init_stdout_logger() {
    static LOGGER: StdoutLogger = StdoutLogger;

    let max_level = if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(max_level);
    }
}

/// Log a fatal error and exit the process
///
/// Logs at Error level (since the log crate has no Fatal level),
/// flushes stdout, and calls std::process::exit(1).
#[macro_export]
macro_rules! log_fatal {
    ($($arg:tt)*) => {{
        $crate::log::error!($($arg)*);
        // Flush stdout to ensure message is visible
        {
            use std::io::Write;
            let _ = std::io::stdout().flush();
        }
        std::process::exit(1)
    }};
}
