//! Logging Infrastructure
//!
//! Console output by default; a daily rolling file when a log dir is given.

use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Initialize the logger
pub fn init_logger() {
    init_logger_with_file(None, None, None);
}

/// Initialize the logger with optional file output
///
/// `RUST_LOG` wins over `log_level` when set. A log dir that cannot be
/// created falls back to console output.
pub fn init_logger_with_file(log_level: Option<&str>, json: Option<bool>, log_dir: Option<&str>) {
    let level = log_level.unwrap_or("info");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_target(false);

    let file_dir = log_dir.filter(|dir| {
        let path = Path::new(dir);
        path.exists() || std::fs::create_dir_all(path).is_ok()
    });

    match (file_dir, json.unwrap_or(false)) {
        (Some(dir), true) => {
            let file_appender = tracing_appender::rolling::daily(dir, "scheduler-server");
            builder.json().with_writer(file_appender).init();
        }
        (Some(dir), false) => {
            let file_appender = tracing_appender::rolling::daily(dir, "scheduler-server");
            builder.with_ansi(false).with_writer(file_appender).init();
        }
        (None, true) => builder.json().init(),
        (None, false) => builder.init(),
    }
}
