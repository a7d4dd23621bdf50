//! Logging infrastructure
//!
//! Writes a full log to gpo-audit.log in the executable's directory and a
//! compact stream to stderr, so stdout stays clean for the report.

use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_FILE_NAME: &str = "gpo-audit.log";

/// Get the directory containing the executable
fn get_executable_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Filter directive used when `RUST_LOG` is unset
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "gpo_write_audit=debug,info"
    } else {
        "info"
    }
}

/// Initialize logging.
///
/// Returns a guard that must be kept alive for the duration of the program
/// to ensure all logs are flushed to disk. `None` when the log file cannot be
/// created; logging then goes to stderr only.
pub fn init_logging(verbose: bool) -> Option<WorkerGuard> {
    let log_dir = get_executable_dir();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let (file_layer, guard, file_error) = match file_appender(&log_dir) {
        Ok(appender) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true);
            (Some(layer), Some(guard), None)
        }
        Err(e) => (None, None, Some(e)),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .init();

    if let Some(e) = file_error {
        warn!(
            "Cannot write {} in {}: {}; logging to stderr only",
            LOG_FILE_NAME,
            log_dir.display(),
            e
        );
    }

    guard
}

/// Non-rotating appender for `LOG_FILE_NAME` in `dir`
fn file_appender(dir: &Path) -> Result<RollingFileAppender, InitError> {
    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(LOG_FILE_NAME)
        .build(dir)
}
