use std::path::Path;

use tracing::level_filters::LevelFilter;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Sets up logging across the engine, writing a rotating daily log file to
/// the given directory (normally `Config::log_directory` after validation).
/// Returns the guard that keeps the background log writer alive; drop it and
/// buffered log lines stop being flushed.
pub fn setup_logging(log_directory: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    // Set up logging to create a rotating log file for each day
    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_directory, "log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_level(true)
        .with_writer(non_blocking);
    // Stdout should only get above warnings (unless the user configures it
    // otherwise)
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_file(true)
        .with_line_number(true)
        .without_time()
        .compact()
        .with_writer(std::io::stdout)
        .with_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .with_env_var("TERN_LOG")
                .from_env_lossy(),
        );
    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .init();

    guard
}
