//! Logging to stdout and to `<output-prefix>.log`.
//!
//! `RUST_LOG` overrides the default `debug` filter.

use std::io;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Keeps the file writer alive; dropping it flushes the log file.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

pub fn init_logging(output_prefix: &str) -> io::Result<LoggingGuard> {
    let log_path = log_path(output_prefix);
    let dir = log_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let file_name = log_path
        .file_name()
        .ok_or_else(|| io::Error::other(format!("invalid log path {}", log_path.display())))?;
    std::fs::create_dir_all(dir)?;

    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_target(true);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_target(true);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .try_init()
        .map_err(io::Error::other)?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

pub fn log_path(output_prefix: &str) -> PathBuf {
    PathBuf::from(format!("{output_prefix}.log"))
}
