//! Tracing setup for the shell binary.
//!
//! Console output goes to stderr, and a non-ANSI copy goes to a daily-rotated
//! `desktop.log` file. Keep the returned guard alive for the process lifetime
//! or buffered file output is lost.

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const ENV_LOG_DIR: &str = "ZSIM_DESKTOP_LOG_DIR";
const DEFAULT_DIRECTIVE: &str = "zsim_desktop=debug";

/// `ZSIM_DESKTOP_LOG_DIR`, else `<data dir>/zsim/logs`, else `./.zsim/logs`.
pub fn log_dir_from<F>(lookup: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(dir) = lookup(ENV_LOG_DIR).filter(|v| !v.trim().is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .map(|dir| dir.join("zsim").join("logs"))
        .unwrap_or_else(|| PathBuf::from(".").join(".zsim").join("logs"))
}

pub fn init_logging() -> WorkerGuard {
    let log_dir = log_dir_from(|key| std::env::var(key).ok());
    let _ = std::fs::create_dir_all(&log_dir);

    // desktop.log.YYYY-MM-DD
    let file_appender = tracing_appender::rolling::daily(&log_dir, "desktop.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking))
        .try_init();

    tracing::info!("Logging to {:?}", log_dir);
    guard
}
