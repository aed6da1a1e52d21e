//! Logging setup: one log file per run plus a colored console mirror.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Local;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging to `<log_dir>/remediation-<label>-<timestamp>.log`.
///
/// Returns a guard that must be kept alive for the duration of the program
/// to ensure all logs are flushed to disk before a reboot takes the process.
pub fn init_logging(log_dir: &Path, label: &str) -> Result<WorkerGuard> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("failed creating log directory {}", log_dir.display()))?;

    let file_name = format!(
        "remediation-{}-{}.log",
        label,
        Local::now().format("%Y%m%d-%H%M%S")
    );
    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true)
                .with_target(false)
                .compact(),
        )
        .try_init()
        .context("failed installing tracing subscriber")?;

    Ok(guard)
}
