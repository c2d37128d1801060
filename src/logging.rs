//! Tracing setup for the CLI.
//!
//! Two sinks: compact human output on stderr, and JSON lines in a daily
//! rolling file under `.crucible/logs/`. `RUST_LOG` overrides the default
//! filter (`crucible=info`, or `crucible=debug` with `--verbose`).

use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE_PREFIX: &str = "crucible.log";

fn filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "crucible=debug" } else { "crucible=info" })
    })
}

/// Install the stderr and file layers. The returned guard flushes the file
/// writer on drop and must be held until the process exits.
pub fn init(log_dir: &Path, verbose: bool) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX));

    tracing_subscriber::registry()
        .with(filter(verbose))
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .with(fmt::layer().json().with_ansi(false).with_writer(file_writer))
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(guard)
}

/// Stderr-only logging for commands that run before `.crucible/` exists.
pub fn init_stderr(verbose: bool) {
    let _ = tracing_subscriber::registry()
        .with(filter(verbose))
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
