//! `tracing` subscriber setup.
//!
//! One-shot commands log to stderr only; the daemon also writes JSON lines
//! to a daily-rotated file under `<state_dir>/logs`.

use crate::error::Result;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Keeps the file writer alive; dropping it flushes pending lines
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Stderr logging for one-shot commands. `RUST_LOG` overrides the default
/// level (`warn`, or `debug` with `--debug`).
pub fn init_cli(debug: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(if debug { "debug" } else { "warn" }))
        .with_writer(std::io::stderr)
        .try_init();
}

/// JSON file layer plus stderr, for the long-running daemon
pub fn init_daemon(logs_dir: &Path, debug: bool) -> Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir)?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, "nixpilot.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let json_layer = tracing_subscriber::fmt::layer().json().with_writer(non_blocking);
    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let _ = tracing_subscriber::registry()
        .with(filter(if debug { "debug" } else { "info" }))
        .with(json_layer)
        .with(console_layer)
        .try_init();

    Ok(LoggingGuard { _guard: guard })
}
